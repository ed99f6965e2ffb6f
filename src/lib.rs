pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod index;
pub mod linear;
pub mod matcher;
pub mod partition;
pub mod pool;

mod matchable;

pub use config::MatcherConfig;
pub use descriptor::{Descriptor, DescriptorBuilder, DescriptorLayout};
pub use dispatch::{slice_ranges, MatchDispatcher};
pub use index::{BinaryIndex, SplittingStrategy};
pub use linear::LinearIndex;
pub use matchable::{Match, Matchable};
pub use matcher::{BinaryMatcher, QUERY_IMAGE_ID};
pub use partition::{partition_matches, MatchPartition};
pub use pool::{PoolState, TaskError, TaskHandle, WorkerPool};


/// Crate version, as reported by the package manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifier of the image a descriptor was extracted from.
pub type ImageId = u64;

/// Identifier of a descriptor, local to its owning image.
pub type DescriptorId = u64;

/// Errors that can occur when building descriptors or driving a match index.
#[derive(thiserror::Error, Debug)]
pub enum HbstError {
    /// Returned when caller-supplied buffers have an unusable shape.
    #[error("shape validation failed: {0}")]
    ShapeValidation(String),
    /// Returned when a descriptor row does not fit the configured width.
    #[error("descriptor width mismatch: expected {expected} bytes, got {got}")]
    DescriptorWidth { expected: usize, got: usize },
    /// Returned when the number of ids does not match the number of rows.
    #[error("count mismatch: {ids} ids for {rows} descriptor rows")]
    CountMismatch { ids: usize, rows: usize },
    /// Returned when an invalid configuration is supplied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Returned when the worker pool is driven through an invalid transition.
    #[error("worker pool: {0}")]
    Pool(&'static str),
    /// Returned when a task executed by the worker pool did not produce a result.
    #[error("task failed: {0}")]
    Task(#[from] TaskError),
    /// Returned when persistence encounters an I/O failure.
    #[error("i/o error while reading or writing an index: {0}")]
    Io(#[from] std::io::Error),
    /// Returned when the persisted bytes are inconsistent or corrupt.
    #[error("invalid persisted index: {0}")]
    InvalidPersistence(&'static str),
}
