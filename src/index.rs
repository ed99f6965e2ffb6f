use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::DescriptorLayout;
use crate::{HbstError, Match, Matchable};

/// How a search tree splits its leaves while integrating new matchables.
///
/// The matching layer never interprets the strategy; it is handed to the
/// index unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SplittingStrategy {
    /// Integrate descriptors without splitting any leaf.
    DoNothing,
    /// Split on the bit closest to an even partition.
    #[default]
    SplitEven,
    /// Split on the first bit that separates the leaf at all.
    SplitUneven,
    /// Split on a uniformly drawn bit.
    SplitRandomUniform,
}

impl SplittingStrategy {
    pub fn as_u8(self) -> u8 {
        match self {
            SplittingStrategy::DoNothing => 0,
            SplittingStrategy::SplitEven => 1,
            SplittingStrategy::SplitUneven => 2,
            SplittingStrategy::SplitRandomUniform => 3,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SplittingStrategy::DoNothing),
            1 => Some(SplittingStrategy::SplitEven),
            2 => Some(SplittingStrategy::SplitUneven),
            3 => Some(SplittingStrategy::SplitRandomUniform),
            _ => None,
        }
    }
}

/// A searchable store of binary descriptors.
///
/// Implementations must tolerate any number of concurrent `match_*` calls
/// through shared references; mutation goes through `&mut self` and is
/// therefore exclusive.
pub trait BinaryIndex: Send + Sync + 'static {
    /// Width of the descriptors this index stores.
    fn layout(&self) -> DescriptorLayout;

    /// Integrate matchables into the index.
    fn add(
        &mut self,
        matchables: Vec<Matchable>,
        strategy: SplittingStrategy,
    ) -> Result<(), HbstError>;

    /// Rebalance or otherwise prepare the index for matching.
    fn train(&mut self, strategy: SplittingStrategy) -> Result<(), HbstError>;

    /// Best matches of every query within `max_distance`.
    fn match_exact(
        &self,
        queries: &[Arc<Matchable>],
        max_distance: u32,
    ) -> Result<Vec<Match>, HbstError>;

    /// Early-exit variant of [`BinaryIndex::match_exact`]: the first stored
    /// matchable within `max_distance` is reported, not necessarily the best.
    fn match_lazy(
        &self,
        queries: &[Arc<Matchable>],
        max_distance: u32,
    ) -> Result<Vec<Match>, HbstError>;

    /// Remove every stored matchable.
    fn clear(&mut self);

    /// Replace the contents of the index with the ones persisted at `path`.
    fn read(&mut self, path: &Path) -> Result<(), HbstError>;

    /// Persist the index to `path`.
    fn write(&self, path: &Path) -> Result<(), HbstError>;

    /// Number of images the index holds descriptors of.
    fn size(&self) -> usize;
}

