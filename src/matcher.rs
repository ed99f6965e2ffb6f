use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::MatcherConfig;
use crate::descriptor::DescriptorBuilder;
use crate::dispatch::MatchDispatcher;
use crate::index::{BinaryIndex, SplittingStrategy};
use crate::linear::LinearIndex;
use crate::partition::{partition_matches, MatchPartition};
use crate::pool::WorkerPool;
use crate::{DescriptorId, HbstError, ImageId, Match, Matchable};

/// Image id assigned to query descriptors matched through
/// [`BinaryMatcher::match_descriptors`].
pub const QUERY_IMAGE_ID: ImageId = 0;

/// Front door for matching raw descriptor rows against an index.
///
/// Owns the index behind a read/write lock, the descriptor builder and, when
/// more than one worker is configured, a running [`WorkerPool`].
pub struct BinaryMatcher<I: BinaryIndex = LinearIndex> {
    config: MatcherConfig,
    builder: DescriptorBuilder,
    index: Arc<RwLock<I>>,
    pool: Option<Arc<WorkerPool>>,
    dispatcher: MatchDispatcher<I>,
}

impl BinaryMatcher<LinearIndex> {
    /// Matcher backed by an exhaustive [`LinearIndex`].
    pub fn linear(config: MatcherConfig) -> Result<Self, HbstError> {
        let layout = config.layout()?;
        Self::new(config, LinearIndex::new(layout))
    }
}

impl<I: BinaryIndex> BinaryMatcher<I> {
    pub fn new(config: MatcherConfig, index: I) -> Result<Self, HbstError> {
        config.validate()?;
        let layout = config.layout()?;
        if index.layout() != layout {
            return Err(HbstError::InvalidConfig(
                "index descriptor width does not match the configuration",
            ));
        }

        let pool = if config.worker_count > 1 {
            let pool = WorkerPool::new(config.worker_count)?;
            pool.start()?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let index = Arc::new(RwLock::new(index));
        let dispatcher = MatchDispatcher::new(Arc::clone(&index), pool.clone());
        info!(
            descriptor_bits = layout.bits(),
            workers = config.worker_count,
            pad_allowed = config.pad_allowed,
            "created binary matcher"
        );

        Ok(Self {
            config,
            builder: DescriptorBuilder::new(layout),
            index,
            pool,
            dispatcher,
        })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn descriptor_size_in_bits(&self) -> usize {
        self.builder.layout().bits()
    }

    pub fn descriptor_size_in_bytes(&self) -> usize {
        self.builder.layout().bytes()
    }

    pub fn descriptor_overflow_bits(&self) -> usize {
        self.builder.layout().overflow_bits()
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.dispatcher.parallelism()
    }

    /// Add the descriptors of one image.
    ///
    /// `descriptor_ids[i]` names `rows[i]`. Nothing reaches the index unless
    /// every row is valid.
    pub fn add<R>(
        &self,
        image_id: ImageId,
        descriptor_ids: &[DescriptorId],
        rows: &[R],
        strategy: SplittingStrategy,
    ) -> Result<(), HbstError>
    where
        R: AsRef<[u8]> + Sync,
    {
        let matchables = self.build_matchables(image_id, descriptor_ids, rows)?;
        debug!(image_id, descriptors = matchables.len(), "adding image");
        self.index.write().add(matchables, strategy)
    }

    pub fn train(&self, strategy: SplittingStrategy) -> Result<(), HbstError> {
        self.index.write().train(strategy)
    }

    /// Match query rows against the index.
    pub fn match_descriptors<R>(
        &self,
        query_ids: &[DescriptorId],
        rows: &[R],
        max_distance: u32,
        lazy: bool,
    ) -> Result<Vec<Match>, HbstError>
    where
        R: AsRef<[u8]> + Sync,
    {
        self.match_for_image(QUERY_IMAGE_ID, query_ids, rows, max_distance, lazy)
    }

    /// [`BinaryMatcher::match_descriptors`] with the configured distance and mode.
    pub fn match_with_defaults<R>(
        &self,
        query_ids: &[DescriptorId],
        rows: &[R],
    ) -> Result<Vec<Match>, HbstError>
    where
        R: AsRef<[u8]> + Sync,
    {
        self.match_descriptors(query_ids, rows, self.config.max_distance, self.config.lazy)
    }

    /// Match query rows that belong to image `image_id`.
    pub fn match_for_image<R>(
        &self,
        image_id: ImageId,
        query_ids: &[DescriptorId],
        rows: &[R],
        max_distance: u32,
        lazy: bool,
    ) -> Result<Vec<Match>, HbstError>
    where
        R: AsRef<[u8]> + Sync,
    {
        let queries = self
            .build_matchables(image_id, query_ids, rows)?
            .into_iter()
            .map(Arc::new)
            .collect();
        self.dispatcher.dispatch(queries, max_distance, lazy)
    }

    /// Group matches by referenced image and rank the images.
    pub fn partition_matches(&self, matches: &[Match]) -> MatchPartition {
        partition_matches(matches)
    }

    pub fn clear(&self) {
        self.index.write().clear();
    }

    pub fn read<P: AsRef<Path>>(&self, path: P) -> Result<(), HbstError> {
        self.index.write().read(path.as_ref())
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), HbstError> {
        self.index.read().write(path.as_ref())
    }

    /// Number of images held by the index.
    pub fn size(&self) -> usize {
        self.index.read().size()
    }

    /// Run `f` against the index while holding its read lock.
    pub fn with_index<T>(&self, f: impl FnOnce(&I) -> T) -> T {
        f(&*self.index.read())
    }

    /// Stop the worker pool after it drained its queue. Later parallel
    /// matches fail with [`crate::TaskError::PoolStopped`].
    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.finish();
        }
    }

    fn build_matchables<R>(
        &self,
        image_id: ImageId,
        descriptor_ids: &[DescriptorId],
        rows: &[R],
    ) -> Result<Vec<Matchable>, HbstError>
    where
        R: AsRef<[u8]> + Sync,
    {
        if descriptor_ids.len() != rows.len() {
            return Err(HbstError::CountMismatch {
                ids: descriptor_ids.len(),
                rows: rows.len(),
            });
        }
        let descriptors = self.builder.build_rows(rows, self.config.pad_allowed)?;
        Ok(descriptor_ids
            .iter()
            .zip(descriptors)
            .map(|(&descriptor_id, descriptor)| Matchable::new(descriptor_id, descriptor, image_id))
            .collect())
    }
}

impl<I: BinaryIndex> std::fmt::Debug for BinaryMatcher<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryMatcher")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
