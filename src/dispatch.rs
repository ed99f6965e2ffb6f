//! Fan-out of a query batch over the worker pool.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::index::BinaryIndex;
use crate::pool::{TaskHandle, WorkerPool};
use crate::{HbstError, Match, Matchable};

/// Split `len` items into at most `parts` contiguous, non-overlapping ranges
/// that together cover `0..len`.
///
/// The first `len % parts` ranges hold one extra item. No range is empty, so
/// fewer than `parts` ranges are returned when `len < parts`.
pub fn slice_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    if len == 0 || parts == 0 {
        return Vec::new();
    }
    let parts = parts.min(len);
    let base = len / parts;
    let extra = len % parts;

    let mut start = 0;
    (0..parts)
        .map(|part| {
            let size = base + usize::from(part < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Runs match requests against a shared index, in parallel when a pool with
/// more than one worker is available.
///
/// A dispatch holds the index's read lock from the first slice until the
/// last one is awaited, so every slice sees the same index and writers
/// (`add`, `train`, `clear`, `read`) wait for the whole batch. Slices take
/// their own shared lock with `read_recursive`, which does not queue behind
/// a waiting writer while the dispatcher's lock is held.
pub struct MatchDispatcher<I: BinaryIndex> {
    index: Arc<RwLock<I>>,
    pool: Option<Arc<WorkerPool>>,
}

impl<I: BinaryIndex> MatchDispatcher<I> {
    pub fn new(index: Arc<RwLock<I>>, pool: Option<Arc<WorkerPool>>) -> Self {
        Self { index, pool }
    }

    /// Number of slices a batch is split into.
    pub fn parallelism(&self) -> usize {
        self.pool.as_ref().map_or(1, |pool| pool.size())
    }

    /// Match every query against the index.
    ///
    /// Results are concatenated in slice order, so the output order is fixed
    /// for a given batch. If any slice fails the whole dispatch fails, with
    /// the error of the lowest failing slice; every slice is awaited first.
    pub fn dispatch(
        &self,
        queries: Vec<Arc<Matchable>>,
        max_distance: u32,
        lazy: bool,
    ) -> Result<Vec<Match>, HbstError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let pool = match &self.pool {
            Some(pool) if pool.size() > 1 => pool,
            _ => return run_slice(&*self.index.read(), &queries, max_distance, lazy),
        };

        let ranges = slice_ranges(queries.len(), pool.size());
        debug!(
            queries = queries.len(),
            slices = ranges.len(),
            max_distance,
            lazy,
            "dispatching match slices"
        );

        let mut remaining = queries;
        let mut slices: Vec<Vec<Arc<Matchable>>> = ranges
            .iter()
            .rev()
            .map(|range| remaining.split_off(range.start))
            .collect();
        slices.reverse();

        let snapshot = self.index.read();
        let handles: Vec<TaskHandle<Result<Vec<Match>, HbstError>>> = slices
            .into_iter()
            .map(|slice| {
                let index = Arc::clone(&self.index);
                pool.submit(move || {
                    run_slice(&*index.read_recursive(), &slice, max_distance, lazy)
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(TaskHandle::wait).collect();
        drop(snapshot);

        let mut merged = Vec::new();
        let mut failure = None;
        for (slice, outcome) in outcomes.into_iter().enumerate() {
            let result = outcome.map_err(HbstError::from).and_then(|matches| matches);
            match result {
                Ok(matches) => merged.extend(matches),
                Err(err) => {
                    warn!(slice, "match slice failed: {err}");
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }
}

fn run_slice<I: BinaryIndex>(
    index: &I,
    queries: &[Arc<Matchable>],
    max_distance: u32,
    lazy: bool,
) -> Result<Vec<Match>, HbstError> {
    if lazy {
        index.match_lazy(queries, max_distance)
    } else {
        index.match_exact(queries, max_distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorLayout};
    use crate::index::SplittingStrategy;
    use crate::linear::LinearIndex;
    use crossbeam::channel::{self, Sender};
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    /// Linear index whose matching stalls on query 0 after announcing it.
    #[derive(Debug)]
    struct StallingIndex {
        inner: LinearIndex,
        stalled: Sender<()>,
    }

    impl StallingIndex {
        fn stall(&self, queries: &[Arc<Matchable>]) {
            if queries.iter().any(|query| query.descriptor_id() == 0) {
                let _ = self.stalled.try_send(());
                thread::sleep(Duration::from_millis(200));
            }
        }
    }

    impl BinaryIndex for StallingIndex {
        fn layout(&self) -> DescriptorLayout {
            self.inner.layout()
        }

        fn add(
            &mut self,
            matchables: Vec<Matchable>,
            strategy: SplittingStrategy,
        ) -> Result<(), HbstError> {
            self.inner.add(matchables, strategy)
        }

        fn train(&mut self, strategy: SplittingStrategy) -> Result<(), HbstError> {
            self.inner.train(strategy)
        }

        fn match_exact(
            &self,
            queries: &[Arc<Matchable>],
            max_distance: u32,
        ) -> Result<Vec<Match>, HbstError> {
            self.stall(queries);
            self.inner.match_exact(queries, max_distance)
        }

        fn match_lazy(
            &self,
            queries: &[Arc<Matchable>],
            max_distance: u32,
        ) -> Result<Vec<Match>, HbstError> {
            self.stall(queries);
            self.inner.match_lazy(queries, max_distance)
        }

        fn clear(&mut self) {
            self.inner.clear();
        }

        fn read(&mut self, path: &Path) -> Result<(), HbstError> {
            self.inner.read(path)
        }

        fn write(&self, path: &Path) -> Result<(), HbstError> {
            self.inner.write(path)
        }

        fn size(&self) -> usize {
            self.inner.size()
        }
    }

    fn matchable(descriptor_id: u64, fill: u8) -> Matchable {
        let descriptor =
            Descriptor::from_packed(DescriptorLayout::BITS_128, vec![fill; 16]).unwrap();
        Matchable::new(descriptor_id, descriptor, 1)
    }

    #[test]
    fn writers_wait_for_the_whole_dispatch() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        pool.start().unwrap();

        // Keep one worker busy so the second slice queues behind it.
        let (busy_tx, busy_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded::<()>(1);
        let blocker = pool.submit(move || {
            busy_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        busy_rx.recv().unwrap();

        let (stalled_tx, stalled_rx) = channel::bounded(1);
        let mut inner = LinearIndex::new(DescriptorLayout::BITS_128);
        inner
            .add(
                vec![matchable(10, 0x00), matchable(11, 0xff)],
                SplittingStrategy::DoNothing,
            )
            .unwrap();
        let index = Arc::new(RwLock::new(StallingIndex {
            inner,
            stalled: stalled_tx,
        }));

        let dispatcher = MatchDispatcher::new(Arc::clone(&index), Some(Arc::clone(&pool)));
        let queries = vec![Arc::new(matchable(0, 0x00)), Arc::new(matchable(1, 0xff))];
        let matching = thread::spawn(move || dispatcher.dispatch(queries, 0, false));

        stalled_rx.recv().unwrap();
        let writer = {
            let index = Arc::clone(&index);
            thread::spawn(move || index.write().clear())
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        let matches = matching.join().unwrap().unwrap();
        writer.join().unwrap();
        blocker.wait().unwrap();

        assert_eq!(matches.len(), 2);
        assert!(index.read().inner.is_empty());
    }

    #[test]
    fn slices_cover_every_item_exactly_once() {
        for len in 0..40 {
            for parts in 1..10 {
                let ranges = slice_ranges(len, parts);
                assert!(ranges.len() <= parts);
                assert!(ranges.iter().all(|r| !r.is_empty()));

                let covered: Vec<usize> = ranges.iter().flat_map(|r| r.clone()).collect();
                assert_eq!(covered, (0..len).collect::<Vec<_>>(), "len={len} parts={parts}");

                let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
                if let (Some(max), Some(min)) = (sizes.iter().max(), sizes.iter().min()) {
                    assert!(max - min <= 1, "uneven slices for len={len} parts={parts}");
                }
            }
        }
    }

    #[test]
    fn tail_is_not_dropped_when_batch_is_not_divisible() {
        assert_eq!(slice_ranges(10, 4), vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(slice_ranges(3, 8), vec![0..1, 1..2, 2..3]);
        assert!(slice_ranges(5, 0).is_empty());
    }
}
