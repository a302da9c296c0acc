use crate::{
    config::{InputType, TrainConfig},
    engine::{ProbeBatch, ShardGraph},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Table of empirically discovered batch-size ceilings, one entry per
/// sequence-length bucket. Built once by [`collect_stats`], immutable
/// afterwards, consumed by dynamic batching.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    buckets: BTreeMap<usize, usize>,
}

impl BatchStats {
    pub fn add(&mut self, bucket: usize, max_batch_size: usize) {
        self.buckets.insert(bucket, max_batch_size);
    }

    /// Largest batch size known to fit for sequences of `length`. Queries
    /// between buckets round up to the covering bucket; queries beyond the
    /// longest bucket fall back to its (smallest) entry.
    pub fn max_batch_size(&self, length: usize) -> Option<usize> {
        self.buckets
            .range(length..)
            .next()
            .or_else(|| self.buckets.iter().next_back())
            .map(|(_, size)| *size)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.buckets.iter().map(|(bucket, size)| (*bucket, *size))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// Suspends the engine's NaN/Inf abort while probing with synthetic noise;
// restores the previous setting on every exit path.
struct OverflowAbortGuard<'a> {
    graph: &'a mut dyn ShardGraph,
    previous: bool,
}

impl<'a> OverflowAbortGuard<'a> {
    fn suspend(graph: &'a mut dyn ShardGraph) -> Self {
        let previous = graph.overflow_abort_enabled();
        graph.set_overflow_abort_enabled(false);
        Self { graph, previous }
    }
}

impl Drop for OverflowAbortGuard<'_> {
    fn drop(&mut self) {
        self.graph.set_overflow_abort_enabled(self.previous);
    }
}

/// Discover the largest batch size that fits the engine's memory budget for
/// each sequence-length bucket up to `max-length`, stepping by
/// `mini-batch-fit-step`.
///
/// Probes run on a single shard's graph; `multiplier` (typically the device
/// count) is applied only when recording results, projecting the single-shard
/// measurement onto the whole group. "Does not fit" is a normal probe
/// outcome, not an error.
pub fn collect_stats(graph: &mut dyn ShardGraph, config: &TrainConfig, multiplier: f64) -> BatchStats {
    let mut guard = OverflowAbortGuard::suspend(graph);

    let mut stats = BatchStats::default();

    let num_streams = config.train_sets.len();
    let step = config.mini_batch_fit_step;
    let first = step;
    let max_length = (config.max_length as f64 / step as f64).ceil() as usize * step;

    // class-label streams carry one token per example regardless of max-length
    let mut local_maxes = vec![max_length; num_streams];
    for (i, input_type) in config.input_types.iter().enumerate().take(num_streams) {
        if *input_type == InputType::Class {
            local_maxes[i] = 1;
        }
    }

    let clamped = |length: usize| -> Vec<usize> {
        local_maxes.iter().map(|max| length.min(*max)).collect()
    };

    // exponential search for an upper bound at the shortest length; capacity
    // only shrinks as length grows, so this ceiling is safe for every bucket
    let mut max_batch = 512;
    loop {
        let lengths = clamped(first);
        let batch = ProbeBatch::synthetic(lengths, max_batch);
        let _loss = guard.graph.build_loss_graph(&batch);
        if !guard.graph.fits_memory_budget() {
            break;
        }
        max_batch *= 2;
    }

    // binary search per length bucket, carrying the narrowed ceiling forward
    let mut bucket = step;
    while bucket <= max_length {
        let lengths = clamped(bucket);
        let mut start = 1usize;
        let mut end = max_batch;

        while start <= end {
            let current = (start + end) / 2;
            let batch = ProbeBatch::synthetic(lengths.clone(), current);
            let _loss = guard.graph.build_loss_graph(&batch);
            let fits = guard.graph.fits_memory_budget();

            debug!(
                "[batching] length: {} - size: {} - fits: {}",
                lengths[0], current, fits
            );

            if fits {
                stats.add(bucket, (current as f64 * multiplier) as usize);
                start = current + 1;
            } else {
                end = current - 1;
            }
        }

        max_batch = start;
        bucket += step;
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Loss;
    use std::path::PathBuf;

    /// Engine stand-in with a token budget: a batch fits while
    /// `batch_size * sum(lengths) <= budget`.
    struct FakeGraph {
        budget: usize,
        last_fits: bool,
        overflow_abort: bool,
        probes: Vec<(Vec<usize>, usize, bool)>,
    }

    impl FakeGraph {
        fn with_budget(budget: usize) -> Self {
            Self {
                budget,
                last_fits: false,
                overflow_abort: true,
                probes: Vec::new(),
            }
        }
    }

    impl ShardGraph for FakeGraph {
        fn build_loss_graph(&mut self, batch: &ProbeBatch) -> Loss {
            let tokens: usize = batch.lengths.iter().sum::<usize>() * batch.batch_size;
            self.last_fits = tokens <= self.budget;
            self.probes
                .push((batch.lengths.clone(), batch.batch_size, self.overflow_abort));
            Loss(0.0)
        }

        fn fits_memory_budget(&self) -> bool {
            self.last_fits
        }

        fn overflow_abort_enabled(&self) -> bool {
            self.overflow_abort
        }

        fn set_overflow_abort_enabled(&mut self, enabled: bool) {
            self.overflow_abort = enabled;
        }
    }

    fn config(step: usize, max_length: usize, streams: usize) -> TrainConfig {
        TrainConfig {
            model: PathBuf::from("model.bin"),
            mini_batch_fit_step: step,
            max_length,
            train_sets: (0..streams).map(|i| format!("stream{i}")).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn finds_exact_per_bucket_ceilings() {
        let mut graph = FakeGraph::with_budget(3200);
        let stats = collect_stats(&mut graph, &config(16, 64, 1), 1.0);

        assert_eq!(stats.max_batch_size(16), Some(200));
        assert_eq!(stats.max_batch_size(32), Some(100));
        assert_eq!(stats.max_batch_size(48), Some(66));
        assert_eq!(stats.max_batch_size(64), Some(50));
    }

    #[test]
    fn buckets_are_monotonically_non_increasing() {
        let mut graph = FakeGraph::with_budget(5000);
        let stats = collect_stats(&mut graph, &config(10, 50, 1), 1.0);

        assert_eq!(stats.len(), 5);
        let sizes: Vec<usize> = stats.iter().map(|(_, size)| size).collect();
        for pair in sizes.windows(2) {
            assert!(pair[0] >= pair[1], "bucket sizes must not grow: {sizes:?}");
        }
    }

    #[test]
    fn multiplier_scales_recorded_sizes_only() {
        let mut single = FakeGraph::with_budget(3200);
        let alone = collect_stats(&mut single, &config(16, 16, 1), 1.0);

        let mut quad = FakeGraph::with_budget(3200);
        let scaled = collect_stats(&mut quad, &config(16, 16, 1), 4.0);

        assert_eq!(alone.max_batch_size(16), Some(200));
        assert_eq!(scaled.max_batch_size(16), Some(800));
        // identical probe sequence: the multiplier never reaches the engine
        let probe_shapes =
            |graph: &FakeGraph| graph.probes.iter().map(|(l, b, _)| (l.clone(), *b)).collect::<Vec<_>>();
        assert_eq!(probe_shapes(&single), probe_shapes(&quad));
    }

    #[test]
    fn class_streams_probe_at_length_one() {
        let mut graph = FakeGraph::with_budget(3200);
        let mut config = config(16, 32, 2);
        config.input_types = vec![InputType::Sequence, InputType::Class];
        collect_stats(&mut graph, &config, 1.0);

        assert!(graph.probes.iter().all(|(lengths, _, _)| lengths[1] == 1));
        assert!(graph.probes.iter().any(|(lengths, _, _)| lengths[0] == 16));
        assert!(graph.probes.iter().any(|(lengths, _, _)| lengths[0] == 32));
    }

    #[test]
    fn max_length_rounds_up_to_a_step_multiple() {
        let mut graph = FakeGraph::with_budget(5000);
        let stats = collect_stats(&mut graph, &config(16, 30, 1), 1.0);

        let buckets: Vec<usize> = stats.iter().map(|(bucket, _)| bucket).collect();
        assert_eq!(buckets, vec![16, 32]);
    }

    #[test]
    fn overflow_abort_suspended_during_probes_and_restored() {
        let mut graph = FakeGraph::with_budget(3200);
        collect_stats(&mut graph, &config(16, 32, 1), 1.0);

        assert!(graph.probes.iter().all(|(_, _, abort)| !abort));
        assert!(graph.overflow_abort_enabled());
    }

    #[test]
    fn restores_abort_even_when_nothing_fits() {
        let mut graph = FakeGraph::with_budget(0);
        let stats = collect_stats(&mut graph, &config(16, 32, 1), 1.0);

        assert!(stats.is_empty());
        assert!(graph.overflow_abort_enabled());
    }

    #[test]
    fn lookup_rounds_up_between_buckets() {
        let mut stats = BatchStats::default();
        stats.add(16, 200);
        stats.add(32, 100);

        assert_eq!(stats.max_batch_size(1), Some(200));
        assert_eq!(stats.max_batch_size(17), Some(100));
        assert_eq!(stats.max_batch_size(32), Some(100));
        // beyond the longest measured bucket: fall back to its entry
        assert_eq!(stats.max_batch_size(48), Some(100));
        assert_eq!(BatchStats::default().max_batch_size(16), None);
    }
}
