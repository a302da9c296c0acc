use crate::{
    batch_fit::{BatchStats, collect_stats},
    collective::Collective,
    config::TrainConfig,
    cost_scale::CostScale,
    engine::{OptimizerShard, Scheduler, Shard},
};
use std::sync::Arc;
use tessera_core::Barrier;
use tracing::info;

/// Owner of the shard set for one training run: per-shard graphs and model
/// wrappers, the parallel optimizer shards, the optional scheduler and the
/// optional cost-scale state, wired to the group's barrier and collective
/// transport.
pub struct ShardGroup {
    pub(crate) config: TrainConfig,
    pub(crate) shards: Vec<Shard>,
    pub(crate) optimizer_shards: Vec<Box<dyn OptimizerShard>>,
    pub(crate) scheduler: Option<Box<dyn Scheduler>>,
    pub(crate) barrier: Arc<dyn Barrier>,
    pub(crate) collective: Arc<dyn Collective>,
    cost_scale: CostScale,
    finalized: bool,
    typical_trg_batch_words: usize,
}

impl ShardGroup {
    pub fn new(
        config: TrainConfig,
        shards: Vec<Shard>,
        optimizer_shards: Vec<Box<dyn OptimizerShard>>,
        barrier: Arc<dyn Barrier>,
        collective: Arc<dyn Collective>,
    ) -> Self {
        assert!(!shards.is_empty(), "shard group needs at least one shard");
        assert_eq!(
            shards.len(),
            optimizer_shards.len(),
            "number of shards and optimizer shards has to be equal ({} != {})",
            shards.len(),
            optimizer_shards.len()
        );
        // the configured device set sizes the batch-fit projection
        assert_eq!(
            shards.len(),
            config.devices.len(),
            "number of shards and configured devices has to be equal ({} != {})",
            shards.len(),
            config.devices.len()
        );

        let cost_scale = match &config.cost_scaling {
            Some(cost_scaling) => CostScale::from_config(cost_scaling),
            None => CostScale::disabled(),
        };

        info!(
            shards = shards.len(),
            devices = ?config.devices,
            "constructed shard group"
        );

        Self {
            config,
            shards,
            optimizer_shards,
            scheduler: None,
            barrier,
            collective,
            cost_scale,
            finalized: false,
            typical_trg_batch_words: 0,
        }
    }

    pub fn set_scheduler(&mut self, scheduler: Box<dyn Scheduler>) {
        self.ensure_active();
        self.scheduler = Some(scheduler);
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Record one overflow-free update with the cost-scale state; no-op when
    /// cost scaling is disabled.
    pub fn increase_cost_scale(&mut self) {
        self.cost_scale.increase();
    }

    /// Record one overflowing update with the cost-scale state; no-op when
    /// cost scaling is disabled.
    pub fn decrease_cost_scale(&mut self) {
        self.cost_scale.decrease();
    }

    pub fn cost_scale_factor(&self) -> Option<f32> {
        self.cost_scale.factor()
    }

    /// Probe shard 0's graph for per-length batch-size ceilings, projected
    /// onto the whole device set. Typically called once, before training.
    pub fn collect_stats(&mut self) -> BatchStats {
        self.ensure_active();
        let multiplier = self.config.devices.len() as f64;
        collect_stats(self.shards[0].graph.as_mut(), &self.config, multiplier)
    }

    // needed for dynamic batch-size scaling
    pub fn set_typical_trg_batch_words(&mut self, typical_trg_batch_words: usize) {
        self.typical_trg_batch_words = typical_trg_batch_words;
    }

    pub fn typical_trg_batch_words(&self) -> usize {
        self.typical_trg_batch_words
    }

    pub(crate) fn ensure_active(&self) {
        assert!(!self.finalized, "training has already finished");
    }

    /// One-way latch; mutating operations on a finalized group abort.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}
