use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};
use tessera_core::DeviceId;

/// Opaque loss handle returned by a trial graph build. The batch-fit probes
/// discard it; only the engine's fit signal matters there.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Loss(pub f32);

/// Synthetic batch used to probe the engine's memory budget. Content is
/// fabricated noise; only the shape drives the memory footprint.
#[derive(Clone, Debug)]
pub struct ProbeBatch {
    /// Effective sequence length per input stream.
    pub lengths: Vec<usize>,
    pub batch_size: usize,
    /// One fabricated token buffer per stream, `batch_size * length` each.
    pub tokens: Vec<Vec<i32>>,
}

impl ProbeBatch {
    pub fn synthetic(lengths: Vec<usize>, batch_size: usize) -> Self {
        let mut rng = rand::rng();
        let tokens = lengths
            .iter()
            .map(|length| {
                (0..batch_size * length)
                    .map(|_| rng.random_range(0..32_000))
                    .collect()
            })
            .collect();
        Self {
            lengths,
            batch_size,
            tokens,
        }
    }
}

/// One shard's view of the execution engine: graph construction, the
/// allocator's fit signal and the NaN/Inf abort switch.
pub trait ShardGraph: Send {
    fn build_loss_graph(&mut self, batch: &ProbeBatch) -> Loss;
    fn fits_memory_budget(&self) -> bool;
    fn overflow_abort_enabled(&self) -> bool;
    fn set_overflow_abort_enabled(&mut self, enabled: bool);
}

/// Model wrapper owning serialization of one shard's weights.
pub trait ModelHost: Send {
    fn load(
        &mut self,
        graph: &mut dyn ShardGraph,
        path: &Path,
        load_optimizer_state: bool,
    ) -> Result<()>;
    fn save(&self, graph: &dyn ShardGraph, path: &Path, write_inference_config: bool)
        -> Result<()>;
}

/// Training-progress collaborator; optional, everything degrades to a no-op
/// or a documented fallback without one.
pub trait Scheduler: Send {
    fn load(&mut self, path: &Path) -> Result<()>;
    fn save(&self, path: &Path) -> Result<()>;
    fn completed_updates(&self) -> u64;
    fn validate(&mut self, shards: &mut [Shard], is_final: bool);
}

/// Serializable slice of one shard's optimizer state (moments, running
/// averages), opaque to the coordinator beyond persistence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub tensors: BTreeMap<String, Vec<f32>>,
    pub updates: u64,
}

/// Per-shard optimizer: parameter smoothing and checkpointable state.
pub trait OptimizerShard: Send {
    /// Exchange the shard's live parameters with their smoothed counterpart
    /// (`use_smoothed = true`) or back (`use_smoothed = false`).
    fn swap_with_smoothed(
        &mut self,
        graph: &mut dyn ShardGraph,
        shard_idx: usize,
        num_shards: usize,
        use_smoothed: bool,
    );
    fn state(&self) -> OptimizerState;
    fn restore(&mut self, state: OptimizerState);
}

/// One parallel replica of the computation graph bound to a device,
/// together with its local model instantiation.
pub struct Shard {
    pub device: DeviceId,
    pub graph: Box<dyn ShardGraph>,
    pub model: Box<dyn ModelHost>,
}

impl Shard {
    pub fn new(device: DeviceId, graph: Box<dyn ShardGraph>, model: Box<dyn ModelHost>) -> Self {
        Self {
            device,
            graph,
            model,
        }
    }
}
