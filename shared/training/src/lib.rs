mod batch_fit;
mod checkpoint;
mod collective;
mod config;
mod cost_scale;
mod engine;
mod group;

pub use batch_fit::{BatchStats, collect_stats};
pub use checkpoint::CheckpointError;
pub use collective::{Collective, LocalCollective};
pub use config::{InputType, TrainConfig};
pub use cost_scale::{CostScale, CostScaleConfig, CostScaleConfigError};
pub use engine::{Loss, ModelHost, OptimizerShard, OptimizerState, ProbeBatch, Scheduler, Shard, ShardGraph};
pub use group::ShardGroup;
