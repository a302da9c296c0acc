use crate::engine::OptimizerState;
use anyhow::Result;
use std::fmt::Debug;

/// Collective transport boundary the coordinator sequences but does not
/// implement. In a multi-process deployment this wraps the actual
/// broadcast/gather/scatter primitives; locally it is the identity.
pub trait Collective: Send + Sync + Debug {
    /// Propagate swapped parameters across the group after a smoothed/original
    /// parameter exchange.
    fn broadcast_parameters(&self) -> Result<()>;

    /// Combine every process's local optimizer slices into the full set, in
    /// shard order. Runs collectively on all processes; only the main process
    /// consumes the result.
    fn gather_optimizer_state(&self, local: Vec<OptimizerState>) -> Result<Vec<OptimizerState>>;

    /// Distribute a persisted combined optimizer state back out; returns the
    /// slices owned by the calling process, in local shard order.
    fn scatter_optimizer_state(&self, combined: Vec<OptimizerState>)
        -> Result<Vec<OptimizerState>>;
}

/// Identity transport for single-process runs: every shard is local, so
/// gather and scatter pass the slices straight through.
#[derive(Debug, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn broadcast_parameters(&self) -> Result<()> {
        Ok(())
    }

    fn gather_optimizer_state(&self, local: Vec<OptimizerState>) -> Result<Vec<OptimizerState>> {
        Ok(local)
    }

    fn scatter_optimizer_state(
        &self,
        combined: Vec<OptimizerState>,
    ) -> Result<Vec<OptimizerState>> {
        Ok(combined)
    }
}
