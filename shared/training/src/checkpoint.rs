use crate::{
    engine::{OptimizerState, Shard},
    group::ShardGroup,
};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::PathBuf,
};
use tessera_core::CancelledBarrier;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("barrier cancelled while checkpointing")]
    Cancelled(#[from] CancelledBarrier),

    #[error("model file exists but its optimizer state is missing at {0}; checkpoint set is invalid")]
    MissingOptimizerState(PathBuf),

    #[error("optimizer checkpoint holds {found} shard slices, group has {expected}")]
    ShardCountChanged { expected: usize, found: usize },

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl ShardGroup {
    /// Persist a consistent snapshot of the whole group: smoothed-parameter
    /// model weights, scheduler progress and every shard's optimizer slice.
    ///
    /// All processes must call this collectively; only the designated main
    /// process writes files, but the smoothed swap and the optimizer-state
    /// gather run everywhere.
    pub fn save(&mut self, is_final: bool, is_main_process: bool) -> Result<(), CheckpointError> {
        self.ensure_active();

        self.barrier.wait()?; // (for better grouping of log messages)

        if is_main_process {
            // bring the smoothed parameters in; the swap itself is sharded
            // across the group, so it runs on all processes concurrently
            // even though only one validates and writes
            self.swap_with_smoothed()?;

            // swap back even when validation or the model write fails, so a
            // caller that handles the error keeps training on the live
            // weights rather than the smoothed copy
            let written = self.validate_and_save_model(is_final);
            let restored = self.swap_with_original();
            written?;
            restored?;
        }

        self.barrier.wait()?; // (for better grouping of log messages)

        self.save_checkpoint(is_main_process)?;

        self.barrier.wait()?; // (for better grouping of log messages)

        Ok(())
    }

    // Everything that must run while the smoothed parameters are swapped in.
    fn validate_and_save_model(&mut self, is_final: bool) -> Result<(), CheckpointError> {
        if is_final {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.validate(&mut self.shards, is_final);
            }
        }

        self.barrier.wait()?; // (for better grouping of log messages)

        self.save_model(is_final)
    }

    /// Write the canonical model file from shard 0's view. In non-overwrite
    /// mode a non-final save first writes an iteration-numbered copy.
    pub fn save_model(&mut self, is_final: bool) -> Result<(), CheckpointError> {
        let name = self.config.model.clone();

        if !self.config.overwrite && !is_final {
            let updates = match &self.scheduler {
                Some(scheduler) => scheduler.completed_updates().to_string(),
                None => "unknown".to_string(),
            };
            let snapshot = self.config.iteration_path(&updates);
            let shard = &self.shards[0];
            shard.model.save(shard.graph.as_ref(), &snapshot, false)?;
        }

        let shard = &self.shards[0];
        shard.model.save(shard.graph.as_ref(), &name, true)?;

        if let Some(scheduler) = &self.scheduler {
            scheduler.save(&name)?;
        }

        Ok(())
    }

    /// Persist the combined optimizer state. The gather is a collective: it
    /// runs on every process, while only the main process writes the file.
    pub fn save_checkpoint(&mut self, is_main_process: bool) -> Result<(), CheckpointError> {
        let local: Vec<OptimizerState> = self
            .optimizer_shards
            .iter()
            .map(|optimizer| optimizer.state())
            .collect();
        let combined = self.collective.gather_optimizer_state(local)?;

        if is_main_process {
            let path = self.config.checkpoint_path();
            let file = File::create(&path)?;
            serde_json::to_writer(BufWriter::new(file), &combined)?;
        }

        Ok(())
    }

    /// Restore the group from disk: a full checkpoint set if one exists,
    /// otherwise weights-only from a configured pretrained model, otherwise
    /// a fresh start. Honors `no-reload`.
    pub fn load(&mut self) -> Result<(), CheckpointError> {
        self.ensure_active();

        if self.config.no_reload {
            return Ok(());
        }

        let name = self.config.model.clone();
        if name.exists() {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.load(&name)?;
            }

            // every shard reads the same file; redundant re-reads are cheap
            // once the OS has it cached
            for shard in &mut self.shards {
                let Shard { graph, model, .. } = shard;
                model.load(graph.as_mut(), &name, true)?;
            }

            self.restore_checkpoint()?;

            info!("[training] model reloaded from {}", name.display());
        } else if let Some(pretrained) = self.config.pretrained_model.clone() {
            info!(
                "[training] initializing model weights with pre-trained model {}",
                pretrained.display()
            );

            for shard in &mut self.shards {
                let Shard { graph, model, .. } = shard;
                model.load(graph.as_mut(), &pretrained, false)?;
            }
        }

        Ok(())
    }

    /// Read the combined optimizer file and scatter its slices back onto the
    /// local optimizer shards.
    fn restore_checkpoint(&mut self) -> Result<(), CheckpointError> {
        let path = self.config.checkpoint_path();
        if !path.exists() {
            return Err(CheckpointError::MissingOptimizerState(path));
        }

        let file = File::open(&path)?;
        let combined: Vec<OptimizerState> = serde_json::from_reader(BufReader::new(file))?;
        let local = self.collective.scatter_optimizer_state(combined)?;

        if local.len() != self.optimizer_shards.len() {
            return Err(CheckpointError::ShardCountChanged {
                expected: self.optimizer_shards.len(),
                found: local.len(),
            });
        }

        for (optimizer, state) in self.optimizer_shards.iter_mut().zip(local) {
            optimizer.restore(state);
        }

        Ok(())
    }

    /// Swap every shard's live parameters with its smoothed counterpart,
    /// then re-distribute the swapped parameters across the group.
    pub fn swap_with_smoothed(&mut self) -> Result<(), CheckpointError> {
        self.swap(true)
    }

    /// Swap the smoothed parameters back out, restoring the live weights.
    pub fn swap_with_original(&mut self) -> Result<(), CheckpointError> {
        self.swap(false)
    }

    fn swap(&mut self, use_smoothed: bool) -> Result<(), CheckpointError> {
        assert_eq!(
            self.shards.len(),
            self.optimizer_shards.len(),
            "number of shards and optimizer shards has to be equal ({} != {})",
            self.shards.len(),
            self.optimizer_shards.len()
        );

        let num_shards = self.shards.len();
        for (i, (shard, optimizer)) in self
            .shards
            .iter_mut()
            .zip(self.optimizer_shards.iter_mut())
            .enumerate()
        {
            optimizer.swap_with_smoothed(shard.graph.as_mut(), i, num_shards, use_smoothed);
        }

        self.collective.broadcast_parameters()?;
        Ok(())
    }
}
