use crate::cost_scale::CostScaleConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tessera_core::DeviceId;

/// Kind of data carried by one parallel input stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    #[default]
    Sequence,
    /// One class label per example; effective sequence length is always 1.
    Class,
}

/// Configuration surface of the training coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrainConfig {
    /// Base path of the canonical model file; checkpoint and snapshot paths
    /// derive from it.
    pub model: PathBuf,
    pub devices: Vec<DeviceId>,
    pub cost_scaling: Option<CostScaleConfig>,
    /// Skip all checkpoint restoration at startup.
    pub no_reload: bool,
    /// Weights-only seed used when no checkpoint exists yet.
    pub pretrained_model: Option<PathBuf>,
    /// Overwrite the canonical model file in place instead of also writing
    /// iteration-numbered snapshots.
    pub overwrite: bool,
    pub mini_batch_fit_step: usize,
    pub max_length: usize,
    /// One entry per parallel input stream.
    pub train_sets: Vec<String>,
    /// Per-stream type markers, aligned with `train_sets`; missing entries
    /// default to `Sequence`.
    pub input_types: Vec<InputType>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("model.bin"),
            devices: vec![DeviceId(0)],
            cost_scaling: None,
            no_reload: false,
            pretrained_model: None,
            overwrite: false,
            mini_batch_fit_step: 10,
            max_length: 50,
            train_sets: vec!["train".to_string()],
            input_types: Vec::new(),
        }
    }
}

impl TrainConfig {
    // Inserts `suffix` before the model file's extension, or appends it when
    // the model path has none, so derived artifacts share the model's naming
    // scheme either way.
    fn with_suffix(&self, suffix: &str) -> PathBuf {
        match self.model.extension().and_then(|ext| ext.to_str()) {
            Some(extension) => {
                let stem = self
                    .model
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or("model");
                self.model
                    .with_file_name(format!("{stem}.{suffix}.{extension}"))
            }
            None => {
                let name = self
                    .model
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("model");
                self.model.with_file_name(format!("{name}.{suffix}"))
            }
        }
    }

    /// Path of the combined optimizer-state file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.with_suffix("optimizer")
    }

    /// Path of an intermediate snapshot embedding the update count.
    pub fn iteration_path(&self, updates: &str) -> PathBuf {
        self.with_suffix(&format!("iter{updates}"))
    }

    pub fn model_path(&self) -> &Path {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_keep_the_model_extension() {
        let config = TrainConfig {
            model: PathBuf::from("run/model.npz"),
            ..Default::default()
        };
        assert_eq!(config.checkpoint_path(), PathBuf::from("run/model.optimizer.npz"));
        assert_eq!(
            config.iteration_path("1200"),
            PathBuf::from("run/model.iter1200.npz")
        );
    }

    #[test]
    fn extensionless_model_gets_plain_suffixes() {
        let config = TrainConfig {
            model: PathBuf::from("run/model"),
            ..Default::default()
        };
        assert_eq!(config.checkpoint_path(), PathBuf::from("run/model.optimizer"));
        assert_eq!(
            config.iteration_path("42"),
            PathBuf::from("run/model.iter42")
        );
    }

    #[test]
    fn config_round_trips_through_kebab_case_json() {
        let json = r#"{
            "model": "out/model.bin",
            "cost-scaling": "4,100,2.0,0.5",
            "no-reload": true,
            "pretrained-model": "seed/model.bin",
            "mini-batch-fit-step": 16,
            "max-length": 32,
            "train-sets": ["src", "labels"],
            "input-types": ["sequence", "class"]
        }"#;
        let config: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cost_scaling.unwrap().frequency, 100);
        assert!(config.no_reload);
        assert_eq!(config.input_types, vec![InputType::Sequence, InputType::Class]);

        let round_tripped: TrainConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round_tripped.max_length, 32);
        assert_eq!(round_tripped.train_sets.len(), 2);
    }
}
