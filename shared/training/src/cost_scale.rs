use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, PartialEq)]
pub enum CostScaleConfigError {
    #[error("cost-scaling expects 4 comma-separated fields (exponent,frequency,multiplier,tolerance), got {0}")]
    WrongFieldCount(usize),

    #[error("cost-scaling field `{field}` is not numeric: {value}")]
    NotNumeric { field: &'static str, value: String },

    #[error("cost-scaling frequency must be > 0")]
    ZeroFrequency,
}

/// Parsed form of the composite `cost-scaling` configuration value,
/// e.g. `"4,100,2.0,0.5"`. The exponent seeds the factor as `2^exponent`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CostScaleConfig {
    pub exponent: f32,
    pub frequency: u64,
    pub multiplier: f32,
    pub tolerance: f32,
}

impl FromStr for CostScaleConfig {
    type Err = CostScaleConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(CostScaleConfigError::WrongFieldCount(fields.len()));
        }
        let numeric = |field: &'static str, value: &str| {
            value
                .parse::<f32>()
                .map_err(|_| CostScaleConfigError::NotNumeric {
                    field,
                    value: value.to_string(),
                })
        };
        let exponent = numeric("exponent", fields[0])?;
        let frequency = fields[1]
            .parse::<u64>()
            .map_err(|_| CostScaleConfigError::NotNumeric {
                field: "frequency",
                value: fields[1].to_string(),
            })?;
        if frequency == 0 {
            return Err(CostScaleConfigError::ZeroFrequency);
        }
        Ok(Self {
            exponent,
            frequency,
            multiplier: numeric("multiplier", fields[2])?,
            tolerance: numeric("tolerance", fields[3])?,
        })
    }
}

impl TryFrom<String> for CostScaleConfig {
    type Error = CostScaleConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CostScaleConfig> for String {
    fn from(config: CostScaleConfig) -> Self {
        format!(
            "{},{},{},{}",
            config.exponent, config.frequency, config.multiplier, config.tolerance
        )
    }
}

/// Dynamic loss-scale state for reduced-precision training.
///
/// The factor grows by `multiplier` every `frequency` overflow-free updates
/// and shrinks by the same multiplier once the observed share of overflowing
/// updates exceeds `tolerance`. When constructed disabled, every operation
/// is a no-op.
#[derive(Debug)]
pub struct CostScale {
    enabled: bool,
    factor: f32,
    frequency: u64,
    multiplier: f32,
    tolerance: f32,
    no_overflow_seen: u64,
    overflow_seen: u64,
}

impl CostScale {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            factor: 1.0,
            frequency: 1,
            multiplier: 1.0,
            tolerance: 0.0,
            no_overflow_seen: 0,
            overflow_seen: 0,
        }
    }

    pub fn from_config(config: &CostScaleConfig) -> Self {
        let factor = 2f32.powf(config.exponent);
        info!(
            "training with cost scaling - factor: 2^{} = {}, frequency: {}, multiplier: {}, tolerance: {}",
            config.exponent, factor, config.frequency, config.multiplier, config.tolerance
        );
        Self {
            enabled: true,
            factor,
            frequency: config.frequency,
            multiplier: config.multiplier,
            tolerance: config.tolerance,
            no_overflow_seen: 0,
            overflow_seen: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Current loss-scale factor, `None` when cost scaling is disabled.
    pub fn factor(&self) -> Option<f32> {
        self.enabled.then_some(self.factor)
    }

    // Share of overflowing updates in the current observation window. The
    // zero-denominator cold start deliberately reports 1.0: a run that has
    // recorded nothing yet must not scale down on its first overflow unless
    // the tolerance is zero.
    fn overflow_share(&self) -> f32 {
        if self.no_overflow_seen == 0 {
            1.0
        } else {
            self.overflow_seen as f32 / self.no_overflow_seen as f32
        }
    }

    /// Record one overflow-free update; every `frequency` such updates the
    /// factor grows by `multiplier`.
    pub fn increase(&mut self) {
        if !self.enabled {
            return;
        }
        self.no_overflow_seen += 1;
        let share = self.overflow_share();
        if self.no_overflow_seen % self.frequency == 0 {
            self.factor *= self.multiplier;
            info!(
                "overflow share {:.2} after {} updates, increasing cost-scale factor to {}",
                share, self.no_overflow_seen, self.factor
            );
        }
    }

    /// Record one update in which gradient overflow was detected. The factor
    /// only shrinks once the overflow share exceeds the tolerance; both
    /// counters reset on that transition, restarting the window.
    pub fn decrease(&mut self) {
        if !self.enabled {
            return;
        }
        self.overflow_seen += 1;
        let share = self.overflow_share();
        if share > self.tolerance {
            self.factor /= self.multiplier;
            warn!(
                "overflow share {:.2} in gradients, skipping update, reducing cost-scale factor to {}",
                share, self.factor
            );
            self.no_overflow_seen = 0;
            self.overflow_seen = 0;
        }
    }
}
