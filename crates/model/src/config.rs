use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Error, Result};

/// Classifier head layouts the trainer can instantiate by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// Single affine projection from features to class scores.
    Linear,
    /// Two affine projections with a ReLU in between.
    Mlp,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::Linear, Architecture::Mlp];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Linear => "linear",
            Architecture::Mlp => "mlp",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "logistic" => Ok(Architecture::Linear),
            "mlp" | "feedforward" => Ok(Architecture::Mlp),
            other => {
                let known = Architecture::ALL
                    .iter()
                    .map(|arch| arch.name())
                    .collect::<Vec<_>>()
                    .join(" | ");
                Err(format!("unknown architecture '{other}' (expected {known})"))
            }
        }
    }
}

/// Shape and placement of a classifier instance.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub arch: Architecture,
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
    /// Seed for the host-side parameter initializer.
    pub init_seed: u64,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Msg("input_dim must be greater than zero".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg(format!(
                "num_classes must be at least 2 (got {})",
                self.num_classes
            )));
        }
        if self.arch == Architecture::Mlp && self.hidden_dim == 0 {
            return Err(Error::Msg(
                "hidden_dim must be greater than zero for the mlp architecture".into(),
            ));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "model parameters require a floating dtype (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }
}
