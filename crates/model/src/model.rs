use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::{Architecture, ModelConfig},
    layer::Dense,
};

/// Feature classifier producing unnormalized class scores.
///
/// Neither architecture has dropout or normalization layers, so `forward`
/// computes the same scores in train and eval mode. The mode flag is still
/// tracked so callers can switch and restore it around evaluation.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    layers: Vec<(String, Dense)>,
    training: AtomicBool,
}

impl Model {
    /// Builds the layers for `config.arch`; identical seeds yield identical weights.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.init_seed);

        let layers = match config.arch {
            Architecture::Linear => vec![(
                "classifier".to_string(),
                Dense::new(
                    config.input_dim,
                    config.num_classes,
                    &mut rng,
                    config.dtype,
                    &config.device,
                )?,
            )],
            Architecture::Mlp => vec![
                (
                    "fc1".to_string(),
                    Dense::new(
                        config.input_dim,
                        config.hidden_dim,
                        &mut rng,
                        config.dtype,
                        &config.device,
                    )?,
                ),
                (
                    "fc2".to_string(),
                    Dense::new(
                        config.hidden_dim,
                        config.num_classes,
                        &mut rng,
                        config.dtype,
                        &config.device,
                    )?,
                ),
            ],
        };

        Ok(Self {
            config,
            layers,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn arch(&self) -> Architecture {
        self.config.arch
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// Produces logits shaped `(batch, num_classes)` for `(batch, input_dim)` features.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let dims = features.dims();
        if dims.len() != 2 || dims[1] != self.config.input_dim {
            return Err(Error::Msg(format!(
                "model input expected [batch, {}] got {:?}",
                self.config.input_dim, dims
            )));
        }

        let last = self.layers.len() - 1;
        let mut hidden = features.to_dtype(self.config.dtype)?;
        for (index, (_, layer)) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if index != last {
                hidden = hidden.relu()?;
            }
        }
        Ok(hidden)
    }

    /// Trainable variables in a stable order, keyed `<layer>.<weight|bias>`.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .flat_map(|(name, layer)| layer.named_parameters(name))
            .collect()
    }

    /// Switches between train and eval mode. Does not change `forward`.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}
