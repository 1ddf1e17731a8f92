use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for SgdConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            momentum: value.momentum,
            weight_decay: value.weight_decay,
        }
    }
}

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
///
/// Per parameter: `d = g + wd * p`, `buf = momentum * buf + d` (the first
/// step seeds `buf = d`), `p = p - lr * buf`.
#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    momentum_buffer: Option<Tensor>,
}

impl Sgd {
    pub fn new(named_parameters: Vec<(String, Var)>, config: SgdConfig) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let dtype = var.as_tensor().dtype();
            if !dtype.is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                momentum_buffer: None,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Applies one update from `grads`, consuming the gradients it uses.
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let SgdConfig {
            learning_rate,
            momentum,
            weight_decay,
        } = self.config;

        for slot in &mut self.params {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad.to_dtype(DType::F32).map_err(to_runtime_error)?,
                None => continue,
            };
            let current = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;

            let direction = if weight_decay != 0.0 {
                let decay = current.affine(weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let direction = if momentum != 0.0 {
                let buffer = match &slot.momentum_buffer {
                    Some(previous) => previous
                        .affine(momentum, 0.0)
                        .and_then(|scaled| scaled.add(&direction))
                        .map_err(to_runtime_error)?,
                    None => direction,
                };
                slot.momentum_buffer = Some(buffer.clone());
                buffer
            } else {
                direction
            };

            let update = direction.affine(learning_rate, 0.0).map_err(to_runtime_error)?;
            let next = current.sub(&update).map_err(to_runtime_error)?;
            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(to_runtime_error)?;
        }

        self.step += 1;
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let momentum_buffer = match &slot.momentum_buffer {
                Some(buffer) => Some(flatten_to_vec(buffer, numel(&shape))?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                momentum_buffer,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            momentum: self.config.momentum,
            weight_decay: self.config.weight_decay,
            parameters,
        })
    }

    /// Restores momentum buffers and hyper-parameters. Parameter names and
    /// shapes must match the model exactly.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;
            let dims = slot.param.as_tensor().dims();
            if dims != saved.shape.as_slice() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}': {:?} vs {:?}",
                    slot.name, saved.shape, dims
                )));
            }
            let buffer = match saved.momentum_buffer {
                Some(values) => {
                    if values.len() != numel(dims) {
                        return Err(TrainingError::checkpoint(format!(
                            "optimizer state size mismatch for '{}'",
                            slot.name
                        )));
                    }
                    let device = slot.param.as_tensor().device();
                    Some(Tensor::from_vec(values, dims, device).map_err(to_runtime_error)?)
                }
                None => None,
            };
            restored.push(buffer);
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::checkpoint(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, buffer) in self.params.iter_mut().zip(restored) {
            slot.momentum_buffer = buffer;
        }
        self.step = state.step;
        self.config = SgdConfig {
            learning_rate: state.learning_rate,
            momentum: state.momentum,
            weight_decay: state.weight_decay,
        };
        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub momentum_buffer: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn setup(momentum: f64, weight_decay: f64) -> (Var, Sgd) {
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, -2.0], &Device::Cpu).unwrap()).unwrap();
        let sgd = Sgd::new(
            vec![("w".to_string(), var.clone())],
            SgdConfig {
                learning_rate: 0.1,
                momentum,
                weight_decay,
            },
        )
        .unwrap();
        (var, sgd)
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    fn sum_loss_step(var: &Var, sgd: &mut Sgd) {
        // d(sum w)/dw = 1 for every element
        let mut grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
        sgd.step(&mut grads).unwrap();
    }

    #[test]
    fn plain_sgd_moves_against_the_gradient() {
        let (var, mut sgd) = setup(0.0, 0.0);
        sum_loss_step(&var, &mut sgd);
        let v = values(&var);
        assert!((v[0] - 0.9).abs() < 1e-6);
        assert!((v[1] + 2.1).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let (var, mut sgd) = setup(0.9, 0.0);
        sum_loss_step(&var, &mut sgd);
        sum_loss_step(&var, &mut sgd);
        // 1.0 - 0.1 * 1 - 0.1 * (0.9 + 1)
        assert!((values(&var)[0] - 0.71).abs() < 1e-6);
        assert_eq!(sgd.steps_taken(), 2);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let (var, mut sgd) = setup(0.0, 0.5);
        sum_loss_step(&var, &mut sgd);
        // 1.0 - 0.1 * (1 + 0.5)
        assert!((values(&var)[0] - 0.85).abs() < 1e-6);
    }

    #[test]
    fn state_restores_momentum() {
        let (var, mut sgd) = setup(0.9, 1e-4);
        sum_loss_step(&var, &mut sgd);
        let state = sgd.state().unwrap();
        assert!(state.parameters[0].momentum_buffer.is_some());

        let (other_var, mut restored) = setup(0.5, 0.0);
        restored.load_state(state.clone()).unwrap();
        assert_eq!(restored.state().unwrap(), state);
        drop(other_var);
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let (_var, mut sgd) = setup(0.9, 0.0);
        let state = OptimizerState {
            step: 1,
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
            parameters: vec![ParameterState {
                name: "w".to_string(),
                shape: vec![3],
                momentum_buffer: None,
            }],
        };
        assert!(matches!(sgd.load_state(state), Err(TrainingError::Checkpoint(_))));
    }
}
