use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Mean negative log-likelihood of integer class targets under softmax logits.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// `logits` is `[batch, classes]`, `targets` is `[batch]`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = match logits.dims() {
            [batch, classes] => (*batch, *classes),
            dims => {
                return Err(TrainingError::runtime(format!(
                    "cross entropy expects [batch, classes] logits, got {dims:?}"
                )))
            }
        };
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy needs at least one row and one class",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets shape {:?} does not match {batch} logit rows",
                targets.dims()
            )));
        }

        let targets = match targets.dtype() {
            DType::U32 => targets.clone(),
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {dtype:?} for cross entropy"
                )))
            }
        };
        let targets = targets.to_device(logits.device()).map_err(to_runtime_error)?;

        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
        let loss = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .and_then(|picked| picked.squeeze(1))
            .and_then(|nll| nll.neg())
            .and_then(|nll| nll.mean_all())
            .map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;
        if !value.is_finite() {
            return Err(TrainingError::runtime(format!("loss became {value}")));
        }

        Ok(LossOutput { loss, value })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar graph node to call `backward` on.
    pub loss: Tensor,
    /// Host copy of the batch mean.
    pub value: f64,
}
