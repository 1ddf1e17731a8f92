use candle_core::{backprop::GradStore, DType, Tensor, Var};

use super::Collective;
use crate::{error::to_runtime_error, TrainingError};

/// Overwrites every parameter with the values held by `root`.
///
/// Called once after construction (and resume) so all replicas start identical.
pub fn broadcast_parameters(
    collective: &dyn Collective,
    parameters: &[(String, Var)],
    root: usize,
) -> Result<(), TrainingError> {
    if collective.world_size() == 1 {
        return Ok(());
    }
    let tensors: Vec<&Tensor> = parameters.iter().map(|(_, var)| var.as_tensor()).collect();
    let mut packed = pack(&tensors)?;
    collective.broadcast(&mut packed, root)?;

    let mut offset = 0;
    for (name, var) in parameters {
        let numel = var.elem_count();
        let slice = packed.get(offset..offset + numel).ok_or_else(|| {
            TrainingError::collective(format!("broadcast buffer too short for {name}"))
        })?;
        let values = Tensor::from_slice(slice, var.shape().clone(), var.device())
            .and_then(|t| t.to_dtype(var.dtype()))
            .map_err(to_runtime_error)?;
        var.set(&values).map_err(to_runtime_error)?;
        offset += numel;
    }
    Ok(())
}

/// Averages the gradients of `parameters` over all ranks, in place.
///
/// A parameter without a gradient on this rank contributes zeros.
pub fn all_reduce_gradients(
    collective: &dyn Collective,
    parameters: &[(String, Var)],
    grads: &mut GradStore,
) -> Result<(), TrainingError> {
    let world_size = collective.world_size();
    if world_size == 1 {
        return Ok(());
    }

    let mut packed = Vec::new();
    for (_, var) in parameters {
        match grads.get(var.as_tensor()) {
            Some(grad) => packed.extend(flatten(grad)?),
            None => packed.extend(std::iter::repeat(0.0).take(var.elem_count())),
        }
    }
    collective.all_reduce_sum(&mut packed)?;

    let scale = 1.0 / world_size as f64;
    let mut offset = 0;
    for (_, var) in parameters {
        let numel = var.elem_count();
        let averaged: Vec<f64> = packed[offset..offset + numel]
            .iter()
            .map(|value| value * scale)
            .collect();
        let grad = Tensor::from_vec(averaged, var.shape().clone(), var.device())
            .and_then(|t| t.to_dtype(var.dtype()))
            .map_err(to_runtime_error)?;
        grads.insert(var.as_tensor(), grad);
        offset += numel;
    }
    Ok(())
}

fn pack(tensors: &[&Tensor]) -> Result<Vec<f64>, TrainingError> {
    let mut packed = Vec::new();
    for tensor in tensors {
        packed.extend(flatten(tensor)?);
    }
    Ok(packed)
}

fn flatten(tensor: &Tensor) -> Result<Vec<f64>, TrainingError> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F64))
        .and_then(|t| t.to_vec1::<f64>())
        .map_err(to_runtime_error)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::distributed::spawn_workers;

    fn parameter(value: f32) -> (String, Var) {
        let var = Var::from_tensor(&Tensor::full(value, (2, 2), &Device::Cpu).unwrap()).unwrap();
        ("w".to_string(), var)
    }

    #[test]
    fn replicas_adopt_root_parameters() {
        let values = spawn_workers(3, None, |context, collective| {
            let params = vec![parameter(context.rank() as f32 + 1.0)];
            broadcast_parameters(collective.as_ref(), &params, 0)?;
            Ok(params[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
        })
        .unwrap();
        for value in values {
            assert_eq!(value, vec![1.0; 4]);
        }
    }

    #[test]
    fn gradients_are_averaged() {
        let grads = spawn_workers(2, None, |context, collective| {
            let params = vec![parameter(1.0)];
            let scale = (context.rank() + 1) as f64;
            let loss = params[0].1.as_tensor().affine(scale, 0.0).unwrap().sum_all().unwrap();
            let mut store = loss.backward().unwrap();
            all_reduce_gradients(collective.as_ref(), &params, &mut store)?;
            let grad = store.get(params[0].1.as_tensor()).unwrap();
            Ok(grad.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        })
        .unwrap();
        for grad in grads {
            assert_eq!(grad, vec![1.5; 4]);
        }
    }
}
