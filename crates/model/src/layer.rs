use candle_core::{bail, DType, Device, Result, Tensor, Var};
use rand::{distributions::Uniform, rngs::StdRng, Rng};

/// Fully connected layer `y = x W^T + b` backed by trainable variables.
#[derive(Debug)]
pub struct Dense {
    weight: Var,
    bias: Var,
    in_dim: usize,
    out_dim: usize,
}

impl Dense {
    /// Initializes weights and bias uniformly in `[-1/sqrt(in_dim), 1/sqrt(in_dim)]`.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            bail!("dense layer dimensions must be non-zero (got {in_dim}x{out_dim})");
        }
        let bound = 1.0 / (in_dim as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);

        let weight: Vec<f32> = (0..in_dim * out_dim).map(|_| rng.sample(&dist)).collect();
        let bias: Vec<f32> = (0..out_dim).map(|_| rng.sample(&dist)).collect();

        let weight = Tensor::from_vec(weight, (out_dim, in_dim), device)?.to_dtype(dtype)?;
        let bias = Tensor::from_vec(bias, out_dim, device)?.to_dtype(dtype)?;

        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            in_dim,
            out_dim,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match input.dims() {
            [_, features] if *features == self.in_dim => {}
            dims => bail!(
                "dense input expected [batch, {}] got {:?}",
                self.in_dim,
                dims
            ),
        }
        let weight_t = self.weight.as_tensor().t()?;
        input.matmul(&weight_t)?.broadcast_add(self.bias.as_tensor())
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub(crate) fn named_parameters(&self, prefix: &str) -> [(String, Var); 2] {
        [
            (format!("{prefix}.weight"), self.weight.clone()),
            (format!("{prefix}.bias"), self.bias.clone()),
        ]
    }
}
