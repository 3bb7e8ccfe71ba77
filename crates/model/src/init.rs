use candle_core::{DType, Error, Result, Tensor, Var};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::config::Gpt2Config;

/// Re-initializes every parameter following the GPT-2 recipe:
/// weights ~ N(0, initializer_range), residual projections scaled by
/// `1 / sqrt(2 * n_layer)`, biases zero, layer norms unit gain.
///
/// `parameters` must be sorted by name so the draw order is reproducible.
pub fn initialize_parameters(
    parameters: &[(String, Var)],
    config: &Gpt2Config,
    rng: &mut StdRng,
) -> Result<()> {
    let base_std = config.initializer_range;
    let residual_std = base_std / (2.0 * config.n_layer as f64).sqrt();

    for (name, var) in parameters {
        let tensor = var.as_tensor();
        let shape = tensor.dims().to_vec();
        let device = tensor.device();

        let value = match ParameterKind::classify(name) {
            ParameterKind::NormGain => Tensor::ones(shape.as_slice(), DType::F32, device)?,
            ParameterKind::Bias => Tensor::zeros(shape.as_slice(), DType::F32, device)?,
            ParameterKind::ResidualProjection => normal(&shape, residual_std, device, rng)?,
            ParameterKind::Weight => normal(&shape, base_std, device, rng)?,
        };
        var.set(&value.to_dtype(tensor.dtype())?)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterKind {
    NormGain,
    Bias,
    ResidualProjection,
    Weight,
}

impl ParameterKind {
    fn classify(name: &str) -> Self {
        let is_norm = name.contains(".ln_");
        if name.ends_with(".bias") {
            Self::Bias
        } else if is_norm {
            Self::NormGain
        } else if name.ends_with("c_proj.weight") {
            Self::ResidualProjection
        } else {
            Self::Weight
        }
    }
}

fn normal(
    shape: &[usize],
    std: f64,
    device: &candle_core::Device,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let dist = Normal::new(0.0f32, std as f32)
        .map_err(|err| Error::Msg(format!("invalid init distribution: {err}")))?;
    let values: Vec<f32> = (0..shape.iter().product::<usize>()).map(|_| dist.sample(rng)).collect();
    Tensor::from_vec(values, shape, device)
}
