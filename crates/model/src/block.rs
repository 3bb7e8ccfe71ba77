use candle_core::{Result, Tensor, D};
use candle_nn::{ops, Dropout, Init, Linear, Module, VarBuilder};

use crate::config::Gpt2Config;

/// Layer normalization over the last dimension, written with primitive ops so
/// gradients flow on every backend.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = variance.affine(1.0, self.eps)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Multi-head causal self-attention with a fused query/key/value projection.
#[derive(Debug)]
pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    n_head: usize,
    head_dim: usize,
    scale: f64,
}

impl CausalSelfAttention {
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let head_dim = config.head_dim();
        Ok(Self {
            c_attn: candle_nn::linear(n_embd, 3 * n_embd, vb.pp("c_attn"))?,
            c_proj: candle_nn::linear(n_embd, n_embd, vb.pp("c_proj"))?,
            attn_dropout: Dropout::new(config.attn_pdrop),
            resid_dropout: Dropout::new(config.resid_pdrop),
            n_head: config.n_head,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `mask` is an additive `(seq, seq)` bias holding zeros on and below the diagonal.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq, n_embd) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let split = |offset: usize| -> Result<Tensor> {
            qkv.narrow(2, offset, n_embd)?
                .reshape((batch, seq, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let query = split(0)?;
        let key = split(n_embd)?;
        let value = split(2 * n_embd)?;

        let scores = query
            .matmul(&key.t()?.contiguous()?)?
            .affine(self.scale, 0.0)?
            .broadcast_add(mask)?;
        let weights = ops::softmax(&scores, D::Minus1)?;
        let weights = self.attn_dropout.forward(&weights, train)?;

        let attended = weights
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, n_embd))?;
        let projected = self.c_proj.forward(&attended)?;
        self.resid_dropout.forward(&projected, train)
    }
}

#[derive(Debug)]
pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let inner = config.inner_dim();
        Ok(Self {
            c_fc: candle_nn::linear(config.n_embd, inner, vb.pp("c_fc"))?,
            c_proj: candle_nn::linear(inner, config.n_embd, vb.pp("c_proj"))?,
            dropout: Dropout::new(config.resid_pdrop),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        // tanh-approximated GELU, matching GPT-2's `gelu_new`
        let hidden = self.c_fc.forward(x)?.gelu()?;
        let projected = self.c_proj.forward(&hidden)?;
        self.dropout.forward(&projected, train)
    }
}

/// Pre-norm transformer block: `x + attn(ln_1(x))` then `x + mlp(ln_2(x))`.
#[derive(Debug)]
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: LayerNorm::new(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: LayerNorm::new(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln_1.forward(x)?, mask, train)?;
        let x = (x + attn_out)?;
        let mlp_out = self.mlp.forward(&self.ln_2.forward(&x)?, train)?;
        x + mlp_out
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn layer_norm_normalizes_last_dim() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = LayerNorm::new(4, 1e-5, vb.pp("ln")).unwrap();
        let x = Tensor::new(&[[1f32, 2., 3., 4.], [10., 10., 10., 10.]], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let mean: f32 = y[0].iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(y[1].iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn attention_ignores_future_positions() {
        let mut config = Gpt2Config::gpt2_small();
        config.n_embd = 8;
        config.n_head = 2;
        config.attn_pdrop = 0.0;
        config.resid_pdrop = 0.0;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = CausalSelfAttention::new(&config, vb).unwrap();
        let mask = crate::model::causal_mask(3, &Device::Cpu).unwrap();

        let a = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let tail = Tensor::randn(0f32, 1.0, (1, 1, 8), &Device::Cpu).unwrap();
        let b = Tensor::cat(&[&a.narrow(1, 0, 2).unwrap(), &tail], 1).unwrap();

        let ya = attn.forward(&a, &mask, false).unwrap();
        let yb = attn.forward(&b, &mask, false).unwrap();
        let head_a = ya.narrow(1, 0, 2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let head_b = yb.narrow(1, 0, 2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in head_a.iter().zip(head_b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
