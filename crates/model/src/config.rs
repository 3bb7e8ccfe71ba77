use std::{fs, path::Path};

use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// GPT-2 hyperparameters, serialized with the field names of a hub `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpt2Config {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_dropout")]
    pub resid_pdrop: f32,
    #[serde(default = "default_dropout")]
    pub embd_pdrop: f32,
    #[serde(default = "default_dropout")]
    pub attn_pdrop: f32,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
}

impl Gpt2Config {
    pub fn gpt2_small() -> Self {
        Self::with_shape(768, 12, 12)
    }

    pub fn gpt2_medium() -> Self {
        Self::with_shape(1024, 24, 16)
    }

    pub fn gpt2_large() -> Self {
        Self::with_shape(1280, 36, 20)
    }

    pub fn gpt2_xl() -> Self {
        Self::with_shape(1600, 48, 25)
    }

    fn with_shape(n_embd: usize, n_layer: usize, n_head: usize) -> Self {
        Self {
            model_type: default_model_type(),
            vocab_size: GPT2_VOCAB_SIZE,
            n_positions: GPT2_CONTEXT,
            n_embd,
            n_layer,
            n_head,
            n_inner: None,
            resid_pdrop: default_dropout(),
            embd_pdrop: default_dropout(),
            attn_pdrop: default_dropout(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
            initializer_range: default_initializer_range(),
        }
    }

    /// Width of the MLP hidden layer (`4 * n_embd` unless overridden).
    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    pub fn apply_overrides(&mut self, overrides: &Gpt2Overrides) {
        if let Some(value) = overrides.n_positions {
            self.n_positions = value;
        }
        if let Some(value) = overrides.n_embd {
            self.n_embd = value;
        }
        if let Some(value) = overrides.n_layer {
            self.n_layer = value;
        }
        if let Some(value) = overrides.n_head {
            self.n_head = value;
        }
        if overrides.n_inner.is_some() {
            self.n_inner = overrides.n_inner;
        }
        if let Some(value) = overrides.resid_pdrop {
            self.resid_pdrop = value;
        }
        if let Some(value) = overrides.embd_pdrop {
            self.embd_pdrop = value;
        }
        if let Some(value) = overrides.attn_pdrop {
            self.attn_pdrop = value;
        }
        if let Some(value) = overrides.layer_norm_epsilon {
            self.layer_norm_epsilon = value;
        }
        if let Some(value) = overrides.initializer_range {
            self.initializer_range = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.n_positions == 0 {
            return Err(Error::Msg("n_positions must be greater than zero".into()));
        }
        if self.n_embd == 0 {
            return Err(Error::Msg("n_embd must be greater than zero".into()));
        }
        if self.n_layer == 0 {
            return Err(Error::Msg("n_layer must be greater than zero".into()));
        }
        if self.n_head == 0 {
            return Err(Error::Msg("n_head must be greater than zero".into()));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(Error::Msg(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.inner_dim() == 0 {
            return Err(Error::Msg("n_inner must be greater than zero".into()));
        }
        for (label, p) in [
            ("resid_pdrop", self.resid_pdrop),
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("{label} must be in [0, 1)")));
            }
        }
        if self.layer_norm_epsilon <= 0.0 {
            return Err(Error::Msg("layer_norm_epsilon must be positive".into()));
        }
        if self.initializer_range <= 0.0 {
            return Err(Error::Msg("initializer_range must be positive".into()));
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|err| {
            Error::Msg(format!(
                "failed to parse model config {}: {err}",
                path.display()
            ))
        })
    }

    pub fn write_json_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut data = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::Msg(format!("failed to serialize model config: {err}")))?;
        data.push(b'\n');
        fs::write(path, data)?;
        Ok(())
    }
}

/// Optional replacements applied on top of a registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Gpt2Overrides {
    #[serde(default)]
    pub n_positions: Option<usize>,
    #[serde(default)]
    pub n_embd: Option<usize>,
    #[serde(default)]
    pub n_layer: Option<usize>,
    #[serde(default)]
    pub n_head: Option<usize>,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default)]
    pub resid_pdrop: Option<f32>,
    #[serde(default)]
    pub embd_pdrop: Option<f32>,
    #[serde(default)]
    pub attn_pdrop: Option<f32>,
    #[serde(default)]
    pub layer_norm_epsilon: Option<f64>,
    #[serde(default)]
    pub initializer_range: Option<f64>,
}

impl Gpt2Overrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub const GPT2_VOCAB_SIZE: usize = 50_257;
pub const GPT2_CONTEXT: usize = 1_024;

fn default_model_type() -> String {
    "gpt2".to_string()
}

fn default_dropout() -> f32 {
    0.1
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_initializer_range() -> f64 {
    0.02
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_present_fields() {
        let mut config = Gpt2Config::gpt2_small();
        config.apply_overrides(&Gpt2Overrides {
            n_layer: Some(2),
            n_embd: Some(64),
            n_head: Some(4),
            ..Default::default()
        });
        assert_eq!(config.n_layer, 2);
        assert_eq!(config.n_embd, 64);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.inner_dim(), 256);
        assert_eq!(config.n_positions, GPT2_CONTEXT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_indivisible_heads() {
        let mut config = Gpt2Config::gpt2_small();
        config.n_head = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn hub_config_with_extra_fields_parses() {
        let json = r#"{
            "activation_function": "gelu_new",
            "architectures": ["GPT2LMHeadModel"],
            "model_type": "gpt2",
            "n_ctx": 1024,
            "n_embd": 768,
            "n_head": 12,
            "n_layer": 12,
            "n_positions": 1024,
            "vocab_size": 50257
        }"#;
        let config: Gpt2Config = serde_json::from_str(json).unwrap();
        assert_eq!(config, Gpt2Config::gpt2_small());
    }
}
