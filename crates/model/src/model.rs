use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{Dropout, Embedding, Module, VarBuilder, VarMap};
use rand::rngs::StdRng;

use crate::{
    block::{Block, LayerNorm},
    config::Gpt2Config,
    init::initialize_parameters,
};

pub const CONFIG_FILENAME: &str = "config.json";
pub const WEIGHTS_FILENAME: &str = "model.safetensors";

/// GPT-2 with a language-modeling head tied to the token embedding.
pub struct Gpt2LmHeadModel {
    config: Gpt2Config,
    device: Device,
    varmap: VarMap,
    wte: Embedding,
    wpe: Embedding,
    drop: Dropout,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
}

impl Gpt2LmHeadModel {
    /// Builds a freshly initialized model. Parameters are drawn from `rng` in
    /// name order, so equal seeds give identical weights on any device.
    pub fn new(config: Gpt2Config, device: &Device, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let vb = vb.pp("transformer");

        let wte = candle_nn::embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;
        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer in 0..config.n_layer {
            blocks.push(Block::new(&config, vb.pp(format!("h.{layer}")))?);
        }
        let ln_f = LayerNorm::new(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        let model = Self {
            drop: Dropout::new(config.embd_pdrop),
            config,
            device: device.clone(),
            varmap,
            wte,
            wpe,
            blocks,
            ln_f,
        };
        initialize_parameters(&model.named_parameters()?, &model.config, rng)?;
        tracing::debug!(
            parameters = model.num_parameters()?,
            layers = model.config.n_layer,
            "initialized GPT-2 model"
        );
        Ok(model)
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns logits shaped `(batch, seq, vocab_size)` for `(batch, seq)` token ids.
    pub fn forward(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        if seq == 0 {
            return Err(Error::Msg("input sequence must not be empty".into()));
        }
        if seq > self.config.n_positions {
            return Err(Error::Msg(format!(
                "sequence length {} exceeds n_positions {}",
                seq, self.config.n_positions
            )));
        }

        let positions = Tensor::arange(0u32, seq as u32, &self.device)?;
        let token_embeddings = self.wte.forward(input_ids)?;
        let position_embeddings = self.wpe.forward(&positions)?.unsqueeze(0)?;
        let mut hidden = token_embeddings.broadcast_add(&position_embeddings)?;
        hidden = self.drop.forward(&hidden, train)?;

        let mask = causal_mask(seq, &self.device)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &mask, train)?;
        }
        let hidden = self.ln_f.forward(&hidden)?;

        let n_embd = self.config.n_embd;
        hidden
            .reshape((batch * seq, n_embd))?
            .matmul(&self.wte.embeddings().t()?)?
            .reshape((batch, seq, self.config.vocab_size))
    }

    /// Trainable parameters sorted by name.
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("model parameter map lock poisoned".into()))?;
        let mut parameters: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        parameters.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(parameters)
    }

    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum())
    }

    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .named_parameters()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)
    }

    /// Replaces every parameter with the tensor of the same name in `path`.
    pub fn load_safetensors(&self, path: &Path) -> Result<()> {
        let mut tensors = candle_core::safetensors::load(path, &self.device)?;
        for (name, var) in self.named_parameters()? {
            let tensor = tensors
                .remove(&name)
                .ok_or_else(|| Error::Msg(format!("weights file is missing parameter {name}")))?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(Error::Msg(format!(
                    "parameter {name} has shape {:?} in weights file, expected {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            var.set(&tensor.to_dtype(var.as_tensor().dtype())?)?;
        }
        if !tensors.is_empty() {
            let mut extra: Vec<String> = tensors.into_keys().collect();
            extra.sort();
            return Err(Error::Msg(format!(
                "weights file contains unknown parameters: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    /// Writes `config.json` and `model.safetensors` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.config.write_json_file(&dir.join(CONFIG_FILENAME))?;
        self.save_safetensors(&dir.join(WEIGHTS_FILENAME))
    }
}

/// Additive attention bias: 0 where a query may attend, -1e9 above the diagonal.
pub(crate) fn causal_mask(seq: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(seq, DType::F32, device)?.affine(1e9, -1e9)
}
