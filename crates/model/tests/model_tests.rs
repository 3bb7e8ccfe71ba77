use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{Gpt2Config, Gpt2LmHeadModel};
use rand::{rngs::StdRng, SeedableRng};

fn tiny_config() -> Gpt2Config {
    let mut config = Gpt2Config::gpt2_small();
    config.vocab_size = 32;
    config.n_positions = 16;
    config.n_embd = 16;
    config.n_layer = 2;
    config.n_head = 4;
    config
}

fn build(seed: u64) -> Result<Gpt2LmHeadModel> {
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(Gpt2LmHeadModel::new(tiny_config(), &Device::Cpu, &mut rng)?)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = build(0)?;
    let token_ids = Tensor::from_slice(&[0u32, 1, 2, 3, 4, 5], (2, 3), &Device::Cpu)?;

    let logits = model.forward(&token_ids, false)?;

    assert_eq!(logits.dims(), &[2, 3, 32]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn rejects_sequences_longer_than_context() -> Result<()> {
    let model = build(0)?;
    let token_ids = Tensor::zeros((1, 17), DType::U32, &Device::Cpu)?;
    assert!(model.forward(&token_ids, false).is_err());
    Ok(())
}

#[test]
fn same_seed_gives_same_weights() -> Result<()> {
    let a = build(7)?;
    let b = build(7)?;
    let c = build(8)?;

    let weights = |model: &Gpt2LmHeadModel| -> Result<Vec<f32>> {
        let params = model.named_parameters()?;
        let (_, wte) = params
            .iter()
            .find(|(name, _)| name == "transformer.wte.weight")
            .expect("wte present");
        Ok(wte.as_tensor().flatten_all()?.to_vec1::<f32>()?)
    };

    assert_eq!(weights(&a)?, weights(&b)?);
    assert_ne!(weights(&a)?, weights(&c)?);
    Ok(())
}

#[test]
fn lm_head_is_tied_to_token_embedding() -> Result<()> {
    let model = build(0)?;
    let names: Vec<String> = model
        .named_parameters()?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(names.iter().all(|name| !name.contains("lm_head")));
    assert!(names.contains(&"transformer.h.1.attn.c_attn.weight".to_string()));
    assert!(names.contains(&"transformer.ln_f.bias".to_string()));

    let config = tiny_config();
    let per_block = 2 * 2 * config.n_embd
        + (3 * config.n_embd * config.n_embd + 3 * config.n_embd)
        + (config.n_embd * config.n_embd + config.n_embd)
        + (config.n_embd * config.inner_dim() + config.inner_dim())
        + (config.inner_dim() * config.n_embd + config.n_embd);
    let expected = config.vocab_size * config.n_embd
        + config.n_positions * config.n_embd
        + config.n_layer * per_block
        + 2 * config.n_embd;
    assert_eq!(model.num_parameters()?, expected);
    Ok(())
}

#[test]
fn save_pretrained_round_trips_weights() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let original = build(3)?;
    original.save_pretrained(dir.path())?;

    assert!(dir.path().join("config.json").is_file());
    let stored = Gpt2Config::from_json_file(&dir.path().join("config.json"))?;
    assert_eq!(&stored, original.config());

    let restored = build(4)?;
    restored.load_safetensors(&dir.path().join("model.safetensors"))?;

    let input = Tensor::from_slice(&[5u32, 9, 2, 1], (1, 4), &Device::Cpu)?;
    let a = original.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?;
    let b = restored.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}
