use std::path::{Path, PathBuf};

use candle_core::{Error, Result};

use crate::config::{Gpt2Config, Gpt2Overrides};

/// Maps a launcher model id onto the hub repository that publishes its tokenizer
/// and the architecture it is initialised from.
#[derive(Debug, Clone, Copy)]
pub struct RegistryEntry {
    pub id: &'static str,
    pub hub_id: &'static str,
    build: fn() -> Gpt2Config,
}

impl RegistryEntry {
    pub fn base_config(&self) -> Gpt2Config {
        (self.build)()
    }

    /// Location of this entry's cached configuration under `configs_dir`.
    pub fn cached_config_path(&self, configs_dir: &Path) -> PathBuf {
        configs_dir.join(format!("{}.json", self.hub_id))
    }
}

pub const REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        id: "gpt2-small",
        hub_id: "gpt2",
        build: Gpt2Config::gpt2_small,
    },
    RegistryEntry {
        id: "gpt2-medium",
        hub_id: "gpt2-medium",
        build: Gpt2Config::gpt2_medium,
    },
    RegistryEntry {
        id: "gpt2-large",
        hub_id: "gpt2-large",
        build: Gpt2Config::gpt2_large,
    },
    RegistryEntry {
        id: "gpt2-xl",
        hub_id: "gpt2-xl",
        build: Gpt2Config::gpt2_xl,
    },
];

pub fn lookup(id: &str) -> Option<&'static RegistryEntry> {
    REGISTRY.iter().find(|entry| entry.id == id)
}

pub fn known_ids() -> Vec<&'static str> {
    REGISTRY.iter().map(|entry| entry.id).collect()
}

/// Resolves the configuration for `id`, reusing `configs_dir/<hub_id>.json` when it
/// exists and seeding it from the built-in definition otherwise.
pub fn resolve_config(
    id: &str,
    overrides: &Gpt2Overrides,
    configs_dir: &Path,
) -> Result<Gpt2Config> {
    let entry = lookup(id).ok_or_else(|| {
        Error::Msg(format!(
            "unknown model id '{}' (expected one of: {})",
            id,
            known_ids().join(", ")
        ))
    })?;

    let cached = entry.cached_config_path(configs_dir);
    let mut config = if cached.is_file() {
        tracing::debug!(path = %cached.display(), "using cached model configuration");
        Gpt2Config::from_json_file(&cached)?
    } else {
        let config = entry.base_config();
        config.write_json_file(&cached)?;
        tracing::debug!(path = %cached.display(), "cached model configuration");
        config
    };

    if !overrides.is_empty() {
        tracing::debug!(?overrides, "applying model configuration overrides");
        config.apply_overrides(overrides);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_maps_to_hub_gpt2() {
        let entry = lookup("gpt2-small").unwrap();
        assert_eq!(entry.hub_id, "gpt2");
        assert_eq!(entry.base_config().n_layer, 12);
        assert!(lookup("gpt3").is_none());
    }

    #[test]
    fn resolve_writes_then_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Gpt2Overrides {
            n_layer: Some(1),
            ..Default::default()
        };
        let config = resolve_config("gpt2-medium", &overrides, dir.path()).unwrap();
        assert_eq!(config.n_layer, 1);

        let cached = dir.path().join("gpt2-medium.json");
        let stored = Gpt2Config::from_json_file(&cached).unwrap();
        assert_eq!(stored.n_layer, 24);

        let mut edited = stored.clone();
        edited.n_head = 8;
        edited.write_json_file(&cached).unwrap();
        let again = resolve_config("gpt2-medium", &Gpt2Overrides::default(), dir.path()).unwrap();
        assert_eq!(again.n_head, 8);
    }

    #[test]
    fn unknown_id_lists_known_ids() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_config("llama", &Gpt2Overrides::default(), dir.path()).unwrap_err();
        assert!(err.to_string().contains("gpt2-small"));
    }
}
