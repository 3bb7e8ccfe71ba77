use crate::errors::{Error, Result};

/// How a dataset's parquet shards are laid out inside its hub repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardLayout {
    /// `<name>/<split>-00000-of-00002.parquet`
    ConfigPrefixed,
    /// `<name>/<split>/0000.parquet`
    ConfigDirectory,
}

impl ShardLayout {
    pub fn prefix(&self, name: &str, split: &str) -> String {
        match self {
            ShardLayout::ConfigPrefixed => format!("{name}/{split}-"),
            ShardLayout::ConfigDirectory => format!("{name}/{split}/"),
        }
    }
}

/// A corpus the launcher knows how to fetch.
#[derive(Debug, Clone, Copy)]
pub struct DatasetSpec {
    pub id: &'static str,
    pub hub_repo: &'static str,
    pub revision: Option<&'static str>,
    pub default_name: &'static str,
    pub names: &'static [&'static str],
    /// Whether the hub publishes a validation split; otherwise one is carved from train.
    pub has_validation: bool,
    pub layout: ShardLayout,
}

impl DatasetSpec {
    pub fn resolve_name<'a>(&'a self, name: Option<&'a str>) -> Result<&'a str> {
        let name = name.unwrap_or(self.default_name);
        if self.names.contains(&name) {
            Ok(name)
        } else {
            Err(Error::Dataset(format!(
                "dataset '{}' has no configuration '{}' (expected one of: {})",
                self.id,
                name,
                self.names.join(", ")
            )))
        }
    }
}

pub const DATASETS: &[DatasetSpec] = &[
    DatasetSpec {
        id: "wikitext",
        hub_repo: "Salesforce/wikitext",
        revision: None,
        default_name: "wikitext-103-raw-v1",
        names: &[
            "wikitext-103-raw-v1",
            "wikitext-103-v1",
            "wikitext-2-raw-v1",
            "wikitext-2-v1",
        ],
        has_validation: true,
        layout: ShardLayout::ConfigPrefixed,
    },
    DatasetSpec {
        id: "openwebtext",
        hub_repo: "Skylion007/openwebtext",
        revision: Some("refs/convert/parquet"),
        default_name: "plain_text",
        names: &["plain_text"],
        has_validation: false,
        layout: ShardLayout::ConfigDirectory,
    },
];

pub fn lookup(id: &str) -> Result<&'static DatasetSpec> {
    DATASETS
        .iter()
        .find(|spec| spec.id == id)
        .ok_or_else(|| Error::UnknownDataset {
            id: id.to_string(),
            known: known_ids().join(", "),
        })
}

pub fn known_ids() -> Vec<&'static str> {
    DATASETS.iter().map(|spec| spec.id).collect()
}
