use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("unknown dataset '{id}' (expected one of: {known})")]
    UnknownDataset { id: String, known: String },

    #[error("dataset error: {0}")]
    Dataset(String),
}
