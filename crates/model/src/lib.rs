//! GPT-2 language model assembled from `candle-nn` layers.
//!
//! Model ids used by the launcher (`gpt2-small`, `gpt2-medium`, ...) are
//! resolved through [`registry`], which also caches the resolved
//! configuration next to the run artifacts. Weights are always initialized
//! from scratch with a seeded RNG.

pub mod block;
pub mod config;
pub mod init;
pub mod model;
pub mod registry;

pub use config::{Gpt2Config, Gpt2Overrides};
pub use model::Gpt2LmHeadModel;
pub use registry::{lookup, resolve_config, RegistryEntry, REGISTRY};
