//! nanoserve core types, traits, and error definitions.

pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod request;
pub mod sampling;
pub mod tensor;
pub mod tokenizer;
pub mod types;

pub use backend::Backend;
pub use config::EngineConfig;
pub use error::{Result, ServeError};
pub use model::{KvState, Model, ModelInput, ModelOutput};
pub use request::{GenerationOutput, GenerationRequest, RequestHandle};
pub use sampling::{SampleResult, SamplingConfig, SamplingParams};
pub use tensor::Tensor;
pub use tokenizer::Tokenizer;
pub use types::*;
