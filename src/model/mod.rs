mod generator;
mod settings;
mod types;

#[cfg(feature = "tch-backend")]
mod decoding;
#[cfg(feature = "tch-backend")]
mod loader;
#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use generator::TextGenerator;
pub use settings::{DEFAULT_MAX_LENGTH, DecodeSettings, SpecialTokens};
pub use types::{
    DetailedOutput, GenerateOptions, GeneratedText, GenerationOutput, GenerationRequest,
    GenerationResponse, ModelKind, TokenIds,
};
