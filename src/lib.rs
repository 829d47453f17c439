pub mod config;
pub mod error;
pub mod model;
pub mod playground;
pub mod server;
pub mod telemetry;

pub use config::{PlaygroundConfig, ServerConfig};
pub use error::ServiceError;
pub use model::{GenerateOptions, GeneratedText, GenerationRequest, GenerationResponse, TextGenerator};
#[cfg(feature = "tch-backend")]
pub use model::tch_backend::TchGenerator;
pub use playground::{BackendClient, PlaygroundState, build_playground_router};
pub use server::build_router;
