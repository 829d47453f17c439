use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::model::ModelKind;

/// Command line of the inference server.
#[derive(Debug, Clone, Parser)]
#[command(name = "generate-server", about = "Pretrained model text-generation service")]
pub struct ServerConfig {
    /// Local model directory or Hugging Face Hub repo id.
    #[arg(long = "huggingface_model", alias = "huggingface-model", env = "MODEL_ID")]
    pub huggingface_model: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 55556)]
    pub port: u16,

    #[arg(
        long = "model_type",
        alias = "model-type",
        env = "MODEL_TYPE",
        value_enum,
        default_value_t = ModelKind::Clm
    )]
    pub model_type: ModelKind,

    #[arg(long, env = "SERVER_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// `cpu`, `cuda` or `cuda:N`; defaults to CUDA when available.
    #[arg(long, env = "DEVICE")]
    pub device: Option<String>,

    /// Hub revision used when the model is fetched remotely.
    #[arg(long, env = "MODEL_REVISION")]
    pub revision: Option<String>,

    /// TorchScript export inside the model directory.
    #[arg(long = "model-file", env = "MODEL_FILE", default_value = "model.ts")]
    pub model_file: String,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[cfg(feature = "tch-backend")]
    pub fn device(&self) -> Device {
        match self.device.as_deref() {
            Some(raw) => parse_device(raw),
            None => Device::cuda_if_available(),
        }
    }
}

/// Command line of the playground UI.
#[derive(Debug, Clone, Parser)]
#[command(name = "playground", about = "Interactive playground for the generate service")]
pub struct PlaygroundConfig {
    /// Full URL of the server's generate endpoint.
    #[arg(long, env = "BACKEND_URL")]
    pub backend: String,

    #[arg(
        long = "displayed_model_name",
        alias = "displayed-model-name",
        default_value = "Language Model"
    )]
    pub displayed_model_name: String,

    #[arg(long, env = "PLAYGROUND_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    #[arg(long, env = "PLAYGROUND_PORT", default_value_t = 8501)]
    pub port: u16,
}

impl PlaygroundConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
