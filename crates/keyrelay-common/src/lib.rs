//! Vocabulary shared by every keyrelay crate: vendors, model families, wire formats
//! and the process configuration.

pub mod config;
pub mod model;

pub use config::{
    CheckConfig, ConfigError, GatewayConfig, GatewayConfigPatch, KeysConfig, QueueConfig,
    UpstreamConfig,
};
pub use model::{
    ApiFormat, ModelFamily, ParseNameError, Service, aws_family, azure_family, claude_family,
    family_for_model, gcp_family, google_ai_family, mistral_family, openai_family, service_for_model,
};
