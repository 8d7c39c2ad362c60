use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream vendor a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google-ai")]
    GoogleAI,
    #[serde(rename = "mistral-ai")]
    MistralAI,
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "gcp")]
    Gcp,
    #[serde(rename = "azure")]
    Azure,
}

impl Service {
    pub const ALL: [Service; 7] = [
        Service::OpenAI,
        Service::Anthropic,
        Service::GoogleAI,
        Service::MistralAI,
        Service::Aws,
        Service::Gcp,
        Service::Azure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::OpenAI => "openai",
            Service::Anthropic => "anthropic",
            Service::GoogleAI => "google-ai",
            Service::MistralAI => "mistral-ai",
            Service::Aws => "aws",
            Service::Gcp => "gcp",
            Service::Azure => "azure",
        }
    }

    /// Resolves the model-family bucket `model` falls into for this vendor.
    pub fn family_for(&self, model: &str) -> ModelFamily {
        match self {
            Service::OpenAI => openai_family(model),
            Service::Anthropic => claude_family(model),
            Service::GoogleAI => google_ai_family(model),
            Service::MistralAI => mistral_family(model),
            Service::Aws => aws_family(model),
            Service::Gcp => gcp_family(model),
            Service::Azure => azure_family(model),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseNameError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Service {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == s)
            .ok_or_else(|| ParseNameError {
                kind: "service",
                value: s.to_string(),
            })
    }
}

macro_rules! model_families {
    ($($variant:ident => ($name:literal, $service:ident)),+ $(,)?) => {
        /// Coarse bucket of models sharing pricing and rate-limit behaviour.
        ///
        /// The unit of queue partitioning and key capability matching.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ModelFamily {
            $(#[serde(rename = $name)] $variant,)+
        }

        impl ModelFamily {
            pub const ALL: &'static [ModelFamily] = &[$(ModelFamily::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ModelFamily::$variant => $name,)+
                }
            }

            pub fn service(&self) -> Service {
                match self {
                    $(ModelFamily::$variant => Service::$service,)+
                }
            }
        }
    };
}

model_families! {
    Turbo => ("turbo", OpenAI),
    Gpt4 => ("gpt4", OpenAI),
    Gpt4_32k => ("gpt4-32k", OpenAI),
    Gpt4Turbo => ("gpt4-turbo", OpenAI),
    Gpt4o => ("gpt4o", OpenAI),
    O1 => ("o1", OpenAI),
    DallE => ("dall-e", OpenAI),
    Claude => ("claude", Anthropic),
    ClaudeOpus => ("claude-opus", Anthropic),
    GeminiFlash => ("gemini-flash", GoogleAI),
    GeminiPro => ("gemini-pro", GoogleAI),
    GeminiUltra => ("gemini-ultra", GoogleAI),
    MistralTiny => ("mistral-tiny", MistralAI),
    MistralSmall => ("mistral-small", MistralAI),
    MistralMedium => ("mistral-medium", MistralAI),
    MistralLarge => ("mistral-large", MistralAI),
    AwsClaude => ("aws-claude", Aws),
    AwsClaudeOpus => ("aws-claude-opus", Aws),
    AwsMistralTiny => ("aws-mistral-tiny", Aws),
    AwsMistralSmall => ("aws-mistral-small", Aws),
    AwsMistralMedium => ("aws-mistral-medium", Aws),
    AwsMistralLarge => ("aws-mistral-large", Aws),
    GcpClaude => ("gcp-claude", Gcp),
    GcpClaudeOpus => ("gcp-claude-opus", Gcp),
    AzureTurbo => ("azure-turbo", Azure),
    AzureGpt4 => ("azure-gpt4", Azure),
    AzureGpt4_32k => ("azure-gpt4-32k", Azure),
    AzureGpt4Turbo => ("azure-gpt4-turbo", Azure),
    AzureGpt4o => ("azure-gpt4o", Azure),
    AzureDallE => ("azure-dall-e", Azure),
}

impl ModelFamily {
    pub fn families_of(service: Service) -> impl Iterator<Item = ModelFamily> {
        ModelFamily::ALL
            .iter()
            .copied()
            .filter(move |family| family.service() == service)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelFamily::ALL
            .iter()
            .copied()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| ParseNameError {
                kind: "model family",
                value: s.to_string(),
            })
    }
}

/// Wire dialect of a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiFormat {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "openai-text")]
    OpenAIText,
    #[serde(rename = "openai-image")]
    OpenAIImage,
    #[serde(rename = "anthropic-chat")]
    AnthropicChat,
    #[serde(rename = "anthropic-text")]
    AnthropicText,
    #[serde(rename = "google-ai")]
    GoogleAI,
    #[serde(rename = "mistral-ai")]
    MistralAI,
    #[serde(rename = "mistral-text")]
    MistralText,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAI => "openai",
            ApiFormat::OpenAIText => "openai-text",
            ApiFormat::OpenAIImage => "openai-image",
            ApiFormat::AnthropicChat => "anthropic-chat",
            ApiFormat::AnthropicText => "anthropic-text",
            ApiFormat::GoogleAI => "google-ai",
            ApiFormat::MistralAI => "mistral-ai",
            ApiFormat::MistralText => "mistral-text",
        }
    }
}

impl fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guesses the vendor serving `model` from its name alone.
pub fn service_for_model(model: &str) -> Option<Service> {
    let model = model.trim();
    if model.starts_with("azure-") {
        return Some(Service::Azure);
    }
    if model.starts_with("anthropic.") || model.starts_with("mistral.") {
        return Some(Service::Aws);
    }
    if model.starts_with("claude-") && model.contains('@') {
        return Some(Service::Gcp);
    }
    if ["gpt", "o1", "chatgpt", "text-embedding", "dall-e"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
    {
        return Some(Service::OpenAI);
    }
    if model.starts_with("claude-") {
        return Some(Service::Anthropic);
    }
    if model.contains("gemini") {
        return Some(Service::GoogleAI);
    }
    if ["mistral", "mixtral", "codestral", "open-mistral", "open-mixtral"]
        .iter()
        .any(|needle| model.contains(needle))
    {
        return Some(Service::MistralAI);
    }
    None
}

/// Resolves a model name to its family, or `None` if no vendor claims it.
pub fn family_for_model(model: &str) -> Option<ModelFamily> {
    service_for_model(model).map(|service| service.family_for(model))
}

pub fn openai_family(model: &str) -> ModelFamily {
    let model = model.trim();
    if model.starts_with("gpt-4o") || model.starts_with("chatgpt-4o") {
        ModelFamily::Gpt4o
    } else if model.starts_with("o1") {
        ModelFamily::O1
    } else if model.starts_with("gpt-4-turbo")
        || model.starts_with("gpt-4-vision")
        || (model.starts_with("gpt-4-") && model.ends_with("-preview"))
    {
        ModelFamily::Gpt4Turbo
    } else if model.starts_with("gpt-4-32k") {
        ModelFamily::Gpt4_32k
    } else if model.starts_with("gpt-4") {
        ModelFamily::Gpt4
    } else if model.starts_with("dall-e") {
        ModelFamily::DallE
    } else {
        ModelFamily::Turbo
    }
}

pub fn claude_family(model: &str) -> ModelFamily {
    if model.contains("opus") {
        ModelFamily::ClaudeOpus
    } else {
        ModelFamily::Claude
    }
}

pub fn google_ai_family(model: &str) -> ModelFamily {
    if model.contains("flash") {
        ModelFamily::GeminiFlash
    } else if model.contains("ultra") {
        ModelFamily::GeminiUltra
    } else {
        ModelFamily::GeminiPro
    }
}

pub fn mistral_family(model: &str) -> ModelFamily {
    if model.contains("tiny") || (model.contains("7b") && !model.contains("8x7b")) {
        ModelFamily::MistralTiny
    } else if model.contains("medium") {
        ModelFamily::MistralMedium
    } else if model.contains("large") || model.contains("8x22b") {
        ModelFamily::MistralLarge
    } else {
        ModelFamily::MistralSmall
    }
}

pub fn aws_family(model: &str) -> ModelFamily {
    if model.starts_with("mistral.") {
        return match mistral_family(model) {
            ModelFamily::MistralTiny => ModelFamily::AwsMistralTiny,
            ModelFamily::MistralMedium => ModelFamily::AwsMistralMedium,
            ModelFamily::MistralLarge => ModelFamily::AwsMistralLarge,
            _ => ModelFamily::AwsMistralSmall,
        };
    }
    match claude_family(model) {
        ModelFamily::ClaudeOpus => ModelFamily::AwsClaudeOpus,
        _ => ModelFamily::AwsClaude,
    }
}

pub fn gcp_family(model: &str) -> ModelFamily {
    match claude_family(model) {
        ModelFamily::ClaudeOpus => ModelFamily::GcpClaudeOpus,
        _ => ModelFamily::GcpClaude,
    }
}

pub fn azure_family(model: &str) -> ModelFamily {
    let model = model.strip_prefix("azure-").unwrap_or(model);
    match openai_family(model) {
        ModelFamily::Gpt4 => ModelFamily::AzureGpt4,
        ModelFamily::Gpt4_32k => ModelFamily::AzureGpt4_32k,
        ModelFamily::Gpt4Turbo => ModelFamily::AzureGpt4Turbo,
        ModelFamily::Gpt4o | ModelFamily::O1 => ModelFamily::AzureGpt4o,
        ModelFamily::DallE => ModelFamily::AzureDallE,
        _ => ModelFamily::AzureTurbo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_service_from_model_name() {
        assert_eq!(service_for_model("gpt-4o-mini"), Some(Service::OpenAI));
        assert_eq!(
            service_for_model("claude-3-opus-20240229"),
            Some(Service::Anthropic)
        );
        assert_eq!(
            service_for_model("claude-3-opus@20240229"),
            Some(Service::Gcp)
        );
        assert_eq!(
            service_for_model("anthropic.claude-3-sonnet-20240229-v1:0"),
            Some(Service::Aws)
        );
        assert_eq!(
            service_for_model("gemini-1.5-flash-latest"),
            Some(Service::GoogleAI)
        );
        assert_eq!(
            service_for_model("mistral-large-latest"),
            Some(Service::MistralAI)
        );
        assert_eq!(service_for_model("azure-gpt-4"), Some(Service::Azure));
        assert_eq!(service_for_model("llama-3"), None);
    }

    #[test]
    fn families_follow_model_names() {
        assert_eq!(openai_family("gpt-4-0613"), ModelFamily::Gpt4);
        assert_eq!(openai_family("gpt-4-32k-0613"), ModelFamily::Gpt4_32k);
        assert_eq!(openai_family("gpt-4-1106-preview"), ModelFamily::Gpt4Turbo);
        assert_eq!(openai_family("gpt-3.5-turbo"), ModelFamily::Turbo);
        assert_eq!(
            aws_family("anthropic.claude-3-opus-20240229-v1:0"),
            ModelFamily::AwsClaudeOpus
        );
        assert_eq!(
            aws_family("mistral.mixtral-8x7b-instruct-v0:1"),
            ModelFamily::AwsMistralSmall
        );
        assert_eq!(azure_family("azure-gpt-4o"), ModelFamily::AzureGpt4o);
        assert_eq!(ModelFamily::Gpt4.service(), Service::OpenAI);
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for family in ModelFamily::ALL {
            assert_eq!(family.as_str().parse::<ModelFamily>().ok(), Some(*family));
        }
        assert_eq!("google-ai".parse::<Service>().ok(), Some(Service::GoogleAI));
        assert!("nope".parse::<Service>().is_err());
    }
}
