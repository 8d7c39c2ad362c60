//! OpenAI chat-completion chunk shape, used as the vendor-neutral stream event.

use serde::{Deserialize, Serialize};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        content: Option<String>,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            object: CHUNK_OBJECT.to_string(),
            created: unix_now(),
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content,
                },
                finish_reason,
            }],
        }
    }

    /// The leading event OpenAI streams always start with.
    pub fn role_announcement(id: impl Into<String>, model: impl Into<String>) -> Self {
        let mut chunk = Self::new(id, model, Some(String::new()), None);
        chunk.choices[0].delta.role = Some("assistant".to_string());
        chunk
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }

    pub fn is_role_only(&self) -> bool {
        self.choices.first().is_some_and(|choice| {
            choice.delta.role.is_some()
                && choice.delta.content.as_deref().unwrap_or_default().is_empty()
                && choice.finish_reason.is_none()
        })
    }
}

pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
