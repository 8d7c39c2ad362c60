use bytes::Bytes;
use http::StatusCode;
use keyrelay_provider_core::Headers;
use serde_json::Value;

/// A complete (non-streaming) reply for the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}
