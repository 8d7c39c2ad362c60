use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use keyrelay_provider_core::{HttpMethod, UpstreamClient, UpstreamHttpRequest};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SigningError;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// Tokens this close to expiry are refreshed early.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Signs the RS256 JWT assertion exchanged for a service-account access token.
pub fn build_assertion(
    client_email: &str,
    private_key_pem: &str,
    token_uri: &str,
    now: i64,
) -> Result<String, SigningError> {
    let claims = JwtClaims {
        iss: client_email,
        scope: DEFAULT_SCOPE,
        aud: token_uri,
        exp: now + 3600,
        iat: now,
    };
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|err| SigningError::InvalidKey(err.to_string()))?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|err| SigningError::Sign(err.to_string()))
}

/// Exchanges service-account assertions for bearer tokens and caches them per account.
pub struct GcpTokenSource {
    client: Arc<dyn UpstreamClient>,
    token_uri: String,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl GcpTokenSource {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self::with_token_uri(client, DEFAULT_TOKEN_URI)
    }

    pub fn with_token_uri(client: Arc<dyn UpstreamClient>, token_uri: impl Into<String>) -> Self {
        Self {
            client,
            token_uri: token_uri.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, client_email: &str, now: i64) -> Result<Option<AccessToken>, SigningError> {
        let guard = self
            .cache
            .lock()
            .map_err(|_| SigningError::TokenExchange("token cache lock failed".to_string()))?;
        Ok(guard
            .get(client_email)
            .filter(|token| now + EXPIRY_SLACK_SECS < token.expires_at)
            .cloned())
    }

    pub async fn access_token(
        &self,
        client_email: &str,
        private_key_pem: &str,
        force_refresh: bool,
    ) -> Result<AccessToken, SigningError> {
        let now = unix_now();
        if !force_refresh && let Some(token) = self.cached(client_email, now)? {
            return Ok(token);
        }

        let assertion = build_assertion(client_email, private_key_pem, &self.token_uri, now)?;
        let body = format!(
            "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion={}",
            urlencoding::encode(&assertion)
        );
        let response = self
            .client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: self.token_uri.clone(),
                headers: vec![(
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                )],
                body: Some(Bytes::from(body)),
                is_stream: false,
            })
            .await
            .map_err(|err| SigningError::TokenExchange(err.to_string()))?;
        let status = response.status;
        let bytes = response
            .into_bytes()
            .await
            .map_err(|err| SigningError::TokenExchange(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(SigningError::TokenExchange(format!(
                "status {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        let parsed: TokenResponse = serde_json::from_slice(&bytes)
            .map_err(|err| SigningError::TokenExchange(err.to_string()))?;
        let token = AccessToken {
            token: parsed.access_token,
            expires_at: now + parsed.expires_in.unwrap_or(3600),
        };
        debug!(event = "gcp_token_refreshed", client_email = %client_email, expires_at = token.expires_at);

        let mut guard = self
            .cache
            .lock()
            .map_err(|_| SigningError::TokenExchange("token cache lock failed".to_string()))?;
        guard.insert(client_email.to_string(), token.clone());
        Ok(token)
    }
}
