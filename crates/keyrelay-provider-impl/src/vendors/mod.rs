//! One module per upstream vendor: secret parsing, selection policy, liveness
//! checker and request preparation.

pub mod anthropic;
pub mod aws;
pub mod azure;
pub mod gcp;
pub mod google_ai;
pub mod mistral_ai;
pub mod openai;

use std::collections::BTreeSet;

use bytes::Bytes;
use keyrelay_common::{ModelFamily, Service};
use keyrelay_provider_core::{
    CheckFailure, DisableReason, Headers, HttpMethod, Key, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest,
};
use serde_json::Value;

use crate::classify::{ErrorAction, KeyEffect, classify};

/// A successful check response.
pub(crate) struct CheckReply {
    pub headers: Headers,
    pub body: Value,
}

pub(crate) fn failure_from_status(
    service: Service,
    status: u16,
    headers: &Headers,
    body: &[u8],
) -> CheckFailure {
    let classification = classify(service, status, headers, body);
    let message = classification.error.message;
    match classification.action {
        ErrorAction::Retry(KeyEffect::Disable(DisableReason::Revoked)) => CheckFailure::Revoked(message),
        ErrorAction::Retry(KeyEffect::Disable(DisableReason::Quota)) => CheckFailure::Quota(message),
        ErrorAction::Retry(KeyEffect::RateLimit) => CheckFailure::RateLimited,
        _ => CheckFailure::Transient(format!("status {status}: {message}")),
    }
}

pub(crate) async fn send_check(
    client: &dyn UpstreamClient,
    service: Service,
    method: HttpMethod,
    url: String,
    headers: Headers,
    body: Option<Value>,
) -> Result<CheckReply, CheckFailure> {
    let response = client
        .send(UpstreamHttpRequest {
            method,
            url,
            headers,
            body: body.map(|value| Bytes::from(value.to_string())),
            is_stream: false,
        })
        .await
        .map_err(|err| match err {
            UpstreamFailure::Http {
                status,
                headers,
                body,
            } => failure_from_status(service, status, &headers, &body),
            other => CheckFailure::Transient(other.to_string()),
        })?;
    let status = response.status;
    let headers = response.headers.clone();
    let bytes = response
        .into_bytes()
        .await
        .map_err(|err| CheckFailure::Transient(err.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(failure_from_status(service, status, &headers, &bytes));
    }
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok(CheckReply { headers, body })
}

/// Splits a composite `a:b:c` secret into exactly `n` non-empty fields.
/// The last field keeps any further separators.
pub(crate) fn split_secret(secret: &str, n: usize) -> Option<Vec<&str>> {
    let parts: Vec<&str> = secret.trim().splitn(n, ':').collect();
    (parts.len() == n && parts.iter().all(|part| !part.is_empty())).then_some(parts)
}

/// Drops blank and duplicate secrets, keeping configuration order.
pub(crate) fn unique_secrets(secrets: &[String]) -> impl Iterator<Item = &str> {
    let mut seen = BTreeSet::new();
    secrets
        .iter()
        .map(|secret| secret.trim())
        .filter(move |secret| !secret.is_empty() && seen.insert(*secret))
}

pub(crate) fn families_from_ids<'a>(
    ids: impl IntoIterator<Item = &'a str>,
    family_of: impl Fn(&str) -> ModelFamily,
) -> BTreeSet<ModelFamily> {
    ids.into_iter().map(family_of).collect()
}

pub(crate) fn model_ids(body: &Value, list_field: &str, id_field: &str) -> Vec<String> {
    body.get(list_field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get(id_field).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Keys of one vendor share a service; `key` is assumed to be one of them.
pub(crate) fn ensure_service(key: &Key, service: Service) -> Result<(), crate::PrepareError> {
    if key.service == service {
        Ok(())
    } else {
        Err(crate::PrepareError::WrongKey(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_secrets_split_into_fields() {
        assert_eq!(
            split_secret("AKIA:sec:ret:us-east-1", 3),
            Some(vec!["AKIA", "sec", "ret:us-east-1"])
        );
        assert_eq!(split_secret("AKIA::us-east-1", 3), None);
        assert_eq!(split_secret("only-one", 2), None);
    }

    #[test]
    fn duplicate_secrets_are_dropped() {
        let secrets = vec!["a".to_string(), " a ".to_string(), "".to_string(), "b".to_string()];
        assert_eq!(unique_secrets(&secrets).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
