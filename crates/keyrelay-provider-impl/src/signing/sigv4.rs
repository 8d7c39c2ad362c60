use hmac::{Hmac, Mac};
use keyrelay_provider_core::{Headers, HttpMethod, header_get, header_set};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::SigningError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// AWS Signature Version 4 for one credential/region/service triple.
#[derive(Debug, Clone, Copy)]
pub struct AwsSigner<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

struct ParsedUrl<'u> {
    host: &'u str,
    path: &'u str,
    query: &'u str,
}

fn parse_url(url: &str) -> Result<ParsedUrl<'_>, SigningError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| SigningError::Sign(format!("unsupported url {url}")))?;
    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (path, query) = path_and_query
        .split_once('?')
        .unwrap_or((path_and_query, ""));
    Ok(ParsedUrl {
        host: authority,
        path,
        query,
    })
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|err| SigningError::InvalidKey(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Non-S3 services encode each path segment a second time.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(k).map(|s| s.into_owned()).unwrap_or_else(|_| k.to_string());
            let v = urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.to_string());
            (
                urlencoding::encode(&k).into_owned(),
                urlencoding::encode(&v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

impl AwsSigner<'_> {
    /// Adds `host`, `x-amz-date` and `authorization` to `headers`.
    pub fn sign(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &mut Headers,
        body: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), SigningError> {
        let parsed = parse_url(url)?;
        let amz_date = now
            .format(format_description!("[year][month][day]T[hour][minute][second]Z"))
            .map_err(|err| SigningError::Sign(err.to_string()))?;
        let date = now
            .format(format_description!("[year][month][day]"))
            .map_err(|err| SigningError::Sign(err.to_string()))?;

        if header_get(headers, "host").is_none() {
            header_set(headers, "host", parsed.host);
        }
        header_set(headers, "x-amz-date", amz_date.clone());

        let mut canonical: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        canonical.sort();
        let canonical_headers: String = canonical
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = canonical
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri(parsed.path),
            canonical_query(parsed.query),
            canonical_headers,
            signed_headers,
            sha256_hex(body),
        );
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            date.as_bytes(),
        )?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, self.service.as_bytes())?;
        let k_signing = hmac(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes())?);

        header_set(
            headers,
            "authorization",
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key_id
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn matches_reference_get_vanilla_signature() {
        let signer = AwsSigner {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            region: "us-east-1",
            service: "service",
        };
        let mut headers = Vec::new();
        signer
            .sign(
                HttpMethod::Get,
                "https://example.amazonaws.com/",
                &mut headers,
                b"",
                datetime!(2015-08-30 12:36:00 UTC),
            )
            .unwrap();
        assert_eq!(
            header_get(&headers, "authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
                 SignedHeaders=host;x-amz-date, \
                 Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
            )
        );
        assert_eq!(header_get(&headers, "x-amz-date"), Some("20150830T123600Z"));
    }

    #[test]
    fn path_segments_are_encoded_twice() {
        assert_eq!(
            canonical_uri("/model/anthropic.claude-v2%3A1/invoke"),
            "/model/anthropic.claude-v2%253A1/invoke"
        );
        assert_eq!(canonical_query("b=2&a=1"), "a=1&b=2");
    }
}
