use bytes::Bytes;
use serde_json::Value;

use crate::headers::{Headers, header_get, header_remove, header_set};
use crate::upstream::{HttpMethod, UpstreamHttpRequest};

/// A request fully signed by a vendor preparer. When present it is sent as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// The upstream request as the dispatcher will send it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub base_url: String,
    pub path: String,
    pub headers: Headers,
    pub body: Value,
    pub signed: Option<SignedRequest>,
}

impl OutboundRequest {
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            base_url: String::new(),
            path: path.into(),
            headers: Vec::new(),
            body,
            signed: None,
        }
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }

    pub fn into_http(&self, is_stream: bool) -> UpstreamHttpRequest {
        if let Some(signed) = &self.signed {
            return UpstreamHttpRequest {
                method: signed.method,
                url: signed.url.clone(),
                headers: signed.headers.clone(),
                body: Some(signed.body.clone()),
                is_stream,
            };
        }
        let mut headers = self.headers.clone();
        if header_get(&headers, "content-type").is_none() {
            header_set(&mut headers, "content-type", "application/json");
        }
        let body = match self.method {
            HttpMethod::Get => None,
            HttpMethod::Post => Some(Bytes::from(self.body.to_string())),
        };
        UpstreamHttpRequest {
            method: self.method,
            url: self.url(),
            headers,
            body,
            is_stream,
        }
    }
}

#[derive(Debug)]
enum Undo {
    /// Restore every value of header `name`; empty means it was absent.
    Header { name: String, previous: Vec<String> },
    Body(Value),
    Path(String),
    BaseUrl(String),
    Signed(Option<SignedRequest>),
}

/// Applies mutations to an `OutboundRequest` while recording their inverses,
/// so a retried attempt can start again from the pristine request.
pub struct ProxyRequestManager<'a> {
    request: &'a mut OutboundRequest,
    undo: Vec<Undo>,
}

impl<'a> ProxyRequestManager<'a> {
    pub fn new(request: &'a mut OutboundRequest) -> Self {
        Self {
            request,
            undo: Vec::new(),
        }
    }

    pub fn request(&self) -> &OutboundRequest {
        self.request
    }

    fn save_header(&mut self, name: &str) {
        let previous = self
            .request
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect();
        self.undo.push(Undo::Header {
            name: name.to_string(),
            previous,
        });
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.save_header(name);
        header_remove(&mut self.request.headers, name);
        header_set(&mut self.request.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.save_header(name);
        header_remove(&mut self.request.headers, name);
    }

    pub fn set_body(&mut self, body: Value) {
        let previous = std::mem::replace(&mut self.request.body, body);
        self.undo.push(Undo::Body(previous));
    }

    /// Edits the body in place; the whole previous body is kept for revert.
    pub fn modify_body(&mut self, f: impl FnOnce(&mut Value)) {
        let previous = self.request.body.clone();
        f(&mut self.request.body);
        self.undo.push(Undo::Body(previous));
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        let previous = std::mem::replace(&mut self.request.path, path.into());
        self.undo.push(Undo::Path(previous));
    }

    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        let previous = std::mem::replace(&mut self.request.base_url, base_url.into());
        self.undo.push(Undo::BaseUrl(previous));
    }

    pub fn set_signed_request(&mut self, signed: SignedRequest) {
        let previous = self.request.signed.replace(signed);
        self.undo.push(Undo::Signed(previous));
    }

    pub fn pending(&self) -> usize {
        self.undo.len()
    }

    /// Replays the inverse of every mutation, newest first.
    pub fn revert(&mut self) {
        while let Some(op) = self.undo.pop() {
            match op {
                Undo::Header { name, previous } => {
                    header_remove(&mut self.request.headers, &name);
                    for value in previous {
                        self.request.headers.push((name.clone(), value));
                    }
                }
                Undo::Body(body) => self.request.body = body,
                Undo::Path(path) => self.request.path = path,
                Undo::BaseUrl(url) => self.request.base_url = url,
                Undo::Signed(signed) => self.request.signed = signed,
            }
        }
    }
}
