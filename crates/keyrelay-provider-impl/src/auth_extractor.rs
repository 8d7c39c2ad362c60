use keyrelay_provider_core::ProxyRequestManager;

/// Headers a client may send that must never reach a vendor.
const CLIENT_AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "api-key", "x-goog-api-key"];

pub fn strip_client_auth(request: &mut ProxyRequestManager<'_>) {
    for name in CLIENT_AUTH_HEADERS {
        request.remove_header(name);
    }
}

pub fn set_bearer(request: &mut ProxyRequestManager<'_>, token: &str) {
    request.set_header("authorization", format!("Bearer {token}"));
}

pub fn set_content_type_json(request: &mut ProxyRequestManager<'_>) {
    request.set_header("content-type", "application/json");
}

pub fn set_header(request: &mut ProxyRequestManager<'_>, name: &str, value: &str) {
    request.set_header(name, value);
}
