//! Restricted network fetch for sandboxed scripts.
//!
//! The only network access a script gets is loopback HTTP: the scheme+host
//! pair must be one of `http(s)://localhost` or `http(s)://127.0.0.1`, any
//! port. Everything else raises inside the script before a single packet
//! leaves the process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Hosts a sandboxed fetch may target.
const ALLOWED_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

/// The loopback-only allowlist applied to every fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchPolicy;

impl FetchPolicy {
    /// Validate a raw URL against the allowlist.
    ///
    /// Returns the parsed URL on success so the caller never re-parses.
    pub fn check(&self, raw: &str) -> Result<Url, String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid URL '{raw}': {e}"))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!(
                "fetch is restricted to localhost http(s) URLs, got scheme '{}'",
                url.scheme()
            ));
        }

        let host = url.host_str().unwrap_or_default();
        if !ALLOWED_HOSTS.contains(&host) {
            return Err(format!(
                "fetch is restricted to localhost URLs, got host '{host}'"
            ));
        }

        Ok(url)
    }
}

/// Options accepted by the script-side `fetch(url, options)` call.
#[derive(Debug, Default, Deserialize)]
pub struct FetchOptions {
    /// HTTP method; GET when absent.
    #[serde(default)]
    pub method: Option<String>,

    /// Request body sent verbatim.
    #[serde(default)]
    pub body: Option<String>,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// The response surface handed back to the script.
///
/// The body travels as text; the script-side wrapper exposes it through
/// `text()` and `json()` accessor methods.
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase, empty when the status has none.
    #[serde(rename = "statusText")]
    pub status_text: String,
    /// Whether the status is in the 2xx range.
    pub ok: bool,
    /// Response body as text.
    pub body: String,
}

/// Perform a policy-checked fetch, honoring the caller's cancellation.
pub async fn perform(
    client: &reqwest::Client,
    policy: &FetchPolicy,
    raw_url: &str,
    options: FetchOptions,
    cancel: &CancellationToken,
) -> Result<FetchResponse, String> {
    let url = policy.check(raw_url)?;

    let method = match &options.method {
        Some(m) => reqwest::Method::from_bytes(m.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid HTTP method '{m}'"))?,
        None => reqwest::Method::GET,
    };

    let mut request = client.request(method, url);
    for (name, value) in &options.headers {
        request = request.header(name, value);
    }
    if let Some(body) = options.body {
        request = request.body(body);
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err("fetch cancelled".to_string()),
        r = request.send() => r.map_err(|e| format!("fetch failed: {e}"))?,
    };

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or_default().to_string();
    let ok = status.is_success();

    let body = tokio::select! {
        _ = cancel.cancelled() => return Err("fetch cancelled".to_string()),
        b = response.text() => b.map_err(|e| format!("fetch body read failed: {e}"))?,
    };

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text,
        ok,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_accepts_loopback_hosts() {
        let policy = FetchPolicy;
        assert!(policy.check("http://localhost/data").is_ok());
        assert!(policy.check("http://localhost:8080/data").is_ok());
        assert!(policy.check("https://127.0.0.1/").is_ok());
        assert!(policy.check("https://127.0.0.1:9443/x?y=1").is_ok());
    }

    #[test]
    fn policy_rejects_external_hosts() {
        let policy = FetchPolicy;
        let err = policy.check("http://evil.example.com").unwrap_err();
        assert!(err.contains("restricted to localhost"), "got: {err}");

        // Host equality, not string prefix: lookalike hosts stay out
        assert!(policy.check("http://localhost.evil.com/").is_err());
        assert!(policy.check("http://127.0.0.1.evil.com/").is_err());
    }

    #[test]
    fn policy_rejects_non_http_schemes() {
        let policy = FetchPolicy;
        assert!(policy.check("file:///etc/passwd").is_err());
        assert!(policy.check("ftp://localhost/x").is_err());
        assert!(policy.check("ws://localhost/x").is_err());
    }

    #[test]
    fn policy_rejects_garbage_urls() {
        let policy = FetchPolicy;
        let err = policy.check("not a url at all").unwrap_err();
        assert!(err.contains("invalid URL"), "got: {err}");
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: FetchOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.method.is_none());
        assert!(opts.body.is_none());
        assert!(opts.headers.is_empty());

        let opts: FetchOptions = serde_json::from_str(
            r#"{"method": "post", "body": "x=1", "headers": {"x-a": "b"}}"#,
        )
        .unwrap();
        assert_eq!(opts.method.as_deref(), Some("post"));
        assert_eq!(opts.headers["x-a"], "b");
    }
}
