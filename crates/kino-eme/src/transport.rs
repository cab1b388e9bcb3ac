//! HTTP transport for certificate and license exchanges
//!
//! The orchestration only sees the [`Transport`] trait. [`ReqwestTransport`]
//! is the default implementation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Header mapping as configured; a `None` value removes the header on merge
pub type Headers = BTreeMap<String, Option<String>>;

/// Merge header sources in increasing priority and drop null-valued entries.
///
/// Header names compare case-insensitively, as in HTTP. Later sources
/// override earlier ones and their spelling of the name wins, so a
/// `Content-Type` license header replaces the default `Content-type`. A
/// header set to `None` by a higher priority source is absent from the
/// result even when a lower priority source gave it a value.
pub fn merge_headers<'a>(sources: impl IntoIterator<Item = &'a Headers>) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, (String, Option<String>)> = BTreeMap::new();
    for source in sources {
        for (name, value) in source {
            merged.insert(name.to_ascii_lowercase(), (name.clone(), value.clone()));
        }
    }
    merged
        .into_values()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
}

/// HTTP method used by the default adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// What an exchange is fetching, for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Certificate,
    License,
}

/// Request descriptor handed to the transport
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub kind: RequestKind,
    pub key_system: String,
}

/// Raw response from the transport; status checking is left to the caller
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Treat 4xx and 5xx as failures carrying the body as cause
    pub fn into_result(self, kind: RequestKind) -> Result<Bytes> {
        if self.status >= 400 {
            let what = match kind {
                RequestKind::Certificate => "certificate",
                RequestKind::License => "license",
            };
            return Err(Error::LicenseRequest {
                message: format!("{what} request returned status {}", self.status),
                status: Some(self.status),
                cause: Some(self.body),
            });
        }
        Ok(self.body)
    }
}

/// Network collaborator used to fetch certificates and licenses
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Transport without a request timeout
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(request.url.clone()),
            HttpMethod::Post => self.client.post(request.url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| Error::LicenseRequest {
            message: format!("{} request to {} failed: {e}", request.key_system, request.url),
            status: None,
            cause: None,
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| Error::LicenseRequest {
            message: format!("failed to read response from {}: {e}", request.url),
            status: Some(status),
            cause: None,
        })?;

        debug!(
            url = %request.url,
            kind = ?request.kind,
            status,
            bytes = body.len(),
            "Transport response"
        );

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: &[(&str, Option<&str>)]) -> Headers {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_merge_priority() {
        let base = headers(&[("Content-type", Some("application/octet-stream"))]);
        let eme = headers(&[("X-Token", Some("global"))]);
        let system = headers(&[("X-Token", Some("system"))]);

        let merged = merge_headers([&base, &eme, &system]);
        assert_eq!(merged.get("X-Token").map(String::as_str), Some("system"));
        assert_eq!(
            merged.get("Content-type").map(String::as_str),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn test_null_removes_lower_priority_value() {
        let base = headers(&[("Content-type", Some("application/octet-stream"))]);
        let eme = headers(&[("X-Debug", Some("1"))]);
        let system = headers(&[("Content-type", None), ("X-Debug", None)]);

        let merged = merge_headers([&base, &eme, &system]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_names_compare_case_insensitively() {
        let base = headers(&[("Content-type", Some("application/octet-stream"))]);
        let license = headers(&[("Content-Type", Some("application/json"))]);

        let merged = merge_headers([&base, &license]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("Content-Type").map(String::as_str), Some("application/json"));

        let eme = headers(&[("CONTENT-TYPE", None)]);
        assert!(merge_headers([&base, &eme]).is_empty());
    }

    #[test]
    fn test_null_in_lowest_source_is_dropped() {
        let base = headers(&[("X-Unset", None)]);
        let merged = merge_headers([&base]);
        assert!(!merged.contains_key("X-Unset"));
    }

    #[test]
    fn test_error_status_carries_cause() {
        let response = HttpResponse {
            status: 403,
            body: Bytes::from_static(b"forbidden"),
        };
        let err = response.into_result(RequestKind::License).unwrap_err();

        match err {
            Error::LicenseRequest { status, cause, .. } => {
                assert_eq!(status, Some(403));
                assert_eq!(cause.as_deref(), Some(&b"forbidden"[..]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_success_status() {
        let body = HttpResponse::ok(Bytes::from_static(b"license"))
            .into_result(RequestKind::License)
            .unwrap();
        assert_eq!(body.as_ref(), b"license");
    }
}
