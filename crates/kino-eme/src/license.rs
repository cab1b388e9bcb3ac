//! License and certificate acquisition
//!
//! Each key system family gets a default adapter that turns a key session
//! message into an HTTP exchange:
//!
//! - Generic: the raw message is POSTed as `application/octet-stream`.
//! - Challenge document (PlayReady): the message is a UTF-16 XML document
//!   carrying its own HTTP headers and a base64 challenge.
//! - Certificate based (FairPlay): a server certificate is fetched with GET,
//!   licenses are POSTed like the generic family.
//!
//! Hosts can replace any of them with their own [`LicenseProvider`] or
//! [`CertificateProvider`].

use crate::content_id::decode_utf16_le;
use crate::error::{Error, Result};
use crate::events::{EmeEvent, EventBus};
use crate::transport::{merge_headers, Headers, HttpMethod, HttpRequest, RequestKind, Transport};
use crate::types::{KeySystemFamily, MessageType};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

const OCTET_STREAM: &str = "application/octet-stream";

/// License request produced by a key session
#[derive(Debug, Clone)]
pub struct LicenseMessage {
    pub key_system: String,
    pub message_type: MessageType,
    pub message: Bytes,
    pub content_id: Option<String>,
}

/// Turns a key session message into a license
#[async_trait]
pub trait LicenseProvider: Send + Sync {
    async fn license(&self, request: &LicenseMessage) -> Result<Bytes>;
}

/// Fetches the server certificate installed on the key container
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn certificate(&self, key_system: &str) -> Result<Bytes>;
}

/// Run a license provider and report the attempt on the event bus
pub async fn request_license(
    provider: &dyn LicenseProvider,
    request: &LicenseMessage,
    events: &EventBus,
) -> Result<Bytes> {
    let result = provider.license(request).await;

    events.emit(EmeEvent::LicenseRequestAttempted {
        key_system: request.key_system.clone(),
        content_id: request.content_id.clone(),
        success: result.is_ok(),
    });

    result
}

/// Default license adapter for every key system family
pub struct HttpLicense {
    key_system: String,
    family: KeySystemFamily,
    url: Url,
    eme_headers: Headers,
    license_headers: Headers,
    transport: Arc<dyn Transport>,
}

impl HttpLicense {
    pub fn new(
        key_system: &str,
        url: Url,
        eme_headers: Headers,
        license_headers: Headers,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            key_system: key_system.to_string(),
            family: KeySystemFamily::of(key_system),
            url,
            eme_headers,
            license_headers,
            transport,
        }
    }

    fn build_request(&self, message: &Bytes) -> Result<HttpRequest> {
        let (headers, body) = match self.family {
            KeySystemFamily::Generic | KeySystemFamily::CertificateBased => {
                let base = Headers::from([("Content-type".to_string(), Some(OCTET_STREAM.to_string()))]);
                let headers = merge_headers([&base, &self.eme_headers, &self.license_headers]);
                (headers, message.clone())
            }
            KeySystemFamily::ChallengeDocument => {
                let document = ChallengeDocument::parse(message)?;
                let headers = merge_headers([&document.headers, &self.eme_headers, &self.license_headers]);
                let body = document.challenge.unwrap_or_else(|| {
                    warn!(key_system = %self.key_system, "Key message has no Challenge element, sending it as is");
                    message.clone()
                });
                (headers, body)
            }
        };

        Ok(HttpRequest {
            url: self.url.clone(),
            method: HttpMethod::Post,
            headers,
            body: Some(body),
            kind: RequestKind::License,
            key_system: self.key_system.clone(),
        })
    }
}

#[async_trait]
impl LicenseProvider for HttpLicense {
    #[instrument(skip(self, request), fields(key_system = %self.key_system, url = %self.url))]
    async fn license(&self, request: &LicenseMessage) -> Result<Bytes> {
        let http = self.build_request(&request.message)?;
        debug!(family = ?self.family, bytes = request.message.len(), "Requesting license");

        let response = self.transport.send(http).await?;
        response.into_result(RequestKind::License)
    }
}

/// Default certificate adapter: GET with global and certificate headers
pub struct HttpCertificate {
    url: Url,
    eme_headers: Headers,
    certificate_headers: Headers,
    transport: Arc<dyn Transport>,
}

impl HttpCertificate {
    pub fn new(url: Url, eme_headers: Headers, certificate_headers: Headers, transport: Arc<dyn Transport>) -> Self {
        Self {
            url,
            eme_headers,
            certificate_headers,
            transport,
        }
    }
}

#[async_trait]
impl CertificateProvider for HttpCertificate {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn certificate(&self, key_system: &str) -> Result<Bytes> {
        let request = HttpRequest {
            url: self.url.clone(),
            method: HttpMethod::Get,
            headers: merge_headers([&self.eme_headers, &self.certificate_headers]),
            body: None,
            kind: RequestKind::Certificate,
            key_system: key_system.to_string(),
        };

        let response = self.transport.send(request).await?;
        let certificate = response.into_result(RequestKind::Certificate)?;
        debug!(bytes = certificate.len(), "Certificate received");
        Ok(certificate)
    }
}

/// Parsed PlayReady key message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeDocument {
    /// Headers the license server expects, from `HttpHeaders`
    pub headers: Headers,
    /// Decoded `Challenge` payload
    pub challenge: Option<Bytes>,
}

#[derive(Deserialize)]
struct PlayReadyKeyMessage {
    #[serde(rename = "LicenseAcquisition")]
    license_acquisition: Option<LicenseAcquisition>,
}

#[derive(Deserialize)]
struct LicenseAcquisition {
    #[serde(rename = "Challenge")]
    challenge: Option<Challenge>,
    #[serde(rename = "HttpHeaders")]
    http_headers: Option<HttpHeaders>,
}

#[derive(Deserialize)]
struct Challenge {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Deserialize)]
struct HttpHeaders {
    #[serde(rename = "HttpHeader", default)]
    headers: Vec<HttpHeader>,
}

#[derive(Deserialize)]
struct HttpHeader {
    name: String,
    value: String,
}

impl ChallengeDocument {
    /// Parse a UTF-16 PlayReady key message
    pub fn parse(message: &[u8]) -> Result<Self> {
        let xml = decode_utf16_le(message);
        let xml = xml.trim_start_matches('\u{feff}').trim_end_matches('\0');

        let parsed: PlayReadyKeyMessage = quick_xml::de::from_str(xml)
            .map_err(|e| Error::license(format!("invalid PlayReady key message: {e}")))?;
        let Some(acquisition) = parsed.license_acquisition else {
            return Ok(Self::default());
        };

        let headers = acquisition
            .http_headers
            .map(|h| {
                h.headers
                    .into_iter()
                    .map(|header| (header.name.trim().to_string(), Some(header.value.trim().to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let challenge = match acquisition.challenge {
            Some(c) => {
                let encoded: String = c.value.chars().filter(|c| !c.is_whitespace()).collect();
                let decoded = STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::license(format!("invalid PlayReady challenge: {e}")))?;
                Some(Bytes::from(decoded))
            }
            None => None,
        };

        Ok(Self { headers, challenge })
    }
}
