//! CLI command implementations

use crate::output::{print_rows, print_value};
use anyhow::{anyhow, bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use kino_eme::content_id::{decode_utf16_le, host_from_uri};
use kino_eme::negotiate::candidate_configurations;
use kino_eme::transport::Headers;
use kino_eme::{
    parse_pssh_boxes, CertificateProvider, DrmSystem, EmeOptions, HttpCertificate, HttpLicense, KeySystemFamily,
    LicenseMessage, LicenseProvider, MessageType, ReqwestTransport, Transport, UriHostContentId,
    ContentIdProvider,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use url::Url;

/// Read `@path` as a file, anything else as base64
fn read_input(input: &str) -> anyhow::Result<Vec<u8>> {
    match input.strip_prefix('@') {
        Some(path) => std::fs::read(path).with_context(|| format!("failed to read {path}")),
        None => STANDARD
            .decode(input.trim())
            .context("input is neither @path nor valid base64"),
    }
}

/// Parse `name:value` header arguments
fn parse_headers(headers: &[String]) -> anyhow::Result<Headers> {
    headers
        .iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("header '{header}' is not name:value"))?;
            Ok((name.trim().to_string(), Some(value.trim().to_string())))
        })
        .collect()
}

fn parse_drm_system(name: &str) -> anyhow::Result<DrmSystem> {
    DrmSystem::ALL
        .into_iter()
        .find(|system| system.to_string() == name.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("unknown DRM system '{name}'"))
}

fn transport(timeout: u64) -> anyhow::Result<Arc<dyn Transport>> {
    Ok(Arc::new(ReqwestTransport::with_timeout(Duration::from_secs(timeout))?))
}

fn write_or_print(data: &Bytes, output: Option<PathBuf>, what: &str, format: &str) -> anyhow::Result<()> {
    if let Some(path) = &output {
        std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
    }

    let report = BinaryReport {
        kind: what.to_string(),
        bytes: data.len(),
        output: output.as_deref().map(|p| p.display().to_string()),
        base64: output.is_none().then(|| STANDARD.encode(data)),
    };
    print_value(&report, format, |r| match (&r.output, &r.base64) {
        (Some(path), _) => format!("{} ({} bytes) written to {}", r.kind, r.bytes, path),
        (None, Some(encoded)) => format!("{} ({} bytes)\n{}", r.kind, r.bytes, encoded),
        (None, None) => format!("{} ({} bytes)", r.kind, r.bytes),
    });
    Ok(())
}

#[derive(Serialize)]
struct BinaryReport {
    kind: String,
    bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    base64: Option<String>,
}

#[derive(Serialize, Tabled)]
struct PsshRow {
    #[tabled(rename = "System")]
    system: String,
    #[tabled(rename = "System ID")]
    system_id: String,
    #[tabled(rename = "Version")]
    version: u8,
    #[tabled(rename = "Offset")]
    offset: usize,
    #[tabled(rename = "Size")]
    size: usize,
    #[tabled(rename = "Key IDs")]
    key_ids: String,
}

/// List or extract protection boxes
pub fn pssh(init_data: &str, extract: Option<&str>, format: &str) -> anyhow::Result<()> {
    let data = read_input(init_data)?;
    let boxes = parse_pssh_boxes(&data);
    tracing::debug!(bytes = data.len(), boxes = boxes.len(), "Scanned init data");

    if let Some(name) = extract {
        let system = parse_drm_system(name)?;
        let found = boxes
            .iter()
            .find(|b| b.drm_system() == Some(system))
            .ok_or_else(|| anyhow!("no {system} pssh box in init data"))?;
        let extracted = found
            .bytes(&data)
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| anyhow!("{system} pssh box lies outside the init data"))?;
        return write_or_print(&extracted, None, &format!("{system} pssh box"), format);
    }

    if boxes.is_empty() {
        println!("No pssh boxes found in {} bytes", data.len());
        return Ok(());
    }

    let rows: Vec<PsshRow> = boxes
        .iter()
        .map(|b| PsshRow {
            system: b.drm_system().map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()),
            system_id: b.system_id.clone(),
            version: b.version,
            offset: b.range.start,
            size: b.range.len(),
            key_ids: b.key_ids.join(","),
        })
        .collect();

    print_rows(&rows, format, |r| {
        let mut line = format!("{:<10} {}  v{}  {} bytes @ {}", r.system, r.system_id, r.version, r.size, r.offset);
        if !r.key_ids.is_empty() {
            line.push_str(&format!("  kids: {}", r.key_ids));
        }
        line
    });
    Ok(())
}

#[derive(Serialize)]
struct ContentIdReport {
    uri: String,
    content_id: Option<String>,
}

/// Derive the FairPlay content id
pub fn content_id(init_data: Option<&str>, uri: Option<&str>, format: &str) -> anyhow::Result<()> {
    let report = match (uri, init_data) {
        (Some(uri), _) => ContentIdReport {
            uri: uri.to_string(),
            content_id: host_from_uri(uri),
        },
        (None, Some(input)) => {
            let data = read_input(input)?;
            ContentIdReport {
                uri: decode_utf16_le(&data).trim_end_matches('\0').to_string(),
                content_id: UriHostContentId.content_id(&data),
            }
        }
        (None, None) => bail!("either init data or --uri is required"),
    };

    print_value(&report, format, |r| match &r.content_id {
        Some(id) => id.clone(),
        None => format!("No content id in '{}'", r.uri),
    });
    Ok(())
}

#[derive(Serialize, Tabled)]
struct KeySystemRow {
    #[tabled(rename = "Key System")]
    key_system: String,
    #[tabled(rename = "Family")]
    family: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "License")]
    license: String,
    #[tabled(rename = "Certificate")]
    certificate: String,
    #[tabled(rename = "Candidates")]
    candidates: usize,
    #[tabled(skip)]
    configurations: serde_json::Value,
}

/// Validate an options file and print what negotiation would try
pub fn config(file: &Path, format: &str) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let options = EmeOptions::from_json(&json)?;

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new());

    if options.key_systems.is_empty() {
        println!("No key systems configured");
        return Ok(());
    }

    let mut rows = Vec::new();
    for (name, system) in options.key_systems.iter() {
        let family = match KeySystemFamily::of(name) {
            KeySystemFamily::Generic => "generic",
            KeySystemFamily::ChallengeDocument => "challenge document",
            KeySystemFamily::CertificateBased => "certificate based",
        };
        let license = match (&system.get_license, system.license_url()) {
            (Some(_), _) => "custom".to_string(),
            (None, Some(url)) => url.to_string(),
            (None, None) => "-".to_string(),
        };
        let certificate = system
            .certificate_uri
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_else(|| "-".to_string());
        let candidates = candidate_configurations(name, system);
        let status = match options.normalize_key_system(name, &transport) {
            Ok(_) => "ok".to_string(),
            Err(e) => e.to_string(),
        };

        rows.push(KeySystemRow {
            key_system: name.clone(),
            family: family.to_string(),
            status,
            license,
            certificate,
            candidates: candidates.len(),
            configurations: serde_json::to_value(&candidates)?,
        });
    }

    print_rows(&rows, format, |r| {
        let configurations = serde_json::to_string(&r.configurations).unwrap_or_default();
        format!(
            "{} ({}): {}\n  license:     {}\n  certificate: {}\n  candidates:  {}",
            r.key_system, r.family, r.status, r.license, r.certificate, configurations
        )
    });
    Ok(())
}

/// Fetch a server certificate with the default certificate adapter
pub async fn certificate(
    url: &str,
    headers: &[String],
    output: Option<PathBuf>,
    timeout: u64,
    format: &str,
) -> anyhow::Result<()> {
    let url = Url::parse(url).with_context(|| format!("invalid certificate URL '{url}'"))?;
    let provider = HttpCertificate::new(url, Headers::new(), parse_headers(headers)?, transport(timeout)?);

    let certificate = provider.certificate("cli").await?;
    write_or_print(&certificate, output, "Certificate", format)
}

/// Send a key message with the default license adapter of its family
pub async fn license(
    key_system: &str,
    url: &str,
    message: &str,
    headers: &[String],
    output: Option<PathBuf>,
    timeout: u64,
    format: &str,
) -> anyhow::Result<()> {
    let url = Url::parse(url).with_context(|| format!("invalid license URL '{url}'"))?;
    let message = Bytes::from(read_input(message)?);
    let content_id = UriHostContentId.content_id(&message);

    let provider = HttpLicense::new(key_system, url, Headers::new(), parse_headers(headers)?, transport(timeout)?);
    let license = provider
        .license(&LicenseMessage {
            key_system: key_system.to_string(),
            message_type: MessageType::LicenseRequest,
            message,
            content_id,
        })
        .await?;

    write_or_print(&license, output, "License", format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&["Authorization: Bearer abc".to_string(), "X-Id:7".to_string()]).unwrap();
        assert_eq!(headers.get("Authorization"), Some(&Some("Bearer abc".to_string())));
        assert_eq!(headers.get("X-Id"), Some(&Some("7".to_string())));

        assert!(parse_headers(&["no-colon".to_string()]).is_err());
    }

    #[test]
    fn test_read_input_base64() {
        assert_eq!(read_input("AQID").unwrap(), vec![1, 2, 3]);
        assert!(read_input("not base64!").is_err());
    }

    #[test]
    fn test_parse_drm_system() {
        assert_eq!(parse_drm_system("PlayReady").unwrap(), DrmSystem::PlayReady);
        assert_eq!(parse_drm_system("widevine").unwrap(), DrmSystem::Widevine);
        assert!(parse_drm_system("primetime").is_err());
    }
}
