//! Content identifier derivation
//!
//! FairPlay scopes its native session with a content id. By default it is the
//! host of the `skd://` URI carried, as UTF-16, in the init data.

use url::Url;

/// Derives the content id handed to the license function
pub trait ContentIdProvider: Send + Sync {
    fn content_id(&self, init_data: &[u8]) -> Option<String>;
}

impl<F> ContentIdProvider for F
where
    F: Fn(&[u8]) -> Option<String> + Send + Sync,
{
    fn content_id(&self, init_data: &[u8]) -> Option<String> {
        self(init_data)
    }
}

/// Default provider: host component of the URI in the init data
#[derive(Debug, Clone, Copy, Default)]
pub struct UriHostContentId;

impl ContentIdProvider for UriHostContentId {
    fn content_id(&self, init_data: &[u8]) -> Option<String> {
        host_from_uri(&decode_utf16_le(init_data))
    }
}

/// Decode little-endian UTF-16, replacing unpaired surrogates
pub fn decode_utf16_le(data: &[u8]) -> String {
    let units = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Encode a string as little-endian UTF-16
pub fn encode_utf16_le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Extract `host[:port]` from a URI.
///
/// Init data from Safari carries a binary length prefix before the URI, so
/// anything before the first ASCII letter and any trailing NULs are ignored.
pub fn host_from_uri(uri: &str) -> Option<String> {
    let start = uri.find(|c: char| c.is_ascii_alphabetic())?;
    let uri = uri[start..].trim_end_matches(['\0', char::REPLACEMENT_CHARACTER]).trim();

    let url = Url::parse(uri).ok()?;
    let host = url.host_str()?;
    if host.is_empty() {
        return None;
    }

    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
