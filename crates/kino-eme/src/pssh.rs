//! Protection System Specific Header (PSSH) box scanning
//!
//! Init data delivered with an encrypted signal is usually a sequence of
//! `pssh` boxes, one per DRM system. The legacy PlayReady dialect only accepts
//! its own box, so the combined buffer is narrowed to a single box here.
//!
//! Box layout (ISO/IEC 23001-7):
//!
//! ```text
//! size:u32 'pssh' version:u8 flags:u24 system_id:[u8;16]
//!   [version 1] kid_count:u32 kids:[[u8;16]; kid_count]
//!   data_size:u32 data:[u8; data_size]
//! ```

use crate::types::DrmSystem;
use nom::bytes::complete::take;
use nom::number::complete::{be_u32, be_u64, u8 as byte};
use nom::{IResult, Parser};
use serde::Serialize;
use std::ops::Range;
use uuid::Uuid;

const PSSH: &[u8; 4] = b"pssh";

/// A `pssh` box located inside an init data buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsshBox {
    /// DRM system ID, lowercase and hyphenated
    pub system_id: String,
    /// Full box version (0 or 1)
    pub version: u8,
    /// Key IDs listed by version 1 boxes, as hex
    pub key_ids: Vec<String>,
    /// Byte range of the whole box inside the scanned buffer
    pub range: Range<usize>,
}

impl PsshBox {
    /// Parse system ID to DRM type
    pub fn drm_system(&self) -> Option<DrmSystem> {
        DrmSystem::from_system_id(&self.system_id)
    }

    /// Slice this box out of the buffer it was found in.
    ///
    /// `None` when `init_data` is too short for the recorded range.
    pub fn bytes<'a>(&self, init_data: &'a [u8]) -> Option<&'a [u8]> {
        init_data.get(self.range.clone())
    }
}

struct BoxHeader<'a> {
    size: u64,
    kind: &'a [u8],
    header_len: usize,
}

fn box_header(input: &[u8]) -> IResult<&[u8], BoxHeader<'_>> {
    let (input, size) = be_u32(input)?;
    let (input, kind) = take(4usize).parse(input)?;

    if size == 1 {
        let (input, large) = be_u64(input)?;
        return Ok((input, BoxHeader { size: large, kind, header_len: 16 }));
    }

    Ok((input, BoxHeader { size: u64::from(size), kind, header_len: 8 }))
}

struct PsshPreamble {
    version: u8,
    system_id: String,
    key_ids: Vec<String>,
}

fn pssh_preamble(input: &[u8]) -> IResult<&[u8], PsshPreamble> {
    let (input, version) = byte(input)?;
    let (input, _flags) = take(3usize).parse(input)?;
    let (mut input, raw_id) = take(16usize).parse(input)?;

    let mut key_ids = Vec::new();
    if version == 1 {
        let (rest, count) = be_u32(input)?;
        input = rest;
        for _ in 0..count {
            let (rest, kid) = take(16usize).parse(input)?;
            key_ids.push(hex::encode(kid));
            input = rest;
        }
    }

    let system_id = Uuid::from_slice(raw_id)
        .map(|id| id.hyphenated().to_string())
        .unwrap_or_default();

    Ok((input, PsshPreamble { version, system_id, key_ids }))
}

/// Scan sequential boxes and collect every well-formed `pssh` box.
///
/// Scanning stops at the first truncated or malformed box; boxes found before
/// it are still returned.
pub fn parse_pssh_boxes(init_data: &[u8]) -> Vec<PsshBox> {
    let mut boxes = Vec::new();
    let mut offset = 0usize;

    while offset < init_data.len() {
        let remaining = &init_data[offset..];
        let Ok((_, header)) = box_header(remaining) else {
            break;
        };

        let size = match header.size {
            0 => remaining.len(),
            n => match usize::try_from(n) {
                Ok(n) => n,
                Err(_) => break,
            },
        };
        if size < header.header_len || size > remaining.len() {
            break;
        }

        if header.kind == PSSH {
            let body = &remaining[header.header_len..size];
            if let Ok((_, preamble)) = pssh_preamble(body) {
                if preamble.version <= 1 {
                    boxes.push(PsshBox {
                        system_id: preamble.system_id,
                        version: preamble.version,
                        key_ids: preamble.key_ids,
                        range: offset..offset + size,
                    });
                }
            }
        }

        offset += size;
    }

    boxes
}

/// Locate the `pssh` box for `system_id` and return its full bytes
pub fn find_pssh<'a>(init_data: &'a [u8], system_id: &str) -> Option<&'a [u8]> {
    let target = system_id.to_ascii_lowercase();
    parse_pssh_boxes(init_data)
        .into_iter()
        .find(|b| b.system_id == target)
        .map(|b| &init_data[b.range])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pssh_box(version: u8, system_id: &str, kids: &[[u8; 16]], data: &[u8]) -> Vec<u8> {
        let mut body = vec![version, 0, 0, 0];
        body.extend_from_slice(Uuid::parse_str(system_id).unwrap().as_bytes());
        if version == 1 {
            body.extend_from_slice(&(kids.len() as u32).to_be_bytes());
            for kid in kids {
                body.extend_from_slice(kid);
            }
        }
        body.extend_from_slice(&(data.len() as u32).to_be_bytes());
        body.extend_from_slice(data);

        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(PSSH);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_finds_matching_box_among_two() {
        let widevine = pssh_box(0, DrmSystem::Widevine.system_id(), &[], b"widevine-data");
        let playready = pssh_box(0, DrmSystem::PlayReady.system_id(), &[], b"playready-data");
        let combined = [widevine.clone(), playready.clone()].concat();

        let found = find_pssh(&combined, DrmSystem::PlayReady.system_id()).unwrap();
        assert_eq!(found, playready.as_slice());

        let found = find_pssh(&combined, DrmSystem::Widevine.system_id()).unwrap();
        assert_eq!(found, widevine.as_slice());
    }

    #[test]
    fn test_unknown_system_id() {
        let combined = pssh_box(0, DrmSystem::Widevine.system_id(), &[], b"x");
        assert!(find_pssh(&combined, "00000000-0000-0000-0000-000000000000").is_none());
    }

    #[test]
    fn test_version_one_key_ids() {
        let kid = [0xab; 16];
        let data = pssh_box(1, DrmSystem::ClearKey.system_id(), &[kid], b"");

        let boxes = parse_pssh_boxes(&data);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].version, 1);
        assert_eq!(boxes[0].key_ids, vec!["ab".repeat(16)]);
        assert_eq!(boxes[0].drm_system(), Some(DrmSystem::ClearKey));
    }

    #[test]
    fn test_unsupported_version_is_skipped() {
        let mut data = pssh_box(0, DrmSystem::Widevine.system_id(), &[], b"x");
        data[8] = 2;
        assert!(parse_pssh_boxes(&data).is_empty());
    }

    #[test]
    fn test_truncated_input_yields_no_match() {
        let data = pssh_box(0, DrmSystem::Widevine.system_id(), &[], b"payload");
        let truncated = &data[..data.len() - 3];
        assert!(find_pssh(truncated, DrmSystem::Widevine.system_id()).is_none());
        assert!(parse_pssh_boxes(&[0, 0, 0]).is_empty());
    }

    #[test]
    fn test_skips_unrelated_boxes() {
        let mut free = 12u32.to_be_bytes().to_vec();
        free.extend_from_slice(b"free");
        free.extend_from_slice(&[0; 4]);
        let playready = pssh_box(0, DrmSystem::PlayReady.system_id(), &[], b"pr");
        let combined = [free, playready.clone()].concat();

        let boxes = parse_pssh_boxes(&combined);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].range, 12..12 + playready.len());
        assert_eq!(boxes[0].bytes(&combined), Some(playready.as_slice()));
    }

    #[test]
    fn test_bytes_of_a_shorter_buffer() {
        let data = pssh_box(0, DrmSystem::Widevine.system_id(), &[], b"payload");
        let boxes = parse_pssh_boxes(&data);

        assert_eq!(boxes[0].bytes(&data), Some(data.as_slice()));
        assert_eq!(boxes[0].bytes(&data[..10]), None);
        assert_eq!(boxes[0].bytes(&[]), None);
    }
}
