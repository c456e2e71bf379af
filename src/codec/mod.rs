//! Compact binary form of a broadcast URL.
//!
//! The first byte selects a scheme prefix. For http(s) schemes the remainder
//! is printable ASCII, with common TLD/path fragments folded into single
//! bytes. For `urn:uuid:` the remainder is the 16 big-endian UUID bytes.
//!
//! Encoding picks the longest matching expansion at each position from left
//! to right. That is deterministic but only locally optimal: a shorter match
//! now can occasionally enable a better encoding later, and the encoder will
//! not find it.

pub mod broadcast;
pub mod frame;

use thiserror::Error;
use uuid::Uuid;

/// Payload budget after the scheme byte's frame header (31-byte advertising
/// frame minus flags, service UUID and service data headers).
pub const MAX_URI_BYTES: usize = 18;

const URN_UUID: &str = "urn:uuid:";
const URN_UUID_CODE: u8 = 0x04;
const UUID_LEN: usize = 16;

/// Ordered: the first matching prefix wins, so `www.` forms come first.
const SCHEMES: [(u8, &str); 5] = [
    (0x00, "http://www."),
    (0x01, "https://www."),
    (0x02, "http://"),
    (0x03, "https://"),
    (URN_UUID_CODE, URN_UUID),
];

const EXPANSIONS: [(u8, &str); 14] = [
    (0x00, ".com/"),
    (0x01, ".org/"),
    (0x02, ".edu/"),
    (0x03, ".net/"),
    (0x04, ".info/"),
    (0x05, ".biz/"),
    (0x06, ".gov/"),
    (0x07, ".com"),
    (0x08, ".org"),
    (0x09, ".edu"),
    (0x0a, ".net"),
    (0x0b, ".info"),
    (0x0c, ".biz"),
    (0x0d, ".gov"),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("url is empty")]
    Empty,
    #[error("no known scheme prefix")]
    UnknownScheme,
    #[error("urn:uuid remainder is not a canonical uuid")]
    InvalidUuid,
    #[error("character {0:?} cannot be carried in a url frame")]
    InvalidCharacter(char),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("unknown scheme code {0:#04x}")]
    UnknownSchemeCode(u8),
    #[error("byte {0:#04x} is neither an expansion nor printable ascii")]
    InvalidByte(u8),
    #[error("payload truncated")]
    Truncated,
    #[error("encoded url is {len} bytes, budget is {max}")]
    TooLong { len: usize, max: usize },
    #[error("no url service data in advertisement")]
    NoServiceData,
    #[error("advertisement frame is malformed")]
    MalformedFrame,
}

/// Encodes a URL and enforces the frame budget.
pub fn encode(url: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = encode_unbounded(url)?;
    if bytes.len() > MAX_URI_BYTES {
        return Err(CodecError::TooLong {
            len: bytes.len(),
            max: MAX_URI_BYTES,
        });
    }
    Ok(bytes)
}

/// Encodes a URL without checking it against the frame budget.
pub fn encode_unbounded(url: &str) -> Result<Vec<u8>, CodecError> {
    if url.is_empty() {
        return Err(CodecError::Empty);
    }

    let (code, scheme) = SCHEMES
        .iter()
        .copied()
        .find(|(_, scheme)| url.starts_with(scheme))
        .ok_or(CodecError::UnknownScheme)?;

    let rest = &url[scheme.len()..];
    let mut out = Vec::with_capacity(url.len());
    out.push(code);

    if code == URN_UUID_CODE {
        encode_urn_uuid(rest, &mut out)?;
    } else {
        encode_url(rest, &mut out)?;
    }

    Ok(out)
}

/// Byte length of the encoded URL, or `None` if it cannot be encoded at all.
pub fn encoded_len(url: &str) -> Option<usize> {
    encode_unbounded(url).ok().map(|bytes| bytes.len())
}

/// Whether the URL can be broadcast as-is, without shortening.
pub fn fits_frame(url: &str) -> bool {
    encoded_len(url).is_some_and(|len| len <= MAX_URI_BYTES)
}

fn encode_url(rest: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let mut position = 0;
    while position < rest.len() {
        let remaining = &rest[position..];
        if let Some((code, expansion)) = longest_expansion(remaining) {
            out.push(code);
            position += expansion.len();
            continue;
        }

        let ch = remaining.chars().next().ok_or(CodecError::Truncated)?;
        if !is_carried_char(ch) {
            return Err(CodecError::InvalidCharacter(ch));
        }
        out.push(ch as u8);
        position += 1;
    }
    Ok(())
}

fn longest_expansion(remaining: &str) -> Option<(u8, &'static str)> {
    EXPANSIONS
        .iter()
        .copied()
        .filter(|(_, expansion)| remaining.starts_with(expansion))
        .max_by_key(|(_, expansion)| expansion.len())
}

fn encode_urn_uuid(rest: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let uuid = Uuid::parse_str(rest).map_err(|_| CodecError::InvalidUuid)?;
    // Only the canonical spelling survives a decode unchanged.
    if uuid.hyphenated().to_string() != rest {
        return Err(CodecError::InvalidUuid);
    }
    out.extend_from_slice(uuid.as_bytes());
    Ok(())
}

/// Decodes a payload that starts with the scheme byte.
pub fn decode(payload: &[u8]) -> Result<String, CodecError> {
    let (&code, rest) = payload.split_first().ok_or(CodecError::EmptyPayload)?;
    let scheme = SCHEMES
        .iter()
        .find(|(scheme_code, _)| *scheme_code == code)
        .map(|(_, scheme)| *scheme)
        .ok_or(CodecError::UnknownSchemeCode(code))?;

    let mut url = String::from(scheme);
    if code == URN_UUID_CODE {
        let bytes: [u8; 16] = match rest.len() {
            UUID_LEN => rest.try_into().map_err(|_| CodecError::Truncated)?,
            len if len > UUID_LEN => return Err(CodecError::TooLong { len, max: UUID_LEN }),
            _ => return Err(CodecError::Truncated),
        };
        url.push_str(&Uuid::from_bytes(bytes).hyphenated().to_string());
        return Ok(url);
    }

    for &byte in rest {
        match EXPANSIONS.iter().find(|(expansion_code, _)| *expansion_code == byte) {
            Some((_, expansion)) => url.push_str(expansion),
            None if is_carried_char(byte as char) => url.push(byte as char),
            None => return Err(CodecError::InvalidByte(byte)),
        }
    }
    Ok(url)
}

fn is_carried_char(ch: char) -> bool {
    ch.is_ascii_graphic()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_scheme_and_expansions() {
        assert_eq!(
            encode("http://www.example.com/").unwrap(),
            vec![0x00, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x00]
        );
        assert_eq!(
            encode("https://goo.gl/S6zT6P").unwrap(),
            vec![0x03, b'g', b'o', b'o', b'.', b'g', b'l', b'/', b'S', b'6', b'z', b'T', b'6', b'P']
        );
    }

    #[test]
    fn prefers_longest_expansion() {
        // ".com/" must win over ".com" when both match.
        assert_eq!(encode("http://a.com/b").unwrap(), vec![0x02, b'a', 0x00, b'b']);
        assert_eq!(encode("http://a.com").unwrap(), vec![0x02, b'a', 0x07]);
        assert_eq!(encode("http://a.info/").unwrap(), vec![0x02, b'a', 0x04]);
    }

    #[test]
    fn round_trips_representative_urls() {
        let urls = [
            "http://www.example.com",
            "https://www.physical-web.org/",
            "http://example.com",
            "https://goo.gl/abc",
            "http://a.gov/x.edu",
            "https://x.biz/y.info/z",
            "http://comcom.com.com/",
            "urn:uuid:b1a3e0c2-6f1c-4d4e-9a3f-0123456789ab",
        ];
        for url in urls {
            let bytes = encode_unbounded(url).unwrap();
            assert_eq!(decode(&bytes).unwrap(), url, "round trip failed for {url}");
        }
    }

    #[test]
    fn rejects_unencodable_input() {
        assert_eq!(encode(""), Err(CodecError::Empty));
        assert_eq!(encode("ftp://example.com"), Err(CodecError::UnknownScheme));
        assert_eq!(encode("urn:uuid:not-a-uuid"), Err(CodecError::InvalidUuid));
        assert_eq!(
            encode("urn:uuid:B1A3E0C2-6F1C-4D4E-9A3F-0123456789AB"),
            Err(CodecError::InvalidUuid)
        );
        assert_eq!(
            encode("http://exa mple.com"),
            Err(CodecError::InvalidCharacter(' '))
        );
        assert_eq!(encode("http://é.com"), Err(CodecError::InvalidCharacter('é')));
    }

    #[test]
    fn length_gate_reports_too_long() {
        let url = "https://www.a-rather-long-domain-name.example/path";
        assert!(!fits_frame(url));
        assert!(matches!(encode(url), Err(CodecError::TooLong { max: MAX_URI_BYTES, .. })));
        assert!(encoded_len(url).is_some_and(|len| len > MAX_URI_BYTES));

        assert!(fits_frame("http://example.com"));
        assert_eq!(encoded_len("ftp://x"), None);
    }

    #[test]
    fn uuid_encodes_sixteen_big_endian_bytes() {
        let bytes = encode("urn:uuid:00112233-4455-6677-8899-aabbccddeeff").unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], URN_UUID_CODE);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[16], 0xff);
    }

    #[test]
    fn decode_failures_are_values() {
        assert_eq!(decode(&[]), Err(CodecError::EmptyPayload));
        assert_eq!(decode(&[0x09, b'a']), Err(CodecError::UnknownSchemeCode(0x09)));
        assert_eq!(decode(&[0x04, 0x00, 0x01]), Err(CodecError::Truncated));
        assert_eq!(decode(&[0x02, b'a', 0x1f]), Err(CodecError::InvalidByte(0x1f)));
    }

    #[test]
    fn uuid_payloads_must_be_exactly_sixteen_bytes() {
        let mut bytes = encode("urn:uuid:00112233-4455-6677-8899-aabbccddeeff").unwrap();
        assert_eq!(decode(&bytes).unwrap(), "urn:uuid:00112233-4455-6677-8899-aabbccddeeff");

        bytes.push(0x2e);
        assert_eq!(decode(&bytes), Err(CodecError::TooLong { len: 17, max: 16 }));
    }
}
