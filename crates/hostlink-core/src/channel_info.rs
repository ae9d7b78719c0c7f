//! Channel identity codec.
//!
//! A spawned client learns which channel to join from a single command-line
//! argument: a base64 string wrapping a small versioned binary record.
//!
//! ```text
//! [u16 BE: format version]
//! [u32 BE: len][channel id bytes]
//! [u32 BE: switch count]
//! repeated: [u32 BE: len][key bytes] [u32 BE: len][value bytes]
//! ```
//!
//! A token whose version tag differs from `TOKEN_FORMAT_VERSION` is rejected
//! before any other field is read.

use crate::config::{IpcConfig, BINARY_VERSION};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Version of the binary record. Bump whenever the layout changes.
pub const TOKEN_FORMAT_VERSION: u16 = 1;

/// Errors produced while decoding a channel token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("token is not valid base64 or contains invalid UTF-8")]
    BadEncoding,

    #[error("token format version {found} does not match {expected}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("token record is truncated")]
    Truncated,
}

/// Bootstrap record handed to a spawned process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelToken {
    /// Name of the channel the process must connect to.
    pub channel_id: String,
    /// Switches inherited from the spawning process, in order.
    pub switches: Vec<(String, String)>,
}

impl ChannelToken {
    pub fn new(channel_id: impl Into<String>, switches: Vec<(String, String)>) -> Self {
        Self {
            channel_id: channel_id.into(),
            switches,
        }
    }

    /// Serialize into a command-line safe token.
    pub fn encode(&self) -> String {
        encode(&self.channel_id, &self.switches)
    }

    /// Parse a token produced by `encode`.
    pub fn decode(token: &str) -> Result<Self, DecodeError> {
        decode(token)
    }

    /// Value of the first switch named `key`.
    pub fn switch(&self, key: &str) -> Option<&str> {
        self.switches
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Encode a channel id and its inherited switches into a token.
pub fn encode(channel_id: &str, switches: &[(String, String)]) -> String {
    let mut buf = BytesMut::new();
    buf.put_u16(TOKEN_FORMAT_VERSION);
    put_string(&mut buf, channel_id);
    buf.put_u32(switches.len() as u32);
    for (key, value) in switches {
        put_string(&mut buf, key);
        put_string(&mut buf, value);
    }
    STANDARD.encode(&buf)
}

/// Decode a token. Never returns a partially filled record.
pub fn decode(token: &str) -> Result<ChannelToken, DecodeError> {
    let raw = STANDARD
        .decode(token.trim())
        .map_err(|_| DecodeError::BadEncoding)?;
    let mut buf = raw.as_slice();

    if buf.remaining() < 2 {
        return Err(DecodeError::Truncated);
    }
    let found = buf.get_u16();
    if found != TOKEN_FORMAT_VERSION {
        return Err(DecodeError::VersionMismatch {
            expected: TOKEN_FORMAT_VERSION,
            found,
        });
    }

    let channel_id = get_string(&mut buf)?;
    let count = get_u32(&mut buf)? as usize;

    // Each pair needs at least two length prefixes.
    let mut switches = Vec::with_capacity(count.min(buf.remaining() / 8));
    for _ in 0..count {
        let key = get_string(&mut buf)?;
        let value = get_string(&mut buf)?;
        switches.push((key, value));
    }

    Ok(ChannelToken {
        channel_id,
        switches,
    })
}

/// Whether a pre-declared channel name was produced by this binary version.
///
/// The name must start with the version string and a separator and carry
/// something after it.
pub fn is_compatible_channel_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(BINARY_VERSION) else {
        return false;
    };
    let Some(tail) = rest.strip_prefix(IpcConfig::CHANNEL_NAME_SEPARATOR) else {
        return false;
    };
    !tail.is_empty()
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switches(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_roundtrip_preserves_order_and_duplicates() {
        let token = ChannelToken::new(
            "abc",
            switches(&[("lang", "en"), ("v", "1"), ("lang", "fr"), ("empty", "")]),
        );
        let decoded = ChannelToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.switch("lang"), Some("en"));
        assert_eq!(decoded.switch("missing"), None);
    }

    #[test]
    fn test_roundtrip_empty_and_unicode() {
        let empty = ChannelToken::default();
        assert_eq!(decode(&empty.encode()).unwrap(), empty);

        let unicode = ChannelToken::new("κανάλι-1", switches(&[("user-data-dir", "C:\\Données")]));
        assert_eq!(decode(&unicode.encode()).unwrap(), unicode);
    }

    #[test]
    fn test_token_is_single_argument() {
        let token = encode("abc def", &switches(&[("a b", "c\nd")]));
        assert!(!token.contains(char::is_whitespace));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert_eq!(decode("%%% not base64 %%%"), Err(DecodeError::BadEncoding));
    }

    #[test]
    fn test_decode_rejects_other_version() {
        let mut buf = BytesMut::new();
        buf.put_u16(TOKEN_FORMAT_VERSION + 1);
        put_string(&mut buf, "abc");
        buf.put_u32(0);
        let token = STANDARD.encode(&buf);

        assert_eq!(
            decode(&token),
            Err(DecodeError::VersionMismatch {
                expected: TOKEN_FORMAT_VERSION,
                found: TOKEN_FORMAT_VERSION + 1,
            })
        );
    }

    #[test]
    fn test_decode_rejects_every_truncation() {
        let raw = STANDARD
            .decode(encode("abc", &switches(&[("lang", "en")])))
            .unwrap();

        // Cutting the record anywhere before its end must fail cleanly.
        for len in 0..raw.len() {
            let token = STANDARD.encode(&raw[..len]);
            assert_eq!(decode(&token), Err(DecodeError::Truncated), "len {}", len);
        }
    }

    #[test]
    fn test_decode_rejects_huge_switch_count() {
        let mut buf = BytesMut::new();
        buf.put_u16(TOKEN_FORMAT_VERSION);
        put_string(&mut buf, "abc");
        buf.put_u32(u32::MAX);
        assert_eq!(decode(&STANDARD.encode(&buf)), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_compatible_channel_name() {
        assert!(is_compatible_channel_name(&format!("{}.abc.1234", BINARY_VERSION)));
        assert!(!is_compatible_channel_name(&format!("{}.", BINARY_VERSION)));
        assert!(!is_compatible_channel_name(BINARY_VERSION));
        assert!(!is_compatible_channel_name("0.0.0-stale.abc"));
        assert!(!is_compatible_channel_name(""));
    }
}
