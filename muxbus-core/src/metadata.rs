use std::time::Duration;

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::{self, Code, Result, Status};

/// Request pseudo-header carrying `/Service/Method`.
pub const PATH: &str = ":path";
/// Trailer-only status code, decimal.
pub const GRPC_STATUS: &str = "grpc-status";
/// Optional percent-encoded human-readable status text.
pub const GRPC_MESSAGE: &str = "grpc-message";
/// Request deadline, `<positive int><unit>` with unit in n/u/m/S/M/H.
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
/// Informational content type sent on request headers.
pub const CONTENT_TYPE: &str = "content-type";

const CONTENT_TYPE_VALUE: &str = "application/grpc+proto";

/// An ordered bag of (name, value) pairs.
///
/// Names compare case-insensitively and are stored lowercased; values are
/// opaque bytes that may be UTF-8 text. Repeated names are allowed and
/// iteration preserves insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<u8>)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Headers for an outbound call to `/service/method`.
    pub fn for_request(service: &str, method: &str) -> Metadata {
        let mut md = Metadata::new();
        md.append(PATH, format!("/{service}/{method}"));
        md.append(CONTENT_TYPE, CONTENT_TYPE_VALUE);
        md
    }

    /// A minimal trailer carrying a termination status.
    pub fn for_trailer(code: Code, message: Option<&str>) -> Metadata {
        let mut md = Metadata::new();
        md.append(GRPC_STATUS, code.as_i32().to_string());
        if let Some(message) = message {
            if !message.is_empty() {
                md.append(GRPC_MESSAGE, status::encode_message(message));
            }
        }
        md
    }

    /// Append a value, keeping any existing values for the name.
    pub fn append(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.entries.push((name.to_lowercase(), value.into()));
    }

    /// Replace all values for the name with a single one.
    pub fn insert(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        let name = name.to_lowercase();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    /// First value for a name, if any.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// First value for a name as UTF-8 text.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `:path` pseudo-header, if present.
    pub fn path(&self) -> Option<&str> {
        self.get_str(PATH)
    }

    /// Split a `/Service/Method` path into its components.
    ///
    /// Returns None unless both components are non-empty ASCII.
    pub fn split_path(&self) -> Option<(&str, &str)> {
        let path = self.path()?;
        let rest = path.strip_prefix('/')?;
        let (service, method) = rest.split_once('/')?;
        if service.is_empty() || method.is_empty() || !rest.is_ascii() {
            return None;
        }
        Some((service, method))
    }

    /// Parse a trailer's `grpc-status`/`grpc-message` pair.
    ///
    /// Returns None when no `grpc-status` entry is present (i.e. this
    /// metadata is not a trailer).
    pub fn status(&self) -> Option<Status> {
        let code = self.get_str(GRPC_STATUS)?.parse::<i32>().ok()?;
        let message = self
            .get_str(GRPC_MESSAGE)
            .map(status::decode_message)
            .unwrap_or_default();
        Some(Status::new(Code::from_i32(code), message))
    }

    /// True when this metadata carries a termination status.
    pub fn is_trailer(&self) -> bool {
        self.get(GRPC_STATUS).is_some()
    }

    /// Attach a `grpc-timeout` header.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.insert(GRPC_TIMEOUT, encode_timeout(timeout));
    }

    /// Parse the `grpc-timeout` header, if present and well-formed.
    pub fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.get_str(GRPC_TIMEOUT)?)
    }

    /// Serialise to the length-prefixed wire form.
    ///
    /// Layout per entry: u16 name length, name bytes, u32 value length,
    /// value bytes. Order of repeated names is preserved.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for (name, value) in &self.entries {
            buf.put_u16(name.len() as u16);
            buf.extend_from_slice(name.as_bytes());
            buf.put_u32(value.len() as u32);
            buf.extend_from_slice(value);
        }
        buf.freeze()
    }

    /// Parse the wire form produced by `to_wire`.
    pub fn from_wire(bytes: &[u8]) -> Result<Metadata> {
        let mut buf = bytes;
        let mut md = Metadata::new();
        while buf.has_remaining() {
            if buf.remaining() < 2 {
                return Err(Status::invalid_argument("truncated metadata entry"));
            }
            let name_len = buf.get_u16() as usize;
            if buf.remaining() < name_len + 4 {
                return Err(Status::invalid_argument("truncated metadata name"));
            }
            let name = std::str::from_utf8(&buf[..name_len])
                .map_err(|_| Status::invalid_argument("metadata name is not UTF-8"))?
                .to_string();
            buf.advance(name_len);
            let value_len = buf.get_u32() as usize;
            if buf.remaining() < value_len {
                return Err(Status::invalid_argument("truncated metadata value"));
            }
            let value = buf[..value_len].to_vec();
            buf.advance(value_len);
            md.entries.push((name, value));
        }
        Ok(md)
    }

    /// Format as a human-readable string, one `name: value` per line.
    ///
    /// Binary values are rendered in base64. Lines are sorted for stable
    /// log output.
    pub fn display_string(&self) -> String {
        if self.is_empty() {
            return "(empty)".to_string();
        }

        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|(name, value)| match std::str::from_utf8(value) {
                Ok(text) => format!("{name}: {text}"),
                Err(_) => format!(
                    "{name}: {}",
                    base64::engine::general_purpose::STANDARD.encode(value)
                ),
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

/// Encode a duration as a `grpc-timeout` value.
///
/// Picks the coarsest unit that represents the duration exactly.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    if nanos == 0 {
        return "0n".to_string();
    }
    if nanos % 3_600_000_000_000 == 0 {
        format!("{}H", nanos / 3_600_000_000_000)
    } else if nanos % 60_000_000_000 == 0 {
        format!("{}M", nanos / 60_000_000_000)
    } else if nanos % 1_000_000_000 == 0 {
        format!("{}S", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}m", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}u", nanos / 1_000)
    } else {
        format!("{nanos}n")
    }
}

/// Parse a `grpc-timeout` value. Returns None on malformed input.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "n" => Some(Duration::from_nanos(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "S" => Some(Duration::from_secs(amount)),
        "M" => amount.checked_mul(60).map(Duration::from_secs),
        "H" => amount.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
