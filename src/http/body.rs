//! Message bodies: text/binary classification and content decoding

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use super::Headers;
use crate::error::DecodeError;

/// Size of the leading sample inspected for non-printable bytes
const SAMPLE_LEN: usize = 512;

/// Share of non-printable bytes above which a sample counts as binary
const BINARY_THRESHOLD: f64 = 0.30;

/// Content types that are never decoded as text
const BINARY_MEDIA: &[&str] = &[
    "image/",
    "audio/",
    "video/",
    "font/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-tar",
    "application/x-7z-compressed",
    "application/x-rar-compressed",
    "application/wasm",
    "application/x-protobuf",
    "application/protobuf",
    "application/grpc",
    "application/vnd.ms-fontobject",
    "application/x-shockwave-flash",
];

/// A captured message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Body {
    /// Printable UTF-8 content
    Text { text: String },
    /// Opaque bytes. `data` holds at most the capture ceiling; `original_len`
    /// is the size seen on the wire.
    Binary {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        original_len: usize,
        truncated: bool,
    },
}

impl Default for Body {
    fn default() -> Self {
        Body::Text { text: String::new() }
    }
}

impl Body {
    pub fn text(text: impl Into<String>) -> Self {
        Body::Text { text: text.into() }
    }

    pub fn binary(data: Vec<u8>) -> Self {
        let original_len = data.len();
        Body::Binary {
            data,
            original_len,
            truncated: false,
        }
    }

    /// Classify raw wire bytes, keeping at most `limit` of them
    pub fn capture(bytes: &[u8], content_type: Option<&str>, limit: usize) -> Self {
        if bytes.len() > limit {
            return Body::Binary {
                data: bytes[..limit].to_vec(),
                original_len: bytes.len(),
                truncated: true,
            };
        }

        if is_binary(bytes, content_type) {
            return Body::binary(bytes.to_vec());
        }

        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Body::Text { text },
            Err(e) => Body::binary(e.into_bytes()),
        }
    }

    /// Text content, if this body is textual
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text { text } => Some(text),
            Body::Binary { .. } => None,
        }
    }

    /// Bytes held by this body
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Text { text } => text.as_bytes(),
            Body::Binary { data, .. } => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length on the wire, which exceeds `len()` for truncated captures
    pub fn original_len(&self) -> usize {
        match self {
            Body::Text { text } => text.len(),
            Body::Binary { original_len, .. } => *original_len,
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Body::Binary { truncated: true, .. })
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Text { text } => f.write_str(text),
            Body::Binary {
                original_len,
                truncated,
                ..
            } => {
                if *truncated {
                    write!(f, "[binary data: {} bytes, truncated]", original_len)
                } else {
                    write!(f, "[binary data: {} bytes]", original_len)
                }
            }
        }
    }
}

/// Binary if it has a NUL, a binary media type, or too many control bytes
pub fn is_binary(bytes: &[u8], content_type: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.trim().to_ascii_lowercase();
        if BINARY_MEDIA.iter().any(|m| ct.starts_with(m)) {
            return true;
        }
    }

    if bytes.contains(&0) {
        return true;
    }

    let sample = &bytes[..bytes.len().min(SAMPLE_LEN)];
    if sample.is_empty() {
        return false;
    }
    let non_printable = sample
        .iter()
        .filter(|&&b| (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 0x7f)
        .count();

    non_printable as f64 / sample.len() as f64 > BINARY_THRESHOLD
}

/// Decode a body according to a single content-coding token
pub fn decode_content(encoding: &str, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let encoding = encoding.trim().to_ascii_lowercase();
    let corrupt = |e: std::io::Error| DecodeError::CorruptBody {
        encoding: encoding.clone(),
        reason: e.to_string(),
    };

    let mut out = Vec::new();
    match encoding.as_str() {
        "identity" | "" => out.extend_from_slice(data),
        "gzip" | "x-gzip" => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(corrupt)?;
        }
        "deflate" => {
            // Servers disagree on whether deflate means zlib-wrapped or raw
            if flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .is_err()
            {
                out.clear();
                flate2::read::DeflateDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(corrupt)?;
            }
        }
        "br" => {
            brotli::Decompressor::new(data, 4096)
                .read_to_end(&mut out)
                .map_err(corrupt)?;
        }
        other => return Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
    Ok(out)
}

/// Undo every content-coding listed in the headers.
///
/// On success the Content-Encoding header is removed. On failure the raw
/// bytes are returned and headers are left untouched.
pub fn decompress(headers: &mut Headers, body: Vec<u8>) -> Vec<u8> {
    let Some(encodings) = headers.get("content-encoding").map(str::to_string) else {
        return body;
    };
    if body.is_empty() {
        return body;
    }

    // Codings are listed in the order they were applied
    let mut decoded = body.clone();
    for encoding in encodings.split(',').rev() {
        match decode_content(encoding, &decoded) {
            Ok(next) => decoded = next,
            Err(e) => {
                tracing::debug!("Falling back to raw body: {}", e);
                return body;
            }
        }
    }

    headers.remove("content-encoding");
    decoded
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
