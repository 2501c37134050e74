//! Pluggable message serialization for isolink.
//!
//! The [`MessageCodec`] trait turns an [`IsoMessage`] into a self-contained
//! byte payload and back. Framing (length prefix, checksum) is the
//! transport's job; a codec only ever sees one complete payload.
//!
//! Two codecs are provided:
//!
//! - [`BinaryCodec`]: compact tag-length-value encoding, the default
//! - [`JsonCodec`]: serde_json encoding, handy when sniffing traffic
//!
//! # Example
//!
//! ```rust
//! use isolink_core::{BinaryCodec, IsoMessage, MessageCodec};
//!
//! let codec = BinaryCodec;
//! let msg = IsoMessage::new("0200").with_field(41, "TERM0001");
//!
//! let bytes = codec.encode(&msg).expect("encode");
//! let decoded = codec.decode(&bytes).expect("decode");
//! assert_eq!(msg, decoded);
//! ```

use crate::message::{FieldValue, IsoMessage};

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before a complete message was read.
    #[error("truncated payload: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes left in the payload.
        have: usize,
    },

    /// A field carried an unknown kind tag.
    #[error("unknown kind {kind} for field {field}")]
    UnknownFieldKind {
        /// Field id.
        field: u32,
        /// The unknown tag.
        kind: u8,
    },

    /// A text field or the MTI was not valid UTF-8.
    #[error("invalid utf-8 in {what}")]
    InvalidUtf8 {
        /// Which part of the message was invalid.
        what: String,
    },

    /// Bytes remained after the last field.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The MTI is too long for the encoding.
    #[error("MTI too long: {0} bytes")]
    MtiTooLong(usize),

    /// The message has too many fields for the encoding.
    #[error("too many fields: {0}")]
    TooManyFields(usize),

    /// JSON encoding or decoding failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pluggable message serialization format.
///
/// The trait requires `Clone + 'static` so codec instances can be stored in
/// framing adapters and shared between connections.
pub trait MessageCodec: Clone + 'static {
    /// Encode a message to a payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the message cannot be represented.
    fn encode(&self, msg: &IsoMessage) -> Result<Vec<u8>, CodecError>;

    /// Decode a payload to a message.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the payload is malformed.
    fn decode(&self, buf: &[u8]) -> Result<IsoMessage, CodecError>;
}

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

/// Compact binary codec.
///
/// Layout (all integers big-endian):
///
/// ```text
/// [mti_len:1][mti:mti_len][field_count:2]
///   repeated field_count times: [id:4][kind:1][len:4][value:len]
/// ```
///
/// `kind` is `0` for text (UTF-8) and `1` for binary values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl MessageCodec for BinaryCodec {
    fn encode(&self, msg: &IsoMessage) -> Result<Vec<u8>, CodecError> {
        let mti = msg.mti().as_bytes();
        let mti_len = u8::try_from(mti.len()).map_err(|_| CodecError::MtiTooLong(mti.len()))?;
        let count = u16::try_from(msg.field_count())
            .map_err(|_| CodecError::TooManyFields(msg.field_count()))?;

        let mut out = Vec::with_capacity(3 + mti.len() + msg.field_count() * 16);
        out.push(mti_len);
        out.extend_from_slice(mti);
        out.extend_from_slice(&count.to_be_bytes());

        for (id, value) in msg.fields() {
            let (kind, bytes) = match value {
                FieldValue::Text(s) => (KIND_TEXT, s.as_bytes()),
                FieldValue::Binary(b) => (KIND_BINARY, b.as_slice()),
            };
            out.extend_from_slice(&id.to_be_bytes());
            out.push(kind);
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }

        Ok(out)
    }

    fn decode(&self, buf: &[u8]) -> Result<IsoMessage, CodecError> {
        let mut cursor = Cursor { buf, pos: 0 };

        let mti_len = cursor.take(1)?[0] as usize;
        let mti = std::str::from_utf8(cursor.take(mti_len)?).map_err(|_| {
            CodecError::InvalidUtf8 {
                what: "mti".to_string(),
            }
        })?;
        let mut msg = IsoMessage::new(mti);

        let count = u16::from_be_bytes(cursor.array::<2>()?);
        for _ in 0..count {
            let id = u32::from_be_bytes(cursor.array::<4>()?);
            let kind = cursor.take(1)?[0];
            let len = u32::from_be_bytes(cursor.array::<4>()?) as usize;
            let raw = cursor.take(len)?;
            let value = match kind {
                KIND_TEXT => FieldValue::Text(
                    std::str::from_utf8(raw)
                        .map_err(|_| CodecError::InvalidUtf8 {
                            what: format!("field {id}"),
                        })?
                        .to_string(),
                ),
                KIND_BINARY => FieldValue::Binary(raw.to_vec()),
                other => {
                    return Err(CodecError::UnknownFieldKind {
                        field: id,
                        kind: other,
                    });
                }
            };
            msg.set(id, value);
        }

        let remaining = buf.len() - cursor.pos;
        if remaining > 0 {
            return Err(CodecError::TrailingBytes(remaining));
        }
        Ok(msg)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(CodecError::Truncated { needed: n, have });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// JSON codec using serde_json.
///
/// Great for debugging (human-readable payloads) but larger on the wire than
/// [`BinaryCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, msg: &IsoMessage) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn decode(&self, buf: &[u8]) -> Result<IsoMessage, CodecError> {
        Ok(serde_json::from_slice(buf)?)
    }
}
