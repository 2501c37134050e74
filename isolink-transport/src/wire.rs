//! Wire format for message frames.
//!
//! Frame format: `[length:4][checksum:4][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of the payload
//! - **payload**: One codec-encoded message

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (1MB).
///
/// A header announcing more than this is never buffered.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed.
    ///
    /// The frame boundary is still known, so a stream reader can skip the
    /// `length` bytes and carry on.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
        /// Total length of the corrupted frame.
        length: usize,
    },

    /// Payload exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },
}

impl WireError {
    /// Whether a stream can continue after this error.
    ///
    /// Only a checksum mismatch leaves the frame boundary intact; every other
    /// error means the byte stream can no longer be resynchronized.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WireError::ChecksumMismatch { .. })
    }
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including header.
    pub length: u32,
    /// CRC32C checksum of the payload.
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize header into buffer (must be at least HEADER_SIZE bytes).
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Deserialize and validate a header.
    ///
    /// # Errors
    ///
    /// - `InsufficientData` if the buffer is shorter than HEADER_SIZE
    /// - `InvalidLength` if the length cannot even hold the header
    /// - `FrameTooLarge` if the announced payload exceeds MAX_PAYLOAD_SIZE
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let checksum = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if (length as usize) < HEADER_SIZE {
            return Err(WireError::InvalidLength { length });
        }
        let payload_len = length as usize - HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge { size: payload_len });
        }

        Ok(Self { length, checksum })
    }
}

/// Serialize a payload into a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if payload exceeds MAX_PAYLOAD_SIZE.
///
/// # Examples
///
/// ```
/// use isolink_transport::{serialize_frame, try_deserialize_frame};
///
/// let frame = serialize_frame(b"hello").expect("serialize");
/// let (payload, consumed) = try_deserialize_frame(&frame)
///     .expect("valid frame")
///     .expect("complete frame");
///
/// assert_eq!(payload, b"hello");
/// assert_eq!(consumed, frame.len());
/// ```
pub fn serialize_frame(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
        });
    }

    let total_length = HEADER_SIZE + payload.len();
    let mut data = vec![0u8; total_length];

    let header = FrameHeader {
        length: total_length as u32,
        checksum: crc32c::crc32c(payload),
    };

    header.serialize_into(&mut data[..HEADER_SIZE]);
    data[HEADER_SIZE..].copy_from_slice(payload);

    Ok(data)
}

/// Try to deserialize one frame from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((payload, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the data is malformed; see [`WireError::is_recoverable`]
///
/// ```
/// use isolink_transport::{serialize_frame, try_deserialize_frame};
///
/// let frame = serialize_frame(b"test").expect("serialize");
/// assert!(try_deserialize_frame(&frame[..6]).expect("partial").is_none());
/// assert!(try_deserialize_frame(&frame).expect("complete").is_some());
/// ```
pub fn try_deserialize_frame(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = FrameHeader::deserialize(data)?;

    let expected_len = header.length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let payload = &data[HEADER_SIZE..expected_len];

    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
            length: expected_len,
        });
    }

    Ok(Some((payload.to_vec(), expected_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_structure() {
        let frame = serialize_frame(b"test").expect("serialize");
        assert_eq!(frame.len(), HEADER_SIZE + 4);

        let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(length as usize, frame.len());

        let checksum = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        assert_eq!(checksum, crc32c::crc32c(b"test"));
        assert_eq!(&frame[HEADER_SIZE..], b"test");
    }

    #[test]
    fn test_checksum_mismatch_reports_frame_length() {
        let mut frame = serialize_frame(b"test").expect("serialize");
        frame[HEADER_SIZE] ^= 0xFF;

        let err = try_deserialize_frame(&frame).expect_err("corrupted");
        assert!(matches!(
            err,
            WireError::ChecksumMismatch { length, .. } if length == frame.len()
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_partial_header_and_payload() {
        let frame = serialize_frame(b"test data").expect("serialize");
        assert!(matches!(try_deserialize_frame(&frame[..3]), Ok(None)));
        assert!(matches!(
            try_deserialize_frame(&frame[..HEADER_SIZE + 2]),
            Ok(None)
        ));
    }

    #[test]
    fn test_extra_data_is_not_consumed() {
        let frame = serialize_frame(b"test").expect("serialize");
        let mut extended = frame.clone();
        extended.extend_from_slice(b"next frame bytes");

        let (payload, consumed) = try_deserialize_frame(&extended)
            .expect("deserialize")
            .expect("complete");
        assert_eq!(payload, b"test");
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_empty_payload() {
        let frame = serialize_frame(&[]).expect("serialize");
        assert_eq!(frame.len(), HEADER_SIZE);
        let (payload, _) = try_deserialize_frame(&frame)
            .expect("deserialize")
            .expect("complete");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_frame_too_large() {
        let large = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            serialize_frame(&large),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversize_header_is_rejected_before_payload_arrives() {
        let mut header = [0u8; HEADER_SIZE];
        FrameHeader {
            length: (HEADER_SIZE + MAX_PAYLOAD_SIZE + 1) as u32,
            checksum: 0,
        }
        .serialize_into(&mut header);

        let err = try_deserialize_frame(&header).expect_err("oversize");
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_invalid_length_too_small() {
        let mut bad = vec![0u8; HEADER_SIZE];
        bad[0..4].copy_from_slice(&3u32.to_le_bytes());

        assert_eq!(
            try_deserialize_frame(&bad),
            Err(WireError::InvalidLength { length: 3 })
        );
    }
}
