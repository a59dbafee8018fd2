//! Error types for chunklog-core

use thiserror::Error;

/// Errors raised while encoding or decoding a framed log record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer bytes were available than the frame or field requires
    #[error("Truncated record: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The length prefix and suffix of a frame disagree
    #[error("Length prefix {prefix} does not match length suffix {suffix}")]
    LengthMismatch { prefix: i32, suffix: i32 },

    /// A frame length that cannot describe a record
    #[error("Invalid record length: {0}")]
    InvalidLength(i32),

    /// The record type tag is not known
    #[error("Unknown record type: {0}")]
    UnknownRecordType(u8),

    /// The system record type tag is not known
    #[error("Unknown system record type: {0}")]
    UnknownSystemRecordType(u8),

    /// The record format version is not supported
    #[error("Unsupported record version {version} for record type {record_type}")]
    UnsupportedVersion { record_type: u8, version: u8 },

    /// A string field does not contain UTF-8
    #[error("Invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),

    /// The payload carried bytes after the last field
    #[error("{0} unexpected trailing bytes in record payload")]
    TrailingBytes(usize),

    /// A field is too long to be encoded
    #[error("Field {field} is too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

impl CodecError {
    /// Create a truncation error
    pub fn truncated(needed: usize, available: usize) -> Self {
        Self::Truncated { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_mismatch_message() {
        let err = CodecError::LengthMismatch {
            prefix: 12,
            suffix: 13,
        };
        assert!(err.to_string().contains("12"));
        assert!(err.to_string().contains("13"));
    }

    #[test]
    fn test_truncated_constructor() {
        let err = CodecError::truncated(8, 3);
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 8,
                available: 3
            }
        );
    }
}
