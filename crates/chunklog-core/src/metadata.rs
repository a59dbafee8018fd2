//! Stream retention metadata
//!
//! Stored as JSON in the metadata of a stream's creation prepare and
//! consulted only by the scavenger.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retention policy of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Number of most recent events to keep
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,

    /// Maximum age of an event, in seconds
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

impl StreamMetadata {
    pub fn new(max_count: Option<i64>, max_age: Option<Duration>) -> Self {
        Self {
            max_count,
            max_age_secs: max_age.map(|age| age.as_secs()),
        }
    }

    /// Maximum age as a duration
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    /// Whether the metadata restricts retention at all
    pub fn is_unbounded(&self) -> bool {
        self.max_count.is_none() && self.max_age_secs.is_none()
    }

    /// Serialize to the JSON carried in prepare metadata
    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Two optional integers cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse metadata bytes; `None` when the bytes are not stream metadata
    pub fn from_json_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let meta = StreamMetadata::new(Some(3), None);
        let json = String::from_utf8(meta.to_json_bytes()).unwrap();
        assert_eq!(json, r#"{"$maxCount":3}"#);
    }

    #[test]
    fn test_parse_max_age() {
        let meta = StreamMetadata::from_json_bytes(br#"{"$maxAge":60}"#).unwrap();
        assert_eq!(meta.max_age(), Some(Duration::from_secs(60)));
        assert_eq!(meta.max_count, None);
    }

    #[test]
    fn test_non_metadata_bytes() {
        assert_eq!(StreamMetadata::from_json_bytes(&[5, 7]), None);
        assert_eq!(StreamMetadata::from_json_bytes(&[]), None);
        assert!(StreamMetadata::default().is_unbounded());
    }
}
