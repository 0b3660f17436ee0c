//! Forward-only progress markers
//!
//! A watermark records how far ingestion has progressed for a
//! `(domain, source, partition_key)` triple. `advance` is monotonic: a value
//! at or below the current high water is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress marker for one partition of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub domain: String,
    pub source: String,
    pub partition_key: String,

    /// Monotonic cursor; typically an ISO-8601 timestamp or a
    /// lexicographically ordered cursor string.
    pub high_water: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_water: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(
        domain: impl Into<String>,
        source: impl Into<String>,
        partition_key: impl Into<String>,
        high_water: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            source: source.into(),
            partition_key: partition_key.into(),
            high_water: high_water.into(),
            low_water: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply a forward-only advance in place. Returns whether the high water
    /// actually moved.
    pub fn advance_to(&mut self, high_water: &str) -> bool {
        if high_water <= self.high_water.as_str() {
            return false;
        }
        self.high_water = high_water.to_string();
        self.updated_at = Utc::now();
        true
    }
}

/// A partition expected to have a watermark but missing or stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkGap {
    pub partition_key: String,

    /// Start of the missing range; `None` when the partition has no
    /// watermark at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_start: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_end: Option<String>,
}

impl WatermarkGap {
    /// Gap for a partition with no watermark.
    pub fn missing(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            gap_start: None,
            gap_end: None,
        }
    }
}

/// Compute gaps: expected partitions with no watermark under
/// `(domain, source)`.
pub fn find_gaps<'a>(
    existing: impl IntoIterator<Item = &'a Watermark>,
    expected_partitions: &[String],
) -> Vec<WatermarkGap> {
    let have: std::collections::HashSet<&str> = existing
        .into_iter()
        .map(|w| w.partition_key.as_str())
        .collect();

    expected_partitions
        .iter()
        .filter(|p| !have.contains(p.as_str()))
        .map(WatermarkGap::missing)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_advance() {
        let mut wm = Watermark::new("sec_filings", "edgar", "10-K", "2025-06-15T00:00:00Z");

        assert!(wm.advance_to("2025-09-30T00:00:00Z"));
        assert_eq!(wm.high_water, "2025-09-30T00:00:00Z");

        // Backward and equal advances are ignored.
        assert!(!wm.advance_to("2025-01-01T00:00:00Z"));
        assert!(!wm.advance_to("2025-09-30T00:00:00Z"));
        assert_eq!(wm.high_water, "2025-09-30T00:00:00Z");
    }

    #[test]
    fn test_gap_detection() {
        let marks = vec![
            Watermark::new("sec_filings", "edgar", "10-K", "2025-09-30"),
            Watermark::new("sec_filings", "edgar", "10-Q", "2025-08-01"),
            Watermark::new("sec_filings", "edgar", "8-K", "2025-09-15"),
        ];
        let expected: Vec<String> = ["10-K", "10-Q", "8-K", "20-F"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let gaps = find_gaps(&marks, &expected);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].partition_key, "20-F");
        assert!(gaps[0].gap_start.is_none());
    }

    #[test]
    fn test_no_gaps_when_all_present() {
        let marks = vec![Watermark::new("prices", "vendor_a", "daily", "2025-09-30")];
        let gaps = find_gaps(&marks, &["daily".to_string()]);
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let wm = Watermark::new("prices", "vendor_a", "daily", "2025-09-30T00:00:00Z");
        let json = serde_json::to_string(&wm).unwrap();
        let parsed: Watermark = serde_json::from_str(&json).unwrap();
        assert_eq!(wm, parsed);
    }
}
