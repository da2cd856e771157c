//! Detection result rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A half-open time range in seconds within one episode file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// How the detector sourced its input fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Enough episodes in the target season
    CurrentSeason,
    /// Sparse season padded with up to three previous seasons
    CrossSeason,
    /// No usable fingerprints
    None,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::CurrentSeason => "current_season",
            DetectionMethod::CrossSeason => "cross_season",
            DetectionMethod::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current_season" => Some(DetectionMethod::CurrentSeason),
            "cross_season" => Some(DetectionMethod::CrossSeason),
            "none" => Some(DetectionMethod::None),
            _ => None,
        }
    }
}

/// Approval state of a detection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    AutoApproved,
    ManualApproved,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::AutoApproved => "auto_approved",
            ApprovalStatus::ManualApproved => "manual_approved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "auto_approved" => Some(ApprovalStatus::AutoApproved),
            "manual_approved" => Some(ApprovalStatus::ManualApproved),
            _ => None,
        }
    }

    pub fn is_approved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// A raw cluster of co-occurring fingerprints, kept alongside the labeled
/// intervals for diagnostics and re-labeling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCluster {
    pub start: f64,
    pub end: f64,
    pub median_time: f64,
    /// Distinct episodes contributing to the cluster
    pub episode_count: usize,
}

/// One detection outcome for one episode of a season.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub show_id: i64,
    pub season_number: i64,
    pub episode_number: i64,
    pub episode_file_id: i64,
    pub intro: Option<Interval>,
    pub credits: Option<Interval>,
    /// Mid-episode common segments, ordered by start
    pub stingers: Vec<Interval>,
    /// Raw clusters that survived filtering
    pub segments: Vec<SegmentCluster>,
    pub confidence_score: f64,
    pub detection_method: DetectionMethod,
    pub approval_status: ApprovalStatus,
    pub processing_notes: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

impl DetectionResult {
    /// True when the result carries at least one labeled range.
    pub fn has_detection(&self) -> bool {
        self.intro.is_some() || self.credits.is_some() || !self.stingers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_strings_round_trip() {
        for m in [
            DetectionMethod::CurrentSeason,
            DetectionMethod::CrossSeason,
            DetectionMethod::None,
        ] {
            assert_eq!(DetectionMethod::parse(m.as_str()), Some(m));
        }
        assert_eq!(DetectionMethod::parse("bogus"), None);
    }

    #[test]
    fn approval_strings_round_trip() {
        for a in [
            ApprovalStatus::Pending,
            ApprovalStatus::AutoApproved,
            ApprovalStatus::ManualApproved,
        ] {
            assert_eq!(ApprovalStatus::parse(a.as_str()), Some(a));
        }
        assert!(ApprovalStatus::AutoApproved.is_approved());
        assert!(!ApprovalStatus::Pending.is_approved());
    }

    #[test]
    fn interval_duration_is_non_negative() {
        assert_eq!(Interval::new(10.0, 40.0).duration(), 30.0);
        assert_eq!(Interval::new(40.0, 10.0).duration(), 0.0);
    }
}
