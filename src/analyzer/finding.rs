use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Case-insensitive; `None` for anything unrecognised.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" | "moderate" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" | "informational" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

/// Model confidence: a score in [0, 1] and its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub score: f64,
}

impl Confidence {
    pub const DEFAULT_SCORE: f64 = 0.7;

    pub fn from_score(score: f64) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            Self::DEFAULT_SCORE
        };
        let level = if score >= 0.8 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        };
        Self { level, score }
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::from_score(Self::DEFAULT_SCORE)
    }
}

/// One reported weakness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub issue: String,
    pub severity: Severity,
    pub confidence: Confidence,
    pub file_path: String,
    pub line_start: Option<usize>,
    pub line_end: Option<usize>,
    pub code_snippet: String,
    pub reasoning: String,
    pub mitigation: String,
    pub cwe_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_buckets() {
        assert_eq!(Confidence::from_score(0.95).level, ConfidenceLevel::High);
        assert_eq!(Confidence::from_score(0.8).level, ConfidenceLevel::High);
        assert_eq!(Confidence::from_score(0.5).level, ConfidenceLevel::Medium);
        assert_eq!(Confidence::from_score(0.49).level, ConfidenceLevel::Low);
        assert_eq!(Confidence::from_score(7.0).score, 1.0);
        assert_eq!(Confidence::from_score(f64::NAN).score, 0.7);
    }

    #[test]
    fn test_severity_parse_and_order() {
        assert_eq!(Severity::parse(" HIGH "), Some(Severity::High));
        assert_eq!(Severity::parse("bogus"), None);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Info < Severity::Low);
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
    }
}
