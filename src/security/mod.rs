//! Heuristic security scoring of proxied exchanges
//!
//! The scorer is a best-effort classifier: it inspects one request/response
//! pair and reports typed findings plus a deduction-based score. It has no
//! side effects, so identical inputs always produce identical reports.

pub mod scorer;

use serde::{Deserialize, Serialize};

pub use scorer::{analyze, score_for, SecurityReport, BASE_SCORE};

/// Category of a security finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    SensitiveDataExposure,
    MissingAuthentication,
    ServerInfoLeak,
    MissingBestPractice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Points subtracted from the score for one finding of this severity
    pub const fn deduction(self) -> i32 {
        match self {
            Severity::Critical => 50,
            Severity::High => 25,
            Severity::Medium => 10,
            Severity::Low => 5,
        }
    }
}

/// One heuristic match, embedded in the persisted exchange record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
    #[serde(rename = "type")]
    pub kind: FindingKind,
    pub severity: Severity,
    pub description: String,
    pub recommendation: String,
}

impl SecurityFinding {
    pub fn new(
        kind: FindingKind,
        severity: Severity,
        description: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            recommendation: recommendation.into(),
        }
    }
}
