//! Error taxonomy.
//!
//! Only two conditions abort a cycle: a policy that cannot be loaded at all (first load,
//! nothing to fall back to) and a candidate list with non-finite scores. Everything else
//! (advisory failures, budget exhaustion, skipped interventions, rejected autopilot
//! proposals) is converted into an annotation or a logged no-op.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Dotted path of the offending field (e.g. `selection.temperature`).
    pub field: String,
    /// Human-readable description of the rule that failed.
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors from loading, validating or publishing a policy.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("policy rejected with {} violation(s): {}", .0.len(), join_violations(.0))]
    Invalid(Vec<Violation>),

    #[error("policy revision conflict: proposal based on revision {expected}, active revision is {active}")]
    VersionConflict { expected: u64, active: u64 },

    #[error("unknown policy revision {0}")]
    UnknownRevision(u64),

    #[error("failed to serialize policy: {0}")]
    Serialize(String),
}

impl ConfigError {
    /// Operator exit code: `1` for validation/schema problems, `2` for runtime failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::Parse(_) | ConfigError::Invalid(_) => 1,
            _ => 2,
        }
    }

    /// All violations carried by this error (empty for non-validation errors).
    pub fn violations(&self) -> &[Violation] {
        match self {
            ConfigError::Invalid(v) => v,
            _ => &[],
        }
    }
}

fn join_violations(v: &[Violation]) -> String {
    v.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fatal input problems for a selection cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectionError {
    #[error("candidate {id} has non-finite score {score}")]
    NonFiniteScore { id: String, score: f64 },

    #[error("candidate {id} has score {score} outside [-{limit}, {limit}]")]
    ScoreOutOfRange { id: String, score: f64, limit: f64 },

    #[error("candidate {id} has non-finite perturbed score (bias or temperature out of range)")]
    PerturbedOverflow { id: String },

    #[error("candidate id {0} appears more than once")]
    DuplicateCandidate(String),
}

/// Failures of the audit sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::SlotPipeline`].
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("a cycle for window {window_id} slot {slot_start} is already in flight")]
    SlotInFlight { window_id: String, slot_start: i64 },

    #[error(transparent)]
    Audit(#[from] AuditError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_error_lists_every_violation() {
        let err = ConfigError::Invalid(vec![
            Violation::new("selection.temperature", "must be in [0.1, 2.0], got 3"),
            Violation::new("selection.top_k", "must be in [5, 50], got 2"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 violation(s)"), "{msg}");
        assert!(msg.contains("selection.temperature"), "{msg}");
        assert!(msg.contains("selection.top_k"), "{msg}");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn runtime_errors_map_to_exit_code_two() {
        let err = ConfigError::VersionConflict {
            expected: 1,
            active: 2,
        };
        assert_eq!(err.exit_code(), 2);
        assert!(err.violations().is_empty());
    }
}
