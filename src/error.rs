//! Error taxonomy for rule loading and per-rule evaluation cycles.
//!
//! Every error below is contained at the single-rule-cycle boundary: the
//! scheduler records it against the rule's runtime status and moves on.

use std::path::PathBuf;

use thiserror::Error;

/// A rule definition that cannot be scheduled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleValidationError {
    #[error("{path}: failed to read rule file: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("{path}: failed to parse rule: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("rule '{rule}': missing required field '{field}'")]
    MissingField { rule: String, field: &'static str },

    #[error("rule '{rule}': invalid value for '{field}': {reason}")]
    InvalidField {
        rule: String,
        field: &'static str,
        reason: String,
    },

    #[error("rule '{rule}': unknown destination '{destination}'")]
    UnknownDestination { rule: String, destination: String },

    #[error("rule '{rule}' is defined more than once ({path})")]
    DuplicateName { rule: String, path: PathBuf },
}

impl RuleValidationError {
    /// Name of the rule this error refers to, when it could be determined.
    pub fn rule_name(&self) -> Option<&str> {
        match self {
            Self::Read { .. } | Self::Parse { .. } => None,
            Self::MissingField { rule, .. }
            | Self::InvalidField { rule, .. }
            | Self::UnknownDestination { rule, .. }
            | Self::DuplicateName { rule, .. } => Some(rule),
        }
    }
}

/// Failure talking to the search backend. Always retryable for the cycle.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("search backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("search transport error: {0}")]
    Transport(String),

    #[error("failed to decode search response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for QueryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            QueryError::Decode(e.to_string())
        } else {
            QueryError::Transport(e.to_string())
        }
    }
}

/// An evaluator could not process the records it was handed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("record '{record}' is missing field '{field}'")]
    MissingField { record: String, field: String },

    #[error("record '{record}' has a non-scalar value in field '{field}'")]
    UnsupportedValue { record: String, field: String },

    #[error("rule kind changed while evaluation state was held")]
    StateMismatch,
}

/// The shared dedup cache could not be consulted or written.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
}

impl From<r2d2::Error> for DedupError {
    fn from(e: r2d2::Error) -> Self {
        DedupError::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for DedupError {
    fn from(e: rusqlite::Error) -> Self {
        DedupError::Unavailable(e.to_string())
    }
}

/// A single destination delivery failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("destination '{destination}' returned status {status}")]
    Status { destination: String, status: u16 },

    #[error("destination '{destination}' failed: {reason}")]
    Transport { destination: String, reason: String },

    #[error("unknown destination '{0}'")]
    UnknownDestination(String),

    #[error("failed to render alert: {0}")]
    Render(String),
}

/// Why a rule's evaluation cycle did not complete normally.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("query failed after {attempts} attempts: {source}")]
    Query {
        attempts: u32,
        #[source]
        source: QueryError,
    },

    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
}
