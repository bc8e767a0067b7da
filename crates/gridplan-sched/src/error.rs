//! Error handling for submission planning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// The resource dimension a job request could not be satisfied on.
///
/// Variants are ordered by the stage at which the matcher checks them, so the
/// largest value seen across all queues is the constraint closest to being met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmetDimension {
    /// No queue offers the requested coprocessor type, class or quantity.
    Coprocessor,
    /// The memory request exceeds every queue's ceiling.
    Memory,
    /// The slot request exceeds every queue's per-node slot count.
    Slots,
    /// The wall-clock request exceeds every queue's time limit.
    Time,
}

impl UnmetDimension {
    /// Get the dimension name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            UnmetDimension::Coprocessor => "coprocessor",
            UnmetDimension::Memory => "memory",
            UnmetDimension::Slots => "slots",
            UnmetDimension::Time => "time",
        }
    }
}

impl std::fmt::Display for UnmetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that can occur while building a capability model or planning a job.
#[derive(Error, Debug)]
pub enum PlanError {
    /// A time or memory value could not be converted.
    #[error("Cannot convert {field} value '{value}': {reason}")]
    UnitConversion {
        field: String,
        value: String,
        reason: String,
    },

    /// No queue satisfies the request.
    #[error("No matching queue: {dimension} requirement cannot be met ({detail})")]
    NoMatchingQueue {
        dimension: UnmetDimension,
        detail: String,
    },

    /// Coprocessor type is not configured.
    #[error("Unknown coprocessor: {0}")]
    UnknownCoprocessor(String),

    /// Coprocessor class is not defined for its type.
    #[error("Unknown class '{class}' for coprocessor {coprocessor}")]
    UnknownClass { coprocessor: String, class: String },

    /// The chosen queue does not carry the requested (or any qualifying) class.
    #[error("Queue {queue} does not offer {coprocessor} class {class}")]
    ClassUnavailableOnQueue {
        queue: String,
        coprocessor: String,
        class: String,
    },

    /// The constituents of a compound queue cannot be reconciled.
    #[error("Compound queue {queue} is inconsistent: {reason}")]
    CompoundQueueInconsistency { queue: String, reason: String },

    /// Mail mode is not one of the configured modes.
    #[error("Unrecognised mail mode: {0}")]
    UnknownMailMode(String),

    /// The job request is malformed.
    #[error("Invalid request: {field} - {reason}")]
    InvalidRequest { field: String, reason: String },

    /// The cluster configuration is malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlanError {
    /// Build a unit conversion error.
    pub fn unit(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PlanError::UnitConversion {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Build an invalid request error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanError::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanError::UnitConversion { .. } => "unit_conversion",
            PlanError::NoMatchingQueue { .. } => "no_matching_queue",
            PlanError::UnknownCoprocessor(_) => "unknown_coprocessor",
            PlanError::UnknownClass { .. } => "unknown_class",
            PlanError::ClassUnavailableOnQueue { .. } => "class_unavailable_on_queue",
            PlanError::CompoundQueueInconsistency { .. } => "compound_queue_inconsistency",
            PlanError::UnknownMailMode(_) => "unknown_mail_mode",
            PlanError::InvalidRequest { .. } => "invalid_request",
            PlanError::Config(_) => "config",
            PlanError::Yaml(_) => "yaml",
            PlanError::Json(_) => "json",
        }
    }

    /// The offending field, where the error names one.
    pub fn field(&self) -> Option<&str> {
        match self {
            PlanError::UnitConversion { field, .. } | PlanError::InvalidRequest { field, .. } => {
                Some(field)
            }
            PlanError::NoMatchingQueue { dimension, .. } => Some(dimension.name()),
            PlanError::UnknownClass { .. } | PlanError::ClassUnavailableOnQueue { .. } => {
                Some("coprocessor_class")
            }
            PlanError::UnknownCoprocessor(_) => Some("coprocessor"),
            PlanError::UnknownMailMode(_) => Some("mail_mode"),
            _ => None,
        }
    }

    /// The unmet dimension of a `NoMatchingQueue` error.
    pub fn unmet_dimension(&self) -> Option<UnmetDimension> {
        match self {
            PlanError::NoMatchingQueue { dimension, .. } => Some(*dimension),
            _ => None,
        }
    }
}

/// Non-fatal degradations surfaced alongside a successful plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    /// Per-index array holds are not available; the hold was widened to the
    /// whole parent array.
    ArrayHoldUnsupported { parents: Vec<String> },

    /// Array concurrency limits are not available; the limit was dropped.
    ArrayLimitUnsupported { limit: u32 },
}

impl std::fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanWarning::ArrayHoldUnsupported { parents } => write!(
                f,
                "Scheduler does not support per-task array holds, holding on whole job(s) {}",
                parents.join(",")
            ),
            PlanWarning::ArrayLimitUnsupported { limit } => write!(
                f,
                "Scheduler does not support array task limits, ignoring limit of {limit}"
            ),
        }
    }
}
