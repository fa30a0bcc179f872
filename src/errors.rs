//! Utilities dealing with error handling in this crate.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Errors originating from calls to `std::io::*`.
    #[error("IO Error - {0}")]
    IO(#[from] std::io::Error),
    /// Errors originating from calls to `std::env::*`.
    #[error("Env Error - {0}")]
    Env(#[from] std::env::VarError),
    /// Errors originating from calls to `regex::*`.
    #[error("Regex Error - {0}")]
    Regex(#[from] regex::Error),
    /// Errors parsing Glob patterns.
    #[error("Glob Error - {0}")]
    GlobPattern(#[from] glob::PatternError),
    /// Errors caused by malformed JSON catalogs or metric libraries.
    #[error("JSON Error - {0}")]
    Json(#[from] serde_json::Error),
    /// Errors caused by parsing integers from strings.
    #[error("Parse Error - {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    /// Errors caused by parsing floats from strings.
    #[error("Parse Error - {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    /// Errors caused by malformed metric expression strings.
    #[error("Parse Error - {0}")]
    ParseMetricExpr(#[from] pest::error::Error<crate::pmu::Rule>),
    /// A definition file could not be read.
    #[error("Could not read {path:?} - {source}")]
    ReadFile {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying IO failure.
        source: std::io::Error,
    },
    /// No resource file exists for the running platform.
    #[error("No resource file matching {0:?}")]
    ResourceNotFound(PathBuf),
    /// A requested metric name is not part of the metric library.
    #[error("Metric not found - {0}")]
    MetricNotFound(String),
    /// A line of a legacy event definition file is malformed.
    #[error("Unrecognized event definition - {0}")]
    ParseEventDefinition(String),
    /// An `if` without a matching `else` in a metric expression.
    #[error("Malformed conditional - {0}")]
    Conditional(String),
    /// Metric expression calls a function the evaluator does not provide.
    #[error("Unknown function - {0}")]
    UnknownFunction(String),
    /// Metric expression references a variable without a value.
    #[error("Unknown variable - {0}")]
    UnknownVariable(String),
    /// Operator applied to values of the wrong type during evaluation.
    #[error("Type mismatch - {0}")]
    TypeMismatch(String),
    /// Event carries no legal counter list.
    #[error("Event {0} has no valid counters defined")]
    NoCounters(String),
    /// Every legal counter for the event is already taken.
    #[error("No counter available for {event}: {counters}")]
    CounterUnavailable {
        /// Event that could not be placed.
        event: String,
        /// Legal counters of the event.
        counters: String,
    },
    /// Group already holds an event that must be measured alone.
    #[error("Group already has an event tagged with TakenAlone, cannot add {0}")]
    TakenAlone(String),
    /// Group already holds two off-core response events.
    #[error("Group already has two OCR events, cannot add {0}")]
    OffcoreLimit(String),
    /// Event needs hardware support the platform lacks.
    #[error("Event not supported on target - {0}")]
    UnsupportedEvent(String),
    /// Two reference-cycle events without a fixed reference-cycle counter.
    #[error("Cannot add {event} to group containing {existing} without fixed reference cycles")]
    RefCyclesConflict {
        /// Event being added.
        event: String,
        /// Reference-cycle event already in the group.
        existing: String,
    },
    /// Uncore event unit differs from the rest of the group.
    #[error("Incompatible unit for {event}, {expected} != {found}")]
    UnitMismatch {
        /// Event being added.
        event: String,
        /// Unit shared by the group.
        expected: String,
        /// Unit of the event.
        found: String,
    },
    /// Group holds no events.
    #[error("Group has no events")]
    EmptyGroup,
    /// No device instances are known for an uncore unit.
    #[error("No uncore devices found for unit {0}")]
    NoDevices(String),
    /// Metric variables could not be matched to any event group.
    #[error("Metric variables ({variables}) not found for metric {metric}")]
    UnresolvedVariables {
        /// Metric being evaluated.
        metric: String,
        /// Comma separated variable names.
        variables: String,
    },
    /// Event groups in the frame no longer match the resolved assignment.
    #[error("Event groups have changed")]
    GroupsChanged,
}

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;
