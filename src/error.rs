//! Custom error types for the engine.
//!
//! This module defines the primary error type, `PoolError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent way to report what can
//! go wrong while composing groups, transforming vectors and driving controllers.
//!
//! ## Error Hierarchy
//!
//! - **`ElementNotFound`**: a name that resolves to no element or group.
//! - **`DuplicateMembership`**: the element is already reachable from the group,
//!   or adding it would make a group contain itself.
//! - **`InvalidGroupState`**: stale or uninstantiated controllers, busy elements,
//!   registry operations that would leave dangling references.
//! - **`ArityMismatch`**: a user vector whose length differs from the group's.
//! - **`BadTransformResult`**: a pseudo controller returned non-finite values or
//!   the wrong number of values.
//! - **`ControllerNotReady`**: a readiness call (`pre_op_one`, `start_one`)
//!   answered `false`.
//! - **`ControllerCallFailed`**: the driver raised an error during a protocol
//!   phase. The driver error is kept with its whole context chain.
//! - **`ReadFailed`**: a position read failed. Non-fatal inside the monitoring
//!   loop, where it becomes the element's notification payload.
//! - **`AbortFailed`**: every element was asked to abort but some refused.
//!
//! Driver traits return `anyhow::Result`; the conversion into `PoolError`
//! happens at the controller boundary where phase and element are known.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the engine error type.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// The controller call in progress when an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Batch preparation, once per controller.
    PreOpAll,
    /// Per-element preparation and readiness check.
    PreOpOne,
    /// Batch commit, once per controller.
    OpAll,
    /// Per-element arming for acquisitions.
    OpOne,
    /// Per-element start with its target.
    StartOne,
    /// Position read.
    ReadOne,
    /// Raw state read.
    StateOne,
    /// Per-element abort.
    AbortOne,
    /// Physical to pseudo transform.
    CalcForward,
    /// Pseudo to physical transform.
    CalcInverse,
}

impl Phase {
    /// Name of the controller method for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreOpAll => "pre_op_all",
            Phase::PreOpOne => "pre_op_one",
            Phase::OpAll => "op_all",
            Phase::OpOne => "op_one",
            Phase::StartOne => "start_one",
            Phase::ReadOne => "read_one",
            Phase::StateOne => "state_one",
            Phase::AbortOne => "abort_one",
            Phase::CalcForward => "calc_all_forward",
            Phase::CalcInverse => "calc_all_inverse",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the engine.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Unknown element, controller or group name or id.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// A membership change would put an element in a group twice.
    #[error("Element '{element}' is already part of group '{group}'")]
    DuplicateMembership {
        /// Element (or group) being added.
        element: String,
        /// Group that already reaches it.
        group: String,
    },

    /// The operation is not possible in the current state.
    #[error("Invalid group state: {0}")]
    InvalidGroupState(String),

    /// Wrong number of values.
    #[error("Arity mismatch: expected {expected} values, got {actual}")]
    ArityMismatch {
        /// Values the closure needs.
        expected: usize,
        /// Values given.
        actual: usize,
    },

    /// A pseudo transform returned the wrong length or a non-finite value.
    #[error("Controller '{controller}' returned an invalid transform result: {detail}")]
    BadTransformResult {
        /// Pseudo controller name.
        controller: String,
        /// What was wrong.
        detail: String,
    },

    /// A readiness call answered `false`.
    #[error("Controller not ready: {phase}() returned false for element '{element}'")]
    ControllerNotReady {
        /// Call that refused.
        phase: Phase,
        /// Element it was made for.
        element: String,
    },

    /// A driver call raised an error.
    #[error(
        "Impossible to operate {}: the {phase}() method of controller '{controller}' failed: {reason}",
        target_label(.element)
    )]
    ControllerCallFailed {
        /// Call in progress.
        phase: Phase,
        /// Element it was made for; `None` for batch calls.
        element: Option<String>,
        /// Controller name.
        controller: String,
        /// Driver error with its context chain.
        reason: String,
    },

    /// A position read failed.
    #[error("Failed to read element '{element}': {reason}")]
    ReadFailed {
        /// Element read.
        element: String,
        /// Driver error with its context chain.
        reason: String,
    },

    /// Some elements refused to abort; every element was attempted.
    #[error("Abort failed for {} element(s): {}", .0.len(), join_errors(.0))]
    AbortFailed(Vec<PoolError>),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Wrap a driver error raised during `phase`.
    pub fn call_failed(
        phase: Phase,
        controller: &str,
        element: Option<&str>,
        err: anyhow::Error,
    ) -> Self {
        PoolError::ControllerCallFailed {
            phase,
            element: element.map(str::to_owned),
            controller: controller.to_owned(),
            reason: format!("{err:#}"),
        }
    }
}

fn target_label(element: &Option<String>) -> String {
    match element {
        Some(name) => format!("element '{name}'"),
        None => "group".to_owned(),
    }
}

fn join_errors(errors: &[PoolError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
