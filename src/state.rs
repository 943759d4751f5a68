//! Element states and the group state reduction.
//!
//! Raw per-element states reduce to one group state with the fixed precedence
//! `Fault > Unknown > Alarm > Moving > Idle`. The diagnostic lists every
//! offending element, one line each, most severe tier first.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::element::Family;

/// Externally visible state of an element or a group.
///
/// The variant order is the severity order used by [`aggregate`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ElementState {
    /// At rest and ready
    #[default]
    Idle,
    /// Moving or acquiring
    Moving,
    /// Usable but outside its nominal envelope (e.g. a limit switch)
    Alarm,
    /// State could not be determined
    Unknown,
    /// Unusable
    Fault,
}

impl ElementState {
    /// Upper-case name as shown in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementState::Idle => "IDLE",
            ElementState::Moving => "MOVING",
            ElementState::Alarm => "ALARM",
            ElementState::Unknown => "UNKNOWN",
            ElementState::Fault => "FAULT",
        }
    }

    /// True while motion or acquisition is in progress.
    pub fn is_moving(&self) -> bool {
        matches!(self, ElementState::Moving)
    }

    /// Alarm, Unknown and Fault are error-level for a running session.
    pub fn is_error(&self) -> bool {
        *self >= ElementState::Alarm
    }

    fn describe(&self) -> &'static str {
        match self {
            ElementState::Fault => "is in FAULT",
            ElementState::Unknown => "is in UNKNOWN state",
            ElementState::Alarm => "is in ALARM",
            ElementState::Moving => "is MOVING",
            ElementState::Idle => "is IDLE",
        }
    }
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element's contribution to a group state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    /// Family named in the diagnostic line.
    pub family: Family,
    /// Name shown in the diagnostic line.
    pub alias: String,
    /// Raw state.
    pub state: ElementState,
}

/// Reduced group state with its diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    /// Most severe element state.
    pub state: ElementState,
    /// One line per offending element, or [`IDLE_DIAGNOSTIC`].
    pub diagnostic: String,
}

/// Diagnostic of a group with nothing to report.
pub const IDLE_DIAGNOSTIC: &str = "All elements are idle";

/// Reduce raw element states to one group state.
///
/// `uninstantiated` names controllers of the group that are not usable; any
/// entry forces `Fault` whatever the element states say.
pub fn aggregate(entries: &[StateEntry], uninstantiated: &[String]) -> GroupStatus {
    let mut lines: Vec<String> = uninstantiated
        .iter()
        .map(|name| {
            format!(
                "The controller object ({name}) used by some element(s) in this group is not initialized"
            )
        })
        .collect();

    let worst = entries
        .iter()
        .map(|e| e.state)
        .max()
        .unwrap_or(ElementState::Idle);

    for tier in [
        ElementState::Fault,
        ElementState::Unknown,
        ElementState::Alarm,
        ElementState::Moving,
    ] {
        lines.extend(
            entries
                .iter()
                .filter(|e| e.state == tier)
                .map(|e| format!("{} {} {}", e.family, e.alias, tier.describe())),
        );
    }

    let state = if uninstantiated.is_empty() {
        worst
    } else {
        ElementState::Fault
    };

    let diagnostic = if lines.is_empty() {
        IDLE_DIAGNOSTIC.to_string()
    } else {
        lines.join("\n")
    };

    GroupStatus { state, diagnostic }
}
