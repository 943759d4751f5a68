//! Direction-dependent backlash compensation.
//!
//! A physical element with a non-zero backlash `b` that moves in the
//! direction of `b`'s sign is first sent to `target - b`, then a follow-up
//! move brings it to `target` once it stopped. Moving against `b`'s sign
//! needs no compensation.

/// Commands for one element of a move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacklashPlan {
    /// Target of the first move.
    pub command: f64,
    /// Target of the follow-up move, if compensation applies.
    pub follow_up: Option<f64>,
}

impl BacklashPlan {
    /// A plain move without follow-up.
    pub fn direct(target: f64) -> Self {
        Self {
            command: target,
            follow_up: None,
        }
    }
}

/// Plan a move from `reference` (last commanded target or last position).
pub fn plan(target: f64, reference: Option<f64>, backlash: f64) -> BacklashPlan {
    match reference {
        Some(reference) if backlash != 0.0 && (target - reference) * backlash > 0.0 => {
            BacklashPlan {
                command: target - backlash,
                follow_up: Some(target),
            }
        }
        _ => BacklashPlan::direct(target),
    }
}
