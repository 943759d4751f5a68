//! Group execution engine for a motion and acquisition control pool.
//!
//! The pool coordinates many physical elements (motors, counter/timer
//! channels) driven by controllers, plus pseudo elements whose positions are
//! computed from physical ones. Elements are grouped, groups nest, and a
//! single operation on a group moves or acquires with all of its elements:
//!
//! - [`registry`] owns controllers, elements and groups, and keeps every
//!   group's flattened [`group::Closure`] up to date;
//! - [`kinematics`] maps user vectors to physical targets and back through
//!   pseudo controllers;
//! - [`session`] validates, locks and starts an operation, and the monitor
//!   follows it to completion;
//! - [`engine::PoolEngine`] is the facade tying them together, with
//!   notifications delivered through [`events::EventBus`].

pub mod backlash;
pub mod config;
pub mod controller;
pub mod element;
pub mod engine;
pub mod error;
pub mod events;
pub mod group;
pub mod hardware;
pub mod kinematics;
pub mod logging;
mod monitor;
pub mod registry;
pub mod session;
pub mod state;

pub use engine::{AcquisitionSpec, PoolEngine};
pub use error::{PoolError, PoolResult};
pub use events::PoolEvent;
pub use session::{SessionHandle, SessionOutcome};
pub use state::{ElementState, GroupStatus};
