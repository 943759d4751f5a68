//! Hardware Controllers
//!
//! Concrete controller drivers. Only simulated hardware ships with the
//! crate; real drivers implement [`crate::controller::ControllerAdapter`]
//! or [`crate::controller::PseudoController`] in their own crates.

pub mod mock;

pub use mock::{MockCounterController, MockMotorController, SlitController};
