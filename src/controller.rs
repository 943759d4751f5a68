//! Controller adapters.
//!
//! Hardware drivers implement [`ControllerAdapter`]; transform plugins
//! implement [`PseudoController`]. Both return `anyhow::Result` so driver
//! authors can attach whatever context they like. [`Controller`] wraps one
//! driver instance, owns its lock and converts driver errors into
//! [`PoolError`]s carrying the protocol phase and element involved.
//!
//! # Protocol
//!
//! For a batched operation the engine calls, across every controller of the
//! operation and strictly in this order:
//!
//! 1. `pre_op_all()` once per controller
//! 2. `pre_op_one(axis)` once per element (`false` means "not ready")
//! 3. `op_all()` once per controller
//! 4. `start_one(axis, target)` per element (`op_one(axis)` then the master's
//!    `start_one` for acquisitions)
//!
//! and then polls `state_one`/`read_one` until every element stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::element::{ControllerId, Lockable};
use crate::error::{Phase, PoolError, PoolResult};
use crate::state::ElementState;

/// Driver of a set of physical axes or channels.
#[async_trait]
pub trait ControllerAdapter: Send + Sync {
    /// Prepare a batched operation.
    async fn pre_op_all(&self) -> Result<()> {
        Ok(())
    }

    /// Prepare one axis; `Ok(false)` refuses the operation.
    async fn pre_op_one(&self, _axis: usize) -> Result<bool> {
        Ok(true)
    }

    /// Commit the batch prepared so far.
    async fn op_all(&self) -> Result<()> {
        Ok(())
    }

    /// Arm one channel of an acquisition.
    async fn op_one(&self, _axis: usize) -> Result<()> {
        Ok(())
    }

    /// Current value of one axis.
    async fn read_one(&self, axis: usize) -> Result<f64>;

    /// Raw state and status text of one axis.
    async fn state_one(&self, axis: usize) -> Result<(ElementState, String)>;

    /// Send one axis to `target`; `Ok(false)` refuses the command.
    async fn start_one(&self, axis: usize, target: f64) -> Result<bool>;

    /// Stop one axis as soon as possible.
    async fn abort_one(&self, axis: usize) -> Result<()>;
}

/// Transform plugin computing pseudo values from physical ones.
///
/// Implementations must be consistent: `inverse(forward(x))` should give
/// back `x`. Outputs are checked for length and finiteness by the engine.
pub trait PseudoController: Send + Sync {
    /// Names of the pseudo roles, in role order.
    fn pseudo_roles(&self) -> Vec<String>;

    /// Names of the physical roles, in the order `calc_all_*` expects them.
    fn physical_roles(&self) -> Vec<String>;

    /// Physical values to pseudo values.
    fn calc_all_forward(&self, physical: &[f64]) -> Result<Vec<f64>>;

    /// Pseudo values to physical values.
    fn calc_all_inverse(&self, pseudo: &[f64]) -> Result<Vec<f64>>;
}

/// The driver behind a controller.
#[derive(Clone)]
pub enum Driver {
    Physical(Arc<dyn ControllerAdapter>),
    Pseudo(Arc<dyn PseudoController>),
}

/// A registered controller instance.
pub struct Controller {
    /// Registry identity.
    pub id: ControllerId,
    /// Unique name.
    pub name: String,
    driver: Driver,
    instantiated: AtomicBool,
    lock: Arc<AsyncMutex<()>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pseudo", &self.is_pseudo())
            .field("instantiated", &self.is_instantiated())
            .finish()
    }
}

impl Lockable for Controller {
    fn lock_handle(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.lock)
    }
}

impl Controller {
    pub(crate) fn new(id: ControllerId, name: &str, driver: Driver) -> Self {
        Self {
            id,
            name: name.to_string(),
            driver,
            instantiated: AtomicBool::new(true),
            lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Whether the driver instance is usable.
    pub fn is_instantiated(&self) -> bool {
        self.instantiated.load(Ordering::Acquire)
    }

    /// Mark the driver instance usable or not.
    pub fn set_instantiated(&self, value: bool) {
        self.instantiated.store(value, Ordering::Release);
    }

    /// Whether this is a transform plugin rather than hardware.
    pub fn is_pseudo(&self) -> bool {
        matches!(self.driver, Driver::Pseudo(_))
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    fn adapter(&self) -> PoolResult<&Arc<dyn ControllerAdapter>> {
        match &self.driver {
            Driver::Physical(adapter) => Ok(adapter),
            Driver::Pseudo(_) => Err(PoolError::InvalidGroupState(format!(
                "controller '{}' drives no hardware",
                self.name
            ))),
        }
    }

    fn calculator(&self) -> PoolResult<&Arc<dyn PseudoController>> {
        match &self.driver {
            Driver::Pseudo(calc) => Ok(calc),
            Driver::Physical(_) => Err(PoolError::InvalidGroupState(format!(
                "controller '{}' has no transform",
                self.name
            ))),
        }
    }

    fn failed(&self, phase: Phase, element: Option<&str>, err: anyhow::Error) -> PoolError {
        PoolError::call_failed(phase, &self.name, element, err)
    }

    /// Batch preparation.
    pub async fn pre_op_all(&self) -> PoolResult<()> {
        self.adapter()?
            .pre_op_all()
            .await
            .map_err(|e| self.failed(Phase::PreOpAll, None, e))
    }

    /// Per-element preparation; a refusal is `ControllerNotReady`.
    pub async fn pre_op_one(&self, axis: usize, element: &str) -> PoolResult<()> {
        let ready = self
            .adapter()?
            .pre_op_one(axis)
            .await
            .map_err(|e| self.failed(Phase::PreOpOne, Some(element), e))?;
        ready.then_some(()).ok_or_else(|| PoolError::ControllerNotReady {
            phase: Phase::PreOpOne,
            element: element.to_string(),
        })
    }

    /// Batch commit.
    pub async fn op_all(&self) -> PoolResult<()> {
        self.adapter()?
            .op_all()
            .await
            .map_err(|e| self.failed(Phase::OpAll, None, e))
    }

    /// Arm one channel of an acquisition.
    pub async fn op_one(&self, axis: usize, element: &str) -> PoolResult<()> {
        self.adapter()?
            .op_one(axis)
            .await
            .map_err(|e| self.failed(Phase::OpOne, Some(element), e))
    }

    /// Start one element; a refusal is `ControllerNotReady`.
    pub async fn start_one(&self, axis: usize, element: &str, target: f64) -> PoolResult<()> {
        let accepted = self
            .adapter()?
            .start_one(axis, target)
            .await
            .map_err(|e| self.failed(Phase::StartOne, Some(element), e))?;
        accepted
            .then_some(())
            .ok_or_else(|| PoolError::ControllerNotReady {
                phase: Phase::StartOne,
                element: element.to_string(),
            })
    }

    /// Position of one element.
    pub async fn read_one(&self, axis: usize, element: &str) -> PoolResult<f64> {
        self.adapter()?
            .read_one(axis)
            .await
            .map_err(|e| PoolError::ReadFailed {
                element: element.to_string(),
                reason: format!("{e:#}"),
            })
    }

    /// Raw state; a failing driver call reads as `Unknown`.
    pub async fn state_one(&self, axis: usize) -> (ElementState, String) {
        match self.adapter() {
            Ok(adapter) => match adapter.state_one(axis).await {
                Ok(state) => state,
                Err(e) => (ElementState::Unknown, format!("state_one() failed: {e:#}")),
            },
            Err(e) => (ElementState::Fault, e.to_string()),
        }
    }

    /// Stop one element.
    pub async fn abort_one(&self, axis: usize, element: &str) -> PoolResult<()> {
        self.adapter()?
            .abort_one(axis)
            .await
            .map_err(|e| self.failed(Phase::AbortOne, Some(element), e))
    }

    /// Number of pseudo roles, 0 for hardware controllers.
    pub fn pseudo_role_count(&self) -> usize {
        match &self.driver {
            Driver::Pseudo(calc) => calc.pseudo_roles().len(),
            Driver::Physical(_) => 0,
        }
    }

    /// Number of physical roles, 0 for hardware controllers.
    pub fn physical_role_count(&self) -> usize {
        match &self.driver {
            Driver::Pseudo(calc) => calc.physical_roles().len(),
            Driver::Physical(_) => 0,
        }
    }

    /// Forward transform with output validation.
    pub fn calc_forward(&self, physical: &[f64]) -> PoolResult<Vec<f64>> {
        let calc = self.calculator()?;
        let out = calc
            .calc_all_forward(physical)
            .map_err(|e| self.failed(Phase::CalcForward, None, e))?;
        self.check_transform(Phase::CalcForward, out, calc.pseudo_roles().len())
    }

    /// Inverse transform with output validation.
    pub fn calc_inverse(&self, pseudo: &[f64]) -> PoolResult<Vec<f64>> {
        let calc = self.calculator()?;
        let out = calc
            .calc_all_inverse(pseudo)
            .map_err(|e| self.failed(Phase::CalcInverse, None, e))?;
        self.check_transform(Phase::CalcInverse, out, calc.physical_roles().len())
    }

    fn check_transform(&self, phase: Phase, out: Vec<f64>, expected: usize) -> PoolResult<Vec<f64>> {
        if out.len() != expected {
            return Err(PoolError::BadTransformResult {
                controller: self.name.clone(),
                detail: format!("{phase}() returned {} values, expected {expected}", out.len()),
            });
        }
        if let Some((idx, value)) = out.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(PoolError::BadTransformResult {
                controller: self.name.clone(),
                detail: format!("{phase}() returned {value} at index {idx}"),
            });
        }
        Ok(out)
    }
}
