//! Engine facade.
//!
//! [`PoolEngine`] is what the device layer talks to: it owns the registry,
//! the notification bus and the table of in-flight sessions, and routes
//! moves, acquisitions, aborts and state queries to them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use motion_pool::config::EngineConfig;
//! use motion_pool::element::Family;
//! use motion_pool::engine::PoolEngine;
//! use motion_pool::hardware::mock::MockMotorController;
//!
//! # async fn demo() -> motion_pool::error::PoolResult<()> {
//! let engine = PoolEngine::new(EngineConfig::default());
//! let ctrl = engine
//!     .registry()
//!     .register_hardware("motctrl", Arc::new(MockMotorController::new(2)))?;
//! engine.registry().register_physical("th", ctrl, 0, Family::Motor)?;
//! engine.registry().register_physical("tth", ctrl, 1, Family::Motor)?;
//! engine.registry().create_group("diff", &["th", "tth"])?;
//!
//! let handle = engine.execute("diff", &[10.0, 20.0], true).await?;
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::EngineConfig;
use crate::element::{Lockable, StateReadable};
use crate::error::{PoolError, PoolResult};
use crate::events::PoolEvent;
use crate::group::{self, Closure};
use crate::kinematics;
use crate::registry::{Registry, Snapshot};
use crate::session::{self, Operation, Plan, SessionHandle, SessionKey, Shared};
use crate::state::{aggregate, GroupStatus, StateEntry};

/// Parameters of an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSpec {
    /// Channel driving the acquisition (timer or monitor).
    pub master: String,
    /// Integration time or monitor count handed to the master's `start_one`.
    pub preset: f64,
}

/// The group execution engine.
pub struct PoolEngine {
    shared: Arc<Shared>,
}

impl PoolEngine {
    /// Engine with an empty registry.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    /// Registry of controllers, elements and groups.
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Receive every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.bus.subscribe()
    }

    /// Closure of a group as of the latest membership change.
    pub fn build_or_refresh_closure(&self, group: &str) -> PoolResult<Arc<Closure>> {
        let snapshot = self.shared.registry.snapshot();
        let id = snapshot.group_by_name(group)?.id;
        snapshot.closure(id)
    }

    /// Move a group to `user` (one value per user slot).
    ///
    /// Returns once every element has been started. With `wait == false` no
    /// monitoring loop runs and nothing is published: the caller watches the
    /// elements itself, and the stored element states are left as they were
    /// before the start.
    pub async fn execute(&self, group: &str, user: &[f64], wait: bool) -> PoolResult<SessionHandle> {
        let snapshot = self.shared.registry.snapshot();
        let definition = snapshot.group_by_name(group)?;
        let (id, settle) = (definition.id, definition.settle_delay);
        let closure = snapshot.closure(id)?;

        let targets = session::prepare_move(&snapshot, &closure, user).await?;
        info!(group, ?user, "move requested");

        let plan = Plan {
            key: Some(SessionKey::Group(id)),
            group: Some(id),
            snapshot: Arc::clone(&snapshot),
            closure,
            targets,
            operation: Operation::Move,
            held: Vec::new(),
            parent: None,
            monitor: wait,
            settle_delay: settle.unwrap_or_else(|| self.shared.config.settle_delay()),
        };
        session::launch(Arc::clone(&self.shared), plan).await
    }

    /// Run an acquisition over every channel of `group`.
    pub async fn acquire(
        &self,
        group: &str,
        spec: AcquisitionSpec,
        wait: bool,
    ) -> PoolResult<SessionHandle> {
        let snapshot = self.shared.registry.snapshot();
        let definition = snapshot.group_by_name(group)?;
        let (id, settle) = (definition.id, definition.settle_delay);
        let closure = snapshot.closure(id)?;
        let master = snapshot.element_by_name(&spec.master)?.id;

        let targets = session::prepare_acquisition(&snapshot, &closure, master, spec.preset)?;
        info!(group, master = %spec.master, preset = spec.preset, "acquisition requested");

        let plan = Plan {
            key: Some(SessionKey::Group(id)),
            group: Some(id),
            snapshot: Arc::clone(&snapshot),
            closure,
            targets,
            operation: Operation::Acquire {
                master,
                preset: spec.preset,
            },
            held: Vec::new(),
            parent: None,
            monitor: wait,
            settle_delay: settle.unwrap_or_else(|| self.shared.config.settle_delay()),
        };
        session::launch(Arc::clone(&self.shared), plan).await
    }

    /// Move one element, physical or pseudo.
    ///
    /// The element's own lock is held here for the whole start phase; the
    /// session does not take it again.
    pub async fn move_element(&self, element: &str, target: f64, wait: bool) -> PoolResult<SessionHandle> {
        let snapshot = self.shared.registry.snapshot();
        let found = snapshot.element_by_name(element)?;
        let id = found.id;
        let runtime = Arc::clone(found.runtime());
        let closure = Arc::new(group::for_element(&snapshot, id)?);

        let targets = session::prepare_move(&snapshot, &closure, &[target]).await?;
        info!(element, target, "move requested");

        let guard = runtime.lock_owned().await;
        let plan = Plan {
            key: Some(SessionKey::Element(id)),
            group: None,
            snapshot: Arc::clone(&snapshot),
            closure,
            targets,
            operation: Operation::Move,
            held: vec![id],
            parent: None,
            monitor: wait,
            settle_delay: self.shared.config.settle_delay(),
        };
        let handle = session::launch(Arc::clone(&self.shared), plan).await;
        drop(guard);
        handle
    }

    /// Abort every element of a group, master first.
    ///
    /// Works with or without a running session. Elements the running session
    /// already reported as stopped are left alone. Every element is attempted
    /// before failures are reported.
    pub async fn abort(&self, group: &str) -> PoolResult<()> {
        let snapshot = self.shared.registry.snapshot();
        let id = snapshot.group_by_name(group)?.id;
        let closure = snapshot.closure(id)?;
        info!(group, "abort requested");
        self.abort_key(&snapshot, SessionKey::Group(id), &closure).await
    }

    /// Abort a single-element operation (or the element's hardware).
    pub async fn abort_element(&self, element: &str) -> PoolResult<()> {
        let snapshot = self.shared.registry.snapshot();
        let id = snapshot.element_by_name(element)?.id;
        let closure = group::for_element(&snapshot, id)?;
        self.abort_key(&snapshot, SessionKey::Element(id), &closure)
            .await
    }

    async fn abort_key(&self, snapshot: &Snapshot, key: SessionKey, closure: &Closure) -> PoolResult<()> {
        let errors = match self.shared.active(key) {
            Some(control) => {
                control.request_abort();
                session::abort_axes(&control.axes, control.master, &control.completed()).await
            }
            None => {
                let axes = session::axes(snapshot, closure)?;
                session::abort_axes(&axes, None, &HashSet::new()).await
            }
        };
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::AbortFailed(errors))
        }
    }

    /// Group state and diagnostic.
    ///
    /// While a session runs this reduces the states the session maintains;
    /// otherwise every element is queried live. Uninstantiated controllers
    /// always yield `Fault`.
    pub async fn current_state(&self, group: &str) -> PoolResult<GroupStatus> {
        let snapshot = self.shared.registry.snapshot();
        let id = snapshot.group_by_name(group)?.id;
        let closure = snapshot.closure(id)?;

        let mut uninstantiated = Vec::new();
        for ctrl_id in closure.implied_controllers() {
            let ctrl = snapshot.controller(ctrl_id)?;
            if !ctrl.is_instantiated() {
                uninstantiated.push(ctrl.name.clone());
            }
        }

        let in_session = self.shared.active(SessionKey::Group(id)).is_some();
        let mut entries = Vec::with_capacity(closure.physical.len());
        for axis in session::axes(&snapshot, &closure)? {
            let state = if in_session || !axis.controller.is_instantiated() {
                axis.runtime.state()
            } else {
                axis.read_state().await.0
            };
            entries.push(StateEntry {
                family: axis.family,
                alias: axis.alias,
                state,
            });
        }
        Ok(aggregate(&entries, &uninstantiated))
    }

    /// Live positions of a group, in user space.
    pub async fn current_user_vector(&self, group: &str) -> PoolResult<Vec<f64>> {
        let snapshot = self.shared.registry.snapshot();
        let id = snapshot.group_by_name(group)?.id;
        let closure = snapshot.closure(id)?;
        let physical = kinematics::current_values(&snapshot, &closure.physical).await?;
        kinematics::to_user(&snapshot, &closure, &physical)
    }
}
