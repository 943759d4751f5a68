//! Elements: physical axes and channels, and pseudo elements computed from them.
//!
//! An [`Element`] is immutable registry data plus a shared [`ElementRuntime`]
//! cell. Registry snapshots clone the data but keep pointing at the same
//! runtime, so states and locks survive every membership rebuild.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::state::ElementState;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(
            /// Raw id value.
            pub u32,
        );

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Registry identity of an element
    ElementId,
    "element"
);
id_type!(
    /// Registry identity of a controller
    ControllerId,
    "controller"
);
id_type!(
    /// Registry identity of a group
    GroupId,
    "group"
);

/// Identity of one execution session.
pub type SessionId = Uuid;

/// Hardware family, used in state diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// Physical motor.
    Motor,
    /// Counter or timer channel.
    CounterTimer,
    /// Pseudo element.
    PseudoMotor,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Motor => "Motor",
            Family::CounterTimer => "CounterTimer",
            Family::PseudoMotor => "PseudoMotor",
        })
    }
}

/// Variant data of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    /// Axis or channel owned by a hardware controller.
    Physical {
        /// Hardware controller.
        controller: ControllerId,
        /// Axis or channel index.
        axis: usize,
        /// Hardware family.
        family: Family,
    },
    /// Value computed by a pseudo controller from the elements in `uses`.
    Pseudo {
        /// Pseudo controller.
        controller: ControllerId,
        /// Pseudo role index.
        role: usize,
        /// Inputs, in physical role order.
        uses: Vec<ElementId>,
    },
}

/// A registered element.
#[derive(Debug, Clone)]
pub struct Element {
    /// Registry identity.
    pub id: ElementId,
    /// Unique name.
    pub name: String,
    /// Name shown in diagnostics.
    pub alias: String,
    /// Physical or pseudo data.
    pub kind: ElementKind,
    /// Signed backlash in user units; zero disables compensation.
    pub backlash: f64,
    runtime: Arc<ElementRuntime>,
}

impl Element {
    pub(crate) fn new(id: ElementId, name: &str, kind: ElementKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            alias: name.to_string(),
            kind,
            backlash: 0.0,
            runtime: Arc::new(ElementRuntime::default()),
        }
    }

    /// Owning controller, physical or pseudo.
    pub fn controller(&self) -> ControllerId {
        match &self.kind {
            ElementKind::Physical { controller, .. } | ElementKind::Pseudo { controller, .. } => {
                *controller
            }
        }
    }

    /// Index of this element inside its controller: axis or role.
    pub fn index_in_controller(&self) -> usize {
        match &self.kind {
            ElementKind::Physical { axis, .. } => *axis,
            ElementKind::Pseudo { role, .. } => *role,
        }
    }

    /// Hardware family; pseudo elements are `PseudoMotor`.
    pub fn family(&self) -> Family {
        match &self.kind {
            ElementKind::Physical { family, .. } => *family,
            ElementKind::Pseudo { .. } => Family::PseudoMotor,
        }
    }

    /// Whether a hardware controller drives this element directly.
    pub fn is_physical(&self) -> bool {
        matches!(self.kind, ElementKind::Physical { .. })
    }

    /// Shared runtime cell.
    pub fn runtime(&self) -> &Arc<ElementRuntime> {
        &self.runtime
    }
}

/// Handle to an exclusive lock taken before touching hardware.
#[async_trait]
pub trait Lockable: Sync {
    /// The shared lock cell.
    fn lock_handle(&self) -> Arc<AsyncMutex<()>>;

    /// Wait for the lock; it is held until the guard drops.
    async fn lock_owned(&self) -> OwnedMutexGuard<()> {
        self.lock_handle().lock_owned().await
    }
}

impl Lockable for Element {
    fn lock_handle(&self) -> Arc<AsyncMutex<()>> {
        self.runtime.lock_handle()
    }
}

/// Raw state of a physical element, as its controller reports it.
#[async_trait]
pub trait StateReadable {
    /// State and status text. Failures read as `Unknown`.
    async fn read_state(&self) -> (ElementState, String);
}

/// Pseudo-side view of an element: which controller computes it and from what.
pub trait Transformable {
    /// `(controller, role, uses)` for pseudo elements, `None` for physical ones.
    fn transform_role(&self) -> Option<(ControllerId, usize, &[ElementId])>;
}

impl Transformable for Element {
    fn transform_role(&self) -> Option<(ControllerId, usize, &[ElementId])> {
        match &self.kind {
            ElementKind::Pseudo {
                controller,
                role,
                uses,
            } => Some((*controller, *role, uses.as_slice())),
            ElementKind::Physical { .. } => None,
        }
    }
}

/// Last known runtime values of an element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeStatus {
    /// Last state set by a session.
    pub state: ElementState,
    /// Last position read.
    pub position: Option<f64>,
    /// Last target commanded.
    pub commanded: Option<f64>,
    /// Session currently driving this element.
    pub owner: Option<SessionId>,
    /// An abort was sent since the element was last claimed.
    pub aborted: bool,
}

/// Mutable side of an element, shared across registry snapshots.
#[derive(Debug, Default)]
pub struct ElementRuntime {
    lock: Arc<AsyncMutex<()>>,
    status: Mutex<RuntimeStatus>,
}

impl Lockable for ElementRuntime {
    fn lock_handle(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.lock)
    }
}

impl ElementRuntime {
    /// Snapshot of the runtime values.
    pub fn status(&self) -> RuntimeStatus {
        self.status.lock().clone()
    }

    /// Last stored state.
    pub fn state(&self) -> ElementState {
        self.status.lock().state
    }

    /// Store a new state, returning the previous one.
    pub fn set_state(&self, state: ElementState) -> ElementState {
        std::mem::replace(&mut self.status.lock().state, state)
    }

    /// Store a position read, returning whether it differs from the last one.
    pub fn record_position(&self, position: f64) -> bool {
        let mut status = self.status.lock();
        let changed = status.position != Some(position);
        status.position = Some(position);
        changed
    }

    /// Remember the last commanded target (backlash reference).
    pub fn record_command(&self, target: f64) {
        self.status.lock().commanded = Some(target);
    }

    /// Note that an abort was sent to this element.
    pub fn mark_aborted(&self) {
        self.status.lock().aborted = true;
    }

    /// Whether an abort was sent since the last fresh claim.
    pub fn abort_marked(&self) -> bool {
        self.status.lock().aborted
    }

    /// Claim the element for `session`; fails with the current owner when taken
    /// by a session other than `session` or `parent`.
    pub(crate) fn claim(
        &self,
        session: SessionId,
        parent: Option<SessionId>,
    ) -> Result<(), SessionId> {
        let mut status = self.status.lock();
        match status.owner {
            Some(owner) if owner != session && Some(owner) != parent => Err(owner),
            Some(_) => Ok(()),
            None => {
                status.owner = Some(session);
                status.aborted = false;
                Ok(())
            }
        }
    }

    /// Release the claim if `session` holds it.
    pub(crate) fn release(&self, session: SessionId) {
        let mut status = self.status.lock();
        if status.owner == Some(session) {
            status.owner = None;
        }
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<SessionId> {
        self.status.lock().owner
    }
}
