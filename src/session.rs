//! Execution sessions.
//!
//! A session runs one move or acquisition over a closure:
//!
//! ```text
//! Validating -> Transforming -> Locking -> Starting -> Running -> Completed | Aborted | Failed
//! ```
//!
//! Validation and transformation happen in the caller's task ([`prepare_move`],
//! [`prepare_acquisition`]); nothing is locked and no element is commanded
//! yet. [`launch`] then spawns the session worker, which locks every element
//! (ascending id, skipping locks the caller holds) and every implied
//! controller (ascending id), runs the start protocol and reports back
//! through a one-shot channel. The caller only waits for that start signal;
//! monitoring continues in the worker (see [`crate::monitor`]).
//!
//! A failure while starting unwinds everything: started elements get a best
//! effort `abort_one`, controller locks are released, elements already
//! reported `Moving` are reverted (with a notification) and element locks are
//! released before the error reaches the caller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backlash::{self, BacklashPlan};
use crate::config::EngineConfig;
use crate::controller::Controller;
use crate::element::{ElementId, ElementRuntime, Family, GroupId, Lockable, SessionId, StateReadable};
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::group::{self, Closure};
use crate::kinematics;
use crate::monitor;
use crate::registry::{Registry, Snapshot};
use crate::state::ElementState;

/// What a session is keyed by for abort routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Group operation.
    Group(GroupId),
    /// Single-element operation.
    Element(ElementId),
}

/// Kind of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    /// Motion to per-element targets.
    Move,
    /// Timed or counted acquisition driven by `master`.
    Acquire {
        /// Channel that ends the acquisition.
        master: ElementId,
        /// Integration time or monitor count.
        preset: f64,
    },
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every element stopped on its own.
    Completed,
    /// An abort reached at least one element.
    Aborted,
    /// Error-level state while moving, with the group diagnostic.
    Failed(String),
}

/// State shared by the engine facade and every session worker.
pub(crate) struct Shared {
    pub registry: Registry,
    pub bus: EventBus,
    pub config: EngineConfig,
    active: Mutex<HashMap<SessionKey, Arc<SessionControl>>>,
}

impl Shared {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: Registry::new(),
            bus: EventBus::new(config.event_capacity),
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self, key: SessionKey) -> Option<Arc<SessionControl>> {
        self.active.lock().get(&key).cloned()
    }

    fn register(&self, control: &Arc<SessionControl>) -> PoolResult<()> {
        let Some(key) = control.key else {
            return Ok(());
        };
        let mut active = self.active.lock();
        if active.contains_key(&key) {
            return Err(PoolError::InvalidGroupState(format!(
                "an operation on {key:?} is already in progress"
            )));
        }
        active.insert(key, Arc::clone(control));
        Ok(())
    }

    /// Forget `control` if it is still the active session of its key.
    pub fn finish(&self, control: &SessionControl) {
        if let Some(key) = control.key {
            let mut active = self.active.lock();
            if active.get(&key).is_some_and(|c| c.id == control.id) {
                active.remove(&key);
            }
        }
    }
}

/// One physical element as a session sees it.
#[derive(Debug, Clone)]
pub(crate) struct Axis {
    pub id: ElementId,
    pub name: String,
    pub alias: String,
    pub family: Family,
    pub axis: usize,
    pub controller: Arc<Controller>,
    pub runtime: Arc<ElementRuntime>,
}

impl Axis {
    pub fn resolve(snapshot: &Snapshot, id: ElementId) -> PoolResult<Self> {
        let element = snapshot.element(id)?;
        Ok(Self {
            id,
            name: element.name.clone(),
            alias: element.alias.clone(),
            family: element.family(),
            axis: element.index_in_controller(),
            controller: Arc::clone(snapshot.controller(element.controller())?),
            runtime: Arc::clone(element.runtime()),
        })
    }

    pub async fn abort(&self) -> PoolResult<()> {
        self.controller.abort_one(self.axis, &self.name).await
    }
}

#[async_trait]
impl StateReadable for Axis {
    async fn read_state(&self) -> (ElementState, String) {
        self.controller.state_one(self.axis).await
    }
}

/// Every physical element of a closure, in closure order.
pub(crate) fn axes(snapshot: &Snapshot, closure: &Closure) -> PoolResult<Vec<Axis>> {
    closure
        .physical
        .iter()
        .map(|id| Axis::resolve(snapshot, *id))
        .collect()
}

/// Commands for one physical element.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub axis: Axis,
    pub command: f64,
    pub follow_up: Option<f64>,
}

/// A fully validated and transformed session, ready to lock and start.
#[derive(Debug)]
pub(crate) struct Plan {
    pub key: Option<SessionKey>,
    pub group: Option<GroupId>,
    pub snapshot: Arc<Snapshot>,
    pub closure: Arc<Closure>,
    /// Aligned with `closure.physical`.
    pub targets: Vec<Target>,
    pub operation: Operation,
    /// Element locks the caller already holds.
    pub held: Vec<ElementId>,
    pub parent: Option<SessionId>,
    /// Run the monitoring loop and publish notifications. Without it the
    /// stored states are put back once the elements are started, except for
    /// follow-ups, whose parent keeps monitoring.
    pub monitor: bool,
    pub settle_delay: Duration,
}

impl Plan {
    pub fn master(&self) -> Option<ElementId> {
        match self.operation {
            Operation::Acquire { master, .. } => Some(master),
            Operation::Move => None,
        }
    }
}

/// Runtime control block of a session, reachable from `abort`.
#[derive(Debug)]
pub(crate) struct SessionControl {
    pub id: SessionId,
    pub key: Option<SessionKey>,
    pub master: Option<ElementId>,
    pub axes: Vec<Axis>,
    aborted: AtomicBool,
    completed: Mutex<HashSet<ElementId>>,
}

impl SessionControl {
    fn new(plan: &Plan) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: plan.key,
            master: plan.master(),
            axes: plan.targets.iter().map(|t| t.axis.clone()).collect(),
            aborted: AtomicBool::new(false),
            completed: Mutex::new(HashSet::new()),
        }
    }

    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self, element: ElementId) {
        self.completed.lock().insert(element);
    }

    pub fn completed(&self) -> HashSet<ElementId> {
        self.completed.lock().clone()
    }
}

/// Caller-side handle of a started session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    done: oneshot::Receiver<SessionOutcome>,
}

impl SessionHandle {
    /// Session identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for the end of the operation (after `GroupOperationEnded`).
    pub async fn wait(self) -> SessionOutcome {
        self.done.await.unwrap_or_else(|_| {
            SessionOutcome::Failed("session worker stopped without reporting".to_string())
        })
    }
}

fn validate(snapshot: &Snapshot, closure: &Closure, user_len: Option<usize>) -> PoolResult<()> {
    for id in closure.implied_controllers() {
        let ctrl = snapshot.controller(id)?;
        if !ctrl.is_instantiated() {
            return Err(PoolError::InvalidGroupState(format!(
                "controller '{}' is not instantiated",
                ctrl.name
            )));
        }
    }
    match user_len {
        Some(actual) if actual != closure.user_len() => Err(PoolError::ArityMismatch {
            expected: closure.user_len(),
            actual,
        }),
        _ => Ok(()),
    }
}

/// Validate, transform and apply backlash for a move.
pub(crate) async fn prepare_move(
    snapshot: &Snapshot,
    closure: &Closure,
    user: &[f64],
) -> PoolResult<Vec<Target>> {
    validate(snapshot, closure, Some(user.len()))?;
    let physical = kinematics::to_physical(snapshot, closure, user).await?;

    let mut targets = Vec::with_capacity(physical.len());
    for (id, value) in closure.physical.iter().zip(physical) {
        let axis = Axis::resolve(snapshot, *id)?;
        let backlash = snapshot.element(*id)?.backlash;
        let plan = if backlash == 0.0 {
            BacklashPlan::direct(value)
        } else {
            let status = axis.runtime.status();
            let reference = match status.commanded.or(status.position) {
                Some(reference) => reference,
                None => axis.controller.read_one(axis.axis, &axis.name).await?,
            };
            backlash::plan(value, Some(reference), backlash)
        };
        targets.push(Target {
            axis,
            command: plan.command,
            follow_up: plan.follow_up,
        });
    }
    Ok(targets)
}

/// Validate an acquisition whose master channel is `master`.
pub(crate) fn prepare_acquisition(
    snapshot: &Snapshot,
    closure: &Closure,
    master: ElementId,
    preset: f64,
) -> PoolResult<Vec<Target>> {
    validate(snapshot, closure, None)?;
    if !closure.contains(master) {
        return Err(PoolError::ElementNotFound(format!(
            "master {master} is not a channel of this group"
        )));
    }
    if !preset.is_finite() || preset <= 0.0 {
        return Err(PoolError::InvalidGroupState(format!(
            "acquisition preset must be positive, got {preset}"
        )));
    }
    closure
        .physical
        .iter()
        .map(|id| {
            Ok(Target {
                axis: Axis::resolve(snapshot, *id)?,
                command: if *id == master { preset } else { 0.0 },
                follow_up: None,
            })
        })
        .collect()
}

/// Spawn the session worker and wait until the start phase finished.
pub(crate) async fn launch(shared: Arc<Shared>, plan: Plan) -> PoolResult<SessionHandle> {
    let control = Arc::new(SessionControl::new(&plan));
    if plan.monitor {
        shared.register(&control)?;
    }

    let (started_tx, started_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    let id = control.id;

    tokio::spawn(worker(shared, plan, control, started_tx, done_tx));

    match started_rx.await {
        Ok(Ok(())) => Ok(SessionHandle { id, done: done_rx }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(PoolError::InvalidGroupState(
            "session worker stopped before starting".to_string(),
        )),
    }
}

async fn worker(
    shared: Arc<Shared>,
    plan: Plan,
    control: Arc<SessionControl>,
    started: oneshot::Sender<PoolResult<()>>,
    done: oneshot::Sender<SessionOutcome>,
) {
    if let Err(err) = start(&shared, &plan, &control).await {
        shared.finish(&control);
        let outcome = SessionOutcome::Failed(err.to_string());
        let _ = started.send(Err(err));
        let _ = done.send(outcome);
        return;
    }
    info!(session = %control.id, group = ?plan.group, elements = plan.targets.len(), "session started");
    let _ = started.send(Ok(()));

    let outcome = if plan.monitor {
        monitor::run(&shared, &plan, &control).await
    } else {
        SessionOutcome::Completed
    };

    for target in &plan.targets {
        target.axis.runtime.release(control.id);
    }
    shared.finish(&control);
    info!(session = %control.id, ?outcome, "session ended");
    let _ = done.send(outcome);
}

/// Start a follow-up move on one element of a running session, inline.
pub(crate) async fn follow_up(
    shared: &Shared,
    parent: &SessionControl,
    snapshot: &Arc<Snapshot>,
    axis: &Axis,
    target: f64,
) -> PoolResult<()> {
    let closure = Arc::new(group::for_element(snapshot, axis.id)?);
    let plan = Plan {
        key: None,
        group: None,
        snapshot: Arc::clone(snapshot),
        closure,
        targets: vec![Target {
            axis: axis.clone(),
            command: target,
            follow_up: None,
        }],
        operation: Operation::Move,
        held: Vec::new(),
        parent: Some(parent.id),
        monitor: false,
        settle_delay: Duration::ZERO,
    };
    let control = SessionControl::new(&plan);
    debug!(element = %axis.name, target, "backlash follow-up");
    start(shared, &plan, &control).await
}

/// Abort `axes`, master first, skipping `skip`. Every element is attempted.
pub(crate) async fn abort_axes(
    axes: &[Axis],
    master: Option<ElementId>,
    skip: &HashSet<ElementId>,
) -> Vec<PoolError> {
    let mut ordered: Vec<&Axis> = axes.iter().filter(|a| !skip.contains(&a.id)).collect();
    ordered.sort_by_key(|a| Some(a.id) != master);

    let mut errors = Vec::new();
    for axis in ordered {
        axis.runtime.mark_aborted();
        debug!(element = %axis.name, "abort_one");
        if let Err(err) = axis.abort().await {
            warn!(element = %axis.name, error = %err, "abort failed");
            errors.push(err);
        }
    }
    errors
}

struct Started<'a> {
    target: &'a Target,
    prior: ElementState,
}

/// Lock, run the start protocol and release. Unwinds on failure.
pub(crate) async fn start(shared: &Shared, plan: &Plan, control: &SessionControl) -> PoolResult<()> {
    let mut controllers = Vec::new();
    for id in plan.closure.implied_controllers() {
        controllers.push(Arc::clone(plan.snapshot.controller(id)?));
    }

    let mut ordered: Vec<&Target> = plan.targets.iter().collect();
    ordered.sort_by_key(|t| t.axis.id);

    let mut element_guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(ordered.len());
    for target in &ordered {
        if !plan.held.contains(&target.axis.id) {
            element_guards.push(target.axis.runtime.lock_owned().await);
        }
    }

    let mut claimed: Vec<&Target> = Vec::with_capacity(ordered.len());
    for target in &ordered {
        if let Err(owner) = target.axis.runtime.claim(control.id, plan.parent) {
            release_claims(&claimed, control.id);
            return Err(PoolError::InvalidGroupState(format!(
                "element '{}' is busy with operation {owner}",
                target.axis.name
            )));
        }
        claimed.push(target);
    }

    let mut controller_guards = Vec::with_capacity(controllers.len());
    for ctrl in &controllers {
        controller_guards.push(ctrl.lock_owned().await);
    }
    let hardware: Vec<&Arc<Controller>> = controllers.iter().filter(|c| !c.is_pseudo()).collect();

    let mut started: Vec<Started<'_>> = Vec::new();
    match run_protocol(shared, plan, &hardware, &mut started).await {
        Ok(()) => {
            drop(controller_guards);
            if plan.monitor {
                if let Some(group) = plan.group {
                    let old = started
                        .iter()
                        .map(|s| s.prior)
                        .max()
                        .unwrap_or(ElementState::Idle);
                    if old != ElementState::Moving {
                        shared.bus.publish(PoolEvent::GroupStateChanged {
                            group,
                            old,
                            new: ElementState::Moving,
                        });
                    }
                }
            } else {
                if plan.parent.is_none() {
                    // unmonitored: nothing will report the stop
                    for s in &started {
                        s.target.axis.runtime.set_state(s.prior);
                    }
                }
                release_claims(&claimed, control.id);
            }
            drop(element_guards);
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "start failed, unwinding");
            for s in &started {
                if let Err(abort_err) = s.target.axis.abort().await {
                    warn!(element = %s.target.axis.name, error = %abort_err, "abort during unwind failed");
                }
            }
            drop(controller_guards);
            for s in started.iter().rev() {
                let old = s.target.axis.runtime.set_state(s.prior);
                if plan.monitor && old != s.prior {
                    shared.bus.publish(PoolEvent::ElementStateChanged {
                        element: s.target.axis.id,
                        old,
                        new: s.prior,
                    });
                }
            }
            release_claims(&claimed, control.id);
            drop(element_guards);
            Err(err)
        }
    }
}

fn release_claims(claimed: &[&Target], session: SessionId) {
    for target in claimed {
        target.axis.runtime.release(session);
    }
}

async fn run_protocol<'a>(
    shared: &Shared,
    plan: &'a Plan,
    hardware: &[&Arc<Controller>],
    started: &mut Vec<Started<'a>>,
) -> PoolResult<()> {
    for ctrl in hardware {
        debug!(controller = %ctrl.name, "pre_op_all");
        ctrl.pre_op_all().await?;
    }
    for target in &plan.targets {
        let axis = &target.axis;
        axis.controller.pre_op_one(axis.axis, &axis.name).await?;
    }
    for ctrl in hardware {
        debug!(controller = %ctrl.name, "op_all");
        ctrl.op_all().await?;
    }

    match plan.operation {
        Operation::Move => {
            for target in &plan.targets {
                let axis = &target.axis;
                debug!(element = %axis.name, target = target.command, "start_one");
                axis.controller
                    .start_one(axis.axis, &axis.name, target.command)
                    .await?;
                started.push(mark_moving(shared, plan, target));
            }
        }
        Operation::Acquire { master, preset } => {
            for target in plan.targets.iter().filter(|t| t.axis.id != master) {
                let axis = &target.axis;
                axis.controller.op_one(axis.axis, &axis.name).await?;
                started.push(mark_moving(shared, plan, target));
            }
            if let Some(target) = plan.targets.iter().find(|t| t.axis.id == master) {
                let axis = &target.axis;
                debug!(element = %axis.name, preset, "start_one (master)");
                axis.controller.start_one(axis.axis, &axis.name, preset).await?;
                started.push(mark_moving(shared, plan, target));
            }
        }
    }
    Ok(())
}

/// Mark an element moving and announce it while its lock is still held.
fn mark_moving<'a>(shared: &Shared, plan: &Plan, target: &'a Target) -> Started<'a> {
    let runtime = &target.axis.runtime;
    let prior = runtime.set_state(ElementState::Moving);
    if matches!(plan.operation, Operation::Move) {
        runtime.record_command(target.command);
    }
    if plan.monitor && prior != ElementState::Moving {
        shared.bus.publish(PoolEvent::ElementStateChanged {
            element: target.axis.id,
            old: prior,
            new: ElementState::Moving,
        });
    }
    Started { target, prior }
}
