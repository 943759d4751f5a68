//! Monitoring and completion loop.
//!
//! Runs inside the session worker once the start protocol succeeded. Every
//! tick it locks the pending elements and their controllers just long enough
//! to read raw states (and, every `state_polls_per_read` ticks, positions),
//! then releases the locks and publishes what changed.
//!
//! Completion rules:
//! - an element that stops before the rest of the group gets its own forced
//!   position read and state notification right away, unless a backlash
//!   follow-up is still due: the follow-up is started (inline, awaited) and
//!   the element keeps moving as far as listeners are concerned;
//! - an error-level group state while elements still move aborts them all;
//! - an element reported stopped is never sampled again, so it cannot flip
//!   back to `Moving` after an abort;
//! - an element aborted from anywhere (its own abort, the session's group or
//!   an enclosing group) gets no follow-up, and the session ends `Aborted`.
//!
//! Once the last element stopped: settle delay, forced read of every element,
//! position notifications, state notifications, group state, and a single
//! `GroupOperationEnded`. Nothing is published while locks are held.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::element::{Lockable, StateReadable};
use crate::error::PoolResult;
use crate::events::PoolEvent;
use crate::kinematics;
use crate::session::{self, Axis, Plan, SessionControl, SessionOutcome, Shared, Target};
use crate::state::{aggregate, ElementState, StateEntry};

struct Track<'a> {
    target: &'a Target,
    done: bool,
    follow_up: Option<f64>,
}

struct Sample {
    idx: usize,
    state: ElementState,
    position: Option<PoolResult<f64>>,
}

/// Drive the session to completion.
pub(crate) async fn run(shared: &Shared, plan: &Plan, control: &SessionControl) -> SessionOutcome {
    let mut tracks: Vec<Track<'_>> = plan
        .targets
        .iter()
        .map(|target| Track {
            target,
            done: false,
            follow_up: target.follow_up,
        })
        .collect();

    let poll = shared.config.poll_interval();
    let reads_every = u64::from(shared.config.state_polls_per_read.max(1));
    let mut failure: Option<String> = None;
    let mut tick: u64 = 0;

    let final_batch = loop {
        sleep(poll).await;
        tick += 1;

        let pending: Vec<usize> = (0..tracks.len()).filter(|i| !tracks[*i].done).collect();
        let with_positions = tick % reads_every == 0;
        let samples = sample(&tracks, &pending, with_positions).await;
        let mut events = Vec::new();

        if with_positions {
            position_events(plan, &tracks, &samples, &mut events);
        }

        if failure.is_none() && samples.iter().any(|s| s.state.is_moving()) {
            let status = aggregate(&entries(&tracks, &samples), &[]);
            if status.state.is_error() {
                warn!(session = %control.id, diagnostic = %status.diagnostic, "error state while moving, aborting");
                control.request_abort();
                let mut skip = control.completed();
                skip.extend(
                    samples
                        .iter()
                        .filter(|s| !s.state.is_moving())
                        .map(|s| tracks[s.idx].target.axis.id),
                );
                session::abort_axes(&control.axes, control.master, &skip).await;
                failure = Some(status.diagnostic);
            }
        }

        let aborted = control.abort_requested();
        let mut stopped: Vec<(usize, ElementState)> = Vec::new();
        let mut follow_ups: Vec<(usize, f64, ElementState)> = Vec::new();
        for s in samples.iter().filter(|s| !s.state.is_moving()) {
            let axis_aborted = aborted || tracks[s.idx].target.axis.runtime.abort_marked();
            match tracks[s.idx].follow_up.take() {
                Some(next) if !axis_aborted => follow_ups.push((s.idx, next, s.state)),
                _ => stopped.push((s.idx, s.state)),
            }
        }

        for (idx, next, state) in follow_ups {
            let axis = &tracks[idx].target.axis;
            if let Err(err) = session::follow_up(shared, control, &plan.snapshot, axis, next).await {
                warn!(element = %axis.name, error = %err, "backlash follow-up failed");
                stopped.push((idx, state));
            }
        }

        if stopped.len() == pending.len() {
            shared.bus.publish_all(events);
            break stopped;
        }

        if !stopped.is_empty() {
            let idxs: Vec<usize> = stopped.iter().map(|(idx, _)| *idx).collect();
            let reads = read_positions(&tracks, &idxs).await;
            for ((idx, state), read) in stopped.into_iter().zip(reads) {
                let track = &mut tracks[idx];
                track.done = true;
                let axis = &track.target.axis;
                control.mark_completed(axis.id);
                events.push(position_event(axis, read, true));
                let old = axis.runtime.set_state(state);
                debug!(element = %axis.name, %state, "element stopped");
                events.push(PoolEvent::ElementStateChanged {
                    element: axis.id,
                    old,
                    new: state,
                });
            }
        }

        shared.bus.publish_all(events);
    };

    teardown(shared, plan, control, &tracks, final_batch, failure).await
}

async fn teardown(
    shared: &Shared,
    plan: &Plan,
    control: &SessionControl,
    tracks: &[Track<'_>],
    final_batch: Vec<(usize, ElementState)>,
    failure: Option<String>,
) -> SessionOutcome {
    if !plan.settle_delay.is_zero() {
        sleep(plan.settle_delay).await;
    }

    let all: Vec<usize> = (0..tracks.len()).collect();
    let reads = read_positions(tracks, &all).await;

    let mut events = Vec::with_capacity(tracks.len() * 2 + 3);
    let mut positions = Vec::with_capacity(tracks.len());
    for (track, read) in tracks.iter().zip(reads) {
        if let Ok(value) = &read {
            positions.push(*value);
        }
        events.push(position_event(&track.target.axis, read, true));
    }
    if let Some(group) = plan.group {
        if positions.len() == tracks.len() {
            match kinematics::to_user(&plan.snapshot, &plan.closure, &positions) {
                Ok(positions) => events.push(PoolEvent::GroupPositionChanged { group, positions }),
                Err(err) => warn!(error = %err, "final user positions unavailable"),
            }
        }
    }

    for (idx, state) in final_batch {
        let axis = &tracks[idx].target.axis;
        control.mark_completed(axis.id);
        let old = axis.runtime.set_state(state);
        if old != state {
            events.push(PoolEvent::ElementStateChanged {
                element: axis.id,
                old,
                new: state,
            });
        }
    }

    if let Some(group) = plan.group {
        let entries: Vec<StateEntry> = tracks
            .iter()
            .map(|t| entry(&t.target.axis, t.target.axis.runtime.state()))
            .collect();
        let status = aggregate(&entries, &[]);
        if status.state != ElementState::Moving {
            events.push(PoolEvent::GroupStateChanged {
                group,
                old: ElementState::Moving,
                new: status.state,
            });
        }
        events.push(PoolEvent::GroupOperationEnded { group });
    }

    let aborted = control.abort_requested()
        || tracks.iter().any(|t| t.target.axis.runtime.abort_marked());
    for track in tracks {
        track.target.axis.runtime.release(control.id);
    }
    shared.finish(control);
    shared.bus.publish_all(events);

    match failure {
        Some(diagnostic) => SessionOutcome::Failed(diagnostic),
        None if aborted => SessionOutcome::Aborted,
        None => SessionOutcome::Completed,
    }
}

fn entry(axis: &Axis, state: ElementState) -> StateEntry {
    StateEntry {
        family: axis.family,
        alias: axis.alias.clone(),
        state,
    }
}

fn entries(tracks: &[Track<'_>], samples: &[Sample]) -> Vec<StateEntry> {
    tracks
        .iter()
        .enumerate()
        .map(|(idx, track)| {
            let state = samples
                .iter()
                .find(|s| s.idx == idx)
                .map(|s| s.state)
                .unwrap_or_else(|| track.target.axis.runtime.state());
            entry(&track.target.axis, state)
        })
        .collect()
}

fn position_event(axis: &Axis, read: PoolResult<f64>, forced: bool) -> PoolEvent {
    let position = match read {
        Ok(value) => {
            axis.runtime.record_position(value);
            Ok(value)
        }
        Err(err) => {
            warn!(element = %axis.name, error = %err, "position read failed");
            Err(err.to_string())
        }
    };
    PoolEvent::ElementPositionChanged {
        element: axis.id,
        position,
        forced,
    }
}

/// Change-filtered position notifications of a periodic read.
fn position_events(plan: &Plan, tracks: &[Track<'_>], samples: &[Sample], events: &mut Vec<PoolEvent>) {
    let mut all_read = true;
    for s in samples {
        let axis = &tracks[s.idx].target.axis;
        match &s.position {
            Some(Ok(value)) => {
                if axis.runtime.record_position(*value) {
                    events.push(PoolEvent::ElementPositionChanged {
                        element: axis.id,
                        position: Ok(*value),
                        forced: false,
                    });
                }
            }
            Some(Err(err)) => {
                all_read = false;
                warn!(element = %axis.name, error = %err, "position read failed");
                events.push(PoolEvent::ElementPositionChanged {
                    element: axis.id,
                    position: Err(err.to_string()),
                    forced: false,
                });
            }
            None => all_read = false,
        }
    }

    let Some(group) = plan.group else {
        return;
    };
    if !all_read {
        return;
    }
    let positions: Option<Vec<f64>> = tracks
        .iter()
        .map(|t| t.target.axis.runtime.status().position)
        .collect();
    if let Some(positions) = positions {
        match kinematics::to_user(&plan.snapshot, &plan.closure, &positions) {
            Ok(positions) => events.push(PoolEvent::GroupPositionChanged { group, positions }),
            Err(err) => warn!(error = %err, "user positions unavailable"),
        }
    }
}

/// Lock elements then controllers, both ascending. Guards release in reverse.
async fn lock_axes(axes: &[&Axis]) -> Vec<OwnedMutexGuard<()>> {
    let mut elements: Vec<&Axis> = axes.to_vec();
    elements.sort_by_key(|a| a.id);
    elements.dedup_by_key(|a| a.id);

    let mut controllers: Vec<&Arc<Controller>> = elements.iter().map(|a| &a.controller).collect();
    controllers.sort_by_key(|c| c.id);
    controllers.dedup_by_key(|c| c.id);

    let mut guards = Vec::with_capacity(elements.len() + controllers.len());
    for axis in elements {
        guards.push(axis.runtime.lock_owned().await);
    }
    for ctrl in controllers {
        guards.push(ctrl.lock_owned().await);
    }
    guards
}

fn unlock(mut guards: Vec<OwnedMutexGuard<()>>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

async fn sample(tracks: &[Track<'_>], pending: &[usize], with_positions: bool) -> Vec<Sample> {
    let axes: Vec<&Axis> = pending.iter().map(|i| &tracks[*i].target.axis).collect();
    let guards = lock_axes(&axes).await;

    let mut samples = Vec::with_capacity(pending.len());
    for (idx, axis) in pending.iter().zip(&axes) {
        let (state, status) = axis.read_state().await;
        if state.is_error() {
            debug!(element = %axis.name, %state, %status, "raw state");
        }
        let position = if with_positions {
            Some(axis.controller.read_one(axis.axis, &axis.name).await)
        } else {
            None
        };
        samples.push(Sample {
            idx: *idx,
            state,
            position,
        });
    }

    unlock(guards);
    samples
}

async fn read_positions(tracks: &[Track<'_>], idxs: &[usize]) -> Vec<PoolResult<f64>> {
    let axes: Vec<&Axis> = idxs.iter().map(|i| &tracks[*i].target.axis).collect();
    let guards = lock_axes(&axes).await;
    let mut reads = Vec::with_capacity(axes.len());
    for axis in &axes {
        reads.push(axis.controller.read_one(axis.axis, &axis.name).await);
    }
    unlock(guards);
    reads
}
