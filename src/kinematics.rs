//! Conversion between user-space and physical-space vectors.
//!
//! User vectors follow the group's slot order (see [`Closure::user_slots`]);
//! physical vectors follow [`Closure::physical`]. Pseudo values go through
//! their controller's transform: requests are resolved outer controller first
//! on the way down and inner controller first on the way up.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::element::{ControllerId, ElementId, ElementKind, Transformable};
use crate::error::{PoolError, PoolResult};
use crate::group::{Closure, UserSlot};
use crate::registry::Snapshot;

/// Physical targets for every element of `closure.physical`.
///
/// Batches whose roles are only partly requested read the current positions
/// of the controller's inputs, so this may touch hardware (`read_one`). No
/// element is commanded here.
pub async fn to_physical(
    snapshot: &Snapshot,
    closure: &Closure,
    user: &[f64],
) -> PoolResult<Vec<f64>> {
    if user.len() != closure.user_len() {
        return Err(PoolError::ArityMismatch {
            expected: closure.user_len(),
            actual: user.len(),
        });
    }

    let mut targets: HashMap<ElementId, f64> = HashMap::new();
    let mut requests: HashMap<ControllerId, BTreeMap<usize, f64>> = HashMap::new();

    for (slot, value) in closure.user_slots.iter().zip(user) {
        match slot {
            UserSlot::Physical(element) | UserSlot::Nested { element, .. } => {
                targets.insert(*element, *value);
            }
            UserSlot::Pseudo {
                controller, role, ..
            } => {
                requests.entry(*controller).or_default().insert(*role, *value);
            }
        }
    }

    for batch in closure.batches.iter().rev() {
        let Some(requested) = requests.remove(&batch.controller) else {
            continue;
        };
        let ctrl = snapshot.controller(batch.controller)?;

        let pseudo = if requested.len() == batch.role_count {
            requested.values().copied().collect::<Vec<_>>()
        } else {
            let current = current_values(snapshot, &batch.uses).await?;
            let mut merged = ctrl.calc_forward(&current)?;
            for (role, value) in &requested {
                if let Some(slot) = merged.get_mut(*role) {
                    *slot = *value;
                }
            }
            merged
        };

        let physical = ctrl.calc_inverse(&pseudo)?;
        tracing::trace!(controller = %ctrl.name, ?pseudo, ?physical, "inverse transform");

        for (used, value) in batch.uses.iter().zip(physical) {
            match snapshot.element(*used)?.transform_role() {
                // explicit slots win over computed ones
                None => {
                    targets.entry(*used).or_insert(value);
                }
                Some((controller, role, _)) => {
                    requests
                        .entry(controller)
                        .or_default()
                        .entry(role)
                        .or_insert(value);
                }
            }
        }
    }

    closure
        .physical
        .iter()
        .map(|id| {
            targets.get(id).copied().ok_or_else(|| {
                PoolError::InvalidGroupState(format!("no target computed for {id}"))
            })
        })
        .collect()
}

/// User vector for the physical positions `physical` (ordered as
/// `closure.physical`).
pub fn to_user(snapshot: &Snapshot, closure: &Closure, physical: &[f64]) -> PoolResult<Vec<f64>> {
    if physical.len() != closure.physical.len() {
        return Err(PoolError::ArityMismatch {
            expected: closure.physical.len(),
            actual: physical.len(),
        });
    }

    let positions: HashMap<ElementId, f64> = closure
        .physical
        .iter()
        .copied()
        .zip(physical.iter().copied())
        .collect();
    let mut pseudo: HashMap<(ControllerId, usize), f64> = HashMap::new();

    let value_of = |id: ElementId, pseudo: &HashMap<(ControllerId, usize), f64>| -> PoolResult<f64> {
        let found = match snapshot.element(id)?.transform_role() {
            None => positions.get(&id).copied(),
            Some((controller, role, _)) => pseudo.get(&(controller, role)).copied(),
        };
        found.ok_or_else(|| PoolError::InvalidGroupState(format!("no value for {id}")))
    };

    for batch in &closure.batches {
        let inputs = batch
            .uses
            .iter()
            .map(|id| value_of(*id, &pseudo))
            .collect::<PoolResult<Vec<_>>>()?;
        let values = snapshot.controller(batch.controller)?.calc_forward(&inputs)?;
        for (role, value) in values.into_iter().enumerate() {
            pseudo.insert((batch.controller, role), value);
        }
    }

    closure
        .user_slots
        .iter()
        .map(|slot| match slot {
            UserSlot::Physical(element) | UserSlot::Nested { element, .. } => {
                value_of(*element, &pseudo)
            }
            UserSlot::Pseudo { element, .. } => value_of(*element, &pseudo),
        })
        .collect()
}

/// Live values of `elements`; pseudo elements are computed from their inputs.
pub fn current_values<'a>(
    snapshot: &'a Snapshot,
    elements: &'a [ElementId],
) -> BoxFuture<'a, PoolResult<Vec<f64>>> {
    async move {
        let mut values = Vec::with_capacity(elements.len());
        for id in elements {
            let element = snapshot.element(*id)?;
            let value = match &element.kind {
                ElementKind::Physical {
                    controller, axis, ..
                } => {
                    let value = snapshot
                        .controller(*controller)?
                        .read_one(*axis, &element.name)
                        .await?;
                    element.runtime().record_position(value);
                    value
                }
                ElementKind::Pseudo {
                    controller,
                    role,
                    uses,
                } => {
                    let inputs = current_values(snapshot, uses).await?;
                    let pseudo = snapshot.controller(*controller)?.calc_forward(&inputs)?;
                    pseudo.get(*role).copied().ok_or_else(|| {
                        PoolError::InvalidGroupState(format!("no pseudo role {role} for {id}"))
                    })?
                }
            };
            values.push(value);
        }
        Ok(values)
    }
    .boxed()
}
