//! Group composition and physical closure.
//!
//! A [`Closure`] is everything an operation on a group needs to know without
//! walking the registry again: the de-duplicated physical elements, the
//! controllers involved, the pseudo transform batches and the mapping from
//! user-vector slots to elements. Closures are derived data. The registry
//! rebuilds all of them from scratch whenever membership changes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::element::{ControllerId, Element, ElementId, GroupId, Transformable};
use crate::error::{PoolError, PoolResult};
use crate::registry::{Member, Snapshot};

/// What one entry of a user vector addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSlot {
    /// Physical element that is a direct member.
    Physical(ElementId),
    /// Pseudo element that is a direct member.
    Pseudo {
        /// The pseudo element.
        element: ElementId,
        /// Its pseudo controller.
        controller: ControllerId,
        /// Its role in that controller.
        role: usize,
    },
    /// One physical element of a nested group's closure.
    Nested {
        /// The nested group.
        group: GroupId,
        /// The physical element.
        element: ElementId,
    },
}

/// Pseudo roles of one controller touched by a group.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformBatch {
    /// Pseudo controller.
    pub controller: ControllerId,
    /// Number of its pseudo roles.
    pub role_count: usize,
    /// Inputs of the controller, in physical role order. May be pseudo.
    pub uses: Vec<ElementId>,
    /// `(role, element)` requested through the group's own slots, by role.
    pub present: Vec<(usize, ElementId)>,
    /// Every pseudo role of the controller is present in the group.
    pub complete: bool,
    /// 0 when every input is physical, else one more than the deepest input.
    pub depth: usize,
}

/// Flattened view of a group (or of a single element).
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    /// `None` for a single-element closure.
    pub group: Option<GroupId>,
    /// What each user vector entry addresses.
    pub user_slots: Vec<UserSlot>,
    /// De-duplicated physical elements, in discovery order.
    pub physical: Vec<ElementId>,
    /// Hardware controllers of `physical`, ascending.
    pub controllers: Vec<ControllerId>,
    /// Pseudo controllers, ascending.
    pub pseudo_controllers: Vec<ControllerId>,
    /// Inner-most first.
    pub batches: Vec<TransformBatch>,
}

impl Closure {
    /// Length of user vectors for this closure.
    pub fn user_len(&self) -> usize {
        self.user_slots.len()
    }

    /// Every controller involved, ascending: the controller lock order.
    pub fn implied_controllers(&self) -> Vec<ControllerId> {
        let all: BTreeSet<ControllerId> = self
            .controllers
            .iter()
            .chain(self.pseudo_controllers.iter())
            .copied()
            .collect();
        all.into_iter().collect()
    }

    /// Index of `element` in `physical`.
    pub fn position_of(&self, element: ElementId) -> Option<usize> {
        self.physical.iter().position(|e| *e == element)
    }

    /// Whether `element` is one of the physical elements.
    pub fn contains(&self, element: ElementId) -> bool {
        self.position_of(element).is_some()
    }

    /// Batch of a pseudo controller.
    pub fn batch(&self, controller: ControllerId) -> Option<&TransformBatch> {
        self.batches.iter().find(|b| b.controller == controller)
    }
}

struct Builder<'a> {
    snapshot: &'a Snapshot,
    group: Option<GroupId>,
    slots: Vec<UserSlot>,
    physical: Vec<ElementId>,
    seen: HashSet<ElementId>,
    hardware: BTreeSet<ControllerId>,
    batches: BTreeMap<ControllerId, TransformBatch>,
}

impl<'a> Builder<'a> {
    fn new(snapshot: &'a Snapshot, group: Option<GroupId>) -> Self {
        Self {
            snapshot,
            group,
            slots: Vec::new(),
            physical: Vec::new(),
            seen: HashSet::new(),
            hardware: BTreeSet::new(),
            batches: BTreeMap::new(),
        }
    }

    fn add_physical(&mut self, element: &Element) {
        if self.seen.insert(element.id) {
            self.physical.push(element.id);
            self.hardware.insert(element.controller());
        }
    }

    /// Register the batch of a pseudo element and pull in what it uses.
    /// Returns the batch depth.
    fn add_pseudo(&mut self, element: &Element) -> PoolResult<usize> {
        let Some((controller, _, uses)) = element.transform_role() else {
            return Ok(0);
        };

        if let Some(batch) = self.batches.get(&controller) {
            return Ok(batch.depth);
        }

        let mut depth = 0;
        for used in uses {
            let used = self.snapshot.element(*used)?;
            if used.is_physical() {
                self.add_physical(used);
            } else {
                depth = depth.max(self.add_pseudo(used)? + 1);
            }
        }

        let ctrl = self.snapshot.controller(controller)?;
        self.batches.insert(
            controller,
            TransformBatch {
                controller,
                role_count: ctrl.pseudo_role_count(),
                uses: uses.to_vec(),
                present: Vec::new(),
                complete: false,
                depth,
            },
        );
        Ok(depth)
    }

    fn add_member(
        &mut self,
        member: Member,
        nested: &HashMap<GroupId, Arc<Closure>>,
    ) -> PoolResult<()> {
        match member {
            Member::Element(id) => {
                let element = self.snapshot.element(id)?;
                match element.transform_role() {
                    None => {
                        self.add_physical(element);
                        self.slots.push(UserSlot::Physical(id));
                    }
                    Some((controller, role, _)) => {
                        self.add_pseudo(element)?;
                        if let Some(batch) = self.batches.get_mut(&controller) {
                            batch.present.push((role, id));
                        }
                        self.slots.push(UserSlot::Pseudo {
                            element: id,
                            controller,
                            role,
                        });
                    }
                }
            }
            Member::Group(gid) => {
                let inner = nested.get(&gid).ok_or_else(|| {
                    PoolError::InvalidGroupState(format!("closure of {gid} is not built"))
                })?;
                for id in &inner.physical {
                    let element = self.snapshot.element(*id)?;
                    self.add_physical(element);
                    self.slots.push(UserSlot::Nested {
                        group: gid,
                        element: *id,
                    });
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Closure {
        let mut batches: Vec<TransformBatch> = self
            .batches
            .into_values()
            .map(|mut batch| {
                batch.present.sort_by_key(|(role, _)| *role);
                batch.complete = batch.role_count > 0 && batch.present.len() == batch.role_count;
                batch
            })
            .collect();
        batches.sort_by_key(|b| (b.depth, b.controller));

        let mut pseudo_controllers: Vec<ControllerId> =
            batches.iter().map(|b| b.controller).collect();
        pseudo_controllers.sort();

        Closure {
            group: self.group,
            user_slots: self.slots,
            physical: self.physical,
            controllers: self.hardware.into_iter().collect(),
            pseudo_controllers,
            batches,
        }
    }
}

/// Build the closure of `group`. Closures of nested groups must be in `nested`.
pub(crate) fn build(
    snapshot: &Snapshot,
    group: GroupId,
    nested: &HashMap<GroupId, Arc<Closure>>,
) -> PoolResult<Closure> {
    let definition = snapshot.group(group)?;
    let mut builder = Builder::new(snapshot, Some(group));
    for member in &definition.members {
        builder.add_member(*member, nested)?;
    }
    Ok(builder.finish())
}

/// Closure of a lone element, for single-element operations.
pub fn for_element(snapshot: &Snapshot, element: ElementId) -> PoolResult<Closure> {
    let mut builder = Builder::new(snapshot, None);
    builder.add_member(Member::Element(element), &HashMap::new())?;
    Ok(builder.finish())
}

/// Build every group's closure, nested groups first.
pub(crate) fn build_all(snapshot: &Snapshot) -> PoolResult<HashMap<GroupId, Arc<Closure>>> {
    let mut built: HashMap<GroupId, Arc<Closure>> = HashMap::new();
    let ids: Vec<GroupId> = snapshot.groups().map(|g| g.id).collect();
    for id in ids {
        build_into(snapshot, id, &mut built)?;
    }
    Ok(built)
}

fn build_into(
    snapshot: &Snapshot,
    group: GroupId,
    built: &mut HashMap<GroupId, Arc<Closure>>,
) -> PoolResult<()> {
    if built.contains_key(&group) {
        return Ok(());
    }
    for member in &snapshot.group(group)?.members {
        if let Member::Group(inner) = member {
            build_into(snapshot, *inner, built)?;
        }
    }
    let closure = build(snapshot, group, built)?;
    built.insert(group, Arc::new(closure));
    Ok(())
}
