//! Element registry.
//!
//! The registry owns identity and controller ownership of every element,
//! controller and group. Readers take an immutable [`Snapshot`] (`Arc`) and
//! never observe a half-applied change: every mutation clones the current
//! snapshot, applies the change, rebuilds all group closures from scratch and
//! swaps the result in, all under one writer lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::controller::{Controller, ControllerAdapter, Driver, PseudoController};
use crate::element::{ControllerId, Element, ElementId, ElementKind, Family, GroupId};
use crate::error::{PoolError, PoolResult};
use crate::group::{self, Closure};

/// A user-facing member of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Member {
    /// Physical or pseudo element.
    Element(ElementId),
    /// Nested group.
    Group(GroupId),
}

/// Group definition: ordered members plus per-group settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Registry identity.
    pub id: GroupId,
    /// Unique name.
    pub name: String,
    /// Members in user-vector order.
    pub members: Vec<Member>,
    /// Overrides the engine's default settle delay.
    pub settle_delay: Option<Duration>,
}

/// Immutable view of the registry.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    controllers: BTreeMap<ControllerId, Arc<Controller>>,
    controller_names: HashMap<String, ControllerId>,
    elements: BTreeMap<ElementId, Element>,
    groups: BTreeMap<GroupId, Group>,
    names: HashMap<String, Member>,
    closures: HashMap<GroupId, Arc<Closure>>,
    next_id: u32,
}

impl Snapshot {
    /// Controller by id.
    pub fn controller(&self, id: ControllerId) -> PoolResult<&Arc<Controller>> {
        self.controllers
            .get(&id)
            .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
    }

    /// Controller by name.
    pub fn controller_by_name(&self, name: &str) -> PoolResult<&Arc<Controller>> {
        let id = self
            .controller_names
            .get(name)
            .ok_or_else(|| PoolError::ElementNotFound(name.to_string()))?;
        self.controller(*id)
    }

    /// Element by id.
    pub fn element(&self, id: ElementId) -> PoolResult<&Element> {
        self.elements
            .get(&id)
            .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
    }

    /// Element by name; group names do not match.
    pub fn element_by_name(&self, name: &str) -> PoolResult<&Element> {
        match self.resolve(name)? {
            Member::Element(id) => self.element(id),
            Member::Group(_) => Err(PoolError::ElementNotFound(name.to_string())),
        }
    }

    /// Group by id.
    pub fn group(&self, id: GroupId) -> PoolResult<&Group> {
        self.groups
            .get(&id)
            .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
    }

    /// Group by name; element names do not match.
    pub fn group_by_name(&self, name: &str) -> PoolResult<&Group> {
        match self.resolve(name)? {
            Member::Group(id) => self.group(id),
            Member::Element(_) => Err(PoolError::ElementNotFound(name.to_string())),
        }
    }

    /// Resolve an element or group name.
    pub fn resolve(&self, name: &str) -> PoolResult<Member> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| PoolError::ElementNotFound(name.to_string()))
    }

    /// Every group, ascending id.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Every element, ascending id.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    /// Cached closure of a group.
    pub fn closure(&self, group: GroupId) -> PoolResult<Arc<Closure>> {
        self.closures
            .get(&group)
            .cloned()
            .ok_or_else(|| PoolError::ElementNotFound(group.to_string()))
    }

    fn member_name(&self, member: Member) -> String {
        match member {
            Member::Element(id) => self.elements.get(&id).map(|e| e.name.clone()),
            Member::Group(id) => self.groups.get(&id).map(|g| g.name.clone()),
        }
        .unwrap_or_else(|| format!("{member:?}"))
    }

    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn claim_name(&mut self, name: &str, member: Member) -> PoolResult<()> {
        if self.names.contains_key(name) || self.controller_names.contains_key(name) {
            return Err(PoolError::InvalidGroupState(format!(
                "name '{name}' is already in use"
            )));
        }
        self.names.insert(name.to_string(), member);
        Ok(())
    }

    /// The member itself and, for groups, everything listed in it, recursively.
    fn explicit(&self, member: Member, out: &mut BTreeSet<Member>) {
        if !out.insert(member) {
            return;
        }
        if let Member::Group(id) = member {
            if let Some(group) = self.groups.get(&id) {
                for inner in &group.members {
                    self.explicit(*inner, out);
                }
            }
        }
    }

    /// Everything the member touches: `explicit` plus pseudo inputs, recursively.
    fn reach(&self, member: Member, out: &mut BTreeSet<Member>) {
        if !out.insert(member) {
            return;
        }
        match member {
            Member::Group(id) => {
                if let Some(group) = self.groups.get(&id) {
                    for inner in &group.members {
                        self.reach(*inner, out);
                    }
                }
            }
            Member::Element(id) => {
                if let Some(ElementKind::Pseudo { uses, .. }) =
                    self.elements.get(&id).map(|e| &e.kind)
                {
                    for used in uses {
                        self.reach(Member::Element(*used), out);
                    }
                }
            }
        }
    }

    /// Groups listing `member` directly.
    fn parents(&self, member: Member) -> Vec<GroupId> {
        self.groups
            .values()
            .filter(|g| g.members.contains(&member))
            .map(|g| g.id)
            .collect()
    }

    /// `group` and every group containing it, transitively.
    fn with_ancestors(&self, group: GroupId) -> Vec<GroupId> {
        let mut found = vec![group];
        let mut idx = 0;
        while idx < found.len() {
            for parent in self.parents(Member::Group(found[idx])) {
                if !found.contains(&parent) {
                    found.push(parent);
                }
            }
            idx += 1;
        }
        found
    }

    fn check_membership(&self, group: GroupId, member: Member) -> PoolResult<()> {
        let mut new_explicit = BTreeSet::new();
        self.explicit(member, &mut new_explicit);
        let mut new_reach = BTreeSet::new();
        self.reach(member, &mut new_reach);

        for host in self.with_ancestors(group) {
            let duplicate = |conflict: Member| PoolError::DuplicateMembership {
                element: self.member_name(conflict),
                group: self.member_name(Member::Group(host)),
            };

            // cycle
            if new_reach.contains(&Member::Group(host)) {
                return Err(duplicate(member));
            }

            let mut host_explicit = BTreeSet::new();
            self.explicit(Member::Group(host), &mut host_explicit);
            host_explicit.remove(&Member::Group(host));
            let mut host_reach = BTreeSet::new();
            self.reach(Member::Group(host), &mut host_reach);
            host_reach.remove(&Member::Group(host));

            if let Some(conflict) = new_explicit.intersection(&host_reach).next() {
                return Err(duplicate(*conflict));
            }
            if let Some(conflict) = new_reach.intersection(&host_explicit).next() {
                return Err(duplicate(*conflict));
            }
        }
        Ok(())
    }

    fn in_use(&self, member: Member) -> Option<String> {
        if let Some(parent) = self.parents(member).first() {
            return Some(self.member_name(Member::Group(*parent)));
        }
        if let Member::Element(id) = member {
            return self
                .elements
                .values()
                .find(|e| matches!(&e.kind, ElementKind::Pseudo { uses, .. } if uses.contains(&id)))
                .map(|e| e.name.clone());
        }
        None
    }

    fn rebuild_closures(&mut self) -> PoolResult<()> {
        self.closures = group::build_all(self)?;
        Ok(())
    }
}

/// Shared, snapshot-swapping registry.
#[derive(Debug, Default)]
pub struct Registry {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current immutable view.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    fn update<T>(&self, change: impl FnOnce(&mut Snapshot) -> PoolResult<T>) -> PoolResult<T> {
        let _writer = self.writer.lock();
        let mut next = Snapshot::clone(&self.current.read());
        let out = change(&mut next)?;
        next.rebuild_closures()?;
        *self.current.write() = Arc::new(next);
        Ok(out)
    }

    fn register_controller(&self, name: &str, driver: Driver) -> PoolResult<ControllerId> {
        self.update(|snap| {
            if snap.controller_names.contains_key(name) || snap.names.contains_key(name) {
                return Err(PoolError::InvalidGroupState(format!(
                    "name '{name}' is already in use"
                )));
            }
            let id = ControllerId(snap.allocate());
            snap.controllers
                .insert(id, Arc::new(Controller::new(id, name, driver)));
            snap.controller_names.insert(name.to_string(), id);
            tracing::debug!(controller = name, %id, "controller registered");
            Ok(id)
        })
    }

    /// Register a hardware controller.
    pub fn register_hardware(
        &self,
        name: &str,
        adapter: Arc<dyn ControllerAdapter>,
    ) -> PoolResult<ControllerId> {
        self.register_controller(name, Driver::Physical(adapter))
    }

    /// Register a pseudo (transform) controller.
    pub fn register_pseudo(
        &self,
        name: &str,
        calculator: Arc<dyn PseudoController>,
    ) -> PoolResult<ControllerId> {
        self.register_controller(name, Driver::Pseudo(calculator))
    }

    /// Register a physical element on axis `axis` of a hardware controller.
    pub fn register_physical(
        &self,
        name: &str,
        controller: ControllerId,
        axis: usize,
        family: Family,
    ) -> PoolResult<ElementId> {
        self.update(|snap| {
            let ctrl = snap.controller(controller)?;
            if ctrl.is_pseudo() {
                return Err(PoolError::InvalidGroupState(format!(
                    "controller '{}' is a pseudo controller",
                    ctrl.name
                )));
            }
            let taken = snap.elements.values().any(|e| {
                matches!(e.kind, ElementKind::Physical { controller: c, axis: a, .. } if c == controller && a == axis)
            });
            if taken {
                return Err(PoolError::InvalidGroupState(format!(
                    "axis {axis} of controller '{}' is already registered",
                    ctrl.name
                )));
            }
            let id = ElementId(snap.allocate());
            snap.claim_name(name, Member::Element(id))?;
            snap.elements.insert(
                id,
                Element::new(
                    id,
                    name,
                    ElementKind::Physical {
                        controller,
                        axis,
                        family,
                    },
                ),
            );
            Ok(id)
        })
    }

    /// Register pseudo role `role` of a pseudo controller computed from `uses`.
    ///
    /// Every pseudo element of one controller must name the same `uses`, one
    /// element per physical role of the controller.
    pub fn register_pseudo_element(
        &self,
        name: &str,
        controller: ControllerId,
        role: usize,
        uses: &[&str],
    ) -> PoolResult<ElementId> {
        self.update(|snap| {
            let ctrl = Arc::clone(snap.controller(controller)?);
            if !ctrl.is_pseudo() {
                return Err(PoolError::InvalidGroupState(format!(
                    "controller '{}' has no transform",
                    ctrl.name
                )));
            }
            if role >= ctrl.pseudo_role_count() {
                return Err(PoolError::InvalidGroupState(format!(
                    "controller '{}' has no pseudo role {role}",
                    ctrl.name
                )));
            }
            if uses.len() != ctrl.physical_role_count() {
                return Err(PoolError::ArityMismatch {
                    expected: ctrl.physical_role_count(),
                    actual: uses.len(),
                });
            }
            let used: Vec<ElementId> = uses
                .iter()
                .map(|n| snap.element_by_name(n).map(|e| e.id))
                .collect::<PoolResult<_>>()?;

            for sibling in snap.elements.values() {
                if let ElementKind::Pseudo {
                    controller: c,
                    role: r,
                    uses: u,
                } = &sibling.kind
                {
                    if *c != controller {
                        continue;
                    }
                    if *r == role {
                        return Err(PoolError::InvalidGroupState(format!(
                            "role {role} of controller '{}' is already '{}'",
                            ctrl.name, sibling.name
                        )));
                    }
                    if *u != used {
                        return Err(PoolError::InvalidGroupState(format!(
                            "'{name}' must use the same elements as '{}'",
                            sibling.name
                        )));
                    }
                }
            }

            let id = ElementId(snap.allocate());
            snap.claim_name(name, Member::Element(id))?;
            snap.elements.insert(
                id,
                Element::new(
                    id,
                    name,
                    ElementKind::Pseudo {
                        controller,
                        role,
                        uses: used,
                    },
                ),
            );
            Ok(id)
        })
    }

    /// Create a group from an ordered list of element or group names.
    pub fn create_group(&self, name: &str, members: &[&str]) -> PoolResult<GroupId> {
        self.update(|snap| {
            let id = GroupId(snap.allocate());
            snap.claim_name(name, Member::Group(id))?;
            snap.groups.insert(
                id,
                Group {
                    id,
                    name: name.to_string(),
                    members: Vec::new(),
                    settle_delay: None,
                },
            );
            for member in members {
                add_member_to(snap, id, member)?;
            }
            Ok(id)
        })
    }

    /// Append a member to a group.
    pub fn add_member(&self, group: &str, member: &str) -> PoolResult<()> {
        self.update(|snap| {
            let id = snap.group_by_name(group)?.id;
            add_member_to(snap, id, member)
        })
    }

    /// Remove a direct member from a group.
    pub fn remove_member(&self, group: &str, member: &str) -> PoolResult<()> {
        self.update(|snap| {
            let id = snap.group_by_name(group)?.id;
            let target = snap.resolve(member)?;
            let members = &mut snap
                .groups
                .get_mut(&id)
                .ok_or_else(|| PoolError::ElementNotFound(group.to_string()))?
                .members;
            let idx = members.iter().position(|m| *m == target).ok_or_else(|| {
                PoolError::ElementNotFound(format!("{member} is not a member of {group}"))
            })?;
            members.remove(idx);
            Ok(())
        })
    }

    /// Unregister an element no group or pseudo element refers to.
    pub fn remove_element(&self, name: &str) -> PoolResult<()> {
        self.update(|snap| {
            let id = snap.element_by_name(name)?.id;
            if let Some(user) = snap.in_use(Member::Element(id)) {
                return Err(PoolError::InvalidGroupState(format!(
                    "'{name}' is still used by '{user}'"
                )));
            }
            snap.elements.remove(&id);
            snap.names.remove(name);
            Ok(())
        })
    }

    /// Delete a group no other group contains.
    pub fn remove_group(&self, name: &str) -> PoolResult<()> {
        self.update(|snap| {
            let id = snap.group_by_name(name)?.id;
            if let Some(user) = snap.in_use(Member::Group(id)) {
                return Err(PoolError::InvalidGroupState(format!(
                    "'{name}' is still used by '{user}'"
                )));
            }
            snap.groups.remove(&id);
            snap.names.remove(name);
            Ok(())
        })
    }

    /// Set the signed backlash of a physical element.
    pub fn set_backlash(&self, element: &str, backlash: f64) -> PoolResult<()> {
        if !backlash.is_finite() {
            return Err(PoolError::InvalidGroupState(format!(
                "backlash of '{element}' must be finite"
            )));
        }
        self.update(|snap| {
            let id = snap.element_by_name(element)?.id;
            let entry = snap
                .elements
                .get_mut(&id)
                .ok_or_else(|| PoolError::ElementNotFound(element.to_string()))?;
            if !entry.is_physical() {
                return Err(PoolError::InvalidGroupState(format!(
                    "'{element}' is not a physical element"
                )));
            }
            entry.backlash = backlash;
            Ok(())
        })
    }

    /// Change the alias shown in diagnostics.
    pub fn set_alias(&self, element: &str, alias: &str) -> PoolResult<()> {
        self.update(|snap| {
            let id = snap.element_by_name(element)?.id;
            if let Some(entry) = snap.elements.get_mut(&id) {
                entry.alias = alias.to_string();
            }
            Ok(())
        })
    }

    /// Override the settle delay of one group.
    pub fn set_settle_delay(&self, group: &str, delay: Option<Duration>) -> PoolResult<()> {
        self.update(|snap| {
            let id = snap.group_by_name(group)?.id;
            if let Some(entry) = snap.groups.get_mut(&id) {
                entry.settle_delay = delay;
            }
            Ok(())
        })
    }

    /// Mark a controller as (not) instantiated by its hosting layer.
    pub fn set_instantiated(&self, controller: &str, instantiated: bool) -> PoolResult<()> {
        let snap = self.snapshot();
        snap.controller_by_name(controller)?
            .set_instantiated(instantiated);
        Ok(())
    }
}

fn add_member_to(snap: &mut Snapshot, group: GroupId, name: &str) -> PoolResult<()> {
    let member = snap.resolve(name)?;
    snap.check_membership(group, member)?;
    snap.groups
        .get_mut(&group)
        .ok_or_else(|| PoolError::ElementNotFound(group.to_string()))?
        .members
        .push(member);
    Ok(())
}
