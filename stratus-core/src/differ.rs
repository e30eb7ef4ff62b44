//! Differ - Compare desired state with current state to generate a Plan
//!
//! Compares the "desired state" declared in configuration with the "current
//! state" recorded for it, and generates a list of required Effects (Plan).

use std::collections::{HashMap, HashSet};

use crate::effect::Effect;
use crate::plan::Plan;
use crate::resource::{Resource, ResourceId, State, Value};
use crate::timeouts::TIMEOUTS_ATTRIBUTE;

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Resource does not exist -> needs creation
    Create(Resource),
    /// Resource exists with differences -> needs update
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource was left tainted by a failed create -> delete, then create
    Replace { from: State, to: Resource },
    /// Resource exists with no differences -> no action needed
    NoChange(ResourceId),
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange(_))
    }
}

/// Compare desired state with current state to compute a Diff
pub fn diff(desired: &Resource, current: &State) -> Diff {
    if !current.exists {
        return Diff::Create(desired.clone());
    }
    if current.tainted {
        return Diff::Replace {
            from: current.clone(),
            to: desired.clone(),
        };
    }

    let changed = find_changed_attributes(&desired.attributes, &current.attributes);

    if changed.is_empty() {
        Diff::NoChange(desired.id.clone())
    } else {
        Diff::Update {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    }
}

/// Find changed attributes between desired and current state
fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
) -> Vec<String> {
    let mut changed = Vec::new();

    for (key, desired_value) in desired {
        // Skip internal attributes (starting with _) and wait settings
        if key.starts_with('_') || key == TIMEOUTS_ATTRIBUTE {
            continue;
        }

        match (current.get(key), desired_value) {
            (Some(current_value), _) if current_value == desired_value => {}
            // Unresolved reference: known only after apply
            (Some(_), Value::ResourceRef(..)) => {}
            _ => changed.push(key.clone()),
        }
    }

    changed.sort();
    changed
}

/// Compute Diff for multiple resources and generate a Plan
///
/// Data sources always produce a Read. Resources recorded in state but no
/// longer declared are deleted after every other effect.
pub fn create_plan(desired: &[Resource], current_states: &HashMap<ResourceId, State>) -> Plan {
    let mut plan = Plan::new();

    for resource in desired {
        if resource.is_data_source() {
            plan.add(Effect::Read(resource.clone()));
            continue;
        }

        let current = current_states
            .get(&resource.id)
            .cloned()
            .unwrap_or_else(|| State::not_found(resource.id.clone()));

        match diff(resource, &current) {
            Diff::Create(r) => plan.add(Effect::Create(r)),
            Diff::Update { id, from, to, .. } => plan.add(Effect::Update { id, from, to }),
            Diff::Replace { from, to } => {
                if let Some(delete) = delete_effect(&from) {
                    plan.add(delete);
                }
                plan.add(Effect::Create(to));
            }
            Diff::NoChange(_) => {}
        }
    }

    let declared: HashSet<&ResourceId> = desired.iter().map(|r| &r.id).collect();
    for effect in orphan_deletes(current_states, |id| !declared.contains(id)) {
        plan.add(effect);
    }

    plan
}

/// Plan deleting every managed resource, dependents first
///
/// `order` is the creation order of declared resources; anything else in
/// state is deleted last.
pub fn destroy_plan(order: &[ResourceId], current_states: &HashMap<ResourceId, State>) -> Plan {
    let mut plan = Plan::new();

    for id in order.iter().rev() {
        if let Some(effect) = current_states.get(id).and_then(delete_effect) {
            plan.add(effect);
        }
    }

    let ordered: HashSet<&ResourceId> = order.iter().collect();
    for effect in orphan_deletes(current_states, |id| !ordered.contains(id)) {
        plan.add(effect);
    }

    plan
}

fn orphan_deletes(
    current_states: &HashMap<ResourceId, State>,
    is_orphan: impl Fn(&ResourceId) -> bool,
) -> Vec<Effect> {
    let mut orphans: Vec<&State> = current_states
        .values()
        .filter(|state| is_orphan(&state.id))
        .collect();
    orphans.sort_by(|a, b| a.id.cmp(&b.id));
    orphans.into_iter().filter_map(delete_effect).collect()
}

fn delete_effect(state: &State) -> Option<Effect> {
    let identifier = state.identifier.clone()?;
    state.exists.then(|| Effect::Delete {
        id: state.id.clone(),
        identifier,
        last: state.clone(),
    })
}
