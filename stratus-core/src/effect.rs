//! Effect - A side effect described as a value
//!
//! Nothing happens until an Effect is handed to an Interpreter.

use crate::resource::{Resource, ResourceId, State};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Read a data source
    Read(Resource),
    Create(Resource),
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
    },
    /// Delete a resource recorded in state
    Delete {
        id: ResourceId,
        identifier: String,
        last: State,
    },
}

impl Effect {
    pub fn id(&self) -> &ResourceId {
        match self {
            Effect::Read(r) | Effect::Create(r) => &r.id,
            Effect::Update { id, .. } | Effect::Delete { id, .. } => id,
        }
    }

    /// Whether this Effect changes the remote system
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Effect::Read(_))
    }

    /// Resource carrying the desired attributes, if any
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Effect::Read(r) | Effect::Create(r) => Some(r),
            Effect::Update { to, .. } => Some(to),
            Effect::Delete { .. } => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Effect::Read(_) => "<=",
            Effect::Create(_) => "+",
            Effect::Update { .. } => "~",
            Effect::Delete { .. } => "-",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Effect::Read(r) => format!("Read {}", r.id),
            Effect::Create(r) => format!("Create {}", r.id),
            Effect::Update { id, .. } => format!("Update {}", id),
            Effect::Delete { id, identifier, .. } => format!("Delete {} ({})", id, identifier),
        }
    }
}
