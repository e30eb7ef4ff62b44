//! Configuration file: provider settings and declared resources
//!
//! ```json
//! {
//!   "provider": { "poll_interval_secs": 10, "delay_secs": 10 },
//!   "resources": [
//!     { "type": "volume", "name": "data", "attributes": { "zone": "us-south-1" } },
//!     { "type": "instance", "name": "web",
//!       "attributes": { "volumes": ["${volume.data.id}"] } }
//!   ]
//! }
//! ```
//!
//! Strings of the form `${type.name.attr}` refer to another resource's
//! attribute and order that resource first.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use stratus_core::poller::PollSettings;
use stratus_core::resource::{Resource, ResourceId, State, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Resource {0} is declared twice")]
    Duplicate(ResourceId),

    #[error("{resource} refers to undeclared resource {binding}")]
    UnknownReference { resource: ResourceId, binding: String },

    #[error("Dependency cycle through {0}")]
    Cycle(ResourceId),
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderSettings {
    /// Seconds between two status polls
    pub poll_interval_secs: Option<u64>,
    /// Seconds before the first status poll
    pub delay_secs: Option<u64>,
}

impl ProviderSettings {
    /// Pacing for status polls; `override_interval` wins over the file
    pub fn poll_settings(&self, override_interval: Option<u64>) -> PollSettings {
        let defaults = PollSettings::default();
        let interval = override_interval.or(self.poll_interval_secs);
        PollSettings {
            delay: self
                .delay_secs
                .or(interval)
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
            min_interval: interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_interval),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Read an existing resource instead of managing it
    #[serde(default)]
    pub data: bool,
}

impl ResourceDecl {
    fn to_resource(&self) -> Resource {
        let mut resource =
            Resource::new(&self.resource_type, &self.name).with_read_only(self.data);
        for (key, value) in &self.attributes {
            if let Some(value) = Value::from_json(value) {
                resource.attributes.insert(key.clone(), value);
            }
        }
        resource
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

impl Config {
    /// Declared resources, dependencies first
    pub fn resources(&self) -> Result<Vec<Resource>, ConfigError> {
        let resources: Vec<Resource> = self.resources.iter().map(ResourceDecl::to_resource).collect();
        sort_by_dependencies(&resources)
    }
}

/// Topological order keeping declaration order among independent resources
pub fn sort_by_dependencies(resources: &[Resource]) -> Result<Vec<Resource>, ConfigError> {
    let mut by_binding: HashMap<String, &Resource> = HashMap::new();
    for resource in resources {
        if by_binding.insert(resource.id.binding(), resource).is_some() {
            return Err(ConfigError::Duplicate(resource.id.clone()));
        }
    }

    fn visit<'a>(
        resource: &'a Resource,
        by_binding: &HashMap<String, &'a Resource>,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        sorted: &mut Vec<Resource>,
    ) -> Result<(), ConfigError> {
        let binding = resource.id.binding();
        if visited.contains(&binding) {
            return Ok(());
        }
        if !visiting.insert(binding.clone()) {
            return Err(ConfigError::Cycle(resource.id.clone()));
        }

        for dep in resource.dependencies() {
            let dependency = by_binding
                .get(&dep)
                .ok_or_else(|| ConfigError::UnknownReference {
                    resource: resource.id.clone(),
                    binding: dep.clone(),
                })?;
            visit(dependency, by_binding, visited, visiting, sorted)?;
        }

        visiting.remove(&binding);
        visited.insert(binding);
        sorted.push(resource.clone());
        Ok(())
    }

    let mut sorted = Vec::with_capacity(resources.len());
    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();
    for resource in resources {
        visit(resource, &by_binding, &mut visited, &mut visiting, &mut sorted)?;
    }
    Ok(sorted)
}

/// Attributes reachable through `${type.name.attr}`, keyed by binding
pub type Bindings = HashMap<String, HashMap<String, Value>>;

/// Declared attributes completed with what state recorded for each resource
pub fn bindings_from_state(resources: &[Resource], states: &HashMap<ResourceId, State>) -> Bindings {
    let mut bindings = Bindings::new();
    for resource in resources {
        let mut attrs = resource.attributes.clone();
        if let Some(state) = states.get(&resource.id)
            && state.exists
        {
            for (k, v) in &state.attributes {
                attrs.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        bindings.insert(resource.id.binding(), attrs);
    }
    bindings
}

/// Record a fresh state for later references
pub fn bind_state(bindings: &mut Bindings, resource: &Resource, state: &State) {
    let mut attrs = resource.attributes.clone();
    attrs.extend(state.attributes.clone());
    bindings.insert(resource.id.binding(), attrs);
}

pub fn resolve_refs(resource: &Resource, bindings: &Bindings) -> Resource {
    let mut resolved = resource.clone();
    resolved.attributes = resource
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), resolve_ref_value(v, bindings)))
        .collect();
    resolved
}

fn resolve_ref_value(value: &Value, bindings: &Bindings) -> Value {
    match value {
        Value::ResourceRef(binding, attr) => {
            if let Some(attrs) = bindings.get(binding)
                && let Some(attr_value) = attrs.get(attr)
                && attr_value != value
            {
                return resolve_ref_value(attr_value, bindings);
            }
            // Known only after apply
            value.clone()
        }
        Value::List(items) => Value::List(items.iter().map(|v| resolve_ref_value(v, bindings)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_ref_value(v, bindings)))
                .collect(),
        ),
        _ => value.clone(),
    }
}
