//! ResourceData - the declarative store a handler reads from and writes to
//!
//! Handlers read configured values by key and write observed values back as
//! they discover them, even before a wait finishes, so an interrupted
//! operation still leaves its partial progress behind.

use std::collections::HashMap;

use crate::provider::ProviderError;
use crate::refresh::ResourceHandle;
use crate::resource::{Resource, ResourceId, State, Value};
use crate::timeouts::{Operation, Timeouts};

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceData {
    id: ResourceId,
    identifier: Option<String>,
    config: HashMap<String, Value>,
    observed: HashMap<String, Value>,
    prior: Option<HashMap<String, Value>>,
    timeouts: Timeouts,
}

impl ResourceData {
    pub fn new(id: ResourceId, timeouts: Timeouts) -> Self {
        Self {
            id,
            identifier: None,
            config: HashMap::new(),
            observed: HashMap::new(),
            prior: None,
            timeouts,
        }
    }

    /// Desired configuration, optionally paired with the last known state
    pub fn from_resource(
        resource: &Resource,
        prior: Option<&State>,
        defaults: Timeouts,
    ) -> Result<Self, ProviderError> {
        let timeouts = defaults
            .with_overrides(&resource.attributes)
            .map_err(|e| ProviderError::new(e).for_resource(resource.id.clone()))?;

        Ok(Self {
            id: resource.id.clone(),
            identifier: prior.and_then(|s| s.identifier.clone()),
            config: resource.attributes.clone(),
            observed: HashMap::new(),
            prior: prior.map(|s| s.attributes.clone()),
            timeouts,
        })
    }

    /// Data for an operation driven only by recorded state, such as delete
    pub fn from_state(state: &State, defaults: Timeouts) -> Self {
        let timeouts = defaults
            .with_overrides(&state.attributes)
            .unwrap_or(defaults);
        Self {
            id: state.id.clone(),
            identifier: state.identifier.clone(),
            config: state.attributes.clone(),
            observed: HashMap::new(),
            prior: Some(state.attributes.clone()),
            timeouts,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        self.identifier.as_deref().map(ResourceHandle::new)
    }

    pub fn set_identifier(&mut self, identifier: impl Into<String>) {
        self.identifier = Some(identifier.into());
    }

    /// The remote resource is gone
    pub fn clear_identifier(&mut self) {
        self.identifier = None;
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn timeout(&self, operation: Operation) -> std::time::Duration {
        self.timeouts.get(operation)
    }

    /// Configured value, falling back to what has been observed
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key).or_else(|| self.observed.get(key))
    }

    pub fn get_observed(&self, key: &str) -> Option<&Value> {
        self.observed.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the configured value differs from the last known state
    ///
    /// Keys absent from the configuration never count as changed, even when
    /// an observed value was recorded for them.
    pub fn has_change(&self, key: &str) -> bool {
        let Some(configured) = self.config.get(key) else {
            return false;
        };
        match &self.prior {
            Some(prior) => prior.get(key) != Some(configured),
            None => true,
        }
    }

    /// Value of `key` in the last known state
    pub fn prior(&self, key: &str) -> Option<&Value> {
        self.prior.as_ref().and_then(|p| p.get(key))
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.observed.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    /// Configuration overlaid with observed values, as recorded in state
    pub fn into_state(self) -> State {
        let Some(identifier) = self.identifier else {
            return State::not_found(self.id);
        };
        let mut attributes = self.config;
        attributes.extend(self.observed);
        State::existing(self.id, attributes).with_identifier(identifier)
    }
}
