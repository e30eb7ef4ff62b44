//! Typed configuration read out of a [`ResourceData`]

use stratus_core::data::ResourceData;
use stratus_core::provider::ProviderError;
use stratus_core::resource::{ResourceId, Value};
use thiserror::Error;

use crate::client::InstanceAction;
use crate::model::{
    InstancePrototype, NetworkInterfacePrototype, SecurityGroupPrototype,
    SecurityGroupRulePrototype, SnapshotPrototype, VolumePrototype,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{resource}: missing required attribute '{attribute}'")]
    Missing {
        resource: ResourceId,
        attribute: &'static str,
    },

    #[error("{resource}: attribute '{attribute}' must be {expected}")]
    InvalidType {
        resource: ResourceId,
        attribute: &'static str,
        expected: &'static str,
    },

    #[error("{resource}: invalid value for '{attribute}': {message}")]
    InvalidValue {
        resource: ResourceId,
        attribute: &'static str,
        message: String,
    },
}

impl From<ConfigError> for ProviderError {
    fn from(e: ConfigError) -> Self {
        let resource = match &e {
            ConfigError::Missing { resource, .. }
            | ConfigError::InvalidType { resource, .. }
            | ConfigError::InvalidValue { resource, .. } => resource.clone(),
        };
        ProviderError::new(e.to_string()).for_resource(resource)
    }
}

/// Typed accessors that report the offending attribute
struct Reader<'a> {
    data: &'a ResourceData,
}

impl<'a> Reader<'a> {
    fn new(data: &'a ResourceData) -> Self {
        Self { data }
    }

    fn invalid_type(&self, attribute: &'static str, expected: &'static str) -> ConfigError {
        ConfigError::InvalidType {
            resource: self.data.id().clone(),
            attribute,
            expected,
        }
    }

    fn string(&self, attribute: &'static str) -> Result<String, ConfigError> {
        self.optional_string(attribute)?
            .ok_or_else(|| ConfigError::Missing {
                resource: self.data.id().clone(),
                attribute,
            })
    }

    fn optional_string(&self, attribute: &'static str) -> Result<Option<String>, ConfigError> {
        match self.data.get(attribute) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid_type(attribute, "a string")),
        }
    }

    fn optional_int(&self, attribute: &'static str) -> Result<Option<i64>, ConfigError> {
        match self.data.get(attribute) {
            None => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(_) => Err(self.invalid_type(attribute, "an integer")),
        }
    }

    fn bool_or(&self, attribute: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.data.get(attribute) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.invalid_type(attribute, "a boolean")),
        }
    }

    fn string_list(&self, attribute: &'static str) -> Result<Vec<String>, ConfigError> {
        match self.data.get(attribute) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(self.invalid_type(attribute, "a list of strings")),
                })
                .collect(),
            Some(_) => Err(self.invalid_type(attribute, "a list of strings")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub prototype: InstancePrototype,
    /// Data volumes attached after the instance is up
    pub volumes: Vec<String>,
    /// Minutes a start or stop may stall before corrective action; 0 disables
    pub force_recovery_time: i64,
    pub wait_before_delete: bool,
    pub action: Option<InstanceAction>,
    pub force_action: bool,
}

impl InstanceConfig {
    pub fn from_data(data: &ResourceData) -> Result<Self, ConfigError> {
        let r = Reader::new(data);
        let action = r
            .optional_string("action")?
            .map(|a| {
                a.parse().map_err(|message| ConfigError::InvalidValue {
                    resource: data.id().clone(),
                    attribute: "action",
                    message,
                })
            })
            .transpose()?;

        let force_recovery_time = r.optional_int("force_recovery_time")?.unwrap_or(0);
        if force_recovery_time < 0 {
            return Err(ConfigError::InvalidValue {
                resource: data.id().clone(),
                attribute: "force_recovery_time",
                message: "must not be negative".to_string(),
            });
        }

        Ok(Self {
            prototype: InstancePrototype {
                name: r.optional_string("name")?.unwrap_or_else(|| data.id().name.clone()),
                vpc: r.string("vpc")?,
                zone: r.string("zone")?,
                profile: r.string("profile")?,
                image: r.string("image")?,
                subnet: r.string("subnet")?,
                auto_delete_volume: r.bool_or("auto_delete_volume", true)?,
            },
            volumes: r.string_list("volumes")?,
            force_recovery_time,
            wait_before_delete: r.bool_or("wait_before_delete", true)?,
            action,
            force_action: r.bool_or("force_action", false)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub prototype: VolumePrototype,
    pub delete_all_snapshots: bool,
}

impl VolumeConfig {
    pub fn from_data(data: &ResourceData) -> Result<Self, ConfigError> {
        let r = Reader::new(data);
        let capacity = r.optional_int("capacity")?.unwrap_or(100);
        if !(10..=16000).contains(&capacity) {
            return Err(ConfigError::InvalidValue {
                resource: data.id().clone(),
                attribute: "capacity",
                message: format!("{} is outside 10..=16000 GB", capacity),
            });
        }

        Ok(Self {
            prototype: VolumePrototype {
                name: r.optional_string("name")?.unwrap_or_else(|| data.id().name.clone()),
                zone: r.string("zone")?,
                profile: r
                    .optional_string("profile")?
                    .unwrap_or_else(|| "general-purpose".to_string()),
                capacity,
                iops: r.optional_int("iops")?,
                source_snapshot: r.optional_string("source_snapshot")?,
            },
            delete_all_snapshots: r.bool_or("delete_all_snapshots", false)?,
        })
    }
}

pub fn snapshot_prototype(data: &ResourceData) -> Result<SnapshotPrototype, ConfigError> {
    let r = Reader::new(data);
    Ok(SnapshotPrototype {
        name: r.optional_string("name")?.unwrap_or_else(|| data.id().name.clone()),
        source_volume: r.string("source_volume")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceConfig {
    pub instance: String,
    pub prototype: NetworkInterfacePrototype,
    pub security_groups: Vec<String>,
}

impl NetworkInterfaceConfig {
    pub fn from_data(data: &ResourceData) -> Result<Self, ConfigError> {
        let r = Reader::new(data);
        Ok(Self {
            instance: r.string("instance")?,
            prototype: NetworkInterfacePrototype {
                name: r.optional_string("name")?.unwrap_or_else(|| data.id().name.clone()),
                subnet: r.string("subnet")?,
                allow_ip_spoofing: r.bool_or("allow_ip_spoofing", false)?,
                primary_ip: r.optional_string("primary_ip")?,
            },
            security_groups: r.string_list("security_groups")?,
        })
    }
}

pub fn security_group_prototype(
    data: &ResourceData,
) -> Result<SecurityGroupPrototype, ConfigError> {
    let r = Reader::new(data);
    Ok(SecurityGroupPrototype {
        name: r.optional_string("name")?.unwrap_or_else(|| data.id().name.clone()),
        vpc: r.string("vpc")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRuleConfig {
    pub security_group: String,
    pub prototype: SecurityGroupRulePrototype,
}

impl SecurityGroupRuleConfig {
    pub fn from_data(data: &ResourceData) -> Result<Self, ConfigError> {
        let r = Reader::new(data);
        let invalid = |attribute: &'static str, message: String| ConfigError::InvalidValue {
            resource: data.id().clone(),
            attribute,
            message,
        };
        let one_of = |attribute: &'static str, value: String, allowed: &[&str]| {
            if allowed.contains(&value.as_str()) {
                Ok(value)
            } else {
                Err(invalid(
                    attribute,
                    format!("'{}' is not one of {}", value, allowed.join(", ")),
                ))
            }
        };

        let direction = one_of("direction", r.string("direction")?, &["inbound", "outbound"])?;
        let ip_version = one_of(
            "ip_version",
            r.optional_string("ip_version")?.unwrap_or_else(|| "ipv4".to_string()),
            &["ipv4", "ipv6"],
        )?;
        let protocol = one_of(
            "protocol",
            r.optional_string("protocol")?.unwrap_or_else(|| "all".to_string()),
            &["all", "tcp", "udp", "icmp"],
        )?;

        let mut prototype = SecurityGroupRulePrototype {
            direction,
            ip_version,
            protocol,
            remote: r.optional_string("remote")?,
            port_min: None,
            port_max: None,
            icmp_type: None,
            icmp_code: None,
        };

        let port_min = r.optional_int("port_min")?;
        let port_max = r.optional_int("port_max")?;
        let icmp_type = r.optional_int("icmp_type")?;
        let icmp_code = r.optional_int("icmp_code")?;

        match prototype.protocol.as_str() {
            "tcp" | "udp" => {
                if icmp_type.is_some() || icmp_code.is_some() {
                    return Err(invalid("icmp_type", "only applies to icmp".to_string()));
                }
                // A single bound covers one port
                let (min, max) = match (port_min, port_max) {
                    (None, None) => (1, 65535),
                    (Some(min), None) => (min, min),
                    (None, Some(max)) => (max, max),
                    (Some(min), Some(max)) => (min, max),
                };
                if !(1..=65535).contains(&min) || !(1..=65535).contains(&max) || min > max {
                    return Err(invalid(
                        "port_min",
                        format!("{}..={} is not a port range within 1..=65535", min, max),
                    ));
                }
                prototype.port_min = Some(min);
                prototype.port_max = Some(max);
            }
            "icmp" => {
                if port_min.is_some() || port_max.is_some() {
                    return Err(invalid("port_min", "only applies to tcp and udp".to_string()));
                }
                if icmp_code.is_some() && icmp_type.is_none() {
                    return Err(invalid("icmp_code", "requires icmp_type".to_string()));
                }
                if let Some(t) = icmp_type.filter(|t| !(0..=254).contains(t)) {
                    return Err(invalid("icmp_type", format!("{} is outside 0..=254", t)));
                }
                if let Some(c) = icmp_code.filter(|c| !(0..=255).contains(c)) {
                    return Err(invalid("icmp_code", format!("{} is outside 0..=255", c)));
                }
                prototype.icmp_type = icmp_type;
                prototype.icmp_code = icmp_code;
            }
            _ => {
                if [port_min, port_max, icmp_type, icmp_code].iter().any(Option::is_some) {
                    return Err(invalid(
                        "protocol",
                        "ports and icmp settings need a specific protocol".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            security_group: r.string("security_group")?,
            prototype,
        })
    }
}
