//! Typed snapshots of VPC resources and the request bodies that create or
//! modify them

use serde::{Deserialize, Serialize};
use stratus_core::status::{Observed, StatusReason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub status_reasons: Vec<StatusReason>,
    pub vpc: String,
    pub zone: String,
    pub profile: String,
    pub image: String,
    pub primary_network_interface: Option<String>,
    pub boot_volume: Option<String>,
    #[serde(default)]
    pub volume_attachments: Vec<VolumeAttachment>,
}

impl Observed for Instance {
    fn status(&self) -> &str {
        &self.status
    }

    fn status_reasons(&self) -> &[StatusReason] {
        &self.status_reasons
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: String,
    pub name: String,
    pub status: String,
    pub instance_id: String,
    pub volume_id: String,
    /// The instance's boot volume
    pub boot: bool,
    pub delete_volume_on_instance_delete: bool,
}

impl Observed for VolumeAttachment {
    fn status(&self) -> &str {
        &self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachmentRef {
    pub id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub status_reasons: Vec<StatusReason>,
    pub zone: String,
    pub profile: String,
    /// GB
    pub capacity: i64,
    pub iops: Option<i64>,
    pub source_snapshot: Option<String>,
    #[serde(default)]
    pub attachments: Vec<VolumeAttachmentRef>,
}

impl Observed for Volume {
    fn status(&self) -> &str {
        &self.status
    }

    fn status_reasons(&self) -> &[StatusReason] {
        &self.status_reasons
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub lifecycle_state: String,
    pub source_volume: String,
    pub size: i64,
    pub bootable: bool,
}

impl Observed for Snapshot {
    fn status(&self) -> &str {
        &self.lifecycle_state
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub status: String,
    pub subnet: String,
    pub primary_ip: Option<String>,
    pub allow_ip_spoofing: bool,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

impl Observed for NetworkInterface {
    fn status(&self) -> &str {
        &self.status
    }
}

/// Security groups have no lifecycle status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub vpc: String,
    /// Ids of network interfaces bound to this group
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

/// Traffic filter owned by a security group
///
/// Ports apply to `tcp` and `udp`, type and code to `icmp`; `all` carries
/// neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub direction: String,
    pub ip_version: String,
    pub protocol: String,
    /// Address, CIDR block or security group id
    pub remote: Option<String>,
    pub port_min: Option<i64>,
    pub port_max: Option<i64>,
    pub icmp_type: Option<i64>,
    pub icmp_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePrototype {
    pub name: String,
    pub vpc: String,
    pub zone: String,
    pub profile: String,
    pub image: String,
    /// Subnet of the primary network interface
    pub subnet: String,
    /// Delete the boot volume together with the instance
    pub auto_delete_volume: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePatch {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachmentPrototype {
    pub volume_id: String,
    pub name: Option<String>,
    pub delete_volume_on_instance_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePrototype {
    pub name: String,
    pub zone: String,
    pub profile: String,
    pub capacity: i64,
    pub iops: Option<i64>,
    pub source_snapshot: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePatch {
    pub name: Option<String>,
    pub capacity: Option<i64>,
    pub iops: Option<i64>,
    pub profile: Option<String>,
}

impl VolumePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPrototype {
    pub name: String,
    pub source_volume: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfacePrototype {
    pub name: String,
    pub subnet: String,
    pub allow_ip_spoofing: bool,
    pub primary_ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfacePatch {
    pub name: Option<String>,
    pub allow_ip_spoofing: Option<bool>,
}

impl NetworkInterfacePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupPrototype {
    pub name: String,
    pub vpc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRulePrototype {
    pub direction: String,
    pub ip_version: String,
    pub protocol: String,
    pub remote: Option<String>,
    pub port_min: Option<i64>,
    pub port_max: Option<i64>,
    pub icmp_type: Option<i64>,
    pub icmp_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRulePatch {
    pub direction: Option<String>,
    pub ip_version: Option<String>,
    pub remote: Option<String>,
    pub port_min: Option<i64>,
    pub port_max: Option<i64>,
    pub icmp_type: Option<i64>,
    pub icmp_code: Option<i64>,
}

impl SecurityGroupRulePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
