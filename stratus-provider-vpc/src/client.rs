//! Resource Client for the VPC API
//!
//! One method per remote call. Each call is a single request awaited to
//! completion; a 404 answer is reported as an [`ApiError`] whose
//! `is_not_found()` is true.

use async_trait::async_trait;
use stratus_core::provider::ProviderError;
use stratus_core::refresh::RemoteError;
use thiserror::Error;

use crate::model::{
    Instance, InstancePatch, InstancePrototype, NetworkInterface, NetworkInterfacePatch,
    NetworkInterfacePrototype, SecurityGroup, SecurityGroupPrototype, SecurityGroupRule,
    SecurityGroupRulePatch, SecurityGroupRulePrototype, Snapshot, SnapshotPrototype, Volume,
    VolumeAttachment, VolumeAttachmentPrototype, VolumePatch, VolumePrototype,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}{}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct ApiError {
    /// HTTP status, absent for transport failures
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::new(404, "not_found", format!("{} {} not found", kind, id))
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "transport_error".to_string(),
            message: message.into(),
        }
    }

    /// Wrap into a provider error with context
    pub fn context(self, context: impl std::fmt::Display) -> ProviderError {
        ProviderError::new(format!("{}: {}", context, self)).with_cause(self)
    }
}

impl RemoteError for ApiError {
    fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Reboot,
}

impl InstanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceAction::Start => "start",
            InstanceAction::Stop => "stop",
            InstanceAction::Reboot => "reboot",
        }
    }
}

impl std::str::FromStr for InstanceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(InstanceAction::Start),
            "stop" => Ok(InstanceAction::Stop),
            "reboot" => Ok(InstanceAction::Reboot),
            other => Err(format!(
                "unknown instance action '{}', expected start, stop or reboot",
                other
            )),
        }
    }
}

#[async_trait]
pub trait VpcClient: Send + Sync {
    // Instances
    async fn get_instance(&self, id: &str) -> ApiResult<Instance>;
    async fn create_instance(&self, prototype: &InstancePrototype) -> ApiResult<Instance>;
    async fn update_instance(&self, id: &str, patch: &InstancePatch) -> ApiResult<Instance>;
    async fn delete_instance(&self, id: &str) -> ApiResult<()>;
    async fn create_instance_action(
        &self,
        id: &str,
        action: InstanceAction,
        force: bool,
    ) -> ApiResult<()>;

    // Instance volume attachments
    async fn list_volume_attachments(&self, instance_id: &str) -> ApiResult<Vec<VolumeAttachment>>;
    async fn get_volume_attachment(
        &self,
        instance_id: &str,
        attachment_id: &str,
    ) -> ApiResult<VolumeAttachment>;
    async fn create_volume_attachment(
        &self,
        instance_id: &str,
        prototype: &VolumeAttachmentPrototype,
    ) -> ApiResult<VolumeAttachment>;
    async fn delete_volume_attachment(&self, instance_id: &str, attachment_id: &str)
    -> ApiResult<()>;

    // Volumes
    async fn get_volume(&self, id: &str) -> ApiResult<Volume>;
    async fn create_volume(&self, prototype: &VolumePrototype) -> ApiResult<Volume>;
    async fn update_volume(&self, id: &str, patch: &VolumePatch) -> ApiResult<Volume>;
    async fn delete_volume(&self, id: &str) -> ApiResult<()>;

    // Snapshots
    async fn get_snapshot(&self, id: &str) -> ApiResult<Snapshot>;
    async fn create_snapshot(&self, prototype: &SnapshotPrototype) -> ApiResult<Snapshot>;
    async fn update_snapshot(&self, id: &str, name: &str) -> ApiResult<Snapshot>;
    async fn delete_snapshot(&self, id: &str) -> ApiResult<()>;
    async fn delete_snapshots_for_volume(&self, volume_id: &str) -> ApiResult<()>;

    // Instance network interfaces
    async fn get_network_interface(
        &self,
        instance_id: &str,
        id: &str,
    ) -> ApiResult<NetworkInterface>;
    async fn create_network_interface(
        &self,
        instance_id: &str,
        prototype: &NetworkInterfacePrototype,
    ) -> ApiResult<NetworkInterface>;
    async fn update_network_interface(
        &self,
        instance_id: &str,
        id: &str,
        patch: &NetworkInterfacePatch,
    ) -> ApiResult<NetworkInterface>;
    async fn delete_network_interface(&self, instance_id: &str, id: &str) -> ApiResult<()>;

    // Security groups
    async fn get_security_group(&self, id: &str) -> ApiResult<SecurityGroup>;
    async fn create_security_group(
        &self,
        prototype: &SecurityGroupPrototype,
    ) -> ApiResult<SecurityGroup>;
    async fn delete_security_group(&self, id: &str) -> ApiResult<()>;
    /// Ids of every target bound to the group
    async fn list_security_group_targets(&self, security_group_id: &str) -> ApiResult<Vec<String>>;
    async fn create_security_group_target_binding(
        &self,
        security_group_id: &str,
        target_id: &str,
    ) -> ApiResult<()>;
    async fn delete_security_group_target_binding(
        &self,
        security_group_id: &str,
        target_id: &str,
    ) -> ApiResult<()>;

    // Security group rules
    async fn get_security_group_rule(
        &self,
        security_group_id: &str,
        id: &str,
    ) -> ApiResult<SecurityGroupRule>;
    async fn create_security_group_rule(
        &self,
        security_group_id: &str,
        prototype: &SecurityGroupRulePrototype,
    ) -> ApiResult<SecurityGroupRule>;
    async fn update_security_group_rule(
        &self,
        security_group_id: &str,
        id: &str,
        patch: &SecurityGroupRulePatch,
    ) -> ApiResult<SecurityGroupRule>;
    async fn delete_security_group_rule(&self, security_group_id: &str, id: &str)
    -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_404_is_not_found() {
        assert!(ApiError::not_found("volume", "vol-1").is_not_found());
        assert!(!ApiError::new(409, "conflict", "busy").is_not_found());
        assert!(!ApiError::transport("connection reset").is_not_found());
    }

    #[test]
    fn display_includes_status_when_known() {
        assert_eq!(
            ApiError::new(409, "conflict", "busy").to_string(),
            "conflict: busy (HTTP 409)"
        );
        assert_eq!(
            ApiError::transport("reset").to_string(),
            "transport_error: reset"
        );
    }

    #[test]
    fn actions_parse() {
        assert_eq!("stop".parse::<InstanceAction>(), Ok(InstanceAction::Stop));
        assert!("halt".parse::<InstanceAction>().is_err());
    }
}
