//! Security group rules
//!
//! The remote identifier is `security_group_id/rule_id`. Rules carry no
//! lifecycle status. Every mutation runs under the owning group's lock, since
//! the API rejects concurrent changes to one group's rules.

use stratus_core::data::ResourceData;
use stratus_core::lock::LockKey;
use stratus_core::provider::{ProviderError, ProviderResult, ResourceType};
use stratus_core::refresh::{RemoteError, ResourceHandle};
use stratus_core::resource::Value;
use stratus_core::timeouts::Timeouts;

use crate::config::SecurityGroupRuleConfig;
use crate::context::{
    ResourceResultExt, VpcContext, child_handle, missing_identifier, split_handle,
};
use crate::model::{SecurityGroupRule, SecurityGroupRulePatch};
use crate::security_group;

pub const RESOURCE_TYPE: &str = "security_group_rule";

/// Attributes a rule cannot change in place
const REPLACE_ON_CHANGE: [&str; 2] = ["security_group", "protocol"];

pub struct SecurityGroupRuleType;

impl ResourceType for SecurityGroupRuleType {
    fn name(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::from_minutes(10, 10, 10)
    }
}

fn group_lock(security_group_id: &str) -> LockKey {
    LockKey::new(security_group::RESOURCE_TYPE, security_group_id)
}

fn record(data: &mut ResourceData, security_group_id: &str, rule: &SecurityGroupRule) {
    data.set_str("rule_id", &rule.id);
    data.set_str("security_group", security_group_id);
    data.set_str("direction", &rule.direction);
    data.set_str("ip_version", &rule.ip_version);
    data.set_str("protocol", &rule.protocol);
    if let Some(remote) = &rule.remote {
        data.set_str("remote", remote);
    }
    let ints = [
        ("port_min", rule.port_min),
        ("port_max", rule.port_max),
        ("icmp_type", rule.icmp_type),
        ("icmp_code", rule.icmp_code),
    ];
    for (key, value) in ints {
        if let Some(value) = value {
            data.set(key, Value::Int(value));
        }
    }
}

fn parse_handle(data: &ResourceData, handle: &ResourceHandle) -> ProviderResult<(String, String)> {
    let (group, rule) = split_handle(handle)
        .map_err(|e| e.context("malformed security group rule identifier"))
        .for_resource(data.id())?;
    Ok((group.to_string(), rule.to_string()))
}

pub async fn create(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let config = SecurityGroupRuleConfig::from_data(data)?;

    let _guard = ctx.locks.lock(&group_lock(&config.security_group)).await;
    let rule = ctx
        .client
        .create_security_group_rule(&config.security_group, &config.prototype)
        .await
        .map_err(|e| {
            e.context(format!(
                "error creating security group rule in {}",
                config.security_group
            ))
        })
        .for_resource(&id)?;
    let handle = child_handle(&config.security_group, &rule.id);
    log::info!("Created security group rule {} ({})", id, handle);
    data.set_identifier(handle.as_str());
    record(data, &config.security_group, &rule);
    Ok(())
}

pub async fn read(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    let (group_id, rule_id) = parse_handle(data, &handle)?;
    match ctx.client.get_security_group_rule(&group_id, &rule_id).await {
        Ok(rule) => {
            record(data, &group_id, &rule);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            Ok(())
        }
        Err(e) => Err(e.context(format!("error getting security group rule {}", handle)))
            .for_resource(data.id()),
    }
}

pub async fn update(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let handle = data.handle().ok_or_else(|| missing_identifier(&id))?;
    let (group_id, rule_id) = parse_handle(data, &handle)?;
    if let Some(key) = REPLACE_ON_CHANGE.iter().find(|k| data.has_change(k)) {
        return Err(ProviderError::new(format!(
            "changing '{}' of a security group rule requires replacement",
            key
        )))
        .for_resource(&id);
    }
    let config = SecurityGroupRuleConfig::from_data(data)?;
    let prototype = config.prototype;

    let mut patch = SecurityGroupRulePatch::default();
    if data.has_change("direction") {
        patch.direction = Some(prototype.direction);
    }
    if data.has_change("ip_version") {
        patch.ip_version = Some(prototype.ip_version);
    }
    if data.has_change("remote") {
        patch.remote = prototype.remote;
    }
    if data.has_change("port_min") || data.has_change("port_max") {
        patch.port_min = prototype.port_min;
        patch.port_max = prototype.port_max;
    }
    if data.has_change("icmp_type") || data.has_change("icmp_code") {
        patch.icmp_type = prototype.icmp_type;
        patch.icmp_code = prototype.icmp_code;
    }
    if patch.is_empty() {
        return Ok(());
    }

    let _guard = ctx.locks.lock(&group_lock(&group_id)).await;
    let rule = ctx
        .client
        .update_security_group_rule(&group_id, &rule_id, &patch)
        .await
        .map_err(|e| e.context(format!("error updating security group rule {}", handle)))
        .for_resource(&id)?;
    record(data, &group_id, &rule);
    Ok(())
}

pub async fn delete(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    let (group_id, rule_id) = parse_handle(data, &handle)?;

    let _guard = ctx.locks.lock(&group_lock(&group_id)).await;
    match ctx.client.delete_security_group_rule(&group_id, &rule_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(e.context(format!("error deleting security group rule {}", handle)))
                .for_resource(&id);
        }
    }
    data.clear_identifier();
    Ok(())
}

pub async fn exists(ctx: &VpcContext, handle: &ResourceHandle) -> ProviderResult<bool> {
    let (group_id, rule_id) = split_handle(handle)
        .map_err(|e| e.context("malformed security group rule identifier"))?;
    match ctx.client.get_security_group_rule(group_id, rule_id).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.context(format!("error checking security group rule {}", handle))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::VpcClient;
    use crate::sim::SimulatedVpc;
    use std::sync::Arc;
    use std::time::Duration;
    use stratus_core::resource::{Resource, State};

    struct Fixture {
        sim: Arc<SimulatedVpc>,
        ctx: VpcContext,
        group: String,
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedVpc::new());
        let group = sim.seed_security_group("web", "vpc-1");
        let ctx = VpcContext::new(sim.clone());
        Fixture { sim, ctx, group }
    }

    fn ssh(group: &str, port: i64) -> Resource {
        let s = |v: &str| Value::String(v.to_string());
        Resource::new(RESOURCE_TYPE, "ssh")
            .with_attribute("security_group", s(group))
            .with_attribute("direction", s("inbound"))
            .with_attribute("protocol", s("tcp"))
            .with_attribute("remote", s("10.0.0.0/8"))
            .with_attribute("port_min", Value::Int(port))
    }

    async fn created(f: &Fixture, resource: &Resource) -> State {
        let mut data =
            ResourceData::from_resource(resource, None, SecurityGroupRuleType.timeouts()).unwrap();
        create(&f.ctx, &mut data).await.unwrap();
        data.into_state()
    }

    #[tokio::test]
    async fn create_adds_rule_to_group() {
        let f = fixture();
        let state = created(&f, &ssh(&f.group, 22)).await;

        let identifier = state.identifier.clone().unwrap();
        assert!(identifier.starts_with(&format!("{}/rule-", f.group)));
        assert_eq!(state.attributes.get("port_max"), Some(&Value::Int(22)));

        let group = f.sim.get_security_group(&f.group).await.unwrap();
        assert_eq!(group.rules.len(), 1);
        assert_eq!(group.rules[0].remote.as_deref(), Some("10.0.0.0/8"));
        assert!(exists(&f.ctx, &ResourceHandle::new(&identifier)).await.unwrap());
    }

    #[tokio::test]
    async fn update_patches_ports_in_place() {
        let f = fixture();
        let state = created(&f, &ssh(&f.group, 22)).await;
        let identifier = state.identifier.clone().unwrap();

        let timeouts = SecurityGroupRuleType.timeouts();
        let mut data =
            ResourceData::from_resource(&ssh(&f.group, 2222), Some(&state), timeouts).unwrap();
        data.set_identifier(&identifier);
        update(&f.ctx, &mut data).await.unwrap();

        assert_eq!(data.identifier(), Some(identifier.as_str()));
        let (_, rule_id) = identifier.split_once('/').unwrap();
        let rule = f.sim.get_security_group_rule(&f.group, rule_id).await.unwrap();
        assert_eq!((rule.port_min, rule.port_max), (Some(2222), Some(2222)));
    }

    #[tokio::test]
    async fn protocol_change_requires_replacement() {
        let f = fixture();
        let state = created(&f, &ssh(&f.group, 22)).await;

        let udp = ssh(&f.group, 22).with_attribute("protocol", Value::String("udp".into()));
        let timeouts = SecurityGroupRuleType.timeouts();
        let mut data = ResourceData::from_resource(&udp, Some(&state), timeouts).unwrap();
        data.set_identifier(state.identifier.clone().unwrap());
        let err = update(&f.ctx, &mut data).await.unwrap_err();

        assert!(err.to_string().contains("'protocol'"), "{err}");
        assert!(
            !f.sim
                .calls()
                .iter()
                .any(|c| c.starts_with("update_security_group_rule"))
        );
    }

    #[tokio::test]
    async fn delete_removes_rule_and_tolerates_missing_one() {
        let f = fixture();
        let state = created(&f, &ssh(&f.group, 22)).await;
        let handle = ResourceHandle::new(state.identifier.clone().unwrap());

        let mut data = ResourceData::from_state(&state, SecurityGroupRuleType.timeouts());
        delete(&f.ctx, &mut data).await.unwrap();
        assert!(data.identifier().is_none());
        assert!(!exists(&f.ctx, &handle).await.unwrap());

        let mut again = ResourceData::from_state(&state, SecurityGroupRuleType.timeouts());
        delete(&f.ctx, &mut again).await.unwrap();
        assert!(again.identifier().is_none());
    }

    #[tokio::test]
    async fn read_clears_identifier_of_missing_rule() {
        let f = fixture();
        let id = ssh(&f.group, 22).id.clone();
        let mut data = ResourceData::new(id, SecurityGroupRuleType.timeouts());
        data.set_identifier(format!("{}/rule-gone", f.group));
        read(&f.ctx, &mut data).await.unwrap();
        assert!(data.identifier().is_none());
    }

    #[tokio::test]
    async fn malformed_identifier_is_rejected() {
        let f = fixture();
        let id = ssh(&f.group, 22).id.clone();
        let mut data = ResourceData::new(id, SecurityGroupRuleType.timeouts());
        data.set_identifier("rule-1");
        let err = read(&f.ctx, &mut data).await.unwrap_err();
        assert!(err.to_string().contains("malformed"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_on_one_group_are_serialized() {
        let f = fixture();
        let held = f.ctx.locks.lock(&group_lock(&f.group)).await;

        let ctx = f.ctx.clone();
        let resource = ssh(&f.group, 22);
        let task = tokio::spawn(async move {
            let mut data =
                ResourceData::from_resource(&resource, None, SecurityGroupRuleType.timeouts())
                    .unwrap();
            create(&ctx, &mut data).await
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(
            !f.sim
                .calls()
                .iter()
                .any(|c| c.starts_with("create_security_group_rule"))
        );

        drop(held);
        task.await.unwrap().unwrap();
        assert!(
            f.sim
                .calls()
                .iter()
                .any(|c| c.starts_with("create_security_group_rule"))
        );
    }
}
