//! Security groups
//!
//! Groups are created synchronously and carry no lifecycle status, so no
//! handler here waits.

use stratus_core::data::ResourceData;
use stratus_core::provider::{ProviderError, ProviderResult, ResourceType};
use stratus_core::refresh::{RemoteError, ResourceHandle};
use stratus_core::timeouts::Timeouts;

use crate::config::security_group_prototype;
use crate::context::{ResourceResultExt, VpcContext, string_list};
use crate::model::SecurityGroup;

pub const RESOURCE_TYPE: &str = "security_group";

pub struct SecurityGroupType;

impl ResourceType for SecurityGroupType {
    fn name(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::from_minutes(10, 10, 10)
    }
}

fn record(data: &mut ResourceData, group: &SecurityGroup) {
    data.set_str("id", &group.id);
    data.set_str("name", &group.name);
    data.set_str("vpc", &group.vpc);
    data.set("targets", string_list(group.targets.iter().cloned()));
}

pub async fn create(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let prototype = security_group_prototype(data)?;
    let group = ctx
        .client
        .create_security_group(&prototype)
        .await
        .map_err(|e| e.context(format!("error creating security group {}", prototype.name)))
        .for_resource(&id)?;
    log::info!("Created security group {} ({})", id, group.id);
    data.set_identifier(&group.id);
    record(data, &group);
    Ok(())
}

pub async fn read(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    match ctx.client.get_security_group(handle.as_str()).await {
        Ok(group) => {
            record(data, &group);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            Ok(())
        }
        Err(e) => Err(e.context(format!("error getting security group {}", handle)))
            .for_resource(data.id()),
    }
}

pub async fn update(_ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    Err(ProviderError::new(
        "changing security group attributes requires replacement",
    ))
    .for_resource(data.id())
}

/// Removes every target binding before deleting the group itself
pub async fn delete(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let Some(handle) = data.handle() else {
        return Ok(());
    };

    let targets = match ctx.client.list_security_group_targets(handle.as_str()).await {
        Ok(targets) => targets,
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            return Ok(());
        }
        Err(e) => {
            return Err(e.context(format!("error listing targets of {}", handle)))
                .for_resource(&id);
        }
    };

    for target in &targets {
        match ctx
            .client
            .delete_security_group_target_binding(handle.as_str(), target)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(e.context(format!("error unbinding {} from {}", target, handle)))
                    .for_resource(&id);
            }
        }
    }

    match ctx.client.delete_security_group(handle.as_str()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(e.context(format!("error deleting security group {}", handle)))
                .for_resource(&id);
        }
    }
    data.clear_identifier();
    Ok(())
}

pub async fn exists(ctx: &VpcContext, handle: &ResourceHandle) -> ProviderResult<bool> {
    match ctx.client.get_security_group(handle.as_str()).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.context(format!("error checking security group {}", handle))),
    }
}
