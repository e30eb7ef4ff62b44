//! Block storage volumes

use std::sync::Arc;
use std::time::Duration;

use stratus_core::data::ResourceData;
use stratus_core::lock::LockKey;
use stratus_core::provider::{ProviderError, ProviderResult, ResourceType};
use stratus_core::refresh::{NotFound, RemoteError, ResourceHandle};
use stratus_core::resource::Value;
use stratus_core::status::{StatusClassifier, StatusTable};
use stratus_core::timeouts::{Operation, Timeouts};

use crate::config::VolumeConfig;
use crate::context::{
    Refresher, ResourceResultExt, VpcContext, missing_identifier, reasons_value, string_list,
};
use crate::instance;
use crate::model::{Volume, VolumePatch};

pub const RESOURCE_TYPE: &str = "volume";

pub mod status {
    pub const PENDING: &str = "pending";
    pub const PROVISIONING: &str = "provisioning";
    pub const UPDATING: &str = "updating";
    pub const AVAILABLE: &str = "available";
    pub const DELETING: &str = "deleting";
    pub const FAILED: &str = "failed";
    pub const UNUSABLE: &str = "unusable";
    /// Reported once the volume no longer exists
    pub const DELETE_DONE: &str = "done";
}

use status::*;

pub struct VolumeType;

impl ResourceType for VolumeType {
    fn name(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::from_minutes(10, 10, 10)
    }
}

fn classifier() -> Arc<dyn StatusClassifier> {
    Arc::new(
        StatusTable::new()
            .success([AVAILABLE])
            .failed([FAILED, UNUSABLE]),
    )
}

fn refresher<'a>(ctx: &VpcContext, handle: ResourceHandle) -> Refresher<'a, Volume> {
    ctx.refresher(handle, classifier(), |client, h| async move {
        client.get_volume(h.as_str()).await
    })
}

fn record(data: &mut ResourceData, volume: &Volume) {
    data.set_str("id", &volume.id);
    data.set_str("name", &volume.name);
    data.set_str("status", &volume.status);
    data.set("status_reasons", reasons_value(&volume.status_reasons));
    data.set_str("zone", &volume.zone);
    data.set_str("profile", &volume.profile);
    data.set("capacity", Value::Int(volume.capacity));
    if let Some(iops) = volume.iops {
        data.set("iops", Value::Int(iops));
    }
    if let Some(snapshot) = &volume.source_snapshot {
        data.set_str("source_snapshot", snapshot);
    }
    data.set(
        "attached_instances",
        string_list(volume.attachments.iter().map(|a| a.instance_id.clone())),
    );
}

async fn wait_available(
    ctx: &VpcContext,
    data: &mut ResourceData,
    handle: &ResourceHandle,
    timeout: Duration,
) -> ProviderResult<()> {
    let mut refresher = refresher(ctx, handle.clone()).observe(|v: &Volume| record(data, v));
    ctx.poller([PENDING, PROVISIONING, UPDATING], [AVAILABLE], timeout)
        .poll_until_done(&mut refresher)
        .await?;
    Ok(())
}

/// Wait until the volume no longer exists
pub(crate) async fn wait_deleted(
    ctx: &VpcContext,
    handle: &ResourceHandle,
    timeout: Duration,
) -> ProviderResult<()> {
    let mut refresher =
        refresher(ctx, handle.clone()).on_not_found(NotFound::Vanished(DELETE_DONE.to_string()));
    ctx.poller([DELETING, AVAILABLE], [DELETE_DONE], timeout)
        .poll_until_done(&mut refresher)
        .await?;
    Ok(())
}

pub async fn create(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let config = VolumeConfig::from_data(data)?;

    let volume = ctx
        .client
        .create_volume(&config.prototype)
        .await
        .map_err(|e| e.context("error creating volume"))
        .for_resource(&id)?;
    log::info!("Created volume {} ({})", id, volume.id);
    data.set_identifier(&volume.id);
    record(data, &volume);

    let timeout = data.timeout(Operation::Create);
    wait_available(ctx, data, &ResourceHandle::new(&volume.id), timeout)
        .await
        .for_resource(&id)
}

pub async fn read(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    match ctx.client.get_volume(handle.as_str()).await {
        Ok(volume) => {
            record(data, &volume);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            log::info!("Volume {} no longer exists", handle);
            data.clear_identifier();
            Ok(())
        }
        Err(e) => Err(e.context(format!("error getting volume {}", handle))).for_resource(data.id()),
    }
}

pub async fn update(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let handle = data.handle().ok_or_else(|| missing_identifier(&id))?;
    let config = VolumeConfig::from_data(data)?;

    let mut patch = VolumePatch::default();
    if data.has_change("name") {
        patch.name = Some(config.prototype.name.clone());
    }
    if data.has_change("capacity") {
        if let Some(Value::Int(previous)) = data.prior("capacity")
            && config.prototype.capacity < *previous
        {
            return Err(ProviderError::new(format!(
                "volume capacity can only grow ({} GB requested, {} GB provisioned)",
                config.prototype.capacity, previous
            )))
            .for_resource(&id);
        }
        patch.capacity = Some(config.prototype.capacity);
    }
    if data.has_change("iops") {
        patch.iops = config.prototype.iops;
    }
    if data.has_change("profile") {
        patch.profile = Some(config.prototype.profile.clone());
    }

    if !patch.is_empty() {
        let volume = ctx
            .client
            .update_volume(handle.as_str(), &patch)
            .await
            .map_err(|e| e.context(format!("error updating volume {}", handle)))
            .for_resource(&id)?;
        record(data, &volume);
        let timeout = data.timeout(Operation::Update);
        wait_available(ctx, data, &handle, timeout)
            .await
            .for_resource(&id)?;
    }

    read(ctx, data).await
}

pub async fn delete(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    let timeout = data.timeout(Operation::Delete);

    let volume = match ctx.client.get_volume(handle.as_str()).await {
        Ok(volume) => volume,
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            return Ok(());
        }
        Err(e) => {
            return Err(e.context(format!("error getting volume {}", handle))).for_resource(&id);
        }
    };

    for attachment in &volume.attachments {
        let instance = ResourceHandle::new(&attachment.instance_id);
        let _guard = ctx
            .locks
            .lock(&LockKey::new(instance::RESOURCE_TYPE, instance))
            .await;
        instance::detach_volume(ctx, &attachment.instance_id, &attachment.id, timeout)
            .await
            .for_resource(&id)?;
    }

    if data.get_bool("delete_all_snapshots").unwrap_or(false) {
        log::info!("Deleting all snapshots of volume {}", handle);
        ctx.client
            .delete_snapshots_for_volume(handle.as_str())
            .await
            .map_err(|e| e.context(format!("error deleting snapshots of {}", handle)))
            .for_resource(&id)?;
    }

    match ctx.client.delete_volume(handle.as_str()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(e.context(format!("error deleting volume {}", handle))).for_resource(&id);
        }
    }
    wait_deleted(ctx, &handle, timeout).await.for_resource(&id)?;

    data.clear_identifier();
    Ok(())
}

pub async fn exists(ctx: &VpcContext, handle: &ResourceHandle) -> ProviderResult<bool> {
    match ctx.client.get_volume(handle.as_str()).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.context(format!("error checking volume {}", handle))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::VpcClient;
    use crate::sim::SimulatedVpc;
    use stratus_core::resource::{Resource, State};
    use tokio::time::Instant;

    fn data_volume(capacity: i64) -> Resource {
        Resource::new(RESOURCE_TYPE, "data")
            .with_attribute("zone", Value::String("us-south-1".to_string()))
            .with_attribute("capacity", Value::Int(capacity))
    }

    fn setup() -> (Arc<SimulatedVpc>, VpcContext) {
        let sim = Arc::new(SimulatedVpc::new());
        let ctx = VpcContext::new(sim.clone());
        (sim, ctx)
    }

    async fn created(ctx: &VpcContext, resource: &Resource) -> State {
        let mut data = ResourceData::from_resource(resource, None, VolumeType.timeouts()).unwrap();
        create(ctx, &mut data).await.unwrap();
        data.into_state()
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_for_available() {
        let (_sim, ctx) = setup();
        let start = Instant::now();
        let state = created(&ctx, &data_volume(100)).await;

        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(
            state.attributes.get("status"),
            Some(&Value::String(AVAILABLE.to_string()))
        );
        assert_eq!(state.attributes.get("name"), Some(&Value::String("data".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_change_is_applied_and_awaited() {
        let (sim, ctx) = setup();
        let state = created(&ctx, &data_volume(100)).await;

        let mut data =
            ResourceData::from_resource(&data_volume(200), Some(&state), VolumeType.timeouts())
                .unwrap();
        update(&ctx, &mut data).await.unwrap();

        assert_eq!(data.get_observed("capacity"), Some(&Value::Int(200)));
        assert!(sim.calls().iter().any(|c| c.starts_with("update_volume")));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_cannot_shrink() {
        let (sim, ctx) = setup();
        let state = created(&ctx, &data_volume(100)).await;

        let mut data =
            ResourceData::from_resource(&data_volume(50), Some(&state), VolumeType.timeouts())
                .unwrap();
        let err = update(&ctx, &mut data).await.unwrap_err();
        assert!(err.to_string().contains("can only grow"));
        assert!(!sim.calls().iter().any(|c| c.starts_with("update_volume")));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_volume_is_not_patched() {
        let (sim, ctx) = setup();
        let state = created(&ctx, &data_volume(100)).await;

        let mut data =
            ResourceData::from_resource(&data_volume(100), Some(&state), VolumeType.timeouts())
                .unwrap();
        update(&ctx, &mut data).await.unwrap();
        assert!(!sim.calls().iter().any(|c| c.starts_with("update_volume")));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_detaches_and_removes_snapshots() {
        let (sim, ctx) = setup();
        let resource = data_volume(100).with_attribute("delete_all_snapshots", Value::Bool(true));
        let state = created(&ctx, &resource).await;
        let volume_id = state.identifier.clone().unwrap();
        let instance_id = sim.seed_instance("web");
        sim.seed_attachment(&instance_id, &volume_id);
        let snapshot_id = sim.seed_snapshot(&volume_id);

        let mut data = ResourceData::from_state(&state, VolumeType.timeouts());
        delete(&ctx, &mut data).await.unwrap();

        assert!(data.identifier().is_none());
        assert!(!exists(&ctx, &ResourceHandle::new(&volume_id)).await.unwrap());
        match sim.get_snapshot(&snapshot_id).await {
            Ok(snapshot) => assert_eq!(snapshot.lifecycle_state, "deleting"),
            Err(e) => assert!(e.is_not_found()),
        }
        assert!(sim.list_volume_attachments(&instance_id).await.unwrap().iter().all(|a| a.boot));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_provisioning_is_an_error() {
        let (sim, ctx) = setup();
        sim.script_next_volume(&["provisioning", "failed"]);
        let mut data =
            ResourceData::from_resource(&data_volume(100), None, VolumeType.timeouts()).unwrap();

        let err = create(&ctx, &mut data).await.unwrap_err();
        assert!(err.to_string().contains("'failed'"));
        assert_eq!(data.get_str("status"), Some(FAILED));
    }
}
