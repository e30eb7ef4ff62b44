//! Volume snapshots

use std::sync::Arc;
use std::time::Duration;

use stratus_core::data::ResourceData;
use stratus_core::provider::{ProviderResult, ResourceType};
use stratus_core::refresh::{NotFound, RemoteError, ResourceHandle};
use stratus_core::resource::Value;
use stratus_core::status::{StatusClassifier, StatusTable};
use stratus_core::timeouts::{Operation, Timeouts};

use crate::config::snapshot_prototype;
use crate::context::{Refresher, ResourceResultExt, VpcContext, missing_identifier};
use crate::model::Snapshot;

pub const RESOURCE_TYPE: &str = "snapshot";

pub mod status {
    pub const PENDING: &str = "pending";
    pub const STABLE: &str = "stable";
    pub const UPDATING: &str = "updating";
    pub const DELETING: &str = "deleting";
    pub const FAILED: &str = "failed";
    /// Reported once the snapshot no longer exists
    pub const DELETED: &str = "deleted";
}

use status::*;

pub struct SnapshotType;

impl ResourceType for SnapshotType {
    fn name(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::from_minutes(10, 10, 10)
    }
}

fn classifier() -> Arc<dyn StatusClassifier> {
    Arc::new(StatusTable::new().success([STABLE]).failed([FAILED]))
}

fn refresher<'a>(ctx: &VpcContext, handle: ResourceHandle) -> Refresher<'a, Snapshot> {
    ctx.refresher(handle, classifier(), |client, h| async move {
        client.get_snapshot(h.as_str()).await
    })
}

fn record(data: &mut ResourceData, snapshot: &Snapshot) {
    data.set_str("id", &snapshot.id);
    data.set_str("name", &snapshot.name);
    data.set_str("lifecycle_state", &snapshot.lifecycle_state);
    data.set_str("source_volume", &snapshot.source_volume);
    data.set("size", Value::Int(snapshot.size));
    data.set("bootable", Value::Bool(snapshot.bootable));
}

async fn wait_stable<'p, P>(
    ctx: &VpcContext,
    data: &mut ResourceData,
    handle: &ResourceHandle,
    pending: P,
    timeout: Duration,
) -> ProviderResult<()>
where
    P: IntoIterator<Item = &'p str>,
{
    let mut refresher = refresher(ctx, handle.clone()).observe(|s: &Snapshot| record(data, s));
    ctx.poller(pending, [STABLE], timeout)
        .poll_until_done(&mut refresher)
        .await?;
    Ok(())
}

pub async fn create(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let prototype = snapshot_prototype(data)?;

    let snapshot = ctx
        .client
        .create_snapshot(&prototype)
        .await
        .map_err(|e| e.context(format!("error creating snapshot of {}", prototype.source_volume)))
        .for_resource(&id)?;
    log::info!("Created snapshot {} ({})", id, snapshot.id);
    data.set_identifier(&snapshot.id);
    record(data, &snapshot);

    let timeout = data.timeout(Operation::Create);
    wait_stable(ctx, data, &ResourceHandle::new(&snapshot.id), [PENDING], timeout)
        .await
        .for_resource(&id)
}

pub async fn read(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    match ctx.client.get_snapshot(handle.as_str()).await {
        Ok(snapshot) => {
            record(data, &snapshot);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            Ok(())
        }
        Err(e) => {
            Err(e.context(format!("error getting snapshot {}", handle))).for_resource(data.id())
        }
    }
}

/// Only the name can change in place
pub async fn update(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let handle = data.handle().ok_or_else(|| missing_identifier(&id))?;
    let prototype = snapshot_prototype(data)?;

    if data.has_change("name") {
        let snapshot = ctx
            .client
            .update_snapshot(handle.as_str(), &prototype.name)
            .await
            .map_err(|e| e.context(format!("error renaming snapshot {}", handle)))
            .for_resource(&id)?;
        record(data, &snapshot);

        let timeout = data.timeout(Operation::Update);
        wait_stable(ctx, data, &handle, [UPDATING, PENDING], timeout)
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

    match ctx.client.delete_snapshot(handle.as_str()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            return Ok(());
        }
        Err(e) => {
            return Err(e.context(format!("error deleting snapshot {}", handle)))
                .for_resource(&id);
        }
    }

    let mut refresher =
        refresher(ctx, handle.clone()).on_not_found(NotFound::Vanished(DELETED.to_string()));
    ctx.poller([DELETING], [DELETED], data.timeout(Operation::Delete))
        .poll_until_done(&mut refresher)
        .await
        .for_resource(&id)?;

    data.clear_identifier();
    Ok(())
}

pub async fn exists(ctx: &VpcContext, handle: &ResourceHandle) -> ProviderResult<bool> {
    match ctx.client.get_snapshot(handle.as_str()).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.context(format!("error checking snapshot {}", handle))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedVpc;
    use stratus_core::resource::Resource;

    fn setup() -> (Arc<SimulatedVpc>, VpcContext, String) {
        let sim = Arc::new(SimulatedVpc::new());
        let volume = sim.seed_volume("data", "us-south-1", 100);
        let ctx = VpcContext::new(sim.clone());
        (sim, ctx, volume)
    }

    fn backup(volume: &str, name: &str) -> Resource {
        Resource::new(RESOURCE_TYPE, "backup")
            .with_attribute("source_volume", Value::String(volume.to_string()))
            .with_attribute("name", Value::String(name.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_for_stable() {
        let (_sim, ctx, volume) = setup();
        let mut data =
            ResourceData::from_resource(&backup(&volume, "nightly"), None, SnapshotType.timeouts())
                .unwrap();

        create(&ctx, &mut data).await.unwrap();
        assert_eq!(data.get_str("lifecycle_state"), Some(STABLE));
        assert_eq!(data.get_str("source_volume"), Some(volume.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn rename_waits_for_stable_again() {
        let (sim, ctx, volume) = setup();
        let mut data =
            ResourceData::from_resource(&backup(&volume, "nightly"), None, SnapshotType.timeouts())
                .unwrap();
        create(&ctx, &mut data).await.unwrap();
        let state = data.into_state();

        let mut renamed = ResourceData::from_resource(
            &backup(&volume, "weekly"),
            Some(&state),
            SnapshotType.timeouts(),
        )
        .unwrap();
        update(&ctx, &mut renamed).await.unwrap();

        assert_eq!(
            renamed.get_observed("name"),
            Some(&Value::String("weekly".to_string()))
        );
        assert!(sim.calls().iter().any(|c| c.starts_with("update_snapshot")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_snapshot_is_an_error() {
        let (sim, ctx, volume) = setup();
        sim.script_next_snapshot(&["failed"]);
        let mut data =
            ResourceData::from_resource(&backup(&volume, "nightly"), None, SnapshotType.timeouts())
                .unwrap();

        let err = create(&ctx, &mut data).await.unwrap_err();
        assert!(err.to_string().contains("'failed'"));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_until_gone() {
        let (_sim, ctx, volume) = setup();
        let mut data =
            ResourceData::from_resource(&backup(&volume, "nightly"), None, SnapshotType.timeouts())
                .unwrap();
        create(&ctx, &mut data).await.unwrap();
        let handle = data.handle().unwrap();
        let state = data.into_state();

        let mut data = ResourceData::from_state(&state, SnapshotType.timeouts());
        delete(&ctx, &mut data).await.unwrap();

        assert!(data.identifier().is_none());
        assert!(!exists(&ctx, &handle).await.unwrap());
    }
}
