//! Virtual server instances
//!
//! Instances converge through `pending → starting → running`; power actions
//! move them through `stopping`/`stopped` and `restarting`. Data volumes are
//! attached once the instance runs, one at a time, under the instance lock.

use std::sync::Arc;
use std::time::Duration;

use stratus_core::corrective::CorrectiveDriver;
use stratus_core::data::ResourceData;
use stratus_core::lock::LockKey;
use stratus_core::poller::{Converged, WaitError};
use stratus_core::provider::{ProviderResult, ResourceType};
use stratus_core::refresh::{NotFound, RemoteError, ResourceHandle};
use stratus_core::resource::Value;
use stratus_core::status::{StatusClassifier, StatusTable};
use stratus_core::timeouts::{Operation, Timeouts};

use crate::client::InstanceAction;
use crate::config::InstanceConfig;
use crate::context::{
    Refresher, ResourceResultExt, VpcContext, child_handle, in_configured_order,
    missing_identifier, reasons_value, split_handle, string_list,
};
use crate::model::{Instance, InstancePatch, VolumeAttachment, VolumeAttachmentPrototype};
use crate::recovery::{ForceStop, RestartStart};

pub const RESOURCE_TYPE: &str = "instance";

pub mod status {
    pub const PENDING: &str = "pending";
    pub const STARTING: &str = "starting";
    pub const RUNNING: &str = "running";
    pub const AVAILABLE: &str = "available";
    pub const STOPPING: &str = "stopping";
    pub const STOPPED: &str = "stopped";
    pub const RESTARTING: &str = "restarting";
    pub const DELETING: &str = "deleting";
    pub const FAILED: &str = "failed";
    /// Reported once the instance no longer exists
    pub const DELETE_DONE: &str = "done";

    pub const ATTACHING: &str = "attaching";
    pub const ATTACHED: &str = "attached";
    pub const DETACHING: &str = "detaching";
    /// Reported once the attachment no longer exists
    pub const DETACHED: &str = "deleted";
}

use status::*;

pub struct InstanceType;

impl ResourceType for InstanceType {
    fn name(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::from_minutes(30, 30, 30)
    }
}

fn classifier() -> Arc<dyn StatusClassifier> {
    Arc::new(
        StatusTable::new()
            .success([RUNNING, AVAILABLE, STOPPED])
            .failed([FAILED]),
    )
}

fn attachment_classifier() -> Arc<dyn StatusClassifier> {
    Arc::new(StatusTable::new().success([ATTACHED]).failed([FAILED]))
}

pub(crate) fn refresher<'a>(ctx: &VpcContext, handle: ResourceHandle) -> Refresher<'a, Instance> {
    ctx.refresher(handle, classifier(), |client, h| async move {
        client.get_instance(h.as_str()).await
    })
}

fn attachment_refresher<'a>(
    ctx: &VpcContext,
    handle: ResourceHandle,
) -> Refresher<'a, VolumeAttachment> {
    ctx.refresher(handle, attachment_classifier(), |client, h| async move {
        let (instance_id, attachment_id) = split_handle(&h)?;
        client.get_volume_attachment(instance_id, attachment_id).await
    })
}

fn lock_key(handle: &ResourceHandle) -> LockKey {
    LockKey::new(RESOURCE_TYPE, handle.clone())
}

/// Record what the remote side reports about an instance
fn record(data: &mut ResourceData, instance: &Instance) {
    data.set_str("id", &instance.id);
    data.set_str("name", &instance.name);
    data.set_str("status", &instance.status);
    data.set("status_reasons", reasons_value(&instance.status_reasons));
    data.set_str("vpc", &instance.vpc);
    data.set_str("zone", &instance.zone);
    data.set_str("profile", &instance.profile);
    data.set_str("image", &instance.image);
    if let Some(nic) = &instance.primary_network_interface {
        data.set_str("primary_network_interface", nic);
    }
    if let Some(boot) = &instance.boot_volume {
        data.set_str("boot_volume", boot);
    }

    let attachments = instance
        .volume_attachments
        .iter()
        .map(|a| {
            Value::Map(
                [
                    ("id", Value::String(a.id.clone())),
                    ("name", Value::String(a.name.clone())),
                    ("volume_id", Value::String(a.volume_id.clone())),
                    ("status", Value::String(a.status.clone())),
                    ("boot", Value::Bool(a.boot)),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            )
        })
        .collect();
    data.set("volume_attachments", Value::List(attachments));

    let attached = instance
        .volume_attachments
        .iter()
        .filter(|a| !a.boot)
        .map(|a| a.volume_id.clone())
        .collect();
    let volumes = in_configured_order(&data.get_str_list("volumes"), attached);
    data.set("volumes", string_list(volumes));
}

/// Wait for a freshly created or started instance to run
///
/// With a driver, a start that stalls is stopped and started again every
/// sub-interval.
async fn wait_running(
    ctx: &VpcContext,
    data: &mut ResourceData,
    handle: &ResourceHandle,
    timeout: Duration,
    driver: Option<CorrectiveDriver>,
) -> Result<Converged<Instance>, WaitError> {
    let mut refresher = refresher(ctx, handle.clone()).observe(|i: &Instance| record(data, i));
    ctx.poller(
        [PENDING, STARTING, RESTARTING, STOPPING, STOPPED],
        [RUNNING, AVAILABLE],
        timeout,
    )
    .with_corrective(driver)
    .poll_until_done(&mut refresher)
    .await
}

pub(crate) async fn wait_stopped(
    ctx: &VpcContext,
    handle: &ResourceHandle,
    timeout: Duration,
    driver: Option<CorrectiveDriver>,
) -> Result<Converged<Instance>, WaitError> {
    let mut refresher = refresher(ctx, handle.clone());
    ctx.poller([RUNNING, PENDING, STOPPING], [STOPPED], timeout)
        .with_corrective(driver)
        .poll_until_done(&mut refresher)
        .await
}

fn restart_driver(ctx: &VpcContext, minutes: i64) -> Option<CorrectiveDriver> {
    CorrectiveDriver::after_minutes(minutes, Arc::new(RestartStart::new(ctx.clone())))
}

fn force_stop_driver(ctx: &VpcContext, minutes: i64) -> Option<CorrectiveDriver> {
    CorrectiveDriver::after_minutes(minutes, Arc::new(ForceStop::new(ctx.client.clone())))
}

/// Attach a volume and wait until the attachment is usable
pub(crate) async fn attach_volume(
    ctx: &VpcContext,
    instance: &ResourceHandle,
    volume_id: &str,
    timeout: Duration,
) -> ProviderResult<VolumeAttachment> {
    let prototype = VolumeAttachmentPrototype {
        volume_id: volume_id.to_string(),
        name: None,
        delete_volume_on_instance_delete: false,
    };
    let attachment = ctx
        .client
        .create_volume_attachment(instance.as_str(), &prototype)
        .await
        .map_err(|e| e.context(format!("error attaching volume {} to {}", volume_id, instance)))?;
    log::info!(
        "Attaching volume {} to instance {} ({})",
        volume_id,
        instance,
        attachment.id
    );

    let mut refresher = attachment_refresher(ctx, child_handle(instance.as_str(), &attachment.id));
    let converged = ctx
        .poller([ATTACHING], [ATTACHED], timeout)
        .poll_until_done(&mut refresher)
        .await?;
    Ok(converged.value.unwrap_or(attachment))
}

/// Detach a volume and wait until the attachment is gone
pub(crate) async fn detach_volume(
    ctx: &VpcContext,
    instance_id: &str,
    attachment_id: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    let handle = child_handle(instance_id, attachment_id);
    match ctx
        .client
        .delete_volume_attachment(instance_id, attachment_id)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.context(format!("error detaching {}", handle))),
    }
    log::info!("Detaching volume attachment {}", handle);

    let mut refresher = attachment_refresher(ctx, handle)
        .on_not_found(NotFound::Vanished(DETACHED.to_string()));
    ctx.poller([ATTACHED, DETACHING], [DETACHED], timeout)
        .poll_until_done(&mut refresher)
        .await?;
    Ok(())
}

pub async fn create(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let config = InstanceConfig::from_data(data)?;
    let timeout = data.timeout(Operation::Create);

    let instance = ctx
        .client
        .create_instance(&config.prototype)
        .await
        .map_err(|e| e.context("error creating instance"))
        .for_resource(&id)?;
    log::info!("Created instance {} ({})", id, instance.id);
    data.set_identifier(&instance.id);
    record(data, &instance);

    let handle = ResourceHandle::new(&instance.id);
    let driver = restart_driver(ctx, config.force_recovery_time);
    wait_running(ctx, data, &handle, timeout, driver)
        .await
        .for_resource(&id)?;

    if !config.volumes.is_empty() {
        let _guard = ctx.locks.lock(&lock_key(&handle)).await;
        for volume_id in &config.volumes {
            attach_volume(ctx, &handle, volume_id, timeout)
                .await
                .for_resource(&id)?;
        }
    }

    read(ctx, data).await
}

/// Refresh observed attributes; a vanished instance clears the identifier
pub async fn read(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    match ctx.client.get_instance(handle.as_str()).await {
        Ok(instance) => {
            record(data, &instance);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            log::info!("Instance {} no longer exists", handle);
            data.clear_identifier();
            Ok(())
        }
        Err(e) => Err(e.context(format!("error getting instance {}", handle)))
            .for_resource(data.id()),
    }
}

pub async fn update(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let handle = data.handle().ok_or_else(|| missing_identifier(&id))?;
    let config = InstanceConfig::from_data(data)?;
    let timeout = data.timeout(Operation::Update);

    if data.has_change("name") {
        let patch = InstancePatch {
            name: Some(config.prototype.name.clone()),
        };
        let instance = ctx
            .client
            .update_instance(handle.as_str(), &patch)
            .await
            .map_err(|e| e.context(format!("error renaming instance {}", handle)))
            .for_resource(&id)?;
        record(data, &instance);
    }

    if data.has_change("action")
        && let Some(action) = config.action
    {
        run_action(ctx, data, &handle, action, &config, timeout)
            .await
            .for_resource(&id)?;
    }

    if data.has_change("volumes") {
        let _guard = ctx.locks.lock(&lock_key(&handle)).await;
        let attachments = ctx
            .client
            .list_volume_attachments(handle.as_str())
            .await
            .map_err(|e| e.context(format!("error listing volume attachments of {}", handle)))
            .for_resource(&id)?;

        for attachment in attachments
            .iter()
            .filter(|a| !a.boot && !config.volumes.contains(&a.volume_id))
        {
            detach_volume(ctx, handle.as_str(), &attachment.id, timeout)
                .await
                .for_resource(&id)?;
        }
        for volume_id in config
            .volumes
            .iter()
            .filter(|v| !attachments.iter().any(|a| &a.volume_id == *v))
        {
            attach_volume(ctx, &handle, volume_id, timeout)
                .await
                .for_resource(&id)?;
        }
    }

    read(ctx, data).await
}

async fn run_action(
    ctx: &VpcContext,
    data: &mut ResourceData,
    handle: &ResourceHandle,
    action: InstanceAction,
    config: &InstanceConfig,
    timeout: Duration,
) -> ProviderResult<()> {
    log::info!("Issuing {} on instance {}", action.as_str(), handle);
    ctx.client
        .create_instance_action(handle.as_str(), action, config.force_action)
        .await
        .map_err(|e| e.context(format!("error issuing {} on {}", action.as_str(), handle)))?;

    match action {
        InstanceAction::Stop => {
            let driver = force_stop_driver(ctx, config.force_recovery_time);
            let converged = wait_stopped(ctx, handle, timeout, driver).await?;
            if let Some(instance) = converged.value {
                record(data, &instance);
            }
        }
        InstanceAction::Start | InstanceAction::Reboot => {
            let driver = restart_driver(ctx, config.force_recovery_time);
            wait_running(ctx, data, handle, timeout, driver).await?;
        }
    }
    Ok(())
}

pub async fn delete(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    let timeout = data.timeout(Operation::Delete);

    let instance = match ctx.client.get_instance(handle.as_str()).await {
        Ok(instance) => instance,
        Err(e) if e.is_not_found() => {
            log::info!("Instance {} is already gone", handle);
            data.clear_identifier();
            return Ok(());
        }
        Err(e) => {
            return Err(e.context(format!("error getting instance {}", handle)))
                .for_resource(&id);
        }
    };

    let wait_before_delete = data.get_bool("wait_before_delete").unwrap_or(true);
    let auto_delete_volume = data.get_bool("auto_delete_volume").unwrap_or(true);
    let recovery_minutes = data.get_int("force_recovery_time").unwrap_or(0);

    if wait_before_delete {
        if instance.status != STOPPED {
            ctx.client
                .create_instance_action(handle.as_str(), InstanceAction::Stop, true)
                .await
                .map_err(|e| e.context(format!("error stopping instance {}", handle)))
                .for_resource(&id)?;
            wait_stopped(ctx, &handle, timeout, force_stop_driver(ctx, recovery_minutes))
                .await
                .for_resource(&id)?;
        }

        let _guard = ctx.locks.lock(&lock_key(&handle)).await;
        for attachment in instance.volume_attachments.iter().filter(|a| !a.boot) {
            detach_volume(ctx, handle.as_str(), &attachment.id, timeout)
                .await
                .for_resource(&id)?;
        }
    }

    match ctx.client.delete_instance(handle.as_str()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(e.context(format!("error deleting instance {}", handle)))
                .for_resource(&id);
        }
    }

    let mut refresher =
        refresher(ctx, handle.clone()).on_not_found(NotFound::Vanished(DELETE_DONE.to_string()));
    ctx.poller(std::iter::empty::<&str>(), [DELETE_DONE], timeout)
        .poll_until_done(&mut refresher)
        .await
        .for_resource(&id)?;

    if auto_delete_volume && let Some(boot_volume) = &instance.boot_volume {
        crate::volume::wait_deleted(ctx, &ResourceHandle::new(boot_volume), timeout)
            .await
            .for_resource(&id)?;
    }

    data.clear_identifier();
    Ok(())
}

pub async fn exists(ctx: &VpcContext, handle: &ResourceHandle) -> ProviderResult<bool> {
    match ctx.client.get_instance(handle.as_str()).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.context(format!("error checking instance {}", handle))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiError, VpcClient};
    use crate::sim::SimulatedVpc;
    use stratus_core::resource::{Resource, State};
    use stratus_core::status::StatusReason;
    use tokio::time::Instant;

    fn web() -> Resource {
        let s = |v: &str| Value::String(v.to_string());
        Resource::new(RESOURCE_TYPE, "web")
            .with_attribute("vpc", s("vpc-1"))
            .with_attribute("zone", s("us-south-1"))
            .with_attribute("profile", s("bx2-2x8"))
            .with_attribute("image", s("ubuntu-24-04"))
            .with_attribute("subnet", s("subnet-1"))
    }

    fn setup() -> (Arc<SimulatedVpc>, VpcContext) {
        let sim = Arc::new(SimulatedVpc::new());
        let ctx = VpcContext::new(sim.clone());
        (sim, ctx)
    }

    fn data(resource: &Resource, prior: Option<&State>) -> ResourceData {
        ResourceData::from_resource(resource, prior, InstanceType.timeouts()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_until_running() {
        let (_sim, ctx) = setup();
        let mut data = data(&web(), None);

        let start = Instant::now();
        create(&ctx, &mut data).await.unwrap();

        // 10s initial delay, then "starting", then "running" 10s later
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(data.get_str("status"), Some(RUNNING));
        assert!(data.get_str("boot_volume").is_some());
        assert!(data.identifier().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn create_attaches_configured_volumes() {
        let (sim, ctx) = setup();
        let volume = sim.seed_volume("data", "us-south-1", 100);
        let resource = web().with_attribute("volumes", string_list([volume.clone()]));
        let mut data = data(&resource, None);

        create(&ctx, &mut data).await.unwrap();

        assert_eq!(data.get_observed("volumes"), Some(&string_list([volume])));
        let state = data.into_state();
        assert!(state.exists);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_instance_reports_reasons() {
        let (sim, ctx) = setup();
        sim.script_next_instance(
            &["failed"],
            vec![StatusReason::new("cannot_start_capacity", "Insufficient capacity")],
        );
        let mut data = data(&web(), None);

        let err = create(&ctx, &mut data).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'failed'"), "{message}");
        assert!(message.contains("cannot_start_capacity"), "{message}");
        // partial progress is kept
        assert!(data.identifier().is_some());
        assert_eq!(data.get_str("status"), Some(FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_start_is_restarted() {
        let (sim, ctx) = setup();
        sim.script_next_instance(&["starting"], Vec::new());
        let resource = web().with_attribute("force_recovery_time", Value::Int(1));
        let mut data = data(&resource, None);

        create(&ctx, &mut data).await.unwrap();

        let calls = sim.calls();
        assert!(calls.iter().any(|c| c.starts_with("create_instance_action stop")));
        assert!(calls.iter().any(|c| c.starts_with("create_instance_action start")));
        assert_eq!(data.get_str("status"), Some(RUNNING));
    }

    #[tokio::test(start_paused = true)]
    async fn read_clears_identifier_of_vanished_instance() {
        let (_sim, ctx) = setup();
        let mut data = ResourceData::new(Resource::new(RESOURCE_TYPE, "web").id, Timeouts::default());
        data.set_identifier("inst-missing");

        read(&ctx, &mut data).await.unwrap();
        assert!(data.identifier().is_none());
        assert!(!data.into_state().exists);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_action_waits_for_stopped() {
        let (_sim, ctx) = setup();
        let mut created = data(&web(), None);
        create(&ctx, &mut created).await.unwrap();
        let state = created.into_state();

        let desired = web().with_attribute("action", Value::String("stop".to_string()));
        let mut data = data(&desired, Some(&state));
        update(&ctx, &mut data).await.unwrap();

        assert_eq!(data.get_observed("status"), Some(&Value::String(STOPPED.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn update_swaps_attached_volumes() {
        let (sim, ctx) = setup();
        let first = sim.seed_volume("first", "us-south-1", 100);
        let second = sim.seed_volume("second", "us-south-1", 100);

        let resource = web().with_attribute("volumes", string_list([first.clone()]));
        let mut created = data(&resource, None);
        create(&ctx, &mut created).await.unwrap();
        let state = created.into_state();

        let desired = web().with_attribute("volumes", string_list([second.clone()]));
        let mut data = data(&desired, Some(&state));
        update(&ctx, &mut data).await.unwrap();

        assert_eq!(data.get_observed("volumes"), Some(&string_list([second])));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_stops_detaches_and_waits_for_boot_volume() {
        let (sim, ctx) = setup();
        let volume = sim.seed_volume("data", "us-south-1", 100);
        let resource = web().with_attribute("volumes", string_list([volume.clone()]));
        let mut created = data(&resource, None);
        create(&ctx, &mut created).await.unwrap();
        let boot = created.get_str("boot_volume").unwrap().to_string();
        let handle = created.handle().unwrap();
        let state = created.into_state();

        let mut data = ResourceData::from_state(&state, InstanceType.timeouts());
        delete(&ctx, &mut data).await.unwrap();

        assert!(data.identifier().is_none());
        assert!(!exists(&ctx, &handle).await.unwrap());
        assert!(sim.get_volume(&boot).await.unwrap_err().is_not_found());
        // the data volume survives, detached
        let survivor = sim.get_volume(&volume).await.unwrap();
        assert!(survivor.attachments.is_empty());

        let calls = sim.calls();
        let stop = calls
            .iter()
            .position(|c| c.starts_with("create_instance_action stop"))
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| c.starts_with("delete_instance"))
            .unwrap();
        assert!(stop < delete);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_of_missing_instance_is_done() {
        let (_sim, ctx) = setup();
        let state = State::existing(Resource::new(RESOURCE_TYPE, "web").id, Default::default())
            .with_identifier("inst-gone");
        let mut data = ResourceData::from_state(&state, InstanceType.timeouts());

        delete(&ctx, &mut data).await.unwrap();
        assert!(data.identifier().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn create_error_names_the_resource() {
        let (sim, ctx) = setup();
        sim.fail_next("create_instance", ApiError::new(403, "forbidden", "quota exceeded"));
        let mut data = data(&web(), None);

        let err = create(&ctx, &mut data).await.unwrap_err();
        assert_eq!(err.resource_id, Some(Resource::new(RESOURCE_TYPE, "web").id));
        assert!(err.to_string().contains("quota exceeded"));
        assert!(data.identifier().is_none());
    }
}
