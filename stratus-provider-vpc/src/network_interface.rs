//! Secondary network interfaces of an instance
//!
//! The remote identifier is `instance_id/interface_id`. Every mutation runs
//! under the owning instance's lock, since the API rejects concurrent
//! changes to one instance's interfaces.

use std::sync::Arc;
use std::time::Duration;

use stratus_core::data::ResourceData;
use stratus_core::lock::LockKey;
use stratus_core::provider::{ProviderError, ProviderResult, ResourceType};
use stratus_core::refresh::{NotFound, RemoteError, ResourceHandle};
use stratus_core::resource::Value;
use stratus_core::status::{StatusClassifier, StatusTable};
use stratus_core::timeouts::{Operation, Timeouts};

use crate::config::NetworkInterfaceConfig;
use crate::context::{
    Refresher, ResourceResultExt, VpcContext, child_handle, in_configured_order,
    missing_identifier, split_handle, string_list,
};
use crate::instance;
use crate::model::{NetworkInterface, NetworkInterfacePatch};

pub const RESOURCE_TYPE: &str = "network_interface";

pub mod status {
    pub const PENDING: &str = "pending";
    pub const AVAILABLE: &str = "available";
    pub const STABLE: &str = "stable";
    pub const DELETING: &str = "deleting";
    pub const FAILED: &str = "failed";
    /// Reported once the interface no longer exists
    pub const DELETED: &str = "deleted";
}

use status::*;

pub struct NetworkInterfaceType;

impl ResourceType for NetworkInterfaceType {
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
            .success([AVAILABLE, STABLE])
            .failed([FAILED]),
    )
}

fn refresher<'a>(ctx: &VpcContext, handle: ResourceHandle) -> Refresher<'a, NetworkInterface> {
    ctx.refresher(handle, classifier(), |client, h| async move {
        let (instance_id, nic_id) = split_handle(&h)?;
        client.get_network_interface(instance_id, nic_id).await
    })
}

fn instance_lock(instance_id: &str) -> LockKey {
    LockKey::new(instance::RESOURCE_TYPE, instance_id)
}

fn record(data: &mut ResourceData, nic: &NetworkInterface) {
    data.set_str("id", &nic.id);
    data.set_str("instance", &nic.instance_id);
    data.set_str("name", &nic.name);
    data.set_str("status", &nic.status);
    data.set_str("subnet", &nic.subnet);
    if let Some(ip) = &nic.primary_ip {
        data.set_str("primary_ip", ip);
    }
    data.set("allow_ip_spoofing", Value::Bool(nic.allow_ip_spoofing));
    let groups = in_configured_order(
        &data.get_str_list("security_groups"),
        nic.security_groups.clone(),
    );
    data.set("security_groups", string_list(groups));
}

async fn wait_available(
    ctx: &VpcContext,
    data: &mut ResourceData,
    handle: &ResourceHandle,
    timeout: Duration,
) -> ProviderResult<()> {
    let mut refresher =
        refresher(ctx, handle.clone()).observe(|n: &NetworkInterface| record(data, n));
    ctx.poller([PENDING], [AVAILABLE, STABLE], timeout)
        .poll_until_done(&mut refresher)
        .await?;
    Ok(())
}

async fn bind(ctx: &VpcContext, security_group: &str, nic_id: &str) -> ProviderResult<()> {
    log::debug!("Binding security group {} to {}", security_group, nic_id);
    ctx.client
        .create_security_group_target_binding(security_group, nic_id)
        .await
        .map_err(|e| e.context(format!("error binding {} to {}", security_group, nic_id)))
}

async fn unbind(ctx: &VpcContext, security_group: &str, nic_id: &str) -> ProviderResult<()> {
    log::debug!("Unbinding security group {} from {}", security_group, nic_id);
    match ctx
        .client
        .delete_security_group_target_binding(security_group, nic_id)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.context(format!("error unbinding {} from {}", security_group, nic_id))),
    }
}

pub async fn create(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let config = NetworkInterfaceConfig::from_data(data)?;

    let instance_handle = ResourceHandle::new(&config.instance);
    if !instance::exists(ctx, &instance_handle).await.for_resource(&id)? {
        return Err(ProviderError::new(format!(
            "instance {} does not exist",
            config.instance
        )))
        .for_resource(&id);
    }

    let _guard = ctx.locks.lock(&instance_lock(&config.instance)).await;
    let nic = ctx
        .client
        .create_network_interface(&config.instance, &config.prototype)
        .await
        .map_err(|e| e.context(format!("error creating network interface on {}", config.instance)))
        .for_resource(&id)?;
    let handle = child_handle(&config.instance, &nic.id);
    log::info!("Created network interface {} ({})", id, handle);
    data.set_identifier(handle.as_str());
    record(data, &nic);

    for group in &config.security_groups {
        bind(ctx, group, &nic.id).await.for_resource(&id)?;
    }

    let timeout = data.timeout(Operation::Create);
    wait_available(ctx, data, &handle, timeout)
        .await
        .for_resource(&id)
}

pub async fn read(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    let (instance_id, nic_id) = split_handle(&handle)
        .map_err(|e| e.context("malformed network interface identifier"))
        .for_resource(data.id())?;
    match ctx.client.get_network_interface(instance_id, nic_id).await {
        Ok(nic) => {
            record(data, &nic);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            Ok(())
        }
        Err(e) => Err(e.context(format!("error getting network interface {}", handle)))
            .for_resource(data.id()),
    }
}

pub async fn update(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let handle = data.handle().ok_or_else(|| missing_identifier(&id))?;
    let config = NetworkInterfaceConfig::from_data(data)?;
    let (instance_id, nic_id) = split_handle(&handle)
        .map_err(|e| e.context("malformed network interface identifier"))
        .for_resource(&id)?;

    let _guard = ctx.locks.lock(&instance_lock(instance_id)).await;

    let mut patch = NetworkInterfacePatch::default();
    if data.has_change("name") {
        patch.name = Some(config.prototype.name.clone());
    }
    if data.has_change("allow_ip_spoofing") {
        patch.allow_ip_spoofing = Some(config.prototype.allow_ip_spoofing);
    }
    if !patch.is_empty() {
        let nic = ctx
            .client
            .update_network_interface(instance_id, nic_id, &patch)
            .await
            .map_err(|e| e.context(format!("error updating network interface {}", handle)))
            .for_resource(&id)?;
        record(data, &nic);
    }

    if data.has_change("security_groups") {
        let current = ctx
            .client
            .get_network_interface(instance_id, nic_id)
            .await
            .map_err(|e| e.context(format!("error getting network interface {}", handle)))
            .for_resource(&id)?
            .security_groups;
        for group in current.iter().filter(|g| !config.security_groups.contains(g)) {
            unbind(ctx, group, nic_id).await.for_resource(&id)?;
        }
        for group in config.security_groups.iter().filter(|g| !current.contains(g)) {
            bind(ctx, group, nic_id).await.for_resource(&id)?;
        }
    }

    let timeout = data.timeout(Operation::Update);
    wait_available(ctx, data, &handle, timeout)
        .await
        .for_resource(&id)
}

pub async fn delete(ctx: &VpcContext, data: &mut ResourceData) -> ProviderResult<()> {
    let id = data.id().clone();
    let Some(handle) = data.handle() else {
        return Ok(());
    };
    let (instance_id, nic_id) = split_handle(&handle)
        .map_err(|e| e.context("malformed network interface identifier"))
        .for_resource(&id)?;

    let _guard = ctx.locks.lock(&instance_lock(instance_id)).await;
    match ctx.client.delete_network_interface(instance_id, nic_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            data.clear_identifier();
            return Ok(());
        }
        Err(e) => {
            return Err(e.context(format!("error deleting network interface {}", handle)))
                .for_resource(&id);
        }
    }

    let mut refresher =
        refresher(ctx, handle.clone()).on_not_found(NotFound::Vanished(DELETED.to_string()));
    ctx.poller([DELETING, AVAILABLE], [DELETED], data.timeout(Operation::Delete))
        .poll_until_done(&mut refresher)
        .await
        .for_resource(&id)?;

    data.clear_identifier();
    Ok(())
}

pub async fn exists(ctx: &VpcContext, handle: &ResourceHandle) -> ProviderResult<bool> {
    let (instance_id, nic_id) = split_handle(handle)
        .map_err(|e| e.context("malformed network interface identifier"))?;
    match ctx.client.get_network_interface(instance_id, nic_id).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.context(format!("error checking network interface {}", handle))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::VpcClient;
    use crate::sim::SimulatedVpc;
    use stratus_core::resource::Resource;

    struct Fixture {
        sim: Arc<SimulatedVpc>,
        ctx: VpcContext,
        instance: String,
        web: String,
        db: String,
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedVpc::new());
        let instance = sim.seed_instance("web");
        let web = sim.seed_security_group("web", "vpc-1");
        let db = sim.seed_security_group("db", "vpc-1");
        let ctx = VpcContext::new(sim.clone());
        Fixture {
            sim,
            ctx,
            instance,
            web,
            db,
        }
    }

    fn eth1(instance: &str, groups: &[&str]) -> Resource {
        Resource::new(RESOURCE_TYPE, "eth1")
            .with_attribute("instance", Value::String(instance.to_string()))
            .with_attribute("subnet", Value::String("subnet-1".to_string()))
            .with_attribute("security_groups", string_list(groups.iter().copied()))
    }

    #[tokio::test(start_paused = true)]
    async fn create_binds_security_groups_and_waits() {
        let f = fixture();
        let resource = eth1(&f.instance, &[&f.web]);
        let mut data =
            ResourceData::from_resource(&resource, None, NetworkInterfaceType.timeouts()).unwrap();

        create(&f.ctx, &mut data).await.unwrap();

        let identifier = data.identifier().unwrap().to_string();
        assert!(identifier.starts_with(&format!("{}/", f.instance)));
        assert_eq!(data.get_str("status"), Some(AVAILABLE));
        let group = f.sim.get_security_group(&f.web).await.unwrap();
        assert_eq!(group.targets.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_requires_existing_instance() {
        let f = fixture();
        let mut data = ResourceData::from_resource(
            &eth1("inst-missing", &[]),
            None,
            NetworkInterfaceType.timeouts(),
        )
        .unwrap();

        let err = create(&f.ctx, &mut data).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_moves_security_group_bindings() {
        let f = fixture();
        let mut data = ResourceData::from_resource(
            &eth1(&f.instance, &[&f.web]),
            None,
            NetworkInterfaceType.timeouts(),
        )
        .unwrap();
        create(&f.ctx, &mut data).await.unwrap();
        let state = data.into_state();

        let mut data = ResourceData::from_resource(
            &eth1(&f.instance, &[&f.db]),
            Some(&state),
            NetworkInterfaceType.timeouts(),
        )
        .unwrap();
        update(&f.ctx, &mut data).await.unwrap();

        assert_eq!(
            data.get_observed("security_groups"),
            Some(&string_list([f.db.clone()]))
        );
        assert!(f.sim.get_security_group(&f.web).await.unwrap().targets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_until_gone() {
        let f = fixture();
        let mut data = ResourceData::from_resource(
            &eth1(&f.instance, &[]),
            None,
            NetworkInterfaceType.timeouts(),
        )
        .unwrap();
        create(&f.ctx, &mut data).await.unwrap();
        let handle = data.handle().unwrap();
        let state = data.into_state();

        let mut data = ResourceData::from_state(&state, NetworkInterfaceType.timeouts());
        delete(&f.ctx, &mut data).await.unwrap();

        assert!(data.identifier().is_none());
        assert!(!exists(&f.ctx, &handle).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_on_one_instance_are_serialized() {
        let f = fixture();
        let key = instance_lock(&f.instance);
        let held = f.ctx.locks.lock(&key).await;

        let ctx = f.ctx.clone();
        let resource = eth1(&f.instance, &[]);
        let task = tokio::spawn(async move {
            let mut data =
                ResourceData::from_resource(&resource, None, NetworkInterfaceType.timeouts())
                    .unwrap();
            create(&ctx, &mut data).await
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(
            !f.sim
                .calls()
                .iter()
                .any(|c| c.starts_with("create_network_interface"))
        );

        drop(held);
        task.await.unwrap().unwrap();
        assert!(
            f.sim
                .calls()
                .iter()
                .any(|c| c.starts_with("create_network_interface"))
        );
    }
}
