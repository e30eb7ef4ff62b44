//! Simulated VPC
//!
//! An in-memory [`VpcClient`]. Every resource carries a queue of upcoming
//! status labels; each `get` moves it one label forward. A resource queued
//! for removal answers 404 once its queue runs dry.
//!
//! The world can be saved to and loaded from a JSON file so separate CLI
//! invocations see the same resources.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_core::status::StatusReason;
use thiserror::Error;
use uuid::Uuid;

use crate::client::{ApiError, ApiResult, InstanceAction, VpcClient};
use crate::model::{
    Instance, InstancePatch, InstancePrototype, NetworkInterface, NetworkInterfacePatch,
    NetworkInterfacePrototype, SecurityGroup, SecurityGroupPrototype, SecurityGroupRule,
    SecurityGroupRulePatch, SecurityGroupRulePrototype, Snapshot, SnapshotPrototype,
    Volume, VolumeAttachment, VolumeAttachmentPrototype, VolumeAttachmentRef, VolumePatch,
    VolumePrototype,
};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

trait Lifecycle {
    fn set_status(&mut self, status: &str);
}

macro_rules! lifecycle {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(impl Lifecycle for $ty {
            fn set_status(&mut self, status: &str) {
                self.$field = status.to_string();
            }
        })*
    };
}

lifecycle! {
    Instance => status,
    Volume => status,
    Snapshot => lifecycle_state,
    NetworkInterface => status,
    VolumeAttachment => status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tracked<T> {
    value: T,
    #[serde(default)]
    upcoming: VecDeque<String>,
    /// Drop the resource once `upcoming` is exhausted
    #[serde(default)]
    remove_after: bool,
}

impl<T: Lifecycle> Tracked<T> {
    fn new<S: AsRef<str>>(value: T, upcoming: &[S]) -> Self {
        let mut tracked = Self {
            value,
            upcoming: VecDeque::new(),
            remove_after: false,
        };
        tracked.script(upcoming);
        tracked
    }

    fn script<S: AsRef<str>>(&mut self, labels: &[S]) {
        self.upcoming = labels.iter().map(|l| l.as_ref().to_string()).collect();
    }

    fn remove_through<S: AsRef<str>>(&mut self, labels: &[S]) {
        self.script(labels);
        self.remove_after = true;
    }

    /// Jump straight to `status` and stay there
    fn hold(&mut self, status: &str) {
        self.value.set_status(status);
        self.upcoming.clear();
    }
}

/// Move one label forward; `None` when the resource is (now) gone
fn advance<T: Lifecycle + Clone>(map: &mut BTreeMap<String, Tracked<T>>, id: &str) -> Option<T> {
    let gone = {
        let tracked = map.get_mut(id)?;
        match tracked.upcoming.pop_front() {
            Some(next) => {
                tracked.value.set_status(&next);
                false
            }
            None => tracked.remove_after,
        }
    };
    if gone {
        map.remove(id);
        return None;
    }
    map.get(id).map(|t| t.value.clone())
}

fn new_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct World {
    instances: BTreeMap<String, Tracked<Instance>>,
    attachments: BTreeMap<String, Tracked<VolumeAttachment>>,
    volumes: BTreeMap<String, Tracked<Volume>>,
    snapshots: BTreeMap<String, Tracked<Snapshot>>,
    network_interfaces: BTreeMap<String, Tracked<NetworkInterface>>,
    security_groups: BTreeMap<String, SecurityGroup>,
}

impl World {
    fn instance(&self, mut instance: Instance) -> Instance {
        instance.volume_attachments = self
            .attachments
            .values()
            .filter(|a| a.value.instance_id == instance.id)
            .map(|a| a.value.clone())
            .collect();
        instance
    }

    fn volume(&self, mut volume: Volume) -> Volume {
        volume.attachments = self
            .attachments
            .values()
            .filter(|a| a.value.volume_id == volume.id)
            .map(|a| VolumeAttachmentRef {
                id: a.value.id.clone(),
                instance_id: a.value.instance_id.clone(),
            })
            .collect();
        volume
    }

    fn network_interface(&self, mut nic: NetworkInterface) -> NetworkInterface {
        nic.security_groups = self
            .security_groups
            .values()
            .filter(|g| g.targets.contains(&nic.id))
            .map(|g| g.id.clone())
            .collect();
        nic
    }

    fn require_instance(&self, id: &str) -> ApiResult<()> {
        if self.instances.contains_key(id) {
            Ok(())
        } else {
            Err(ApiError::not_found("instance", id))
        }
    }

    fn insert_volume(&mut self, volume: Volume, upcoming: &[&str]) {
        self.volumes
            .insert(volume.id.clone(), Tracked::new(volume, upcoming));
    }

    fn insert_attachment(
        &mut self,
        instance_id: &str,
        volume_id: &str,
        name: String,
        boot: bool,
        delete_volume_on_instance_delete: bool,
        status: &str,
        upcoming: &[&str],
    ) -> VolumeAttachment {
        let attachment = VolumeAttachment {
            id: new_id("att"),
            name,
            status: status.to_string(),
            instance_id: instance_id.to_string(),
            volume_id: volume_id.to_string(),
            boot,
            delete_volume_on_instance_delete,
        };
        self.attachments.insert(
            attachment.id.clone(),
            Tracked::new(attachment.clone(), upcoming),
        );
        attachment
    }

    /// New instance with its boot volume and boot attachment
    fn insert_instance<S: AsRef<str>>(
        &mut self,
        prototype: &InstancePrototype,
        status: &str,
        upcoming: &[S],
        reasons: Vec<StatusReason>,
    ) -> Instance {
        let id = new_id("inst");
        let boot_volume = Volume {
            id: new_id("vol"),
            name: format!("{}-boot", prototype.name),
            status: "available".to_string(),
            status_reasons: Vec::new(),
            zone: prototype.zone.clone(),
            profile: "general-purpose".to_string(),
            capacity: 100,
            iops: None,
            source_snapshot: None,
            attachments: Vec::new(),
        };
        let boot_volume_id = boot_volume.id.clone();
        self.insert_volume(boot_volume, &[]);
        self.insert_attachment(
            &id,
            &boot_volume_id,
            format!("{}-boot", prototype.name),
            true,
            prototype.auto_delete_volume,
            "attached",
            &[],
        );

        let instance = Instance {
            id: id.clone(),
            name: prototype.name.clone(),
            status: status.to_string(),
            status_reasons: reasons,
            vpc: prototype.vpc.clone(),
            zone: prototype.zone.clone(),
            profile: prototype.profile.clone(),
            image: prototype.image.clone(),
            primary_network_interface: Some(new_id("nic")),
            boot_volume: Some(boot_volume_id),
            volume_attachments: Vec::new(),
        };
        self.instances
            .insert(id, Tracked::new(instance.clone(), upcoming));
        self.instance(instance)
    }
}

#[derive(Debug, Default)]
struct Hooks {
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<ApiError>>,
    next_instance: Option<(Vec<String>, Vec<StatusReason>)>,
    next_volume: Option<Vec<String>>,
    next_snapshot: Option<Vec<String>>,
    /// Instance id -> status the next action freezes it in
    stalls: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    world: World,
    hooks: Hooks,
}

#[derive(Debug, Default)]
pub struct SimulatedVpc {
    inner: Mutex<Inner>,
}

impl SimulatedVpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a saved world; a missing file yields an empty one
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let world = match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => World::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                world,
                hooks: Hooks::default(),
            }),
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let content = serde_json::to_string_pretty(&self.lock().world)?;
        tokio::fs::write(path.as_ref(), content).await?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call and fail it if a failure was queued for `op`
    fn begin(&self, op: &str, args: &[&str]) -> ApiResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        let entry = std::iter::once(op)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        log::debug!("sim: {}", entry);
        inner.hooks.calls.push(entry);
        if let Some(error) = inner
            .hooks
            .failures
            .get_mut(op)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(inner)
    }

    /// Every call made so far, as `op arg...`
    pub fn calls(&self) -> Vec<String> {
        self.lock().hooks.calls.clone()
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: &str, error: ApiError) {
        self.lock()
            .hooks
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    /// Replace the upcoming labels of an existing resource
    pub fn script(&self, id: &str, labels: &[&str]) {
        let world = &mut self.lock().world;
        if let Some(t) = world.instances.get_mut(id) {
            t.script(labels);
        } else if let Some(t) = world.volumes.get_mut(id) {
            t.script(labels);
        } else if let Some(t) = world.snapshots.get_mut(id) {
            t.script(labels);
        } else if let Some(t) = world.network_interfaces.get_mut(id) {
            t.script(labels);
        } else if let Some(t) = world.attachments.get_mut(id) {
            t.script(labels);
        }
    }

    /// Labels (and reasons) of the next created instance
    pub fn script_next_instance(&self, labels: &[&str], reasons: Vec<StatusReason>) {
        self.lock().hooks.next_instance =
            Some((labels.iter().map(|l| l.to_string()).collect(), reasons));
    }

    pub fn script_next_volume(&self, labels: &[&str]) {
        self.lock().hooks.next_volume = Some(labels.iter().map(|l| l.to_string()).collect());
    }

    pub fn script_next_snapshot(&self, labels: &[&str]) {
        self.lock().hooks.next_snapshot = Some(labels.iter().map(|l| l.to_string()).collect());
    }

    /// The next action on `instance_id` leaves it in `status` for good
    pub fn stall_after_next_action(&self, instance_id: &str, status: &str) {
        self.lock()
            .hooks
            .stalls
            .insert(instance_id.to_string(), status.to_string());
    }

    pub fn seed_volume(&self, name: &str, zone: &str, capacity: i64) -> String {
        let volume = Volume {
            id: new_id("vol"),
            name: name.to_string(),
            status: "available".to_string(),
            status_reasons: Vec::new(),
            zone: zone.to_string(),
            profile: "general-purpose".to_string(),
            capacity,
            iops: None,
            source_snapshot: None,
            attachments: Vec::new(),
        };
        let id = volume.id.clone();
        self.lock().world.insert_volume(volume, &[]);
        id
    }

    /// A running instance with its boot volume attached
    pub fn seed_instance(&self, name: &str) -> String {
        let prototype = InstancePrototype {
            name: name.to_string(),
            vpc: "vpc-seed".to_string(),
            zone: "us-south-1".to_string(),
            profile: "bx2-2x8".to_string(),
            image: "ubuntu-24-04".to_string(),
            subnet: "subnet-seed".to_string(),
            auto_delete_volume: true,
        };
        self.lock()
            .world
            .insert_instance::<&str>(&prototype, "running", &[], Vec::new())
            .id
    }

    pub fn seed_attachment(&self, instance_id: &str, volume_id: &str) -> String {
        self.lock()
            .world
            .insert_attachment(
                instance_id,
                volume_id,
                format!("{}-attachment", volume_id),
                false,
                false,
                "attached",
                &[],
            )
            .id
    }

    pub fn seed_snapshot(&self, volume_id: &str) -> String {
        let snapshot = Snapshot {
            id: new_id("snap"),
            name: format!("{}-snapshot", volume_id),
            lifecycle_state: "stable".to_string(),
            source_volume: volume_id.to_string(),
            size: 100,
            bootable: false,
        };
        let id = snapshot.id.clone();
        self.lock()
            .world
            .snapshots
            .insert(id.clone(), Tracked::new(snapshot, &[] as &[&str]));
        id
    }

    pub fn seed_security_group(&self, name: &str, vpc: &str) -> String {
        let group = SecurityGroup {
            id: new_id("sg"),
            name: name.to_string(),
            vpc: vpc.to_string(),
            targets: Vec::new(),
            rules: Vec::new(),
        };
        let id = group.id.clone();
        self.lock().world.security_groups.insert(id.clone(), group);
        id
    }
}

#[async_trait]
impl VpcClient for SimulatedVpc {
    async fn get_instance(&self, id: &str) -> ApiResult<Instance> {
        let mut inner = self.begin("get_instance", &[id])?;
        let world = &mut inner.world;
        let instance =
            advance(&mut world.instances, id).ok_or_else(|| ApiError::not_found("instance", id))?;
        Ok(world.instance(instance))
    }

    async fn create_instance(&self, prototype: &InstancePrototype) -> ApiResult<Instance> {
        let mut inner = self.begin("create_instance", &[&prototype.name])?;
        let (upcoming, reasons) = inner.hooks.next_instance.take().unwrap_or_else(|| {
            (vec!["starting".to_string(), "running".to_string()], Vec::new())
        });
        Ok(inner
            .world
            .insert_instance(prototype, "pending", &upcoming, reasons))
    }

    async fn update_instance(&self, id: &str, patch: &InstancePatch) -> ApiResult<Instance> {
        let mut inner = self.begin("update_instance", &[id])?;
        let world = &mut inner.world;
        let tracked = world
            .instances
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("instance", id))?;
        if let Some(name) = &patch.name {
            tracked.value.name = name.clone();
        }
        let instance = tracked.value.clone();
        Ok(world.instance(instance))
    }

    async fn delete_instance(&self, id: &str) -> ApiResult<()> {
        let mut inner = self.begin("delete_instance", &[id])?;
        let world = &mut inner.world;
        world
            .instances
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("instance", id))?
            .remove_through(&["deleting"]);

        let attachments: Vec<VolumeAttachment> = world
            .attachments
            .values()
            .filter(|a| a.value.instance_id == id)
            .map(|a| a.value.clone())
            .collect();
        for attachment in attachments {
            world.attachments.remove(&attachment.id);
            if attachment.delete_volume_on_instance_delete
                && let Some(volume) = world.volumes.get_mut(&attachment.volume_id)
            {
                volume.hold("deleting");
                volume.remove_after = true;
            }
        }
        Ok(())
    }

    async fn create_instance_action(
        &self,
        id: &str,
        action: InstanceAction,
        force: bool,
    ) -> ApiResult<()> {
        let mut args = vec![action.as_str(), id];
        if force {
            args.push("force");
        }
        let mut inner = self.begin("create_instance_action", &args)?;
        let stall = inner.hooks.stalls.remove(id);
        let tracked = inner
            .world
            .instances
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("instance", id))?;
        match (stall, action) {
            (Some(status), _) => tracked.hold(&status),
            (None, InstanceAction::Stop) if force => tracked.script(&["stopped"]),
            (None, InstanceAction::Stop) => tracked.script(&["stopping", "stopped"]),
            (None, InstanceAction::Start) => tracked.script(&["starting", "running"]),
            (None, InstanceAction::Reboot) => tracked.script(&["restarting", "running"]),
        }
        Ok(())
    }

    async fn list_volume_attachments(&self, instance_id: &str) -> ApiResult<Vec<VolumeAttachment>> {
        let inner = self.begin("list_volume_attachments", &[instance_id])?;
        inner.world.require_instance(instance_id)?;
        Ok(inner
            .world
            .attachments
            .values()
            .filter(|a| a.value.instance_id == instance_id)
            .map(|a| a.value.clone())
            .collect())
    }

    async fn get_volume_attachment(
        &self,
        instance_id: &str,
        attachment_id: &str,
    ) -> ApiResult<VolumeAttachment> {
        let mut inner = self.begin("get_volume_attachment", &[instance_id, attachment_id])?;
        advance(&mut inner.world.attachments, attachment_id)
            .filter(|a| a.instance_id == instance_id)
            .ok_or_else(|| ApiError::not_found("volume attachment", attachment_id))
    }

    async fn create_volume_attachment(
        &self,
        instance_id: &str,
        prototype: &VolumeAttachmentPrototype,
    ) -> ApiResult<VolumeAttachment> {
        let mut inner =
            self.begin("create_volume_attachment", &[instance_id, &prototype.volume_id])?;
        let world = &mut inner.world;
        world.require_instance(instance_id)?;
        if !world.volumes.contains_key(&prototype.volume_id) {
            return Err(ApiError::not_found("volume", &prototype.volume_id));
        }
        if world
            .attachments
            .values()
            .any(|a| a.value.volume_id == prototype.volume_id)
        {
            return Err(ApiError::new(
                409,
                "volume_in_use",
                format!("volume {} is already attached", prototype.volume_id),
            ));
        }
        let name = prototype
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-attachment", prototype.volume_id));
        Ok(world.insert_attachment(
            instance_id,
            &prototype.volume_id,
            name,
            false,
            prototype.delete_volume_on_instance_delete,
            "attaching",
            &["attached"],
        ))
    }

    async fn delete_volume_attachment(
        &self,
        instance_id: &str,
        attachment_id: &str,
    ) -> ApiResult<()> {
        let mut inner = self.begin("delete_volume_attachment", &[instance_id, attachment_id])?;
        let tracked = inner
            .world
            .attachments
            .get_mut(attachment_id)
            .filter(|a| a.value.instance_id == instance_id)
            .ok_or_else(|| ApiError::not_found("volume attachment", attachment_id))?;
        if tracked.value.boot {
            return Err(ApiError::new(
                409,
                "boot_volume_attachment",
                "the boot volume cannot be detached",
            ));
        }
        tracked.remove_through(&["detaching"]);
        Ok(())
    }

    async fn get_volume(&self, id: &str) -> ApiResult<Volume> {
        let mut inner = self.begin("get_volume", &[id])?;
        let world = &mut inner.world;
        let volume =
            advance(&mut world.volumes, id).ok_or_else(|| ApiError::not_found("volume", id))?;
        Ok(world.volume(volume))
    }

    async fn create_volume(&self, prototype: &VolumePrototype) -> ApiResult<Volume> {
        let mut inner = self.begin("create_volume", &[&prototype.name])?;
        if let Some(snapshot) = &prototype.source_snapshot
            && !inner.world.snapshots.contains_key(snapshot)
        {
            return Err(ApiError::not_found("snapshot", snapshot));
        }
        let upcoming = inner
            .hooks
            .next_volume
            .take()
            .unwrap_or_else(|| vec!["available".to_string()]);
        let volume = Volume {
            id: new_id("vol"),
            name: prototype.name.clone(),
            status: "pending".to_string(),
            status_reasons: Vec::new(),
            zone: prototype.zone.clone(),
            profile: prototype.profile.clone(),
            capacity: prototype.capacity,
            iops: prototype.iops,
            source_snapshot: prototype.source_snapshot.clone(),
            attachments: Vec::new(),
        };
        inner
            .world
            .volumes
            .insert(volume.id.clone(), Tracked::new(volume.clone(), &upcoming));
        Ok(volume)
    }

    async fn update_volume(&self, id: &str, patch: &VolumePatch) -> ApiResult<Volume> {
        let mut inner = self.begin("update_volume", &[id])?;
        let world = &mut inner.world;
        let tracked = world
            .volumes
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("volume", id))?;
        if let Some(capacity) = patch.capacity
            && capacity < tracked.value.capacity
        {
            return Err(ApiError::new(
                400,
                "invalid_capacity",
                "volume capacity cannot be reduced",
            ));
        }
        let volume = &mut tracked.value;
        if let Some(name) = &patch.name {
            volume.name = name.clone();
        }
        if let Some(capacity) = patch.capacity {
            volume.capacity = capacity;
        }
        if let Some(iops) = patch.iops {
            volume.iops = Some(iops);
        }
        if let Some(profile) = &patch.profile {
            volume.profile = profile.clone();
        }
        tracked.hold("updating");
        tracked.script(&["available"]);
        let volume = tracked.value.clone();
        Ok(world.volume(volume))
    }

    async fn delete_volume(&self, id: &str) -> ApiResult<()> {
        let mut inner = self.begin("delete_volume", &[id])?;
        let world = &mut inner.world;
        if world.attachments.values().any(|a| a.value.volume_id == id) {
            return Err(ApiError::new(
                409,
                "volume_in_use",
                format!("volume {} is still attached", id),
            ));
        }
        world
            .volumes
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("volume", id))?
            .remove_through(&["deleting"]);
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> ApiResult<Snapshot> {
        let mut inner = self.begin("get_snapshot", &[id])?;
        advance(&mut inner.world.snapshots, id).ok_or_else(|| ApiError::not_found("snapshot", id))
    }

    async fn create_snapshot(&self, prototype: &SnapshotPrototype) -> ApiResult<Snapshot> {
        let mut inner = self.begin("create_snapshot", &[&prototype.source_volume])?;
        let source = inner
            .world
            .volumes
            .get(&prototype.source_volume)
            .ok_or_else(|| ApiError::not_found("volume", &prototype.source_volume))?
            .value
            .clone();
        let bootable = inner
            .world
            .attachments
            .values()
            .any(|a| a.value.volume_id == source.id && a.value.boot);
        let upcoming = inner
            .hooks
            .next_snapshot
            .take()
            .unwrap_or_else(|| vec!["stable".to_string()]);
        let snapshot = Snapshot {
            id: new_id("snap"),
            name: prototype.name.clone(),
            lifecycle_state: "pending".to_string(),
            source_volume: source.id,
            size: source.capacity,
            bootable,
        };
        inner
            .world
            .snapshots
            .insert(snapshot.id.clone(), Tracked::new(snapshot.clone(), &upcoming));
        Ok(snapshot)
    }

    async fn update_snapshot(&self, id: &str, name: &str) -> ApiResult<Snapshot> {
        let mut inner = self.begin("update_snapshot", &[id, name])?;
        let tracked = inner
            .world
            .snapshots
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("snapshot", id))?;
        tracked.value.name = name.to_string();
        tracked.hold("updating");
        tracked.script(&["stable"]);
        Ok(tracked.value.clone())
    }

    async fn delete_snapshot(&self, id: &str) -> ApiResult<()> {
        let mut inner = self.begin("delete_snapshot", &[id])?;
        inner
            .world
            .snapshots
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found("snapshot", id))?
            .remove_through(&["deleting"]);
        Ok(())
    }

    async fn delete_snapshots_for_volume(&self, volume_id: &str) -> ApiResult<()> {
        let mut inner = self.begin("delete_snapshots_for_volume", &[volume_id])?;
        for tracked in inner
            .world
            .snapshots
            .values_mut()
            .filter(|s| s.value.source_volume == volume_id)
        {
            tracked.hold("deleting");
            tracked.remove_after = true;
        }
        Ok(())
    }

    async fn get_network_interface(
        &self,
        instance_id: &str,
        id: &str,
    ) -> ApiResult<NetworkInterface> {
        let mut inner = self.begin("get_network_interface", &[instance_id, id])?;
        let world = &mut inner.world;
        let nic = advance(&mut world.network_interfaces, id)
            .filter(|n| n.instance_id == instance_id)
            .ok_or_else(|| ApiError::not_found("network interface", id))?;
        Ok(world.network_interface(nic))
    }

    async fn create_network_interface(
        &self,
        instance_id: &str,
        prototype: &NetworkInterfacePrototype,
    ) -> ApiResult<NetworkInterface> {
        let mut inner = self.begin("create_network_interface", &[instance_id, &prototype.name])?;
        let world = &mut inner.world;
        world.require_instance(instance_id)?;
        let primary_ip = prototype.primary_ip.clone().unwrap_or_else(|| {
            format!("10.240.0.{}", 4 + world.network_interfaces.len())
        });
        let nic = NetworkInterface {
            id: new_id("nic"),
            instance_id: instance_id.to_string(),
            name: prototype.name.clone(),
            status: "pending".to_string(),
            subnet: prototype.subnet.clone(),
            primary_ip: Some(primary_ip),
            allow_ip_spoofing: prototype.allow_ip_spoofing,
            security_groups: Vec::new(),
        };
        world
            .network_interfaces
            .insert(nic.id.clone(), Tracked::new(nic.clone(), &["available"]));
        Ok(nic)
    }

    async fn update_network_interface(
        &self,
        instance_id: &str,
        id: &str,
        patch: &NetworkInterfacePatch,
    ) -> ApiResult<NetworkInterface> {
        let mut inner = self.begin("update_network_interface", &[instance_id, id])?;
        let world = &mut inner.world;
        let tracked = world
            .network_interfaces
            .get_mut(id)
            .filter(|n| n.value.instance_id == instance_id)
            .ok_or_else(|| ApiError::not_found("network interface", id))?;
        if let Some(name) = &patch.name {
            tracked.value.name = name.clone();
        }
        if let Some(allow) = patch.allow_ip_spoofing {
            tracked.value.allow_ip_spoofing = allow;
        }
        let nic = tracked.value.clone();
        Ok(world.network_interface(nic))
    }

    async fn delete_network_interface(&self, instance_id: &str, id: &str) -> ApiResult<()> {
        let mut inner = self.begin("delete_network_interface", &[instance_id, id])?;
        let world = &mut inner.world;
        world
            .network_interfaces
            .get_mut(id)
            .filter(|n| n.value.instance_id == instance_id)
            .ok_or_else(|| ApiError::not_found("network interface", id))?
            .remove_through(&["deleting"]);
        for group in world.security_groups.values_mut() {
            group.targets.retain(|t| t != id);
        }
        Ok(())
    }

    async fn get_security_group(&self, id: &str) -> ApiResult<SecurityGroup> {
        let inner = self.begin("get_security_group", &[id])?;
        inner
            .world
            .security_groups
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("security group", id))
    }

    async fn create_security_group(
        &self,
        prototype: &SecurityGroupPrototype,
    ) -> ApiResult<SecurityGroup> {
        let mut inner = self.begin("create_security_group", &[&prototype.name])?;
        let group = SecurityGroup {
            id: new_id("sg"),
            name: prototype.name.clone(),
            vpc: prototype.vpc.clone(),
            targets: Vec::new(),
            rules: Vec::new(),
        };
        inner
            .world
            .security_groups
            .insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn delete_security_group(&self, id: &str) -> ApiResult<()> {
        let mut inner = self.begin("delete_security_group", &[id])?;
        let group = inner
            .world
            .security_groups
            .get(id)
            .ok_or_else(|| ApiError::not_found("security group", id))?;
        if !group.targets.is_empty() {
            return Err(ApiError::new(
                409,
                "security_group_in_use",
                format!("security group {} still has {} targets", id, group.targets.len()),
            ));
        }
        inner.world.security_groups.remove(id);
        Ok(())
    }

    async fn list_security_group_targets(&self, security_group_id: &str) -> ApiResult<Vec<String>> {
        let inner = self.begin("list_security_group_targets", &[security_group_id])?;
        inner
            .world
            .security_groups
            .get(security_group_id)
            .map(|group| group.targets.clone())
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))
    }

    async fn create_security_group_target_binding(
        &self,
        security_group_id: &str,
        target_id: &str,
    ) -> ApiResult<()> {
        let mut inner = self.begin(
            "create_security_group_target_binding",
            &[security_group_id, target_id],
        )?;
        let group = inner
            .world
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))?;
        if !group.targets.iter().any(|t| t == target_id) {
            group.targets.push(target_id.to_string());
        }
        Ok(())
    }

    async fn delete_security_group_target_binding(
        &self,
        security_group_id: &str,
        target_id: &str,
    ) -> ApiResult<()> {
        let mut inner = self.begin(
            "delete_security_group_target_binding",
            &[security_group_id, target_id],
        )?;
        let group = inner
            .world
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))?;
        let before = group.targets.len();
        group.targets.retain(|t| t != target_id);
        if group.targets.len() == before {
            return Err(ApiError::not_found("security group target", target_id));
        }
        Ok(())
    }

    async fn get_security_group_rule(
        &self,
        security_group_id: &str,
        id: &str,
    ) -> ApiResult<SecurityGroupRule> {
        let inner = self.begin("get_security_group_rule", &[security_group_id, id])?;
        inner
            .world
            .security_groups
            .get(security_group_id)
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))?
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("security group rule", id))
    }

    async fn create_security_group_rule(
        &self,
        security_group_id: &str,
        prototype: &SecurityGroupRulePrototype,
    ) -> ApiResult<SecurityGroupRule> {
        let mut inner = self.begin(
            "create_security_group_rule",
            &[security_group_id, &prototype.direction, &prototype.protocol],
        )?;
        let group = inner
            .world
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))?;
        let rule = SecurityGroupRule {
            id: new_id("rule"),
            direction: prototype.direction.clone(),
            ip_version: prototype.ip_version.clone(),
            protocol: prototype.protocol.clone(),
            remote: prototype.remote.clone(),
            port_min: prototype.port_min,
            port_max: prototype.port_max,
            icmp_type: prototype.icmp_type,
            icmp_code: prototype.icmp_code,
        };
        group.rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_security_group_rule(
        &self,
        security_group_id: &str,
        id: &str,
        patch: &SecurityGroupRulePatch,
    ) -> ApiResult<SecurityGroupRule> {
        let mut inner = self.begin("update_security_group_rule", &[security_group_id, id])?;
        let rule = inner
            .world
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))?
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ApiError::not_found("security group rule", id))?;
        if let Some(direction) = &patch.direction {
            rule.direction = direction.clone();
        }
        if let Some(ip_version) = &patch.ip_version {
            rule.ip_version = ip_version.clone();
        }
        if let Some(remote) = &patch.remote {
            rule.remote = Some(remote.clone());
        }
        rule.port_min = patch.port_min.or(rule.port_min);
        rule.port_max = patch.port_max.or(rule.port_max);
        rule.icmp_type = patch.icmp_type.or(rule.icmp_type);
        rule.icmp_code = patch.icmp_code.or(rule.icmp_code);
        Ok(rule.clone())
    }

    async fn delete_security_group_rule(
        &self,
        security_group_id: &str,
        id: &str,
    ) -> ApiResult<()> {
        let mut inner = self.begin("delete_security_group_rule", &[security_group_id, id])?;
        let group = inner
            .world
            .security_groups
            .get_mut(security_group_id)
            .ok_or_else(|| ApiError::not_found("security group", security_group_id))?;
        let before = group.rules.len();
        group.rules.retain(|r| r.id != id);
        if group.rules.len() == before {
            return Err(ApiError::not_found("security group rule", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::refresh::RemoteError;

    fn prototype() -> VolumePrototype {
        VolumePrototype {
            name: "data".to_string(),
            zone: "us-south-1".to_string(),
            profile: "general-purpose".to_string(),
            capacity: 100,
            iops: None,
            source_snapshot: None,
        }
    }

    #[tokio::test]
    async fn each_get_advances_one_label() {
        let sim = SimulatedVpc::new();
        sim.script_next_volume(&["provisioning", "available"]);
        let created = sim.create_volume(&prototype()).await.unwrap();
        assert_eq!(created.status, "pending");

        assert_eq!(sim.get_volume(&created.id).await.unwrap().status, "provisioning");
        assert_eq!(sim.get_volume(&created.id).await.unwrap().status, "available");
        assert_eq!(sim.get_volume(&created.id).await.unwrap().status, "available");
    }

    #[tokio::test]
    async fn deleted_resource_reports_deleting_then_404() {
        let sim = SimulatedVpc::new();
        let id = sim.seed_volume("data", "us-south-1", 10);
        sim.delete_volume(&id).await.unwrap();

        assert_eq!(sim.get_volume(&id).await.unwrap().status, "deleting");
        assert!(sim.get_volume(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attached_volume_cannot_be_deleted() {
        let sim = SimulatedVpc::new();
        let instance = sim.seed_instance("web");
        let volume = sim.seed_volume("data", "us-south-1", 10);
        sim.seed_attachment(&instance, &volume);

        let err = sim.delete_volume(&volume).await.unwrap_err();
        assert_eq!(err.status, Some(409));
        assert_eq!(sim.get_volume(&volume).await.unwrap().attachments.len(), 1);
    }

    #[tokio::test]
    async fn injected_failure_hits_once_and_is_logged() {
        let sim = SimulatedVpc::new();
        sim.fail_next("create_volume", ApiError::new(500, "internal_error", "boom"));

        assert!(sim.create_volume(&prototype()).await.is_err());
        assert!(sim.create_volume(&prototype()).await.is_ok());
        assert_eq!(sim.calls(), vec!["create_volume data", "create_volume data"]);
    }

    #[tokio::test]
    async fn instance_delete_takes_boot_volume_along() {
        let sim = SimulatedVpc::new();
        let id = sim.seed_instance("web");
        let boot = sim.get_instance(&id).await.unwrap().boot_volume.unwrap();

        sim.delete_instance(&id).await.unwrap();
        assert!(sim.get_volume(&boot).await.unwrap_err().is_not_found());
        assert_eq!(sim.get_instance(&id).await.unwrap().status, "deleting");
        assert!(sim.get_instance(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn world_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");

        let sim = SimulatedVpc::new();
        let instance = sim.seed_instance("web");
        let group = sim.seed_security_group("web", "vpc-1");
        sim.save(&path).await.unwrap();

        let loaded = SimulatedVpc::load(&path).await.unwrap();
        assert_eq!(loaded.get_instance(&instance).await.unwrap().name, "web");
        assert_eq!(loaded.get_security_group(&group).await.unwrap().name, "web");
        assert_eq!(loaded.calls().len(), 2);
    }

    #[tokio::test]
    async fn missing_world_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedVpc::load(dir.path().join("absent.json")).await.unwrap();
        assert!(sim.get_instance("inst-1").await.unwrap_err().is_not_found());
    }
}
