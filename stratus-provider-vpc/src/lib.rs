//! Stratus VPC Provider
//!
//! Manages virtual server instances, block volumes, snapshots, instance
//! network interfaces, security groups and their rules. Every mutating
//! operation returns only once the remote resource reached a terminal status.

pub mod client;
pub mod config;
pub mod context;
pub mod instance;
pub mod model;
pub mod network_interface;
pub mod recovery;
pub mod security_group;
pub mod security_group_rule;
pub mod sim;
pub mod snapshot;
pub mod volume;

use std::sync::Arc;

use stratus_core::data::ResourceData;
use stratus_core::provider::{BoxFuture, Provider, ProviderError, ProviderResult, ResourceType};
use stratus_core::refresh::ResourceHandle;
use stratus_core::resource::{Resource, ResourceId, State};
use stratus_core::timeouts::Timeouts;

use crate::client::VpcClient;
pub use crate::context::VpcContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Read,
    Update,
    Delete,
}

fn unknown_type(id: &ResourceId) -> ProviderError {
    ProviderError::new(format!("Unknown resource type: {}", id.resource_type))
        .for_resource(id.clone())
}

/// VPC Provider
pub struct VpcProvider {
    ctx: VpcContext,
}

impl VpcProvider {
    pub fn new(client: Arc<dyn VpcClient>) -> Self {
        Self::with_context(VpcContext::new(client))
    }

    /// Provider sharing an existing context (locks, pacing, cancellation)
    pub fn with_context(ctx: VpcContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &VpcContext {
        &self.ctx
    }

    /// Whether the remote resource behind `identifier` still exists
    pub async fn exists(&self, id: &ResourceId, identifier: &str) -> ProviderResult<bool> {
        let ctx = &self.ctx;
        let handle = ResourceHandle::new(identifier);
        let exists = match id.resource_type.as_str() {
            instance::RESOURCE_TYPE => instance::exists(ctx, &handle).await,
            volume::RESOURCE_TYPE => volume::exists(ctx, &handle).await,
            snapshot::RESOURCE_TYPE => snapshot::exists(ctx, &handle).await,
            network_interface::RESOURCE_TYPE => network_interface::exists(ctx, &handle).await,
            security_group::RESOURCE_TYPE => security_group::exists(ctx, &handle).await,
            security_group_rule::RESOURCE_TYPE => {
                security_group_rule::exists(ctx, &handle).await
            }
            _ => return Err(unknown_type(id)),
        };
        exists.map_err(|e| e.for_resource(id.clone()))
    }

    fn timeouts_for(&self, id: &ResourceId) -> ProviderResult<Timeouts> {
        self.resource_types()
            .iter()
            .find(|t| t.name() == id.resource_type)
            .map(|t| t.timeouts())
            .ok_or_else(|| unknown_type(id))
    }

    async fn dispatch(&self, op: Op, data: &mut ResourceData) -> ProviderResult<()> {
        let ctx = &self.ctx;
        let resource_type = data.id().resource_type.clone();
        match resource_type.as_str() {
            instance::RESOURCE_TYPE => match op {
                Op::Create => instance::create(ctx, data).await,
                Op::Read => instance::read(ctx, data).await,
                Op::Update => instance::update(ctx, data).await,
                Op::Delete => instance::delete(ctx, data).await,
            },
            volume::RESOURCE_TYPE => match op {
                Op::Create => volume::create(ctx, data).await,
                Op::Read => volume::read(ctx, data).await,
                Op::Update => volume::update(ctx, data).await,
                Op::Delete => volume::delete(ctx, data).await,
            },
            snapshot::RESOURCE_TYPE => match op {
                Op::Create => snapshot::create(ctx, data).await,
                Op::Read => snapshot::read(ctx, data).await,
                Op::Update => snapshot::update(ctx, data).await,
                Op::Delete => snapshot::delete(ctx, data).await,
            },
            network_interface::RESOURCE_TYPE => match op {
                Op::Create => network_interface::create(ctx, data).await,
                Op::Read => network_interface::read(ctx, data).await,
                Op::Update => network_interface::update(ctx, data).await,
                Op::Delete => network_interface::delete(ctx, data).await,
            },
            security_group::RESOURCE_TYPE => match op {
                Op::Create => security_group::create(ctx, data).await,
                Op::Read => security_group::read(ctx, data).await,
                Op::Update => security_group::update(ctx, data).await,
                Op::Delete => security_group::delete(ctx, data).await,
            },
            security_group_rule::RESOURCE_TYPE => match op {
                Op::Create => security_group_rule::create(ctx, data).await,
                Op::Read => security_group_rule::read(ctx, data).await,
                Op::Update => security_group_rule::update(ctx, data).await,
                Op::Delete => security_group_rule::delete(ctx, data).await,
            },
            _ => Err(unknown_type(data.id())),
        }
    }
}

impl Provider for VpcProvider {
    fn name(&self) -> &'static str {
        "vpc"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        vec![
            Box::new(instance::InstanceType),
            Box::new(volume::VolumeType),
            Box::new(snapshot::SnapshotType),
            Box::new(network_interface::NetworkInterfaceType),
            Box::new(security_group::SecurityGroupType),
            Box::new(security_group_rule::SecurityGroupRuleType),
        ]
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(str::to_string);
        Box::pin(async move {
            let timeouts = self.timeouts_for(&id)?;
            let Some(identifier) = identifier else {
                return Ok(State::not_found(id));
            };
            let mut data = ResourceData::new(id, timeouts);
            data.set_identifier(identifier);
            self.dispatch(Op::Read, &mut data).await?;
            Ok(data.into_state())
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            let timeouts = self.timeouts_for(&resource.id)?;
            let mut data = ResourceData::from_resource(&resource, None, timeouts)?;
            match self.dispatch(Op::Create, &mut data).await {
                Ok(()) => Ok(data.into_state()),
                Err(e) => {
                    let Some(identifier) = data.identifier() else {
                        return Err(e);
                    };
                    log::warn!(
                        "{} was created as {} but did not converge",
                        resource.id,
                        identifier
                    );
                    Err(e.with_partial(data.into_state().with_tainted(true)))
                }
            }
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move {
            let timeouts = self.timeouts_for(&id)?;
            let mut data = ResourceData::from_resource(&to, Some(&from), timeouts)?;
            data.set_identifier(identifier);
            self.dispatch(Op::Update, &mut data).await?;
            Ok(data.into_state())
        })
    }

    fn delete(
        &self,
        id: &ResourceId,
        identifier: &str,
        last: &State,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let last = last.clone();
        Box::pin(async move {
            let timeouts = self.timeouts_for(&id)?;
            let mut data = ResourceData::from_state(&last, timeouts);
            data.set_identifier(identifier);
            self.dispatch(Op::Delete, &mut data).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedVpc;
    use stratus_core::resource::Value;

    fn provider() -> (Arc<SimulatedVpc>, VpcProvider) {
        let sim = Arc::new(SimulatedVpc::new());
        (sim.clone(), VpcProvider::new(sim))
    }

    fn volume(capacity: i64) -> Resource {
        Resource::new("volume", "data")
            .with_attribute("zone", Value::String("us-south-1".to_string()))
            .with_attribute("capacity", Value::Int(capacity))
    }

    #[tokio::test(start_paused = true)]
    async fn volume_lifecycle_through_provider() {
        let (_sim, provider) = provider();

        let created = provider.create(&volume(100)).await.unwrap();
        assert!(created.exists);
        let identifier = created.identifier.clone().unwrap();

        let updated = provider
            .update(&created.id, &identifier, &created, &volume(150))
            .await
            .unwrap();
        assert_eq!(updated.attributes.get("capacity"), Some(&Value::Int(150)));

        let read = provider
            .read(&created.id, Some(&identifier))
            .await
            .unwrap();
        assert_eq!(read.attributes.get("capacity"), Some(&Value::Int(150)));

        provider
            .delete(&created.id, &identifier, &updated)
            .await
            .unwrap();
        assert!(!provider.exists(&created.id, &identifier).await.unwrap());
    }

    #[tokio::test]
    async fn read_without_identifier_is_not_found() {
        let (_sim, provider) = provider();
        let state = provider
            .read(&ResourceId::new("instance", "web"), None)
            .await
            .unwrap();
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn read_of_existing_volume_acts_as_data_source() {
        let (sim, provider) = provider();
        let id = sim.seed_volume("shared", "us-south-1", 250);

        let state = provider
            .read(&ResourceId::new("volume", "shared"), Some(&id))
            .await
            .unwrap();
        assert!(state.exists);
        assert_eq!(state.identifier.as_deref(), Some(id.as_str()));
        assert_eq!(state.attributes.get("capacity"), Some(&Value::Int(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_hands_back_a_tainted_state() {
        let (sim, provider) = provider();
        sim.script_next_instance(&["failed"], Vec::new());
        let s = |v: &str| Value::String(v.to_string());
        let web = Resource::new("instance", "web")
            .with_attribute("vpc", s("vpc-1"))
            .with_attribute("zone", s("us-south-1"))
            .with_attribute("profile", s("bx2-2x8"))
            .with_attribute("image", s("ubuntu-24-04"))
            .with_attribute("subnet", s("subnet-1"));

        let err = provider.create(&web).await.unwrap_err();

        let partial = err.partial.expect("failed create keeps its identifier");
        assert!(partial.exists);
        assert!(partial.tainted);
        let identifier = partial.identifier.clone().unwrap();
        assert!(provider.exists(&web.id, &identifier).await.unwrap());
    }

    #[tokio::test]
    async fn rejected_create_has_nothing_to_record() {
        let (_sim, provider) = provider();
        let err = provider
            .create(&Resource::new("volume", "data"))
            .await
            .unwrap_err();
        assert!(err.partial.is_none());
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let (_sim, provider) = provider();
        let err = provider
            .create(&Resource::new("load_balancer", "lb"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown resource type: load_balancer"));
        assert_eq!(err.resource_id, Some(ResourceId::new("load_balancer", "lb")));
    }

    #[test]
    fn every_type_has_timeouts() {
        let (_sim, provider) = provider();
        let names: Vec<_> = provider.resource_types().iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "instance",
                "volume",
                "snapshot",
                "network_interface",
                "security_group",
                "security_group_rule"
            ]
        );
        let instance = provider
            .timeouts_for(&ResourceId::new("instance", "web"))
            .unwrap();
        assert_eq!(instance, Timeouts::from_minutes(30, 30, 30));
    }
}
