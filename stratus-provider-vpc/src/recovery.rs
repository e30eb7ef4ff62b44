//! Corrective actions for instances stuck in a power transition

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratus_core::corrective::CorrectiveAction;
use stratus_core::provider::ProviderError;
use stratus_core::refresh::ResourceHandle;

use crate::client::{InstanceAction, VpcClient};
use crate::context::VpcContext;
use crate::instance;

/// How long a restart waits for the stop to land before starting again
pub const RESTART_STOP_BUDGET: Duration = Duration::from_secs(60);

/// Stop the instance, give it a minute to stop, then start it again
pub struct RestartStart {
    ctx: VpcContext,
}

impl RestartStart {
    pub fn new(ctx: VpcContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CorrectiveAction for RestartStart {
    async fn remediate(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        let client = &self.ctx.client;
        client
            .create_instance_action(handle.as_str(), InstanceAction::Stop, false)
            .await
            .map_err(|e| e.context(format!("error stopping instance {} for restart", handle)))?;

        // Starting is attempted whether or not the stop was observed
        if let Err(e) =
            instance::wait_stopped(&self.ctx, handle, RESTART_STOP_BUDGET, None).await
        {
            log::warn!("Instance {} did not report stopped before restart: {}", handle, e);
        }

        client
            .create_instance_action(handle.as_str(), InstanceAction::Start, false)
            .await
            .map_err(|e| e.context(format!("error starting instance {}", handle)))
    }

    fn describe(&self) -> String {
        "restarting the instance".to_string()
    }
}

/// Stop the instance with `force` set
pub struct ForceStop {
    client: Arc<dyn VpcClient>,
}

impl ForceStop {
    pub fn new(client: Arc<dyn VpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CorrectiveAction for ForceStop {
    async fn remediate(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        self.client
            .create_instance_action(handle.as_str(), InstanceAction::Stop, true)
            .await
            .map_err(|e| e.context(format!("error force-stopping instance {}", handle)))
    }

    fn describe(&self) -> String {
        "force-stopping the instance".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiError;
    use crate::model::InstancePrototype;
    use crate::sim::SimulatedVpc;
    use tokio::time::Instant;

    fn prototype() -> InstancePrototype {
        InstancePrototype {
            name: "web".to_string(),
            vpc: "vpc-1".to_string(),
            zone: "us-south-1".to_string(),
            profile: "bx2-2x8".to_string(),
            image: "ubuntu-24-04".to_string(),
            subnet: "subnet-1".to_string(),
            auto_delete_volume: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_stops_then_starts() {
        let sim = Arc::new(SimulatedVpc::new());
        let created = sim.create_instance(&prototype()).await.unwrap();
        let ctx = VpcContext::new(sim.clone());
        let handle = ResourceHandle::new(&created.id);

        let start = Instant::now();
        RestartStart::new(ctx).remediate(&handle).await.unwrap();

        let actions: Vec<String> = sim
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create_instance_action"))
            .collect();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].starts_with("create_instance_action stop"));
        assert!(actions[1].starts_with("create_instance_action start"));
        assert!(start.elapsed() <= RESTART_STOP_BUDGET);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_starts_even_when_stop_is_not_observed() {
        let sim = Arc::new(SimulatedVpc::new());
        let created = sim.create_instance(&prototype()).await.unwrap();
        let ctx = VpcContext::new(sim.clone());
        let handle = ResourceHandle::new(&created.id);
        sim.stall_after_next_action(&created.id, "stopping");

        let start = Instant::now();
        RestartStart::new(ctx).remediate(&handle).await.unwrap();

        assert!(start.elapsed() >= RESTART_STOP_BUDGET);
        assert!(
            sim.calls()
                .iter()
                .any(|c| c.starts_with("create_instance_action start"))
        );
    }

    #[tokio::test]
    async fn force_stop_reports_rejection() {
        let sim = Arc::new(SimulatedVpc::new());
        sim.fail_next(
            "create_instance_action",
            ApiError::new(409, "conflict", "instance is busy"),
        );

        let err = ForceStop::new(sim.clone())
            .remediate(&ResourceHandle::new("inst-1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("instance is busy"));
        assert!(sim.calls()[0].ends_with("force"));
    }
}
