use crate::config::SchedulerSettings;
use crate::error::ReconcileError;
use crate::lifecycle::{SchedulerLike, WorkerState};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::DesiredStatus;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Blocking wrapper around one ECS service.
#[derive(Clone)]
pub struct EcsScheduler {
    client: Client,
    cluster: String,
    service: String,
    runtime: Arc<Runtime>,
}

impl EcsScheduler {
    pub fn new(
        settings: &SchedulerSettings,
        region: &str,
        runtime: Arc<Runtime>,
    ) -> Result<Self, ReconcileError> {
        let region = Region::new(region.to_string());
        let base_config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load(),
        );

        Ok(Self {
            client: Client::new(&base_config),
            cluster: settings.cluster.clone(),
            service: settings.service.clone(),
            runtime,
        })
    }
}

impl SchedulerLike for EcsScheduler {
    fn describe_service(&self) -> Result<WorkerState, ReconcileError> {
        let resp = self
            .runtime
            .block_on(
                self.client
                    .describe_services()
                    .cluster(&self.cluster)
                    .services(&self.service)
                    .send(),
            )
            .map_err(|e| ReconcileError::Scheduler(format!("describe {}: {}", self.service, e)))?;

        let service = resp.services().first().ok_or_else(|| {
            let reason = resp
                .failures()
                .first()
                .and_then(|f| f.reason())
                .unwrap_or("not found");
            ReconcileError::Scheduler(format!("describe {}: {}", self.service, reason))
        })?;

        Ok(WorkerState {
            running_count: service.running_count(),
            desired_count: service.desired_count(),
        })
    }

    fn update_desired_count(&self, desired: i32) -> Result<(), ReconcileError> {
        self.runtime
            .block_on(
                self.client
                    .update_service()
                    .cluster(&self.cluster)
                    .service(&self.service)
                    .desired_count(desired)
                    .send(),
            )
            .map_err(|e| {
                ReconcileError::Scheduler(format!("scale {} to {}: {}", self.service, desired, e))
            })?;
        Ok(())
    }

    fn list_running_tasks(&self) -> Result<Vec<String>, ReconcileError> {
        let resp = self
            .runtime
            .block_on(
                self.client
                    .list_tasks()
                    .cluster(&self.cluster)
                    .service_name(&self.service)
                    .desired_status(DesiredStatus::Running)
                    .send(),
            )
            .map_err(|e| ReconcileError::Scheduler(format!("list tasks {}: {}", self.service, e)))?;
        Ok(resp.task_arns().to_vec())
    }

    fn task_status(&self, task_id: &str) -> Result<Option<String>, ReconcileError> {
        let resp = self
            .runtime
            .block_on(
                self.client
                    .describe_tasks()
                    .cluster(&self.cluster)
                    .tasks(task_id)
                    .send(),
            )
            .map_err(|e| ReconcileError::Scheduler(format!("describe task {}: {}", task_id, e)))?;
        Ok(resp
            .tasks()
            .first()
            .and_then(|task| task.last_status())
            .map(|s| s.to_string()))
    }
}
