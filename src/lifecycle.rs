use crate::error::ReconcileError;
use serde::Serialize;

/// Run state of the backing worker service, as reported by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    pub running_count: i32,
    pub desired_count: i32,
}

pub trait SchedulerLike {
    fn describe_service(&self) -> Result<WorkerState, ReconcileError>;
    fn update_desired_count(&self, desired: i32) -> Result<(), ReconcileError>;

    fn list_running_tasks(&self) -> Result<Vec<String>, ReconcileError> {
        Ok(Vec::new())
    }

    fn task_status(&self, _task_id: &str) -> Result<Option<String>, ReconcileError> {
        Ok(None)
    }
}

/// Stateless façade over the scheduler. Only "off" (0) and "one worker" (1)
/// are ever requested.
pub struct WorkerLifecycle<C> {
    scheduler: C,
}

impl<C: SchedulerLike> WorkerLifecycle<C> {
    pub fn new(scheduler: C) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &C {
        &self.scheduler
    }

    pub fn state(&self) -> Result<WorkerState, ReconcileError> {
        self.scheduler.describe_service()
    }

    pub fn current_replica_count(&self) -> Result<i32, ReconcileError> {
        Ok(self.state()?.running_count)
    }

    pub fn set_desired_replica_count(&self, desired: i32) -> Result<(), ReconcileError> {
        if !(0..=1).contains(&desired) {
            return Err(ReconcileError::Scheduler(format!(
                "refusing to scale worker to {}, only 0 or 1 is supported",
                desired
            )));
        }
        self.scheduler.update_desired_count(desired)
    }

    /// Task ids paired with their last reported status, for operators.
    pub fn task_statuses(&self) -> Result<Vec<(String, Option<String>)>, ReconcileError> {
        self.scheduler
            .list_running_tasks()?
            .into_iter()
            .map(|task| {
                let status = self.scheduler.task_status(&task)?;
                Ok::<_, ReconcileError>((task, status))
            })
            .collect()
    }
}
