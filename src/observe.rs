use crate::verify::MatchStrategy;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Things worth telling an operator about during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    InputsListed { pending: usize, excluded: usize },
    WorkerScaled { desired: i32 },
    Settling { delay: Duration },
    IndexPrepared { name: String, created: bool },
    IndexPreparationFailed { name: String, reason: String },
    InputUnreadable { key: String, reason: String },
    InputUnextractable { key: String, subject: Option<String> },
    StrategyMissed { identifier: String, strategy: MatchStrategy },
    StrategyMatched { identifier: String, strategy: MatchStrategy, evidence: Option<String> },
    AttemptMissed { key: String, identifier: String, attempt: u32, max_attempts: u32 },
    InputDeleted { key: String, identifier: String, strategy: Option<MatchStrategy> },
    DeleteFailed { key: String, reason: String },
    InputLeftPending { key: String, identifier: String, attempts: u32 },
    RecentIdentifiers { identifiers: Vec<String> },
    WorkerLeftRunning { remaining: usize },
}

pub trait ReconcileObserver: Send + Sync {
    fn record(&self, event: &ReconcileEvent);
}

/// Writes every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ReconcileObserver for TracingObserver {
    fn record(&self, event: &ReconcileEvent) {
        match event {
            ReconcileEvent::InputsListed { pending, excluded } => {
                info!(pending, excluded, "listed pending inputs")
            }
            ReconcileEvent::WorkerScaled { desired } => info!(desired, "requested worker scale"),
            ReconcileEvent::Settling { delay } => {
                info!(delay_secs = delay.as_secs(), "waiting for worker to start")
            }
            ReconcileEvent::IndexPrepared { name, created } => debug!(%name, created, "index ready"),
            ReconcileEvent::IndexPreparationFailed { name, reason } => {
                warn!(%name, %reason, "could not prepare index, using default analysis")
            }
            ReconcileEvent::InputUnreadable { key, reason } => {
                warn!(%key, %reason, "skipping unreadable input")
            }
            ReconcileEvent::InputUnextractable { key, subject } => {
                warn!(%key, subject = subject.as_deref().unwrap_or("-"), "skipping input without report id")
            }
            ReconcileEvent::StrategyMissed { identifier, strategy } => {
                debug!(%identifier, ?strategy, "no match")
            }
            ReconcileEvent::StrategyMatched { identifier, strategy, evidence } => {
                info!(%identifier, ?strategy, evidence = evidence.as_deref().unwrap_or("-"), "matched")
            }
            ReconcileEvent::AttemptMissed { key, identifier, attempt, max_attempts } => {
                info!(%key, %identifier, attempt, max_attempts, "report not indexed yet")
            }
            ReconcileEvent::InputDeleted { key, identifier, strategy } => {
                info!(%key, %identifier, ?strategy, "deleted ingested input")
            }
            ReconcileEvent::DeleteFailed { key, reason } => {
                error!(%key, %reason, "failed to delete ingested input")
            }
            ReconcileEvent::InputLeftPending { key, identifier, attempts } => {
                warn!(%key, %identifier, attempts, "report never appeared in index, leaving input for next run")
            }
            ReconcileEvent::RecentIdentifiers { identifiers } => {
                info!(recent = %identifiers.join(","), "most recently indexed report ids")
            }
            ReconcileEvent::WorkerLeftRunning { remaining } => {
                info!(remaining, "inputs remain, leaving worker running")
            }
        }
    }
}

/// Keeps events in memory so callers can inspect them.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ReconcileEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReconcileEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ReconcileObserver for RecordingObserver {
    fn record(&self, event: &ReconcileEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
