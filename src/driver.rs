use crate::clock::{SleeperLike, ThreadSleeper};
use crate::config::ReconcileConfig;
use crate::error::ReconcileError;
use crate::extract::IdentifierExtractor;
use crate::index::IndexClientLike;
use crate::lifecycle::{SchedulerLike, WorkerLifecycle};
use crate::observe::{ReconcileEvent, ReconcileObserver, TracingObserver};
use crate::store::{ObjectStoreLike, PendingInput};
use crate::verify::{MatchStrategy, MatchVerdict, MatchVerifier};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NoFiles,
    Success,
}

/// What happened to one input during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum InputDisposition {
    Deleted { key: String, identifier: String, strategy: Option<MatchStrategy> },
    Unreadable { key: String, reason: String },
    Unextractable { key: String },
    Unmatched { key: String, identifier: String, attempts: u32 },
    DeleteFailed { key: String, identifier: String, reason: String },
}

impl InputDisposition {
    pub fn key(&self) -> &str {
        match self {
            InputDisposition::Deleted { key, .. }
            | InputDisposition::Unreadable { key, .. }
            | InputDisposition::Unextractable { key }
            | InputDisposition::Unmatched { key, .. }
            | InputDisposition::DeleteFailed { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub status: RunStatus,
    pub processed: Vec<String>,
    pub dispositions: Vec<InputDisposition>,
}

impl ReconcileOutcome {
    fn no_files() -> Self {
        Self {
            status: RunStatus::NoFiles,
            processed: Vec::new(),
            dispositions: Vec::new(),
        }
    }

    /// The status object returned to the invoking harness.
    pub fn to_status(&self) -> InvocationStatus {
        match self.status {
            RunStatus::NoFiles => InvocationStatus::NoFiles,
            RunStatus::Success => InvocationStatus::Success {
                processed_files: self.processed.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationStatus {
    NoFiles,
    Success { processed_files: Vec<String> },
}

/// Runs reconciliation passes: confirms each pending input's report is in
/// the index before deleting it, and keeps one worker running while inputs
/// remain.
pub struct Reconciler {
    config: ReconcileConfig,
    extractor: IdentifierExtractor,
    verifier: MatchVerifier,
    sleeper: Arc<dyn SleeperLike>,
    observer: Arc<dyn ReconcileObserver>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        let observer: Arc<dyn ReconcileObserver> = Arc::new(TracingObserver);
        let extractor = IdentifierExtractor::new(config.extractor);
        let verifier = MatchVerifier::new(config.strategies.clone(), config.index.clone())
            .with_observer(observer.clone());
        Self {
            config,
            extractor,
            verifier,
            sleeper: Arc::new(ThreadSleeper),
            observer,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn SleeperLike>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReconcileObserver>) -> Self {
        self.verifier = MatchVerifier::new(self.config.strategies.clone(), self.config.index.clone())
            .with_observer(observer.clone());
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn verifier(&self) -> &MatchVerifier {
        &self.verifier
    }

    pub fn extractor(&self) -> &IdentifierExtractor {
        &self.extractor
    }

    /// Keys under the configured prefix, minus derived aggregate output.
    pub fn pending_keys<S>(&self, store: &S) -> Result<Vec<String>, ReconcileError>
    where
        S: ObjectStoreLike + ?Sized,
    {
        let listed = store.list(&self.config.store.prefix)?;
        let total = listed.len();
        let pending: Vec<String> = listed
            .into_iter()
            .filter(|key| !self.config.store.is_aggregate_output(key))
            .collect();
        self.observer.record(&ReconcileEvent::InputsListed {
            pending: pending.len(),
            excluded: total - pending.len(),
        });
        Ok(pending)
    }

    /// One full pass. Index and scheduler failures abort the pass; per-input
    /// store failures are recorded and the pass continues.
    pub fn reconcile<S, I, C>(
        &self,
        store: &S,
        index: &I,
        lifecycle: &WorkerLifecycle<C>,
    ) -> Result<ReconcileOutcome, ReconcileError>
    where
        S: ObjectStoreLike + ?Sized,
        I: IndexClientLike + ?Sized,
        C: SchedulerLike,
    {
        let pending = self.pending_keys(store)?;
        if pending.is_empty() {
            self.scale(lifecycle, 0)?;
            return Ok(ReconcileOutcome::no_files());
        }

        if lifecycle.current_replica_count()? == 0 {
            self.scale(lifecycle, 1)?;
            let delay = self.config.scheduler.settle_delay;
            self.observer.record(&ReconcileEvent::Settling { delay });
            self.sleeper.sleep(delay);
        }

        if self.config.index.ensure_index {
            self.verifier.ensure_index_ready(index);
        }

        let mut processed = Vec::new();
        let mut dispositions = Vec::with_capacity(pending.len());
        for key in &pending {
            let disposition = self.process_input(store, index, key)?;
            if let InputDisposition::Deleted { key, .. } = &disposition {
                processed.push(key.clone());
            }
            dispositions.push(disposition);
        }

        let remaining = self.pending_keys(store)?;
        if remaining.is_empty() {
            self.scale(lifecycle, 0)?;
        } else {
            self.observer.record(&ReconcileEvent::WorkerLeftRunning {
                remaining: remaining.len(),
            });
        }

        Ok(ReconcileOutcome {
            status: RunStatus::Success,
            processed,
            dispositions,
        })
    }

    fn process_input<S, I>(&self, store: &S, index: &I, key: &str) -> Result<InputDisposition, ReconcileError>
    where
        S: ObjectStoreLike + ?Sized,
        I: IndexClientLike + ?Sized,
    {
        let input = match PendingInput::load(store, key) {
            Ok(input) => input,
            Err(e) => {
                let reason = e.to_string();
                self.observer.record(&ReconcileEvent::InputUnreadable {
                    key: key.to_string(),
                    reason: reason.clone(),
                });
                return Ok(InputDisposition::Unreadable {
                    key: key.to_string(),
                    reason,
                });
            }
        };

        let Some(identifier) = self.extractor.extract(input.raw_subject_line.as_deref()) else {
            self.observer.record(&ReconcileEvent::InputUnextractable {
                key: input.key.clone(),
                subject: input.raw_subject_line.clone(),
            });
            return Ok(InputDisposition::Unextractable { key: input.key });
        };

        let (verdict, attempts) = self.await_ingestion(index, &input.key, &identifier)?;
        if !verdict.matched {
            self.observer.record(&ReconcileEvent::InputLeftPending {
                key: input.key.clone(),
                identifier: identifier.clone(),
                attempts,
            });
            self.log_recent_identifiers(index);
            return Ok(InputDisposition::Unmatched {
                key: input.key,
                identifier,
                attempts,
            });
        }

        match store.delete(&input.key) {
            Ok(()) => {
                self.observer.record(&ReconcileEvent::InputDeleted {
                    key: input.key.clone(),
                    identifier: identifier.clone(),
                    strategy: verdict.strategy,
                });
                Ok(InputDisposition::Deleted {
                    key: input.key,
                    identifier,
                    strategy: verdict.strategy,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.observer.record(&ReconcileEvent::DeleteFailed {
                    key: input.key.clone(),
                    reason: reason.clone(),
                });
                Ok(InputDisposition::DeleteFailed {
                    key: input.key,
                    identifier,
                    reason,
                })
            }
        }
    }

    /// Polls the verifier until it matches or the retry budget runs out.
    /// Returns the last verdict and the number of attempts made.
    fn await_ingestion<I>(&self, index: &I, key: &str, identifier: &str) -> Result<(MatchVerdict, u32), ReconcileError>
    where
        I: IndexClientLike + ?Sized,
    {
        let policy = self.config.retry;
        let mut verdict = MatchVerdict::unmatched();
        for attempt in 1..=policy.max_attempts {
            verdict = self.verifier.verify(identifier, index)?;
            if verdict.matched {
                return Ok((verdict, attempt));
            }
            self.observer.record(&ReconcileEvent::AttemptMissed {
                key: key.to_string(),
                identifier: identifier.to_string(),
                attempt,
                max_attempts: policy.max_attempts,
            });
            if attempt < policy.max_attempts {
                self.sleeper.sleep(policy.delay);
            }
        }
        Ok((verdict, policy.max_attempts))
    }

    fn log_recent_identifiers<I>(&self, index: &I)
    where
        I: IndexClientLike + ?Sized,
    {
        match self.verifier.recent_identifiers(index) {
            Ok(identifiers) => self
                .observer
                .record(&ReconcileEvent::RecentIdentifiers { identifiers }),
            Err(e) => tracing::warn!(error = %e, "could not list recent report ids"),
        }
    }

    fn scale<C: SchedulerLike>(&self, lifecycle: &WorkerLifecycle<C>, desired: i32) -> Result<(), ReconcileError> {
        lifecycle.set_desired_replica_count(desired)?;
        self.observer.record(&ReconcileEvent::WorkerScaled { desired });
        Ok(())
    }
}

/// Callback entry point: the trigger event and execution context are opaque
/// and ignored. Returns the serialized status object.
pub fn handle_invocation<S, I, C, E, X>(
    reconciler: &Reconciler,
    store: &S,
    index: &I,
    lifecycle: &WorkerLifecycle<C>,
    _event: E,
    _context: X,
) -> Result<serde_json::Value, ReconcileError>
where
    S: ObjectStoreLike + ?Sized,
    I: IndexClientLike + ?Sized,
    C: SchedulerLike,
{
    let outcome = reconciler.reconcile(store, index, lifecycle)?;
    Ok(serde_json::to_value(outcome.to_status())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::config::{IndexSettings, RetryPolicy, SchedulerSettings, StoreSettings};
    use crate::extract::ExtractorOptions;
    use crate::memory::{MemoryIndex, MemoryScheduler, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    fn config(max_attempts: u32) -> ReconcileConfig {
        ReconcileConfig {
            store: StoreSettings {
                bucket: "reports".to_string(),
                prefix: "incoming/".to_string(),
                region: "us-east-1".to_string(),
                endpoint: None,
                aggregate_segment: "aggregate".to_string(),
            },
            scheduler: SchedulerSettings {
                cluster: "dmarc".to_string(),
                service: "parsedmarc".to_string(),
                settle_delay: Duration::from_secs(30),
            },
            index: IndexSettings {
                host: "http://localhost:9200".to_string(),
                ..IndexSettings::default()
            },
            retry: RetryPolicy::new(max_attempts, Duration::from_secs(15)),
            extractor: ExtractorOptions::default(),
            strategies: MatchStrategy::ordered(true),
        }
    }

    fn message(report_id: &str) -> String {
        format!(
            "From: noreply@example.net\r\nSubject: Report Domain: example.com Submitter: example.net Report-ID: <{}@example.net>\r\n\r\nbody\r\n",
            report_id
        )
    }

    fn reconciler(max_attempts: u32, sleeper: Arc<RecordingSleeper>) -> Reconciler {
        Reconciler::new(config(max_attempts)).with_sleeper(sleeper)
    }

    #[test]
    fn test_empty_store_scales_down_and_reports_no_files() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let store = MemoryStore::new();
        let index = MemoryIndex::new("report_id");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new());

        let outcome = reconciler(3, sleeper.clone()).reconcile(&store, &index, &lifecycle).unwrap();

        assert_eq!(outcome.status, RunStatus::NoFiles);
        assert_eq!(lifecycle.scheduler().desired_history(), vec![0]);
        assert_eq!(index.search_count(), 0);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn test_only_aggregate_output_counts_as_no_files() {
        let store = MemoryStore::new();
        store.insert("incoming/aggregate/2025-07-31.json", "{}");
        let index = MemoryIndex::new("report_id");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new());

        let outcome = reconciler(3, Arc::new(RecordingSleeper::new()))
            .reconcile(&store, &index, &lifecycle)
            .unwrap();

        assert_eq!(outcome.status, RunStatus::NoFiles);
        assert!(store.contains("incoming/aggregate/2025-07-31.json"));
    }

    #[test]
    fn test_cold_worker_is_started_and_allowed_to_settle_before_polling() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("abc123"));
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new());

        let outcome = reconciler(3, sleeper.clone()).reconcile(&store, &index, &lifecycle).unwrap();

        assert_eq!(outcome.processed, vec!["incoming/a.eml"]);
        assert_eq!(lifecycle.scheduler().desired_history(), vec![1, 0]);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[test]
    fn test_running_worker_is_not_scaled_up_again() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("abc123"));
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        let scheduler = MemoryScheduler::new().auto_start(true);
        scheduler.update_desired_count(1).unwrap();
        let lifecycle = WorkerLifecycle::new(scheduler);

        reconciler(3, sleeper.clone()).reconcile(&store, &index, &lifecycle).unwrap();

        assert_eq!(lifecycle.scheduler().desired_history(), vec![1, 0]);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn test_retries_with_fixed_delay_until_ingested() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("late-report-0001"));
        let index = MemoryIndex::new("report_id");
        // No '.' in the id, so four strategies query per attempt. Visible from
        // the third attempt onward.
        index.ingest_after("late-report-0001", 8);
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new().auto_start(true));

        let outcome = reconciler(5, sleeper.clone()).reconcile(&store, &index, &lifecycle).unwrap();

        assert_eq!(outcome.processed, vec!["incoming/a.eml"]);
        assert_eq!(
            outcome.dispositions,
            vec![InputDisposition::Deleted {
                key: "incoming/a.eml".to_string(),
                identifier: "late-report-0001".to_string(),
                strategy: Some(MatchStrategy::Exact),
            }]
        );
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(30), Duration::from_secs(15), Duration::from_secs(15)]
        );
    }

    #[test]
    fn test_never_deletes_without_a_match() {
        for attempts in [1, 2, 5] {
            let sleeper = Arc::new(RecordingSleeper::new());
            let store = MemoryStore::new();
            store.insert("incoming/a.eml", message("never-indexed"));
            store.insert("incoming/b.eml", message("also-missing"));
            let index = MemoryIndex::new("report_id");
            let lifecycle = WorkerLifecycle::new(MemoryScheduler::new().auto_start(true));

            let outcome = reconciler(attempts, sleeper.clone())
                .reconcile(&store, &index, &lifecycle)
                .unwrap();

            assert_eq!(outcome.status, RunStatus::Success);
            assert!(outcome.processed.is_empty());
            assert!(store.deleted().is_empty());
            assert_eq!(store.keys().len(), 2);
            // Worker keeps running because inputs remain.
            assert_eq!(lifecycle.scheduler().desired_history(), vec![1]);
            // Settle delay plus (attempts - 1) gaps per input.
            assert_eq!(sleeper.sleeps().len(), 1 + 2 * (attempts as usize - 1));
        }
    }

    #[test]
    fn test_unextractable_input_is_skipped_and_kept() {
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", "Subject: weekly newsletter\r\n\r\nhi");
        store.insert("incoming/b.eml", message("abc123"));
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new().auto_start(true));

        let outcome = reconciler(2, Arc::new(RecordingSleeper::new()))
            .reconcile(&store, &index, &lifecycle)
            .unwrap();

        assert_eq!(outcome.processed, vec!["incoming/b.eml"]);
        assert_eq!(
            outcome.dispositions[0],
            InputDisposition::Unextractable { key: "incoming/a.eml".to_string() }
        );
        assert!(store.contains("incoming/a.eml"));
    }

    #[test]
    fn test_unreadable_input_is_skipped() {
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("abc123"));
        store.make_unreadable("incoming/a.eml");
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new().auto_start(true));

        let outcome = reconciler(2, Arc::new(RecordingSleeper::new()))
            .reconcile(&store, &index, &lifecycle)
            .unwrap();

        assert!(outcome.processed.is_empty());
        assert!(matches!(outcome.dispositions[0], InputDisposition::Unreadable { .. }));
        assert_eq!(index.search_count(), 0);
    }

    #[test]
    fn test_delete_failure_is_surfaced_and_batch_continues() {
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("abc123"));
        store.insert("incoming/b.eml", message("def456"));
        store.make_undeletable("incoming/a.eml");
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        index.ingest("def456");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new().auto_start(true));

        let outcome = reconciler(2, Arc::new(RecordingSleeper::new()))
            .reconcile(&store, &index, &lifecycle)
            .unwrap();

        assert_eq!(outcome.processed, vec!["incoming/b.eml"]);
        assert!(matches!(
            &outcome.dispositions[0],
            InputDisposition::DeleteFailed { key, .. } if key == "incoming/a.eml"
        ));
        assert_eq!(lifecycle.scheduler().desired_history(), vec![1]);
    }

    #[test]
    fn test_index_error_fails_the_pass_without_deleting() {
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("abc123"));
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        index.fail_next_searches(1);
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new().auto_start(true));
        let sleeper = Arc::new(RecordingSleeper::new());

        let err = reconciler(20, sleeper.clone())
            .reconcile(&store, &index, &lifecycle)
            .unwrap_err();

        assert!(err.is_index_error());
        assert!(store.deleted().is_empty());
        // Only the settle delay; the error was not retried as a miss.
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[test]
    fn test_scheduler_error_fails_loudly() {
        let store = MemoryStore::new();
        store.insert("incoming/a.eml", message("abc123"));
        let index = MemoryIndex::new("report_id");
        let scheduler = MemoryScheduler::new();
        scheduler.fail(true);
        let lifecycle = WorkerLifecycle::new(scheduler);

        let err = reconciler(2, Arc::new(RecordingSleeper::new()))
            .reconcile(&store, &index, &lifecycle)
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Scheduler(_)));
        assert_eq!(index.search_count(), 0);
    }

    #[test]
    fn test_handle_invocation_returns_status_object() {
        let store = MemoryStore::new();
        let index = MemoryIndex::new("report_id");
        let lifecycle = WorkerLifecycle::new(MemoryScheduler::new());
        let reconciler = reconciler(2, Arc::new(RecordingSleeper::new()));

        let status = handle_invocation(&reconciler, &store, &index, &lifecycle, json!({}), ()).unwrap();
        assert_eq!(status, json!({ "status": "no_files" }));

        store.insert("incoming/a.eml", message("abc123"));
        index.ingest("abc123");
        let status = handle_invocation(&reconciler, &store, &index, &lifecycle, json!({"detail": 1}), ()).unwrap();
        assert_eq!(
            status,
            json!({ "status": "success", "processed_files": ["incoming/a.eml"] })
        );
    }
}
