//! In-memory collaborators. Used by the tests and for dry runs against
//! local fixtures.

use crate::error::ReconcileError;
use crate::index::{IndexClientLike, IndexQuery, NGRAM_MAX, NGRAM_MIN, SearchHits};
use crate::lifecycle::{SchedulerLike, WorkerState};
use crate::store::ObjectStoreLike;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MemoryStoreState {
    objects: BTreeMap<String, Vec<u8>>,
    deleted: Vec<String>,
    unreadable: HashSet<String>,
    undeletable: HashSet<String>,
    list_calls: usize,
}

/// Object store backed by a sorted map, so listing order is lexicographic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        guard(&self.state).objects.insert(key.to_string(), body.into());
    }

    pub fn keys(&self) -> Vec<String> {
        guard(&self.state).objects.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        guard(&self.state).objects.contains_key(key)
    }

    /// Every successful delete call, including repeats.
    pub fn deleted(&self) -> Vec<String> {
        guard(&self.state).deleted.clone()
    }

    pub fn list_calls(&self) -> usize {
        guard(&self.state).list_calls
    }

    pub fn make_unreadable(&self, key: &str) {
        guard(&self.state).unreadable.insert(key.to_string());
    }

    pub fn make_undeletable(&self, key: &str) {
        guard(&self.state).undeletable.insert(key.to_string());
    }
}

impl ObjectStoreLike for MemoryStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ReconcileError> {
        let mut state = guard(&self.state);
        state.list_calls += 1;
        Ok(state
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ReconcileError> {
        let state = guard(&self.state);
        if state.unreadable.contains(key) {
            return Err(ReconcileError::Store(format!("get {}: access denied", key)));
        }
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ReconcileError::Store(format!("get {}: no such key", key)))
    }

    fn delete(&self, key: &str) -> Result<(), ReconcileError> {
        let mut state = guard(&self.state);
        if state.undeletable.contains(key) {
            return Err(ReconcileError::Store(format!("delete {}: access denied", key)));
        }
        state.objects.remove(key);
        state.deleted.push(key.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryIndexState {
    documents: Vec<String>,
    delayed: Vec<(String, usize)>,
    queries: Vec<IndexQuery>,
    fail_next: usize,
    fail_after: Option<usize>,
    existing: Vec<String>,
    fail_create: bool,
}

/// Search index holding bare identifiers, evaluating each query kind the
/// way the real engine would for a keyword field with an n-gram sub-field.
pub struct MemoryIndex {
    id_field: String,
    state: Mutex<MemoryIndexState>,
}

impl MemoryIndex {
    pub fn new(id_field: &str) -> Self {
        Self {
            id_field: id_field.to_string(),
            state: Mutex::new(MemoryIndexState::default()),
        }
    }

    pub fn ingest(&self, identifier: &str) {
        guard(&self.state).documents.push(identifier.to_string());
    }

    /// Makes `identifier` visible only once `searches` searches have run,
    /// simulating ingestion lag.
    pub fn ingest_after(&self, identifier: &str, searches: usize) {
        guard(&self.state)
            .delayed
            .push((identifier.to_string(), searches));
    }

    pub fn fail_next_searches(&self, count: usize) {
        guard(&self.state).fail_next = count;
    }

    /// Lets `count` more searches succeed, then fails every one after.
    pub fn fail_searches_after(&self, count: usize) {
        let mut state = guard(&self.state);
        state.fail_after = Some(state.queries.len() + count);
    }

    pub fn fail_create(&self, fail: bool) {
        guard(&self.state).fail_create = fail;
    }

    pub fn search_count(&self) -> usize {
        guard(&self.state).queries.len()
    }

    pub fn queries(&self) -> Vec<IndexQuery> {
        guard(&self.state).queries.clone()
    }

    pub fn created_indices(&self) -> Vec<String> {
        guard(&self.state).existing.clone()
    }

    fn source(&self, identifier: &str) -> Value {
        json!({ self.id_field.as_str(): identifier })
    }
}

impl IndexClientLike for MemoryIndex {
    fn search(&self, index_pattern: &str, query: &IndexQuery) -> Result<SearchHits, ReconcileError> {
        let mut state = guard(&self.state);
        state.queries.push(query.clone());
        let performed = state.queries.len();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ReconcileError::Index(format!("search {}: connection reset", index_pattern)));
        }
        if state.fail_after.is_some_and(|limit| performed > limit) {
            return Err(ReconcileError::Index(format!("search {}: 403 forbidden", index_pattern)));
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(_, after)| performed > *after);
        state.delayed = waiting;
        state.documents.extend(ready.into_iter().map(|(id, _)| id));

        let matches: Vec<&String> = match query {
            IndexQuery::Term { value, .. } => state.documents.iter().filter(|d| *d == value).collect(),
            IndexQuery::Prefix { value, .. } => state
                .documents
                .iter()
                .filter(|d| d.starts_with(value.as_str()))
                .collect(),
            IndexQuery::NgramMatch { text, minimum_should_match, .. } => {
                let required = minimum_should_match
                    .trim_end_matches('%')
                    .parse::<f64>()
                    .unwrap_or(100.0)
                    / 100.0;
                let wanted = shingles(text);
                state
                    .documents
                    .iter()
                    .filter(|d| {
                        if wanted.is_empty() {
                            return false;
                        }
                        let have = shingles(d);
                        let shared = wanted.iter().filter(|s| have.contains(*s)).count();
                        shared as f64 / wanted.len() as f64 >= required
                    })
                    .collect()
            }
            IndexQuery::Fuzzy { value, .. } => {
                let allowed = auto_fuzziness(value);
                state
                    .documents
                    .iter()
                    .filter(|d| strsim::levenshtein(value, d) <= allowed)
                    .collect()
            }
            IndexQuery::Recent { .. } => state.documents.iter().rev().collect(),
        };

        let total_hits = matches.len() as u64;
        let hits = matches
            .into_iter()
            .take(query.size())
            .map(|id| self.source(id))
            .collect();
        Ok(SearchHits { total_hits, hits })
    }

    fn index_exists(&self, name: &str) -> Result<bool, ReconcileError> {
        Ok(guard(&self.state).existing.iter().any(|n| n == name))
    }

    fn create_index(&self, name: &str, _mapping: &Value) -> Result<(), ReconcileError> {
        let mut state = guard(&self.state);
        if state.fail_create {
            return Err(ReconcileError::Index(format!("create {}: resource_already_exists_exception", name)));
        }
        state.existing.push(name.to_string());
        Ok(())
    }
}

fn shingles(text: &str) -> HashSet<String> {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    (NGRAM_MIN..=NGRAM_MAX)
        .flat_map(|n| chars.windows(n).map(|w| w.iter().collect::<String>()).collect::<Vec<_>>())
        .collect()
}

/// Edit distance allowed by `"fuzziness": "AUTO"` for a term of this length.
fn auto_fuzziness(term: &str) -> usize {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

#[derive(Default)]
struct MemorySchedulerState {
    state: WorkerState,
    history: Vec<i32>,
    tasks: Vec<String>,
    next_task: usize,
    failing: bool,
    auto_start: bool,
}

/// Scheduler whose tasks start only when told to (or immediately with
/// `auto_start`).
#[derive(Default)]
pub struct MemoryScheduler {
    inner: Mutex<MemorySchedulerState>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: WorkerState) -> Self {
        let scheduler = Self::default();
        guard(&scheduler.inner).state = state;
        scheduler
    }

    pub fn auto_start(self, enabled: bool) -> Self {
        guard(&self.inner).auto_start = enabled;
        self
    }

    pub fn fail(&self, failing: bool) {
        guard(&self.inner).failing = failing;
    }

    pub fn desired_history(&self) -> Vec<i32> {
        guard(&self.inner).history.clone()
    }

    pub fn current(&self) -> WorkerState {
        guard(&self.inner).state
    }

    /// Brings the running count up (or down) to the desired count.
    pub fn start_pending_tasks(&self) {
        let mut inner = guard(&self.inner);
        Self::converge(&mut inner);
    }

    fn converge(inner: &mut MemorySchedulerState) {
        let desired = inner.state.desired_count.max(0) as usize;
        while inner.tasks.len() < desired {
            inner.next_task += 1;
            let task = format!("task-{}", inner.next_task);
            inner.tasks.push(task);
        }
        inner.tasks.truncate(desired);
        inner.state.running_count = inner.state.desired_count;
    }
}

impl SchedulerLike for MemoryScheduler {
    fn describe_service(&self) -> Result<WorkerState, ReconcileError> {
        let inner = guard(&self.inner);
        if inner.failing {
            return Err(ReconcileError::Scheduler("describe_services: throttled".to_string()));
        }
        Ok(inner.state)
    }

    fn update_desired_count(&self, desired: i32) -> Result<(), ReconcileError> {
        let mut inner = guard(&self.inner);
        if inner.failing {
            return Err(ReconcileError::Scheduler("update_service: throttled".to_string()));
        }
        inner.state.desired_count = desired;
        inner.history.push(desired);
        if inner.auto_start {
            Self::converge(&mut inner);
        }
        Ok(())
    }

    fn list_running_tasks(&self) -> Result<Vec<String>, ReconcileError> {
        Ok(guard(&self.inner).tasks.clone())
    }

    fn task_status(&self, task_id: &str) -> Result<Option<String>, ReconcileError> {
        let inner = guard(&self.inner);
        Ok(inner
            .tasks
            .iter()
            .any(|t| t == task_id)
            .then(|| "RUNNING".to_string()))
    }
}
