use crate::error::ReconcileError;
use crate::extract::ExtractorOptions;
use crate::verify::MatchStrategy;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

const KEY_PREFIX: &str = "RECONCILE_";

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// 20 attempts, 15s apart. Tolerates slow ingestion pipelines.
    pub const EXTENDED: Self = Self {
        max_attempts: 20,
        delay: Duration::from_secs(15),
    };

    /// 5 attempts, 10s apart.
    pub const CONSERVATIVE: Self = Self {
        max_attempts: 5,
        delay: Duration::from_secs(10),
    };

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Sleeps taken between attempts; there is none after the final attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|_| self.delay)
    }

    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::EXTENDED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint: Option<String>,
    /// Path segment marking derived aggregate output; such keys are never inputs.
    pub aggregate_segment: String,
}

impl StoreSettings {
    pub fn is_aggregate_output(&self, key: &str) -> bool {
        !self.aggregate_segment.is_empty()
            && key.split('/').any(|segment| segment == self.aggregate_segment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub cluster: String,
    pub service: String,
    pub settle_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    pub host: String,
    pub pattern: String,
    /// Concrete index created by `ensure_index_ready`.
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub id_field: String,
    pub sort_field: String,
    pub candidate_limit: usize,
    pub recent_limit: usize,
    pub ensure_index: bool,
}

impl IndexSettings {
    pub fn keyword_field(&self) -> String {
        format!("{}.keyword", self.id_field)
    }

    pub fn ngram_field(&self) -> String {
        format!("{}.ngram", self.id_field)
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            pattern: "dmarc_aggregate*".to_string(),
            name: "dmarc_aggregate".to_string(),
            username: None,
            password: None,
            id_field: "report_id".to_string(),
            sort_field: "date_end".to_string(),
            candidate_limit: 10,
            recent_limit: 10,
            ensure_index: true,
        }
    }
}

/// Everything one reconciliation pass needs, read once at invocation start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub store: StoreSettings,
    pub scheduler: SchedulerSettings,
    pub index: IndexSettings,
    pub retry: RetryPolicy,
    pub extractor: ExtractorOptions,
    pub strategies: Vec<MatchStrategy>,
}

impl ReconcileConfig {
    /// Builds the configuration from a flat key-value lookup. Keys are the
    /// `RECONCILE_*` names; the lookup receives the full key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ReconcileError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", KEY_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let required = |name: &str| {
            get(name).ok_or_else(|| {
                ReconcileError::Config(format!("missing {}{}", KEY_PREFIX, name))
            })
        };

        let defaults = IndexSettings::default();

        let store = StoreSettings {
            bucket: required("BUCKET")?,
            prefix: get("PREFIX").unwrap_or_default(),
            region: get("REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: get("S3_ENDPOINT"),
            aggregate_segment: get("AGGREGATE_SEGMENT").unwrap_or_else(|| "aggregate".to_string()),
        };

        let scheduler = SchedulerSettings {
            cluster: required("ECS_CLUSTER")?,
            service: required("ECS_SERVICE")?,
            settle_delay: Duration::from_secs(parse_or(get("SETTLE_DELAY_SECS"), "SETTLE_DELAY_SECS", 30)?),
        };

        let index = IndexSettings {
            host: required("INDEX_HOST")?.trim_end_matches('/').to_string(),
            pattern: get("INDEX_PATTERN").unwrap_or(defaults.pattern),
            name: get("INDEX_NAME").unwrap_or(defaults.name),
            username: get("INDEX_USERNAME"),
            password: get("INDEX_PASSWORD"),
            id_field: get("ID_FIELD").unwrap_or(defaults.id_field),
            sort_field: get("SORT_FIELD").unwrap_or(defaults.sort_field),
            candidate_limit: parse_or(get("CANDIDATE_LIMIT"), "CANDIDATE_LIMIT", defaults.candidate_limit)?,
            recent_limit: parse_or(get("RECENT_LIMIT"), "RECENT_LIMIT", defaults.recent_limit)?,
            ensure_index: parse_bool_or(get("ENSURE_INDEX"), "ENSURE_INDEX", defaults.ensure_index)?,
        };

        let retry = RetryPolicy::new(
            parse_or(get("MAX_ATTEMPTS"), "MAX_ATTEMPTS", RetryPolicy::EXTENDED.max_attempts)?,
            Duration::from_secs(parse_or(
                get("RETRY_DELAY_SECS"),
                "RETRY_DELAY_SECS",
                RetryPolicy::EXTENDED.delay.as_secs(),
            )?),
        );
        if retry.max_attempts == 0 {
            return Err(ReconcileError::Config(format!("{}MAX_ATTEMPTS must be at least 1", KEY_PREFIX)));
        }

        let extractor = ExtractorOptions {
            uuid_fallback: parse_bool_or(get("UUID_FALLBACK"), "UUID_FALLBACK", false)?,
        };

        let numeric_suffix = parse_bool_or(get("NUMERIC_SUFFIX_FALLBACK"), "NUMERIC_SUFFIX_FALLBACK", true)?;

        Ok(Self {
            store,
            scheduler,
            index,
            retry,
            extractor,
            strategies: MatchStrategy::ordered(numeric_suffix),
        })
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ReconcileError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_env() -> Result<Self, ReconcileError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn parse_or<T: FromStr>(value: Option<String>, name: &str, default: T) -> Result<T, ReconcileError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ReconcileError::Config(format!("invalid {}{}: {}", KEY_PREFIX, name, raw))),
        None => Ok(default),
    }
}

fn parse_bool_or(value: Option<String>, name: &str, default: bool) -> Result<bool, ReconcileError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ReconcileError::Config(format!("invalid {}{}: {}", KEY_PREFIX, name, v))),
        },
    }
}
