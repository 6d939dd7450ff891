use crate::config::IndexSettings;
use crate::error::ReconcileError;
use crate::index::{IndexClientLike, IndexQuery, index_mapping};
use crate::observe::{ReconcileEvent, ReconcileObserver, TracingObserver};
use serde::Serialize;
use std::sync::Arc;

/// Prefix candidates may differ in length from the query by at most this much.
pub const PREFIX_MAX_LENGTH_DIFF: usize = 10;
/// Leading characters an n-gram candidate must share with the query.
pub const NGRAM_ANCHOR_CHARS: usize = 20;
pub const NGRAM_MINIMUM_SHOULD_MATCH: &str = "80%";
pub const FUZZY_MAX_DISTANCE: usize = 5;

/// Index lookup strategies, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStrategy {
    Exact,
    Prefix,
    Ngram,
    Fuzzy,
    NumericSuffix,
}

impl MatchStrategy {
    pub const ALL: [MatchStrategy; 5] = [
        MatchStrategy::Exact,
        MatchStrategy::Prefix,
        MatchStrategy::Ngram,
        MatchStrategy::Fuzzy,
        MatchStrategy::NumericSuffix,
    ];

    pub fn ordered(numeric_suffix: bool) -> Vec<MatchStrategy> {
        Self::ALL
            .into_iter()
            .filter(|s| numeric_suffix || *s != MatchStrategy::NumericSuffix)
            .collect()
    }

    /// The single query this strategy issues for `identifier`, or `None` when
    /// the strategy does not apply to it.
    pub fn query(&self, identifier: &str, settings: &IndexSettings) -> Option<IndexQuery> {
        let size = settings.candidate_limit;
        match self {
            MatchStrategy::Exact => Some(IndexQuery::Term {
                field: settings.keyword_field(),
                value: identifier.to_string(),
                size,
            }),
            MatchStrategy::Prefix => Some(IndexQuery::Prefix {
                field: settings.keyword_field(),
                value: identifier.to_string(),
                size,
            }),
            MatchStrategy::Ngram => Some(IndexQuery::NgramMatch {
                field: settings.ngram_field(),
                text: identifier.to_string(),
                minimum_should_match: NGRAM_MINIMUM_SHOULD_MATCH.to_string(),
                size,
            }),
            MatchStrategy::Fuzzy => Some(IndexQuery::Fuzzy {
                field: settings.keyword_field(),
                value: identifier.to_string(),
                size,
            }),
            MatchStrategy::NumericSuffix => numeric_suffix(identifier).map(|suffix| IndexQuery::Term {
                field: settings.keyword_field(),
                value: suffix.to_string(),
                size,
            }),
        }
    }

    /// Whether a hit is evidence of a match. Term-based strategies accept any
    /// hit; the approximate ones check the stored identifier.
    pub fn accepts(&self, identifier: &str, stored: Option<&str>) -> bool {
        match (self, stored) {
            (MatchStrategy::Exact | MatchStrategy::NumericSuffix, _) => true,
            (MatchStrategy::Prefix, Some(stored)) => prefix_accepts(identifier, stored),
            (MatchStrategy::Ngram, Some(stored)) => ngram_accepts(identifier, stored),
            (MatchStrategy::Fuzzy, Some(stored)) => fuzzy_accepts(identifier, stored),
            (_, None) => false,
        }
    }
}

pub fn numeric_suffix(identifier: &str) -> Option<&str> {
    identifier
        .rsplit_once('.')
        .map(|(_, suffix)| suffix)
        .filter(|suffix| !suffix.is_empty())
}

/// Accepts truncation in either direction, within a bounded length difference.
pub fn prefix_accepts(identifier: &str, stored: &str) -> bool {
    let diff = stored.chars().count().abs_diff(identifier.chars().count());
    diff <= PREFIX_MAX_LENGTH_DIFF && (stored.starts_with(identifier) || identifier.starts_with(stored))
}

pub fn ngram_accepts(identifier: &str, stored: &str) -> bool {
    let query_len = identifier.chars().count();
    if stored.chars().count() < query_len {
        return false;
    }
    let anchor = query_len.min(NGRAM_ANCHOR_CHARS);
    identifier.chars().take(anchor).eq(stored.chars().take(anchor))
}

pub fn fuzzy_max_distance(identifier: &str) -> usize {
    (identifier.chars().count() / 4).min(FUZZY_MAX_DISTANCE)
}

pub fn fuzzy_accepts(identifier: &str, stored: &str) -> bool {
    strsim::levenshtein(identifier, stored) <= fuzzy_max_distance(identifier)
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchVerdict {
    pub matched: bool,
    pub strategy: Option<MatchStrategy>,
    pub evidence: Option<String>,
}

impl MatchVerdict {
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            strategy: None,
            evidence: None,
        }
    }

    pub fn matched(strategy: MatchStrategy, evidence: Option<String>) -> Self {
        Self {
            matched: true,
            strategy: Some(strategy),
            evidence,
        }
    }
}

/// Looks a report identifier up in the index, escalating through its
/// strategies until one finds acceptable evidence.
pub struct MatchVerifier {
    strategies: Vec<MatchStrategy>,
    settings: IndexSettings,
    observer: Arc<dyn ReconcileObserver>,
}

impl MatchVerifier {
    pub fn new(strategies: Vec<MatchStrategy>, settings: IndexSettings) -> Self {
        Self {
            strategies,
            settings,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReconcileObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn strategies(&self) -> &[MatchStrategy] {
        &self.strategies
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn is_matched<I>(&self, identifier: &str, index: &I) -> Result<bool, ReconcileError>
    where
        I: IndexClientLike + ?Sized,
    {
        Ok(self.verify(identifier, index)?.matched)
    }

    /// Runs the strategies in order. An index failure aborts the attempt; it
    /// is never read as "not found".
    pub fn verify<I>(&self, identifier: &str, index: &I) -> Result<MatchVerdict, ReconcileError>
    where
        I: IndexClientLike + ?Sized,
    {
        for strategy in &self.strategies {
            if let Some(verdict) = self.try_strategy(*strategy, identifier, index)? {
                return Ok(verdict);
            }
        }
        Ok(MatchVerdict::unmatched())
    }

    /// One query round-trip for a single strategy. `Ok(None)` means the
    /// strategy found no acceptable candidate (or did not apply).
    pub fn try_strategy<I>(
        &self,
        strategy: MatchStrategy,
        identifier: &str,
        index: &I,
    ) -> Result<Option<MatchVerdict>, ReconcileError>
    where
        I: IndexClientLike + ?Sized,
    {
        let Some(query) = strategy.query(identifier, &self.settings) else {
            return Ok(None);
        };
        let hits = index.search(&self.settings.pattern, &query)?;

        let verdict = if hits.is_empty() {
            None
        } else {
            let stored = hits.identifiers(&self.settings.id_field);
            match strategy {
                MatchStrategy::Exact | MatchStrategy::NumericSuffix => {
                    Some(MatchVerdict::matched(strategy, stored.into_iter().next()))
                }
                _ => stored
                    .into_iter()
                    .find(|candidate| strategy.accepts(identifier, Some(candidate.as_str())))
                    .map(|candidate| MatchVerdict::matched(strategy, Some(candidate))),
            }
        };

        match &verdict {
            Some(v) => self.observer.record(&ReconcileEvent::StrategyMatched {
                identifier: identifier.to_string(),
                strategy,
                evidence: v.evidence.clone(),
            }),
            None => self.observer.record(&ReconcileEvent::StrategyMissed {
                identifier: identifier.to_string(),
                strategy,
            }),
        }
        Ok(verdict)
    }

    /// Creates the concrete index with the n-gram mapping if it is missing.
    /// Failure is reported and otherwise ignored: verification still works
    /// against default analysis. Returns whether the index is known to exist.
    pub fn ensure_index_ready<I>(&self, index: &I) -> bool
    where
        I: IndexClientLike + ?Sized,
    {
        let name = &self.settings.name;
        let result = index.index_exists(name).and_then(|exists| {
            if exists {
                Ok(false)
            } else {
                index
                    .create_index(name, &index_mapping(&self.settings.id_field))
                    .map(|_| true)
            }
        });
        match result {
            Ok(created) => {
                self.observer.record(&ReconcileEvent::IndexPrepared {
                    name: name.clone(),
                    created,
                });
                true
            }
            Err(e) => {
                self.observer.record(&ReconcileEvent::IndexPreparationFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Most recently indexed identifiers, newest first. Diagnostic only.
    pub fn recent_identifiers<I>(&self, index: &I) -> Result<Vec<String>, ReconcileError>
    where
        I: IndexClientLike + ?Sized,
    {
        let query = IndexQuery::Recent {
            sort_field: self.settings.sort_field.clone(),
            source_field: self.settings.id_field.clone(),
            size: self.settings.recent_limit,
        };
        let hits = index.search(&self.settings.pattern, &query)?;
        Ok(hits.identifiers(&self.settings.id_field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;
    use crate::observe::RecordingObserver;

    const STORED_UUID: &str = "bc663a43-570e-4ce2-a5ee-4e9758998888";

    fn settings() -> IndexSettings {
        IndexSettings {
            host: "http://localhost:9200".to_string(),
            ..IndexSettings::default()
        }
    }

    fn verifier() -> MatchVerifier {
        MatchVerifier::new(MatchStrategy::ordered(true), settings())
    }

    #[test]
    fn test_prefix_accepts_truncated_query() {
        assert!(prefix_accepts("bc663a43-570e-4ce2-a5ee-4e9758998", STORED_UUID));
    }

    #[test]
    fn test_prefix_accepts_truncated_stored_value() {
        assert!(prefix_accepts(STORED_UUID, "bc663a43-570e-4ce2-a5ee-4e975899"));
    }

    #[test]
    fn test_prefix_rejects_large_length_difference() {
        // 11 characters shorter than the stored value.
        let query = &STORED_UUID[..STORED_UUID.len() - 11];
        assert!(!prefix_accepts(query, STORED_UUID));
        let query = &STORED_UUID[..STORED_UUID.len() - 10];
        assert!(prefix_accepts(query, STORED_UUID));
    }

    #[test]
    fn test_prefix_rejects_divergent_values() {
        assert!(!prefix_accepts("bc663a43-570e-4ce2-a5ee-4e9758990", STORED_UUID));
    }

    #[test]
    fn test_fuzzy_bound_one_edit_in_twenty() {
        let stored = "abcdefghij0123456789";
        let query = "abcdefghij0123456780";
        assert_eq!(fuzzy_max_distance(query), 5);
        assert!(fuzzy_accepts(query, stored));
    }

    #[test]
    fn test_fuzzy_bound_eight_edits_in_twenty() {
        let stored = "abcdefghij0123456789";
        let query = "abcdefghij01XXXXXXXX";
        assert_eq!(strsim::levenshtein(query, stored), 8);
        assert!(!fuzzy_accepts(query, stored));
    }

    #[test]
    fn test_fuzzy_bound_scales_with_short_identifiers() {
        assert_eq!(fuzzy_max_distance("abc"), 0);
        assert_eq!(fuzzy_max_distance("abcdefgh"), 2);
        assert_eq!(fuzzy_max_distance(&"x".repeat(100)), FUZZY_MAX_DISTANCE);
        assert!(!fuzzy_accepts("abc", "abd"));
    }

    #[test]
    fn test_ngram_requires_anchor_and_length() {
        let stored = "2025.07.31.1650389751.extra";
        assert!(ngram_accepts("2025.07.31.1650389751", stored));
        assert!(!ngram_accepts("2025.07.31.1650389751.extra.longer", stored));
        assert!(!ngram_accepts("2025.07.30.1650389751", stored));
    }

    #[test]
    fn test_ngram_anchor_is_capped_at_twenty_chars() {
        let query = "abcdefghijklmnopqrst-query-tail";
        let stored = "abcdefghijklmnopqrst-other-tail-x";
        assert!(ngram_accepts(query, stored));
    }

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(numeric_suffix("2025.07.31.1650389751"), Some("1650389751"));
        assert_eq!(numeric_suffix("abc123"), None);
        assert_eq!(numeric_suffix("trailing."), None);
    }

    #[test]
    fn test_ordered_strategies_toggle_numeric_suffix() {
        assert_eq!(MatchStrategy::ordered(true), MatchStrategy::ALL.to_vec());
        assert_eq!(
            MatchStrategy::ordered(false),
            vec![
                MatchStrategy::Exact,
                MatchStrategy::Prefix,
                MatchStrategy::Ngram,
                MatchStrategy::Fuzzy
            ]
        );
    }

    #[test]
    fn test_exact_match_stops_escalation() {
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        let verdict = verifier().verify("abc123", &index).unwrap();
        assert_eq!(verdict, MatchVerdict::matched(MatchStrategy::Exact, Some("abc123".to_string())));
        assert_eq!(index.search_count(), 1);
    }

    #[test]
    fn test_prefix_match_recovers_truncated_identifier() {
        let index = MemoryIndex::new("report_id");
        index.ingest(STORED_UUID);
        let verdict = verifier().verify("bc663a43-570e-4ce2-a5ee-4e9758998", &index).unwrap();
        assert_eq!(verdict.strategy, Some(MatchStrategy::Prefix));
        assert_eq!(verdict.evidence.as_deref(), Some(STORED_UUID));
    }

    #[test]
    fn test_fuzzy_match_tolerates_single_typo() {
        let index = MemoryIndex::new("report_id");
        index.ingest("17283940561728394056");
        let verdict = verifier().verify("17283940561728394057", &index).unwrap();
        assert!(verdict.matched);
        assert!(matches!(
            verdict.strategy,
            Some(MatchStrategy::Ngram) | Some(MatchStrategy::Fuzzy)
        ));
    }

    #[test]
    fn test_fuzzy_strategy_in_isolation() {
        let index = MemoryIndex::new("report_id");
        index.ingest("x7283940561728394056");
        let verdict = verifier()
            .try_strategy(MatchStrategy::Fuzzy, "17283940561728394056", &index)
            .unwrap();
        assert_eq!(
            verdict,
            Some(MatchVerdict::matched(MatchStrategy::Fuzzy, Some("x7283940561728394056".to_string())))
        );
    }

    #[test]
    fn test_numeric_suffix_fallback() {
        let index = MemoryIndex::new("report_id");
        index.ingest("1650389751");
        let verdict = verifier().verify("2025.07.31.1650389751", &index).unwrap();
        assert_eq!(
            verdict,
            MatchVerdict::matched(MatchStrategy::NumericSuffix, Some("1650389751".to_string()))
        );

        let without = MatchVerifier::new(MatchStrategy::ordered(false), settings());
        assert!(!without.is_matched("2025.07.31.1650389751", &index).unwrap());
    }

    #[test]
    fn test_no_hits_is_unmatched_after_every_strategy() {
        let index = MemoryIndex::new("report_id");
        index.ingest("something-else-entirely");
        let verdict = verifier().verify("abc.123", &index).unwrap();
        assert_eq!(verdict, MatchVerdict::unmatched());
        assert_eq!(index.search_count(), MatchStrategy::ALL.len());
    }

    #[test]
    fn test_index_error_propagates_instead_of_missing() {
        let index = MemoryIndex::new("report_id");
        index.ingest("abc123");
        index.fail_next_searches(1);
        let err = verifier().verify("abc123", &index).unwrap_err();
        assert!(err.is_index_error());
        assert_eq!(index.search_count(), 1);
    }

    #[test]
    fn test_index_error_mid_escalation_propagates() {
        let index = MemoryIndex::new("report_id");
        index.fail_searches_after(2);
        let err = verifier().verify("abc123", &index).unwrap_err();
        assert!(err.is_index_error());
    }

    #[test]
    fn test_observer_sees_each_strategy() {
        let index = MemoryIndex::new("report_id");
        index.ingest("1650389751");
        let observer = Arc::new(RecordingObserver::new());
        let verifier = verifier().with_observer(observer.clone());
        verifier.verify("2025.07.31.1650389751", &index).unwrap();
        let events = observer.events();
        assert_eq!(events.len(), 5);
        assert!(matches!(
            events.last(),
            Some(ReconcileEvent::StrategyMatched { strategy: MatchStrategy::NumericSuffix, .. })
        ));
    }

    #[test]
    fn test_ensure_index_creates_missing_index() {
        let index = MemoryIndex::new("report_id");
        assert!(verifier().ensure_index_ready(&index));
        assert_eq!(index.created_indices(), vec!["dmarc_aggregate".to_string()]);
        // Second call finds it and does not create again.
        assert!(verifier().ensure_index_ready(&index));
        assert_eq!(index.created_indices().len(), 1);
    }

    #[test]
    fn test_ensure_index_failure_is_not_fatal() {
        let index = MemoryIndex::new("report_id");
        index.fail_create(true);
        let observer = Arc::new(RecordingObserver::new());
        let verifier = verifier().with_observer(observer.clone());
        assert!(!verifier.ensure_index_ready(&index));
        assert!(matches!(
            observer.events().as_slice(),
            [ReconcileEvent::IndexPreparationFailed { .. }]
        ));
        index.ingest("abc123");
        assert!(verifier.is_matched("abc123", &index).unwrap());
    }

    #[test]
    fn test_recent_identifiers_newest_first() {
        let index = MemoryIndex::new("report_id");
        for id in ["one", "two", "three"] {
            index.ingest(id);
        }
        let mut settings = settings();
        settings.recent_limit = 2;
        let verifier = MatchVerifier::new(MatchStrategy::ordered(true), settings);
        assert_eq!(verifier.recent_identifiers(&index).unwrap(), vec!["three", "two"]);
    }
}
