use crate::error::ReconcileError;
use serde_json::{Value, json};

pub trait IndexClientLike {
    fn search(&self, index_pattern: &str, query: &IndexQuery) -> Result<SearchHits, ReconcileError>;
    fn index_exists(&self, name: &str) -> Result<bool, ReconcileError>;
    fn create_index(&self, name: &str, mapping: &Value) -> Result<(), ReconcileError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub total_hits: u64,
    pub hits: Vec<Value>,
}

impl SearchHits {
    pub fn is_empty(&self) -> bool {
        self.total_hits == 0 && self.hits.is_empty()
    }

    /// Stored identifiers of each hit's source document, skipping hits that
    /// do not carry `field`.
    pub fn identifiers(&self, field: &str) -> Vec<String> {
        self.hits
            .iter()
            .filter_map(|source| stored_identifier(source, field))
            .collect()
    }

    /// Parses the `hits` section of a search response body.
    pub fn from_response(body: &Value) -> Result<Self, ReconcileError> {
        let hits = body
            .get("hits")
            .ok_or_else(|| ReconcileError::Index("search response has no hits section".to_string()))?;
        // `total` is an object on current engines and a bare number on older ones.
        let total_hits = match hits.get("total") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
            Some(total) => total.get("value").and_then(Value::as_u64).unwrap_or_default(),
            None => 0,
        };
        let sources = hits
            .get("hits")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|hit| hit.get("_source").cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(Self {
            total_hits: total_hits.max(sources.len() as u64),
            hits: sources,
        })
    }
}

/// Reads `field` from a source document, either as a dotted path through
/// nested objects or as a flat key containing dots.
pub fn stored_identifier(source: &Value, field: &str) -> Option<String> {
    let nested = field
        .split('.')
        .try_fold(source, |node, part| node.get(part));
    nested
        .or_else(|| source.get(field))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// The queries the verifier and diagnostics issue, independent of wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    Term { field: String, value: String, size: usize },
    Prefix { field: String, value: String, size: usize },
    NgramMatch { field: String, text: String, minimum_should_match: String, size: usize },
    Fuzzy { field: String, value: String, size: usize },
    Recent { sort_field: String, source_field: String, size: usize },
}

impl IndexQuery {
    pub fn size(&self) -> usize {
        match self {
            IndexQuery::Term { size, .. }
            | IndexQuery::Prefix { size, .. }
            | IndexQuery::NgramMatch { size, .. }
            | IndexQuery::Fuzzy { size, .. }
            | IndexQuery::Recent { size, .. } => *size,
        }
    }

    /// Renders the query as a `_search` request body.
    pub fn to_body(&self) -> Value {
        match self {
            IndexQuery::Term { field, value, size } => json!({
                "size": size,
                "query": { "term": { field: value } }
            }),
            IndexQuery::Prefix { field, value, size } => json!({
                "size": size,
                "query": { "prefix": { field: { "value": value } } }
            }),
            IndexQuery::NgramMatch { field, text, minimum_should_match, size } => json!({
                "size": size,
                "query": {
                    "match": {
                        field: {
                            "query": text,
                            "minimum_should_match": minimum_should_match
                        }
                    }
                }
            }),
            IndexQuery::Fuzzy { field, value, size } => json!({
                "size": size,
                "query": {
                    "fuzzy": {
                        field: { "value": value, "fuzziness": "AUTO" }
                    }
                }
            }),
            IndexQuery::Recent { sort_field, source_field, size } => json!({
                "size": size,
                "sort": [ { sort_field: { "order": "desc", "unmapped_type": "date" } } ],
                "_source": [ source_field ],
                "query": { "match_all": {} }
            }),
        }
    }
}

pub const NGRAM_MIN: usize = 3;
pub const NGRAM_MAX: usize = 10;

/// Index settings and mapping for the identifier field: a keyword sub-field
/// for term, prefix and fuzzy queries, and n-gram / edge-n-gram sub-fields
/// for partial matching.
pub fn index_mapping(id_field: &str) -> Value {
    json!({
        "settings": {
            "index": { "max_ngram_diff": NGRAM_MAX - NGRAM_MIN },
            "analysis": {
                "tokenizer": {
                    "report_id_ngram": {
                        "type": "ngram",
                        "min_gram": NGRAM_MIN,
                        "max_gram": NGRAM_MAX,
                        "token_chars": ["letter", "digit", "punctuation", "symbol"]
                    },
                    "report_id_edge": {
                        "type": "edge_ngram",
                        "min_gram": NGRAM_MIN,
                        "max_gram": NGRAM_MAX,
                        "token_chars": ["letter", "digit", "punctuation", "symbol"]
                    }
                },
                "analyzer": {
                    "report_id_ngram": {
                        "type": "custom",
                        "tokenizer": "report_id_ngram",
                        "filter": ["lowercase"]
                    },
                    "report_id_edge": {
                        "type": "custom",
                        "tokenizer": "report_id_edge",
                        "filter": ["lowercase"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                id_field: {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword", "ignore_above": 256 },
                        "ngram": { "type": "text", "analyzer": "report_id_ngram", "search_analyzer": "report_id_ngram" },
                        "edge": { "type": "text", "analyzer": "report_id_edge", "search_analyzer": "standard" }
                    }
                }
            }
        }
    })
}
