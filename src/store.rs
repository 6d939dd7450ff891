use crate::error::ReconcileError;

/// Object storage as the reconciler sees it. `list` is flattened across
/// pages; `delete` of a missing key must succeed.
pub trait ObjectStoreLike {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ReconcileError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, ReconcileError>;
    fn delete(&self, key: &str) -> Result<(), ReconcileError>;
}

/// A stored input not yet confirmed ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInput {
    pub key: String,
    pub raw_subject_line: Option<String>,
}

impl PendingInput {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            raw_subject_line: None,
        }
    }

    /// Reads the object and pulls its subject header.
    pub fn load<S>(store: &S, key: &str) -> Result<Self, ReconcileError>
    where
        S: ObjectStoreLike + ?Sized,
    {
        let body = store.get(key)?;
        Ok(Self {
            key: key.to_string(),
            raw_subject_line: crate::extract::subject_line(&body),
        })
    }
}
