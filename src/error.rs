use std::fmt;

#[derive(Debug)]
pub enum ReconcileError {
    Extraction(String),
    Store(String),
    Index(String),
    Scheduler(String),
    Config(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    Other(String),
}

impl ReconcileError {
    /// True for failures of the search index itself, as opposed to "no hits".
    pub fn is_index_error(&self) -> bool {
        matches!(self, ReconcileError::Index(_))
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Extraction(e) => write!(f, "Extraction error: {}", e),
            ReconcileError::Store(e) => write!(f, "Object store error: {}", e),
            ReconcileError::Index(e) => write!(f, "Index error: {}", e),
            ReconcileError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
            ReconcileError::Config(e) => write!(f, "Configuration error: {}", e),
            ReconcileError::Io(e) => write!(f, "IO error: {}", e),
            ReconcileError::Json(e) => write!(f, "JSON error: {}", e),
            ReconcileError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Io(e) => Some(e),
            ReconcileError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        ReconcileError::Io(err)
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Json(err)
    }
}

impl From<String> for ReconcileError {
    fn from(err: String) -> Self {
        ReconcileError::Other(err)
    }
}

impl From<&str> for ReconcileError {
    fn from(err: &str) -> Self {
        ReconcileError::Other(err.to_string())
    }
}
