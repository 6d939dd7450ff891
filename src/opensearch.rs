use crate::config::IndexSettings;
use crate::error::ReconcileError;
use crate::index::{IndexClientLike, IndexQuery, SearchHits};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Search index reached over its HTTP API.
pub struct OpenSearchClient {
    http: Client,
    host: String,
    username: Option<String>,
    password: Option<String>,
}

impl OpenSearchClient {
    pub fn new(settings: &IndexSettings) -> Result<Self, ReconcileError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ReconcileError::Index(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            host: settings.host.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.host, path.trim_start_matches('/'))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, ReconcileError> {
        self.authed(request)
            .send()
            .map_err(|e| ReconcileError::Index(format!("{}: {}", what, e)))
    }
}

fn error_body(what: &str, resp: Response) -> ReconcileError {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    ReconcileError::Index(format!("{}: {} {}", what, status, body))
}

impl IndexClientLike for OpenSearchClient {
    fn search(&self, index_pattern: &str, query: &IndexQuery) -> Result<SearchHits, ReconcileError> {
        let what = format!("search {}", index_pattern);
        let request = self
            .http
            .post(self.url(&format!("{}/_search", index_pattern)))
            .json(&query.to_body());
        let resp = self.send(request, &what)?;
        if !resp.status().is_success() {
            return Err(error_body(&what, resp));
        }
        let body: Value = resp
            .json()
            .map_err(|e| ReconcileError::Index(format!("{}: {}", what, e)))?;
        SearchHits::from_response(&body)
    }

    fn index_exists(&self, name: &str) -> Result<bool, ReconcileError> {
        let what = format!("exists {}", name);
        let resp = self.send(self.http.head(self.url(name)), &what)?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_body(&what, resp)),
        }
    }

    fn create_index(&self, name: &str, mapping: &Value) -> Result<(), ReconcileError> {
        let what = format!("create {}", name);
        let resp = self.send(self.http.put(self.url(name)).json(mapping), &what)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_body(&what, resp))
        }
    }
}
