use crate::config::StoreSettings;
use crate::error::ReconcileError;
use crate::store::ObjectStoreLike;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Blocking view of one bucket. Keys handed out and accepted are full
/// object keys; the configured prefix only scopes listing.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    runtime: Arc<Runtime>,
}

impl S3Store {
    pub fn new(settings: &StoreSettings, runtime: Arc<Runtime>) -> Result<Self, ReconcileError> {
        let region = Region::new(settings.region.clone());
        let base_config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(region.clone())
                .load(),
        );

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &settings.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint);
            s3_builder = s3_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: settings.bucket.clone(),
            runtime,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl ObjectStoreLike for S3Store {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ReconcileError> {
        let mut token: Option<String> = None;
        let mut keys = Vec::new();

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = self
                .runtime
                .block_on(request.send())
                .map_err(|e| ReconcileError::Store(format!("list {}: {}", prefix, e)))?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    // Folder placeholders created by the console.
                    .filter(|key| !key.ends_with('/'))
                    .map(|key| key.to_string()),
            );

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
                if token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ReconcileError> {
        let resp = self
            .runtime
            .block_on(self.client.get_object().bucket(&self.bucket).key(key).send())
            .map_err(|e| ReconcileError::Store(format!("get {}: {}", key, e)))?;

        let data = self
            .runtime
            .block_on(resp.body.collect())
            .map_err(|e| ReconcileError::Store(format!("read {}: {}", key, e)))?
            .to_vec();
        Ok(data)
    }

    fn delete(&self, key: &str) -> Result<(), ReconcileError> {
        // S3 reports success for keys that are already gone.
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .map_err(|e| ReconcileError::Store(format!("delete {}: {}", key, e)))?;
        Ok(())
    }
}
