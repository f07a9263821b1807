//! S3 staging area for batch files.
//!
//! Batch files destined for warehouses that bulk-load from object
//! storage are uploaded here between flush and `load_table`; objects are
//! deleted best-effort once the load finishes.

use crate::error::BulkError;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Credentials and location for the S3 staging bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3StageConfig {
    pub access_key: String,
    pub secret: String,
    pub region: String,
    pub bucket: String,
    /// Key prefix inside the bucket; empty means bucket root.
    #[serde(default)]
    pub folder: String,
    /// Custom endpoint URL for S3-compatible stores (MinIO, LocalStack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Staging uploader bound to one bucket.
pub struct S3Stage {
    store: Arc<dyn ObjectStore>,
    folder: String,
}

impl S3Stage {
    pub fn new(config: &S3StageConfig) -> Result<Self, BulkError> {
        let mut builder = AmazonS3Builder::new()
            .with_region(&config.region)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret);
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| BulkError::staging("failed to set up s3 staging client", e))?;
        Ok(Self {
            store: Arc::new(store),
            folder: config.folder.clone(),
        })
    }

    /// Object key for a staged batch file name.
    pub fn object_key(&self, file_name: &str) -> String {
        if self.folder.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.folder.trim_end_matches('/'), file_name)
        }
    }

    pub async fn upload(&self, key: &str, local_path: &Path) -> Result<(), BulkError> {
        let contents = std::fs::read(local_path)
            .map_err(|e| BulkError::staging("failed to read batch file for upload", e))?;
        let size = contents.len();
        self.store
            .put(&ObjectPath::from(key), Bytes::from(contents).into())
            .await
            .map_err(|e| BulkError::staging("failed to upload batch file to s3", e))?;
        debug!(key, size, "uploaded staging object");
        Ok(())
    }

    /// Best-effort delete; callers ignore the result after a successful
    /// load and log it elsewhere on the cleanup path.
    pub async fn delete(&self, key: &str) -> Result<(), BulkError> {
        self.store
            .delete(&ObjectPath::from(key))
            .await
            .map_err(|e| BulkError::staging("failed to delete staging object", e))
    }
}
