//! Object-storage access for staged exports: S3 for deployments and a
//! filesystem layout for local runs and tests.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use fundsync_core::{FailureKind, ObjectLocation};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundsync-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{bucket}` does not exist")]
    BucketNotFound { bucket: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` in bucket `{bucket}` is empty")]
    EmptyObject { bucket: String, key: String },
    #[error("storage error for {location}: {message}")]
    Backend { location: String, message: String },
}

impl StorageError {
    pub fn bucket_not_found(location: &ObjectLocation) -> Self {
        Self::BucketNotFound {
            bucket: location.bucket.clone(),
        }
    }

    pub fn object_not_found(location: &ObjectLocation) -> Self {
        Self::ObjectNotFound {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
        }
    }

    pub fn empty_object(location: &ObjectLocation) -> Self {
        Self::EmptyObject {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
        }
    }

    pub fn backend(location: &ObjectLocation, message: impl Into<String>) -> Self {
        Self::Backend {
            location: location.to_string(),
            message: message.into(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StorageError::BucketNotFound { .. } => FailureKind::BucketNotFound,
            StorageError::ObjectNotFound { .. } => FailureKind::ObjectNotFound,
            StorageError::EmptyObject { .. } => FailureKind::EmptyObject,
            StorageError::Backend { .. } => FailureKind::Storage,
        }
    }
}

/// Read side of object storage as the pipeline consumes it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the full object body. Missing buckets, missing objects and
    /// zero-byte objects are reported as distinct errors.
    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the ambient AWS configuration. A custom endpoint
    /// (MinIO, LocalStack) switches to path-style addressing.
    pub async fn from_env(endpoint: Option<&str>) -> Self {
        let shared = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }
}

fn classify_get_error(err: SdkError<GetObjectError>, location: &ObjectLocation) -> StorageError {
    if let SdkError::ServiceError(service_err) = &err {
        let inner = service_err.err();
        if inner.is_no_such_key() {
            return StorageError::object_not_found(location);
        }
        match inner.code() {
            Some("NoSuchBucket") => return StorageError::bucket_not_found(location),
            Some("NoSuchKey") | Some("NotFound") => return StorageError::object_not_found(location),
            _ => {}
        }
    }
    StorageError::backend(location, DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        let span = info_span!("s3_get_object", bucket = %location.bucket, key = %location.key);
        async {
            let resp = self
                .client
                .get_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .send()
                .await
                .map_err(|err| classify_get_error(err, location))?;
            let body = resp
                .body
                .collect()
                .await
                .map_err(|err| StorageError::backend(location, err.to_string()))?
                .into_bytes()
                .to_vec();
            if body.is_empty() {
                return Err(StorageError::empty_object(location));
            }
            debug!(bytes = body.len(), "downloaded object");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub location: ObjectLocation,
    pub absolute_path: PathBuf,
    pub content_sha256: String,
    pub byte_size: usize,
}

/// Buckets as directories under `root`, keys as relative paths.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        let bucket = Path::new(&location.bucket);
        if location.bucket.is_empty() || bucket.components().count() != 1 || !is_plain(bucket) {
            return Err(StorageError::backend(location, "invalid bucket name"));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        let key = Path::new(location.key.trim_start_matches('/'));
        if location.key.is_empty() || !is_plain(key) {
            return Err(StorageError::backend(location, "invalid object key"));
        }
        Ok(self.bucket_path(location)?.join(key))
    }

    /// Writes an object atomically through a temp file and rename, replacing
    /// any previous version.
    pub async fn put_object(
        &self,
        location: &ObjectLocation,
        bytes: &[u8],
    ) -> Result<StoredObject, StorageError> {
        let absolute_path = self.object_path(location)?;
        let io_err = |context: &str, err: std::io::Error| {
            StorageError::backend(location, format!("{context}: {err}"))
        };

        let parent = absolute_path
            .parent()
            .ok_or_else(|| StorageError::backend(location, "object path has no parent"))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_err("creating object directory", e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| io_err("opening temp object file", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_err("writing temp object file", e))?;
        file.flush()
            .await
            .map_err(|e| io_err("flushing temp object file", e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err("renaming temp object file", err));
        }

        Ok(StoredObject {
            location: location.clone(),
            absolute_path,
            content_sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

fn is_plain(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        let object_path = self.object_path(location)?;
        let bucket_exists = fs::metadata(self.bucket_path(location)?)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !bucket_exists {
            return Err(StorageError::bucket_not_found(location));
        }

        let bytes = match fs::read(&object_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::object_not_found(location));
            }
            Err(err) => {
                return Err(StorageError::backend(
                    location,
                    format!("reading {}: {err}", object_path.display()),
                ));
            }
        };
        if bytes.is_empty() {
            return Err(StorageError::empty_object(location));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let location = ObjectLocation::new("fund-staging", "raw/erp/prices/2025-12-09/a.csv");

        let first = store.put_object(&location, b"v1").await.expect("first put");
        store.put_object(&location, b"v2").await.expect("second put");

        assert!(first.absolute_path.exists());
        assert_eq!(first.content_sha256, sha256_hex(b"v1"));
        assert_eq!(store.get_object(&location).await.expect("get"), b"v2");
    }

    #[tokio::test]
    async fn missing_bucket_and_object_are_distinguished() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let existing = ObjectLocation::new("fund-staging", "raw/a.csv");
        store.put_object(&existing, b"x").await.expect("put");

        let no_bucket = ObjectLocation::new("other-bucket", "raw/a.csv");
        let err = store.get_object(&no_bucket).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::BucketNotFound);

        let no_object = ObjectLocation::new("fund-staging", "raw/b.csv");
        let err = store.get_object(&no_object).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ObjectNotFound);
        assert_eq!(err.to_string(), "object `raw/b.csv` not found in bucket `fund-staging`");
    }

    #[tokio::test]
    async fn zero_byte_objects_are_empty() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let location = ObjectLocation::new("fund-staging", "raw/empty.csv");
        store.put_object(&location, b"").await.expect("put");

        let err = store.get_object(&location).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::EmptyObject);
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let location = ObjectLocation::new("fund-staging", "../../etc/passwd");
        let err = store.get_object(&location).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Storage);
    }
}
