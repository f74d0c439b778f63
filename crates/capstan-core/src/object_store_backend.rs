//! [`StorageBackend`] implementation over the `object_store` crate.
//!
//! Covers both configured backends: `posix` (local filesystem) and
//! `s3` (any S3-compatible endpoint). The CAS version token is the
//! backend's entity tag.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::ops::Range;
use std::sync::Arc;

use crate::config::{ObjectStorageConfig, ObjectStorageType};
use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Object storage backend backed by the `object_store` crate.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Creates a backend over an existing `object_store` implementation.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Creates a backend from the object storage configuration.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for incomplete configuration and
    /// `Unavailable` when the backend cannot be constructed.
    pub fn from_config(config: &ObjectStorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.storage_type {
            ObjectStorageType::Posix => {
                let path = config
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::bad_request("posix object storage requires a path"))?;
                std::fs::create_dir_all(path).map_err(|e| {
                    Error::unavailable_with_source(
                        format!("creating object storage dir {path}"),
                        e,
                    )
                })?;
                Arc::new(LocalFileSystem::new_with_prefix(path).map_err(|e| {
                    Error::unavailable_with_source("opening posix object storage", e)
                })?)
            }
            ObjectStorageType::S3 => {
                let bucket = config
                    .bucket
                    .as_deref()
                    .ok_or_else(|| Error::bad_request("s3 object storage requires a bucket"))?;
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(access_key) = &config.access_key {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                Arc::new(builder.build().map_err(|e| {
                    Error::unavailable_with_source("building s3 object storage", e)
                })?)
            }
        };
        Ok(Self { store })
    }

    async fn current_version(&self, path: &ObjectPath) -> String {
        match self.store.head(path).await {
            Ok(meta) => meta.e_tag.unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}

fn map_error(path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::not_found("object", path),
        other => Error::unavailable_with_source(format!("object store access for {path}"), other),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = ObjectPath::from(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_error(path, e))?;
        result.bytes().await.map_err(|e| map_error(path, e))
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        if range.end < range.start {
            return Err(Error::bad_request(format!(
                "range end {} is before start {}",
                range.end, range.start
            )));
        }
        let location = ObjectPath::from(path);
        let start = usize::try_from(range.start)
            .map_err(|_| Error::bad_request("range start out of bounds"))?;
        let end =
            usize::try_from(range.end).map_err(|_| Error::bad_request("range end out of bounds"))?;
        self.store
            .get_range(&location, start..end)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = ObjectPath::from(path);
        let mode = match &precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(version) => PutMode::Update(UpdateVersion {
                e_tag: Some(version.clone()),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let opts = PutOptions {
            mode,
            ..Default::default()
        };

        match self
            .store
            .put_opts(&location, PutPayload::from(data), opts)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: result.e_tag.unwrap_or_default(),
            }),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => {
                Ok(WriteResult::PreconditionFailed {
                    current_version: self.current_version(&location).await,
                })
            }
            Err(e) => Err(map_error(path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = ObjectPath::from(path);
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = ObjectPath::from(prefix.trim_end_matches('/'));
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| map_error(prefix, e))?;

        Ok(metas
            .into_iter()
            .map(|meta| ObjectMeta {
                path: meta.location.to_string(),
                size: meta.size as u64,
                version: meta.e_tag.clone().unwrap_or_default(),
                last_modified: Some(meta.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let location = ObjectPath::from(path);
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                path: meta.location.to_string(),
                size: meta.size as u64,
                version: meta.e_tag.clone().unwrap_or_default(),
                last_modified: Some(meta.last_modified),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_error(path, e)),
        }
    }
}
