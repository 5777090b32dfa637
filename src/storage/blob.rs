//! Result blob storage.
//!
//! Workers upload rendered frames through the scheduler; the scheduler
//! writes them to an `object_store` backend (local disk, in-memory, S3, GCS)
//! chosen by the `--blob_root` URL.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::prefix::PrefixStore;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use url::Url;

use crate::error::{Result, SchedulerError};

/// Byte stream of one blob plus its content type.
pub struct BlobStream {
    pub content_type: String,
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Writes `data` at `key`, replacing any existing blob.
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<()>;

    /// Opens `key` for streaming. `NotFound` if absent.
    async fn get_stream(&self, key: &str) -> Result<BlobStream>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// [`BlobStore`] over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
    /// Local disk can't persist attributes; content types are inferred
    /// from the key there.
    attributes: bool,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, attributes: bool) -> Self {
        Self { store, attributes }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), true)
    }

    /// Builds a store from a root such as `file:///srv/results`,
    /// `memory:///`, `s3://bucket/prefix`, `gs://bucket` or a bare path.
    /// Cloud credentials come from the usual environment variables.
    pub fn from_url(root: &str) -> Result<Self> {
        let invalid = |e: &dyn std::fmt::Display| {
            SchedulerError::InvalidArgument(format!("blob root {:?}: {}", root, e))
        };

        if !root.contains("://") {
            return Self::local(PathBuf::from(root));
        }

        let url = Url::parse(root).map_err(|e| invalid(&e))?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| invalid(&"not a local path"))?;
                Self::local(path)
            }
            "memory" => Ok(Self::in_memory()),
            _ => {
                let (store, prefix) =
                    object_store::parse_url_opts(&url, std::iter::empty::<(String, String)>())
                        .map_err(|e| invalid(&e))?;
                let store: Arc<dyn ObjectStore> = if prefix.as_ref().is_empty() {
                    Arc::from(store)
                } else {
                    Arc::new(PrefixStore::new(store, prefix))
                };
                Ok(Self::new(store, true))
            }
        }
    }

    fn local(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).map_err(|e| {
            SchedulerError::InvalidArgument(format!("blob root {}: {}", path.display(), e))
        })?;
        let store = LocalFileSystem::new_with_prefix(&path).map_err(|e| {
            SchedulerError::InvalidArgument(format!("blob root {}: {}", path.display(), e))
        })?;
        Ok(Self::new(Arc::new(store), false))
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<()> {
        let path = Path::from(key);
        let payload = PutPayload::from(data);
        if self.attributes {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            self.store.put_opts(&path, payload, opts).await?;
        } else {
            self.store.put(&path, payload).await?;
        }
        tracing::debug!(key, content_type, "Stored blob");
        Ok(())
    }

    async fn get_stream(&self, key: &str) -> Result<BlobStream> {
        let result = self.store.get(&Path::from(key)).await?;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| {
                let s: &str = v.as_ref();
                s.to_string()
            })
            .unwrap_or_else(|| content_type_for(key).to_string());
        let chunks = result.into_stream().map_err(SchedulerError::from).boxed();
        Ok(BlobStream {
            content_type,
            chunks,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Content type implied by a blob key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".png") {
        "image/png"
    } else if key.ends_with(".gz") {
        "application/gzip"
    } else {
        "application/octet-stream"
    }
}
