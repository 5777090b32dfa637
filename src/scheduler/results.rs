//! Result artifacts in the blob store.
//!
//! Every done lease owns two blobs under a deterministic prefix:
//! `{batch|single}/{batch_id}/{lease_id}/{order_id}.png` and
//! `.../{order_id}.meta.pb.gz`. A retried Done writes the same keys.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use prost::Message;

use crate::error::{Result, SchedulerError};
use crate::proto::{RenderingMetadata, StoredResult};
use crate::retry::{with_retry, BLOB_RETRIES};
use crate::scheduler::lease::Lease;
use crate::storage::{BlobStore, BlobStream};

/// Largest data chunk sent in one Result reply.
pub const CHUNK_SIZE: usize = 16 * 1024;

pub const IMAGE_EXT: &str = "png";
pub const META_EXT: &str = "meta.pb.gz";

const IMAGE_CONTENT_TYPE: &str = "image/png";
const META_CONTENT_TYPE: &str = "application/gzip";

/// Deterministic key of one result blob.
pub fn blob_key(lease: &Lease, ext: &str) -> String {
    let (kind, batch) = match lease.batch_id {
        Some(batch_id) => ("batch", batch_id.to_string()),
        None => ("single", String::new()),
    };
    format!("{}/{}/{}/{}.{}", kind, batch, lease.id, lease.order_id, ext)
}

/// What a worker reports when it finishes an order.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub image: Bytes,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub metadata: Option<RenderingMetadata>,
}

#[derive(Clone)]
pub struct ResultStore {
    blobs: Arc<dyn BlobStore>,
}

impl ResultStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Writes the image and the compressed metadata record, retrying each
    /// put on transient failures.
    pub async fn upload(&self, lease: &Lease, completion: &Completion) -> Result<()> {
        let meta = encode_stored(&StoredResult {
            lease_id: lease.id.to_string(),
            order_id: lease.order_id.to_string(),
            metadata: completion.metadata.clone(),
            stdout: completion.stdout.clone(),
            stderr: completion.stderr.clone(),
        })?;

        let uploads = [
            (blob_key(lease, IMAGE_EXT), IMAGE_CONTENT_TYPE, completion.image.clone()),
            (blob_key(lease, META_EXT), META_CONTENT_TYPE, meta),
        ];
        for (key, content_type, data) in &uploads {
            with_retry("blob_put", BLOB_RETRIES, || {
                self.blobs.put(key, content_type, data.clone())
            })
            .await?;
        }
        tracing::debug!(
            lease_id = %lease.id,
            image_bytes = completion.image.len(),
            "Uploaded result"
        );
        Ok(())
    }

    /// Opens the image of a done lease, re-chunked to [`CHUNK_SIZE`]. A
    /// missing blob is an internal error: the lease row says it exists.
    /// So is any read failure once the blob is open.
    pub async fn open_image(&self, lease: &Lease) -> Result<BlobStream> {
        let key = blob_key(lease, IMAGE_EXT);
        match self.blobs.get_stream(&key).await {
            Ok(blob) => {
                let chunks = blob
                    .chunks
                    .map_err(move |e| {
                        SchedulerError::Internal(format!("read result blob {}: {}", key, e))
                    })
                    .boxed();
                Ok(BlobStream {
                    content_type: blob.content_type,
                    chunks: rechunk(chunks, CHUNK_SIZE),
                })
            }
            Err(SchedulerError::NotFound(_)) => Err(SchedulerError::Internal(format!(
                "result blob {} missing for done lease {}",
                key, lease.id
            ))),
            Err(e) => Err(e),
        }
    }
}

fn encode_stored(record: &StoredResult) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&record.encode_length_delimited_to_vec())
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| SchedulerError::Internal(format!("compress metadata: {}", e)))
}

/// Splits every chunk of `chunks` into pieces of at most `max` bytes.
pub fn rechunk(
    chunks: BoxStream<'static, Result<Bytes>>,
    max: usize,
) -> BoxStream<'static, Result<Bytes>> {
    chunks
        .flat_map(move |item| {
            let pieces: Vec<Result<Bytes>> = match item {
                Ok(mut bytes) => {
                    let mut pieces = Vec::with_capacity(bytes.len() / max + 1);
                    while bytes.len() > max {
                        pieces.push(Ok(bytes.split_to(max)));
                    }
                    if !bytes.is_empty() {
                        pieces.push(Ok(bytes));
                    }
                    pieces
                }
                Err(e) => vec![Err(e)],
            };
            stream::iter(pieces)
        })
        .boxed()
}
