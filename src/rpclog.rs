//! Binary audit log of every RPC.
//!
//! Each call appends one length-delimited `RpcLogEntry`. Appends are
//! serialized by a mutex and flushed before the lock is released, so the
//! file order is the completion order.

use std::path::{Path, PathBuf};

use prost::Message;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::proto::RpcLogEntry;

pub struct RpcLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RpcLog {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::info!(path = %path.display(), "Opened RPC log");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub async fn append(&self, entry: &RpcLogEntry) -> std::io::Result<()> {
        let buf = entry.encode_length_delimited_to_vec();
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await
    }

    /// Appends `entry`. An unwritable audit log is fatal.
    pub async fn record(&self, entry: &RpcLogEntry) {
        if let Err(e) = self.append(entry).await {
            tracing::error!(
                path = %self.path.display(),
                method = %entry.method,
                error = %e,
                "Failed to write RPC log, exiting"
            );
            std::process::exit(1);
        }
    }
}

/// Decodes a whole audit log.
pub fn read_entries(mut buf: &[u8]) -> Result<Vec<RpcLogEntry>, prost::DecodeError> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        entries.push(RpcLogEntry::decode_length_delimited(&mut buf)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(method: &str, error: &str) -> RpcLogEntry {
        RpcLogEntry {
            start_ns: 1,
            end_ns: 2,
            method: method.to_string(),
            peer_address: "127.0.0.1:5000".to_string(),
            peer_cn: "worker".to_string(),
            request: vec![1, 2, 3],
            reply: Vec::new(),
            error: error.to_string(),
            request_id: "r".to_string(),
            user_id: 7,
        }
    }

    #[tokio::test]
    async fn appends_in_order_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rpc.log");

        let log = RpcLog::open(&path).await.unwrap();
        log.append(&entry("Get", "")).await.unwrap();
        log.append(&entry("Done", "not found: lease")).await.unwrap();
        drop(log);

        let log = RpcLog::open(&path).await.unwrap();
        log.append(&entry("Stats", "")).await.unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        let entries = read_entries(&bytes).unwrap();
        let methods: Vec<_> = entries.iter().map(|e| e.method.as_str()).collect();
        assert_eq!(methods, ["Get", "Done", "Stats"]);
        assert_eq!(entries[1].error, "not found: lease");
        assert_eq!(entries[0].request, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rpc.log");
        let log = std::sync::Arc::new(RpcLog::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&entry(&format!("M{}", i), "")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let entries = read_entries(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(entries.len(), 20);
    }
}
