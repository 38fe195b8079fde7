//! Data node storage: file-per-chunk on local disk plus a warm in-memory
//! chunk map, and the heartbeat loop back to the master.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, warn};

use crate::config::{CommonConfig, DataNodeConfig};
use crate::protocol::Command;
use crate::util;

#[derive(Debug)]
pub struct DataNodeService {
    pub node_id: u32,
    data_dir: PathBuf,
    warm: Mutex<HashMap<String, Bytes>>, // fname:cid -> body
    pub common: CommonConfig,
}

impl DataNodeService {
    /// Build the service and make sure the node's chunk directory exists.
    pub fn new(node_id: u32, config: &DataNodeConfig, common: CommonConfig) -> io::Result<Self> {
        let data_dir = Path::new(&config.data_root).join(format!("data_node_{node_id}"));
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            node_id,
            data_dir,
            warm: Mutex::new(HashMap::new()),
            common,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn chunk_key(file: &str, cid: u64) -> String {
        format!("{file}:{cid}")
    }

    fn chunk_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.chunk"))
    }

    /// Write the chunk body to disk (truncating) and refresh the warm map.
    /// Filenames may contain `/`, so parent directories are created on
    /// demand.
    pub async fn save_chunk(&self, file: &str, cid: u64, body: Bytes) -> io::Result<()> {
        let key = Self::chunk_key(file, cid);
        let path = self.chunk_path(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await?;
        self.warm.lock().await.insert(key, body);
        Ok(())
    }

    /// Warm-map body if present, otherwise loaded from disk into the warm
    /// map, otherwise empty (the empty reply is the missing-chunk signal).
    pub async fn load_chunk(&self, file: &str, cid: u64) -> Bytes {
        let key = Self::chunk_key(file, cid);
        if let Some(body) = self.warm.lock().await.get(&key) {
            return body.clone();
        }
        match tokio::fs::read(self.chunk_path(&key)).await {
            Ok(raw) => {
                let body = Bytes::from(raw);
                self.warm.lock().await.insert(key, body.clone());
                body
            }
            Err(_) => Bytes::new(),
        }
    }

    /// Drop the warm entry and the disk file, if present.
    pub async fn remove_chunk(&self, file: &str, cid: u64) {
        let key = Self::chunk_key(file, cid);
        self.warm.lock().await.remove(&key);
        let path = self.chunk_path(&key);
        if path.exists() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                error!("failed to remove {}: {e}", path.display());
            }
        }
    }

    /// Purge every chunk belonging to `file`. Returns how many on-disk
    /// chunk files were removed.
    pub async fn purge_file(&self, file: &str) -> usize {
        let prefix = format!("{file}:");
        self.warm.lock().await.retain(|key, _| !key.starts_with(&prefix));

        let mut removed = 0;
        let Ok(mut dir) = tokio::fs::read_dir(&self.data_dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".chunk") {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Heartbeat loop: one `heartbeat:<id>` frame to the master per tick,
    /// forever. Failures are logged and retried on the next tick.
    pub fn start_heartbeat(self: &Arc<Self>, master_addr: String) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(svc.common.heartbeat_interval));
            let limit = Duration::from_secs(svc.common.request_timeout);
            let frame = Command::Heartbeat { node_id: svc.node_id }.encode();
            loop {
                ticker.tick().await;
                match util::exchange(&master_addr, &frame, limit).await {
                    Ok(reply) if reply == b"OK" => debug!("heartbeat acknowledged"),
                    Ok(reply) => warn!(
                        "unexpected heartbeat response: {}",
                        String::from_utf8_lossy(&reply)
                    ),
                    Err(e) => warn!("heartbeat to {master_addr} failed: {e}"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_service(node_id: u32) -> (DataNodeService, PathBuf) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "minidfs-node-{}-{id}",
            std::process::id()
        ));
        let config = DataNodeConfig {
            data_root: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let svc = DataNodeService::new(node_id, &config, CommonConfig::default()).unwrap();
        (svc, root)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (svc, root) = temp_service(1);
        svc.save_chunk("f", 0, Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(svc.load_chunk("f", 0).await, Bytes::from_static(b"hello"));
        assert!(svc.data_dir().join("f:0.chunk").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_chunk_loads_empty() {
        let (svc, root) = temp_service(2);
        assert!(svc.load_chunk("ghost", 9).await.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn load_falls_back_to_disk_after_warm_loss() {
        let (svc, root) = temp_service(3);
        svc.save_chunk("f", 1, Bytes::from_static(b"warm")).await.unwrap();
        svc.warm.lock().await.clear();

        assert_eq!(svc.load_chunk("f", 1).await, Bytes::from_static(b"warm"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn remove_chunk_clears_disk_and_warm() {
        let (svc, root) = temp_service(4);
        svc.save_chunk("f", 0, Bytes::from_static(b"x")).await.unwrap();
        svc.remove_chunk("f", 0).await;

        assert!(!svc.data_dir().join("f:0.chunk").exists());
        assert!(svc.load_chunk("f", 0).await.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn purge_removes_only_matching_prefix() {
        let (svc, root) = temp_service(5);
        svc.save_chunk("doc", 0, Bytes::from_static(b"a")).await.unwrap();
        svc.save_chunk("doc", 1, Bytes::from_static(b"b")).await.unwrap();
        svc.save_chunk("doc2", 0, Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(svc.purge_file("doc").await, 2);
        assert!(svc.load_chunk("doc", 0).await.is_empty());
        assert_eq!(svc.load_chunk("doc2", 0).await, Bytes::from_static(b"c"));

        let _ = std::fs::remove_dir_all(root);
    }
}
