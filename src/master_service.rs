//! Master-side state and coordination: the file → chunk → replica
//! namespace, replica placement, read fallback, healing, liveness
//! tracking, and JSON metadata persistence.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{error, info, warn};

use crate::config::{CommonConfig, MasterConfig};
use crate::error::DfsError;
use crate::protocol::NodeCommand;
use crate::util;

/// One chunk of a file: its dense zero-based id and the data nodes
/// currently believed to hold its body, in insertion order (which is also
/// the read-fallback order).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub cid: u64,
    pub replicas: Vec<u32>,
}

/// Master-side view of one data node. Created lazily on first heartbeat
/// and kept for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub alive: bool,
    pub last_heartbeat: f64, // epoch seconds
    pub port: u16,
}

/// The whole mutable namespace, guarded by a single lock. Never held
/// across a socket call to a data node.
#[derive(Debug, Default)]
pub struct State {
    pub files: HashMap<String, Vec<ChunkEntry>>,
    pub nodes: HashMap<u32, NodeRecord>,
}

#[derive(Debug)]
pub struct MasterService {
    pub state: RwLock<State>,
    pub config: MasterConfig,
    pub common: CommonConfig,
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Split a body into chunk_size-byte pieces; the final piece may be
/// shorter. An empty body yields no chunks.
pub fn split_chunks(body: &[u8], chunk_size: usize) -> Vec<Bytes> {
    body.chunks(chunk_size).map(Bytes::copy_from_slice).collect()
}

impl MasterService {
    /// Build the service, restoring the namespace from the metadata file
    /// when one is present.
    pub fn new(config: MasterConfig, common: CommonConfig) -> Self {
        let files = load_metadata(Path::new(&config.metadata_path));
        if !files.is_empty() {
            info!(files = files.len(), "restored namespace from {}", config.metadata_path);
        }
        Self {
            state: RwLock::new(State { files, nodes: HashMap::new() }),
            config,
            common,
        }
    }

    /// Record a heartbeat: one insert path creates or refreshes the full
    /// node record, so liveness, timestamp, and port can never drift.
    pub async fn record_heartbeat(&self, node_id: u32) {
        let port = self.common.node_port(node_id);
        let mut st = self.state.write().await;
        let rec = st.nodes.entry(node_id).or_insert(NodeRecord {
            alive: true,
            last_heartbeat: 0.0,
            port,
        });
        rec.alive = true;
        rec.last_heartbeat = now_secs();
        rec.port = port;
    }

    /// Currently-alive node ids in ascending order.
    pub async fn alive_nodes(&self) -> Vec<u32> {
        let st = self.state.read().await;
        let mut alive: Vec<u32> = st
            .nodes
            .iter()
            .filter(|(_, rec)| rec.alive)
            .map(|(id, _)| *id)
            .collect();
        alive.sort_unstable();
        alive
    }

    pub async fn mark_dead(&self, node_id: u32) {
        let mut st = self.state.write().await;
        if let Some(rec) = st.nodes.get_mut(&node_id) {
            rec.alive = false;
        }
    }

    /// Mark nodes whose heartbeat lapsed as dead. Returns the ids that
    /// transitioned on this sweep.
    pub async fn expire_stale(&self, now: f64) -> Vec<u32> {
        let timeout = self.common.heartbeat_timeout as f64;
        let mut st = self.state.write().await;
        let mut expired = Vec::new();
        for (id, rec) in st.nodes.iter_mut() {
            if rec.alive && now - rec.last_heartbeat > timeout {
                rec.alive = false;
                expired.push(*id);
            }
        }
        expired.sort_unstable();
        expired
    }

    /// One framed request to a data node. A transport failure marks the
    /// node dead and reports `None`; the healer is the retry mechanism.
    pub async fn node_request(&self, node_id: u32, cmd: &NodeCommand) -> Option<Vec<u8>> {
        let addr = self.common.node_addr(node_id);
        let limit = Duration::from_secs(self.common.request_timeout);
        match util::exchange(&addr, &cmd.encode(), limit).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("node {node_id} unreachable at {addr}: {e}");
                self.mark_dead(node_id).await;
                None
            }
        }
    }

    async fn node_write(&self, node_id: u32, file: &str, cid: u64, body: &Bytes) -> bool {
        let cmd = NodeCommand::Write {
            file: file.to_string(),
            cid,
            body: body.clone(),
        };
        matches!(self.node_request(node_id, &cmd).await, Some(reply) if reply == b"OK")
    }

    /// Place one chunk on up to `replication_factor` nodes.
    ///
    /// - Tries the first RF alive nodes in ascending id order.
    /// - Falls back to further alive nodes one by one until RF acks or
    ///   the pool is exhausted.
    /// - Any non-empty result is acceptance; an empty result is a hard
    ///   write failure for the caller.
    pub async fn place_chunk(&self, file: &str, cid: u64, body: &Bytes) -> Vec<u32> {
        let rf = self.common.replication_factor;
        let mut replicas = Vec::new();
        let candidates: Vec<u32> = self.alive_nodes().await.into_iter().take(rf).collect();
        if candidates.is_empty() {
            return replicas;
        }
        for &node_id in &candidates {
            if self.node_write(node_id, file, cid, body).await {
                replicas.push(node_id);
            }
        }
        if replicas.len() < rf {
            let tried: HashSet<u32> = candidates.into_iter().collect();
            let mut extra_needed = rf - replicas.len();
            for node_id in self.alive_nodes().await {
                if extra_needed == 0 {
                    break;
                }
                if tried.contains(&node_id) {
                    continue;
                }
                if self.node_write(node_id, file, cid, body).await {
                    replicas.push(node_id);
                    extra_needed -= 1;
                }
            }
        }
        replicas
    }

    /// Fetch one chunk body, falling back across replicas in list order.
    /// Replicas currently marked dead are skipped; the first non-empty
    /// reply wins.
    pub async fn fetch_chunk(&self, file: &str, cid: u64, replicas: &[u32]) -> Option<Bytes> {
        for &node_id in replicas {
            let alive = {
                let st = self.state.read().await;
                st.nodes.get(&node_id).map(|rec| rec.alive).unwrap_or(false)
            };
            if !alive {
                continue;
            }
            let cmd = NodeCommand::Read { file: file.to_string(), cid };
            if let Some(body) = self.node_request(node_id, &cmd).await {
                if !body.is_empty() {
                    return Some(Bytes::from(body));
                }
            }
        }
        None
    }

    /// Chunk the body and place every chunk, committing metadata entries
    /// as placements succeed. A chunk with zero acks aborts with
    /// `WriteFailed`, leaving the entries committed so far — the observable
    /// partial-metadata contract.
    ///
    /// Returns the chunk count and the replica count of the first chunk
    /// (0 for an empty file), which callers report in success messages.
    pub async fn store_file(&self, file: &str, body: &[u8]) -> Result<(usize, usize), DfsError> {
        let chunks = split_chunks(body, self.common.chunk_size);
        {
            let mut st = self.state.write().await;
            st.files.insert(file.to_string(), Vec::new());
        }
        for (cid, chunk) in chunks.iter().enumerate() {
            let replicas = self.place_chunk(file, cid as u64, chunk).await;
            if replicas.is_empty() {
                return Err(DfsError::WriteFailed);
            }
            let mut st = self.state.write().await;
            if let Some(entries) = st.files.get_mut(file) {
                entries.push(ChunkEntry { cid: cid as u64, replicas });
            }
        }
        let rf = {
            let st = self.state.read().await;
            st.files
                .get(file)
                .and_then(|entries| entries.first())
                .map(|entry| entry.replicas.len())
                .unwrap_or(0)
        };
        Ok((chunks.len(), rf))
    }

    /// Delete every replica of `file`'s current chunks. Used as the
    /// prelude to a full re-place; errors are swallowed (they already
    /// marked the node dead).
    pub async fn delete_replicas(&self, file: &str) {
        let entries = {
            let st = self.state.read().await;
            st.files.get(file).cloned().unwrap_or_default()
        };
        for entry in entries {
            for node_id in entry.replicas {
                let cmd = NodeCommand::Delete { file: file.to_string(), cid: entry.cid };
                let _ = self.node_request(node_id, &cmd).await;
            }
        }
    }

    /// Broadcast `delete_file` to every known node to purge stray chunks
    /// left over from past placements.
    pub async fn purge_everywhere(&self, file: &str) {
        let ids: Vec<u32> = {
            let st = self.state.read().await;
            st.nodes.keys().copied().collect()
        };
        let calls = ids.into_iter().map(|node_id| {
            let cmd = NodeCommand::DeleteFile { file: file.to_string() };
            async move { self.node_request(node_id, &cmd).await }
        });
        futures::future::join_all(calls).await;
    }

    /// One full healing pass over every chunk of every file.
    ///
    /// - At or above RF alive replicas: truncate to the first RF.
    /// - Below RF: recover the body from a surviving replica and copy it
    ///   onto additional alive nodes in ascending id order.
    /// - Unrecoverable: keep the surviving claims as they are.
    ///
    /// Returns whether any replica list changed.
    pub async fn heal_all(&self) -> bool {
        let mut changed = false;
        let rf = self.common.replication_factor;
        let files: Vec<String> = {
            let st = self.state.read().await;
            st.files.keys().cloned().collect()
        };
        for file in files {
            let entries = {
                let st = self.state.read().await;
                match st.files.get(&file) {
                    Some(entries) => entries.clone(),
                    None => continue, // deleted mid-pass
                }
            };
            for entry in entries {
                let alive_replicas: Vec<u32> = {
                    let st = self.state.read().await;
                    entry
                        .replicas
                        .iter()
                        .copied()
                        .filter(|id| st.nodes.get(id).map(|rec| rec.alive).unwrap_or(false))
                        .collect()
                };
                let new_replicas = if alive_replicas.len() >= rf {
                    alive_replicas[..rf].to_vec()
                } else {
                    match self.fetch_chunk(&file, entry.cid, &alive_replicas).await {
                        None => alive_replicas,
                        Some(body) => {
                            let mut replicas = alive_replicas;
                            let needed = rf - replicas.len();
                            let targets: Vec<u32> = self
                                .alive_nodes()
                                .await
                                .into_iter()
                                .filter(|id| !replicas.contains(id))
                                .take(needed)
                                .collect();
                            for node_id in targets {
                                if self.node_write(node_id, &file, entry.cid, &body).await {
                                    replicas.push(node_id);
                                }
                            }
                            replicas
                        }
                    }
                };
                if new_replicas != entry.replicas {
                    info!(
                        "[healer] {file}#{} replicas {:?} -> {:?}",
                        entry.cid, entry.replicas, new_replicas
                    );
                    changed = true;
                    let mut st = self.state.write().await;
                    if let Some(entries) = st.files.get_mut(&file) {
                        if let Some(e) = entries.iter_mut().find(|e| e.cid == entry.cid) {
                            e.replicas = new_replicas;
                        }
                    }
                }
            }
        }
        changed
    }

    /// Serialize the namespace to the metadata file, write-to-temp then
    /// atomic rename.
    pub async fn persist(&self) -> io::Result<()> {
        let snapshot = {
            let st = self.state.read().await;
            st.files.clone()
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = format!("{}.tmp", self.config.metadata_path);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.config.metadata_path).await?;
        Ok(())
    }

    pub async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!("failed to persist metadata to {}: {e}", self.config.metadata_path);
        }
    }

    /// Heartbeat-timeout monitor: sweep on a fixed tick and run a healing
    /// pass whenever any node transitions to dead.
    pub fn start_monitor(self: &Arc<Self>) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(svc.config.monitor_interval));
            loop {
                ticker.tick().await;
                let expired = svc.expire_stale(now_secs()).await;
                if expired.is_empty() {
                    continue;
                }
                warn!("[monitor] nodes {expired:?} failed heartbeat, re-replicating affected chunks");
                if svc.heal_all().await {
                    svc.persist_logged().await;
                }
            }
        });
    }

    /// Periodic healer: unconditionally run a full healing pass.
    pub fn start_healer(self: &Arc<Self>) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(svc.config.healer_interval));
            loop {
                ticker.tick().await;
                if svc.heal_all().await {
                    svc.persist_logged().await;
                }
            }
        });
    }
}

/// Load the persisted namespace, tolerating damage: non-object roots are
/// ignored, non-array files are skipped, and entries without an integer
/// `cid` are discarded.
pub fn load_metadata(path: &Path) -> HashMap<String, Vec<ChunkEntry>> {
    let mut files = HashMap::new();
    let Ok(raw) = std::fs::read(path) else {
        return files;
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        warn!("metadata file {} is not valid JSON, starting empty", path.display());
        return files;
    };
    let Some(map) = value.as_object() else {
        return files;
    };
    for (name, entries) in map {
        let Some(arr) = entries.as_array() else {
            continue;
        };
        let mut list = Vec::new();
        for entry in arr {
            let Some(cid) = entry.get("cid").and_then(|v| v.as_u64()) else {
                continue;
            };
            let replicas = entry
                .get("replicas")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_u64().map(|n| n as u32)).collect())
                .unwrap_or_default();
            list.push(ChunkEntry { cid, replicas });
        }
        files.insert(name.clone(), list);
    }
    files
}
