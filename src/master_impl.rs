//! Command dispatch for the master: maps each parsed [`Command`] onto the
//! namespace operations in [`crate::master_service`] and runs the accept
//! loop, one task per connection.

use std::io;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::error::DfsError;
use crate::master_service::MasterService;
use crate::protocol::{Command, NodeCommand, ParseError, Reply};

impl MasterService {
    /// Dispatch one client command to a reply.
    pub async fn handle(&self, cmd: Command) -> Reply {
        match cmd {
            Command::Create { file, body } => self.handle_create(file, body.as_ref()).await,
            Command::Write { file, body } => self.handle_write(file, body.as_ref()).await,
            Command::Append { file, body } => self.handle_append(file, body.as_ref()).await,
            Command::Read { file } => self.handle_read(&file).await,
            Command::Delete { file } => self.handle_delete(&file).await,
            Command::List => self.handle_list().await,
            Command::Metadata { file } => self.handle_metadata(&file).await,
            Command::SystemInfo => self.handle_system_info().await,
            Command::Heartbeat { node_id } => {
                self.record_heartbeat(node_id).await;
                Reply::Ok
            }
        }
    }

    /// Create (or idempotently overwrite) a file.
    ///
    /// - Refuses up front when no data node is alive; the namespace is
    ///   left untouched.
    /// - Purges replicas of any previous version first, so overwritten
    ///   chunk bodies do not leak on the nodes.
    /// - Places all chunks, then persists.
    async fn handle_create(&self, file: String, body: &[u8]) -> Reply {
        if self.alive_nodes().await.is_empty() {
            return Reply::Error(DfsError::NoAliveNodes);
        }
        let existed = {
            let st = self.state.read().await;
            st.files.contains_key(&file)
        };
        if existed {
            self.delete_replicas(&file).await;
        }
        match self.store_file(&file, body).await {
            Ok((chunks, rf)) => {
                info!("created {file} with {chunks} chunks");
                self.persist_logged().await;
                Reply::Success(format!("Created {file} with {chunks} chunks (RF={rf})"))
            }
            Err(e) => Reply::Error(e),
        }
    }

    /// Replace a file's content wholesale: purge old replicas, chunk and
    /// place the new body, persist.
    async fn handle_write(&self, file: String, body: &[u8]) -> Reply {
        if self.alive_nodes().await.is_empty() {
            return Reply::Error(DfsError::NoAliveNodes);
        }
        self.delete_replicas(&file).await;
        match self.store_file(&file, body).await {
            Ok(_) => {
                self.persist_logged().await;
                Reply::Success(format!("Replaced file with {} bytes", body.len()))
            }
            Err(e) => Reply::Error(e),
        }
    }

    /// Append, modeled as read-all + concat + rewrite.
    ///
    /// - Missing file: behaves as create (message without the RF suffix).
    /// - Any chunk of the current content unreadable: the append is
    ///   refused rather than rewriting around the hole.
    async fn handle_append(&self, file: String, body: &[u8]) -> Reply {
        if self.alive_nodes().await.is_empty() {
            return Reply::Error(DfsError::NoAliveNodes);
        }
        let entries = {
            let st = self.state.read().await;
            st.files.get(&file).cloned()
        };
        let Some(entries) = entries else {
            return match self.store_file(&file, body).await {
                Ok((chunks, _)) => {
                    self.persist_logged().await;
                    Reply::Success(format!("Created {file} with {chunks} chunks"))
                }
                Err(e) => Reply::Error(e),
            };
        };

        let mut content = Vec::new();
        for entry in &entries {
            match self.fetch_chunk(&file, entry.cid, &entry.replicas).await {
                Some(chunk) => content.extend_from_slice(&chunk),
                None => return Reply::Error(DfsError::AppendDegraded(entry.cid)),
            }
        }
        content.extend_from_slice(body);

        self.delete_replicas(&file).await;
        match self.store_file(&file, &content).await {
            Ok(_) => {
                self.persist_logged().await;
                Reply::Success(format!("Appended {} bytes", body.len()))
            }
            Err(e) => Reply::Error(e),
        }
    }

    /// Read the whole file by replica fallback. Unreadable chunks become
    /// trailing `WARNING:` lines; readable chunks are concatenated in
    /// chunk-id order.
    async fn handle_read(&self, file: &str) -> Reply {
        let entries = {
            let st = self.state.read().await;
            st.files.get(file).cloned()
        };
        let Some(entries) = entries else {
            return Reply::Error(DfsError::NotFound);
        };
        let mut data = Vec::new();
        let mut warnings = Vec::new();
        for entry in &entries {
            match self.fetch_chunk(file, entry.cid, &entry.replicas).await {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => warnings.push(format!("Chunk {} unavailable (node failure)", entry.cid)),
            }
        }
        Reply::Body { data: data.into(), warnings }
    }

    /// Delete the file: per-replica chunk deletes, then a `delete_file`
    /// broadcast to every known node to purge strays. Never errors.
    async fn handle_delete(&self, file: &str) -> Reply {
        let entries = {
            let mut st = self.state.write().await;
            st.files.remove(file)
        };
        match entries {
            Some(entries) => {
                for entry in &entries {
                    for &node_id in &entry.replicas {
                        let cmd = NodeCommand::Delete { file: file.to_string(), cid: entry.cid };
                        let _ = self.node_request(node_id, &cmd).await;
                    }
                }
                self.purge_everywhere(file).await;
                self.persist_logged().await;
                Reply::Success("Deleted".to_string())
            }
            None => {
                self.purge_everywhere(file).await;
                Reply::Success("Deleted (metadata missing; purged replicas)".to_string())
            }
        }
    }

    async fn handle_list(&self) -> Reply {
        let mut names: Vec<String> = {
            let st = self.state.read().await;
            st.files.keys().cloned().collect()
        };
        names.sort_unstable();
        Reply::Json(json!(names))
    }

    async fn handle_metadata(&self, file: &str) -> Reply {
        let st = self.state.read().await;
        let Some(entries) = st.files.get(file) else {
            return Reply::Error(DfsError::NotFound);
        };
        let replicas: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "chunk_id": entry.cid,
                    "replica_nodes": entry.replicas,
                    "replica_count": entry.replicas.len(),
                })
            })
            .collect();
        Reply::Json(json!({
            "filename": file,
            "chunks": entries.len(),
            "replicas": replicas,
        }))
    }

    async fn handle_system_info(&self) -> Reply {
        let st = self.state.read().await;
        let mut nodes = serde_json::Map::new();
        let mut alive = 0;
        for (id, rec) in &st.nodes {
            if rec.alive {
                alive += 1;
            }
            nodes.insert(
                id.to_string(),
                json!({
                    "status": if rec.alive { "alive" } else { "dead" },
                    "last_heartbeat": rec.last_heartbeat,
                    "port": rec.port,
                }),
            );
        }
        Reply::Json(json!({
            "data_nodes": nodes,
            "total_files": st.files.len(),
            "alive_nodes": alive,
        }))
    }

    /// Accept loop: one short-lived task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let svc = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = svc.handle_connection(stream).await {
                            debug!("connection from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => error!("accept failed: {e}"),
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        let mut frame = Vec::new();
        stream.read_to_end(&mut frame).await?;
        if frame.is_empty() {
            // peer connected and went away
            return Ok(());
        }
        let reply = match Command::parse(&frame) {
            Ok(cmd) => self.handle(cmd).await,
            Err(ParseError::Silent) => return Ok(()),
            Err(ParseError::Invalid) => Reply::Error(DfsError::InvalidRequest),
        };
        stream.write_all(&reply.encode()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommonConfig, MasterConfig};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn service() -> MasterService {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let config = MasterConfig {
            metadata_path: std::env::temp_dir()
                .join(format!("minidfs-impl-{}-{id}.json", std::process::id()))
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        };
        MasterService::new(config, CommonConfig::default())
    }

    #[tokio::test]
    async fn create_without_nodes_is_refused_and_leaves_no_entry() {
        let svc = service();
        let reply = svc
            .handle(Command::Create { file: "y".into(), body: Bytes::from_static(b"z") })
            .await;
        assert_eq!(reply, Reply::Error(DfsError::NoAliveNodes));
        assert_eq!(svc.handle(Command::List).await, Reply::Json(serde_json::json!([])));
    }

    #[tokio::test]
    async fn read_of_missing_file_is_not_found() {
        let svc = service();
        assert_eq!(
            svc.handle(Command::Read { file: "nope".into() }).await,
            Reply::Error(DfsError::NotFound)
        );
        assert_eq!(
            svc.handle(Command::Metadata { file: "nope".into() }).await,
            Reply::Error(DfsError::NotFound)
        );
    }

    #[tokio::test]
    async fn heartbeat_registers_node_in_system_info() {
        let svc = service();
        assert_eq!(svc.handle(Command::Heartbeat { node_id: 1 }).await, Reply::Ok);

        let Reply::Json(info) = svc.handle(Command::SystemInfo).await else {
            panic!("system_info should reply JSON");
        };
        assert_eq!(info["alive_nodes"], 1);
        assert_eq!(info["total_files"], 0);
        assert_eq!(info["data_nodes"]["1"]["status"], "alive");
        assert_eq!(info["data_nodes"]["1"]["port"], 5001);
    }

    #[tokio::test]
    async fn delete_of_missing_file_still_succeeds() {
        let svc = service();
        assert_eq!(
            svc.handle(Command::Delete { file: "ghost".into() }).await,
            Reply::Success("Deleted (metadata missing; purged replicas)".into())
        );
    }
}
