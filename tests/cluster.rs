//! End-to-end scenarios: an in-process master plus real data node
//! services wired together over loopback TCP, driven through the framed
//! wire protocol exactly as an external client would.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use minidfs::config::{CommonConfig, DataNodeConfig, MasterConfig};
use minidfs::datanode_service::DataNodeService;
use minidfs::master_service::{load_metadata, MasterService};
use minidfs::util;

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let id = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("minidfs-cluster-{}-{id}", std::process::id()))
}

struct Cluster {
    master: Arc<MasterService>,
    master_addr: String,
    nodes: Vec<Arc<DataNodeService>>,
    root: PathBuf,
}

impl Cluster {
    fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    fn node_dir(&self, idx: usize) -> PathBuf {
        self.nodes[idx].data_dir().to_path_buf()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Bind listeners for the given node ids on a contiguous port range so
/// that `base + id` addressing holds, retrying on collisions.
async fn alloc_node_listeners(ids: &[u32]) -> (u16, Vec<TcpListener>) {
    if ids.is_empty() {
        return (5000, Vec::new());
    }
    'attempt: for _ in 0..32 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_port = probe.local_addr().unwrap().port();
        let base = first_port - ids[0] as u16;
        let mut listeners = vec![probe];
        for id in &ids[1..] {
            match TcpListener::bind(("127.0.0.1", base + *id as u16)).await {
                Ok(listener) => listeners.push(listener),
                Err(_) => continue 'attempt,
            }
        }
        return (base, listeners);
    }
    panic!("could not allocate a contiguous port range for test data nodes");
}

/// Start a master and one data node service per id, then register every
/// node with a direct heartbeat frame.
async fn start_cluster(node_ids: &[u32]) -> Cluster {
    let (base, listeners) = alloc_node_listeners(node_ids).await;
    let root = temp_root();
    std::fs::create_dir_all(&root).unwrap();

    let common = CommonConfig {
        node_base_port: base,
        request_timeout: 2,
        ..Default::default()
    };
    let master_config = MasterConfig {
        metadata_path: root.join("metadata.json").to_string_lossy().into_owned(),
        ..Default::default()
    };

    let master_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master_listener.local_addr().unwrap().to_string();
    let master = Arc::new(MasterService::new(master_config, common.clone()));
    tokio::spawn(Arc::clone(&master).serve(master_listener));

    let node_config = DataNodeConfig {
        data_root: root.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut nodes = Vec::new();
    for (id, listener) in node_ids.iter().zip(listeners) {
        let node = Arc::new(DataNodeService::new(*id, &node_config, common.clone()).unwrap());
        tokio::spawn(Arc::clone(&node).serve(listener));
        nodes.push(node);
    }

    let cluster = Cluster { master, master_addr, nodes, root };
    for id in node_ids {
        assert_eq!(cluster.send(&format!("heartbeat:{id}")).await, "OK");
    }
    cluster
}

impl Cluster {
    async fn send(&self, frame: &str) -> String {
        String::from_utf8_lossy(&self.send_raw(frame.as_bytes()).await).into_owned()
    }

    async fn send_raw(&self, frame: &[u8]) -> Vec<u8> {
        util::exchange(&self.master_addr, frame, Duration::from_secs(10))
            .await
            .expect("master reachable")
    }
}

#[tokio::test]
async fn create_read_metadata_round_trip() {
    let cluster = start_cluster(&[1, 2]).await;

    let reply = cluster.send("create:hello:hi").await;
    assert_eq!(reply, "SUCCESS: Created hello with 1 chunks (RF=2)");

    assert_eq!(cluster.send("read:hello:").await, "hi");

    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:hello:").await).unwrap();
    assert_eq!(meta["filename"], "hello");
    assert_eq!(meta["chunks"], 1);
    assert_eq!(meta["replicas"][0]["chunk_id"], 0);
    assert_eq!(meta["replicas"][0]["replica_nodes"], serde_json::json!([1, 2]));
    assert_eq!(meta["replicas"][0]["replica_count"], 2);
}

#[tokio::test]
async fn large_body_chunks_and_reads_back_exactly() {
    let cluster = start_cluster(&[1, 2]).await;

    let body = "a".repeat(2050);
    let reply = cluster.send(&format!("create:big:{body}")).await;
    assert_eq!(reply, "SUCCESS: Created big with 3 chunks (RF=2)");

    let read = cluster.send_raw(b"read:big:").await;
    assert_eq!(read.len(), 2050);
    assert_eq!(String::from_utf8_lossy(&read), body);

    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:big:").await).unwrap();
    assert_eq!(meta["chunks"], 3);
}

#[tokio::test]
async fn body_may_contain_colons() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:cfg:key:value:other").await;
    assert_eq!(cluster.send("read:cfg:").await, "key:value:other");
}

#[tokio::test]
async fn append_extends_existing_file() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:x:abc").await;
    assert_eq!(cluster.send("append:x:def").await, "SUCCESS: Appended 3 bytes");
    assert_eq!(cluster.send("read:x:").await, "abcdef");
}

#[tokio::test]
async fn append_to_missing_file_creates_it() {
    let cluster = start_cluster(&[1, 2]).await;

    assert_eq!(
        cluster.send("append:fresh:data").await,
        "SUCCESS: Created fresh with 1 chunks"
    );
    assert_eq!(cluster.send("read:fresh:").await, "data");
}

#[tokio::test]
async fn write_replaces_content() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:x:abc").await;
    assert_eq!(
        cluster.send("write:x:longer").await,
        "SUCCESS: Replaced file with 6 bytes"
    );
    assert_eq!(cluster.send("read:x:").await, "longer");
}

#[tokio::test]
async fn no_alive_nodes_refuses_writes_and_keeps_namespace_empty() {
    let cluster = start_cluster(&[]).await;

    assert_eq!(cluster.send("create:y:z").await, "ERROR: No alive data nodes");
    assert_eq!(cluster.send("list::").await, "[]");
}

#[tokio::test]
async fn delete_purges_metadata_disk_and_snapshot() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:z:hello").await;
    assert_eq!(cluster.send("delete:z:").await, "SUCCESS: Deleted");
    assert_eq!(cluster.send("read:z:").await, "ERROR: File not found");

    for idx in 0..2 {
        let leftover: Vec<_> = std::fs::read_dir(cluster.node_dir(idx))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("z:"))
            .collect();
        assert!(leftover.is_empty(), "node {idx} still holds chunks of z");
    }

    let snapshot = load_metadata(&cluster.metadata_path());
    assert!(!snapshot.contains_key("z"));

    // deleting again still succeeds, via the purge-only path
    assert_eq!(
        cluster.send("delete:z:").await,
        "SUCCESS: Deleted (metadata missing; purged replicas)"
    );
}

#[tokio::test]
async fn healing_restores_replication_after_node_death() {
    let cluster = start_cluster(&[1, 2, 3]).await;

    cluster.send("create:x:abc").await;
    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:x:").await).unwrap();
    assert_eq!(meta["replicas"][0]["replica_nodes"], serde_json::json!([1, 2]));

    // node 2 stops heartbeating and is declared dead
    {
        let mut st = cluster.master.state.write().await;
        st.nodes.get_mut(&2).unwrap().alive = false;
    }
    assert!(cluster.master.heal_all().await);

    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:x:").await).unwrap();
    assert_eq!(meta["replicas"][0]["replica_nodes"], serde_json::json!([1, 3]));
    assert_eq!(meta["replicas"][0]["replica_count"], 2);

    assert_eq!(cluster.send("read:x:").await, "abc");
}

#[tokio::test]
async fn healer_trims_over_replicated_chunks() {
    let cluster = start_cluster(&[1, 2, 3]).await;

    cluster.send("create:x:abc").await;
    {
        let mut st = cluster.master.state.write().await;
        st.files.get_mut("x").unwrap()[0].replicas = vec![1, 2, 3];
    }
    assert!(cluster.master.heal_all().await);

    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:x:").await).unwrap();
    assert_eq!(meta["replicas"][0]["replica_nodes"], serde_json::json!([1, 2]));
}

#[tokio::test]
async fn read_warns_per_unavailable_chunk() {
    let cluster = start_cluster(&[1]).await;

    cluster.send("create:w:data").await;
    {
        let mut st = cluster.master.state.write().await;
        st.nodes.get_mut(&1).unwrap().alive = false;
    }

    assert_eq!(
        cluster.send("read:w:").await,
        "WARNING: Chunk 0 unavailable (node failure)\n"
    );
}

#[tokio::test]
async fn degraded_append_is_refused() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:x:abc").await;
    // node 2 is gone, and node 1's copy of the chunk is lost
    cluster.nodes[0].purge_file("x").await;
    {
        let mut st = cluster.master.state.write().await;
        st.nodes.get_mut(&2).unwrap().alive = false;
        st.files.get_mut("x").unwrap()[0].replicas = vec![1];
    }

    assert_eq!(
        cluster.send("append:x:def").await,
        "ERROR: Append failed (chunk 0 unavailable)"
    );
    // the existing entry is untouched
    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:x:").await).unwrap();
    assert_eq!(meta["chunks"], 1);
}

#[tokio::test]
async fn placement_uses_all_nodes_when_rf_exceeds_pool() {
    let cluster = start_cluster(&[1]).await;

    assert_eq!(
        cluster.send("create:solo:hi").await,
        "SUCCESS: Created solo with 1 chunks (RF=1)"
    );
    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:solo:").await).unwrap();
    assert_eq!(meta["replicas"][0]["replica_nodes"], serde_json::json!([1]));
}

#[tokio::test]
async fn empty_body_creates_file_with_zero_chunks() {
    let cluster = start_cluster(&[1, 2]).await;

    assert_eq!(
        cluster.send("create:void:").await,
        "SUCCESS: Created void with 0 chunks (RF=0)"
    );
    assert_eq!(cluster.send("read:void:").await, "");
    assert_eq!(cluster.send("list::").await, r#"["void"]"#);

    let meta: serde_json::Value =
        serde_json::from_str(&cluster.send("metadata:void:").await).unwrap();
    assert_eq!(meta["chunks"], 0);
}

#[tokio::test]
async fn invalid_and_unknown_requests_error() {
    let cluster = start_cluster(&[]).await;

    assert_eq!(cluster.send("garbage").await, "ERROR: Invalid request");
    assert_eq!(cluster.send("chmod:f:755").await, "ERROR: Invalid request");
}

#[tokio::test]
async fn system_info_tracks_nodes_and_files() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:f:data").await;
    let info: serde_json::Value =
        serde_json::from_str(&cluster.send("system_info::").await).unwrap();
    assert_eq!(info["alive_nodes"], 2);
    assert_eq!(info["total_files"], 1);
    assert_eq!(info["data_nodes"]["1"]["status"], "alive");
    assert!(info["data_nodes"]["1"]["last_heartbeat"].as_f64().unwrap() > 0.0);

    cluster.master.mark_dead(2).await;
    let info: serde_json::Value =
        serde_json::from_str(&cluster.send("system_info::").await).unwrap();
    assert_eq!(info["alive_nodes"], 1);
    assert_eq!(info["data_nodes"]["2"]["status"], "dead");
}

#[tokio::test]
async fn metadata_snapshot_survives_restart() {
    let cluster = start_cluster(&[1, 2]).await;

    cluster.send("create:keep:me").await;

    // a fresh master over the same metadata path sees the namespace
    let master_config = MasterConfig {
        metadata_path: cluster.metadata_path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    let reborn = MasterService::new(master_config, CommonConfig::default());
    let st = reborn.state.read().await;
    assert!(st.files.contains_key("keep"));
    assert_eq!(st.files["keep"][0].replicas, vec![1, 2]);
}
