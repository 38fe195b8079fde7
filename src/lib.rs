//! minidfs — a miniature distributed file store.
//!
//! A single master owns the file → chunk → replica namespace and proxies
//! all chunk I/O; data nodes store replicated chunk bodies on local disk
//! and heartbeat back to the master. Everything speaks the colon-framed
//! command grammar in [`protocol`], one command per short-lived TCP
//! connection.

pub mod config;
pub mod datanode_impl;
pub mod datanode_service;
pub mod error;
pub mod logging;
pub mod master_impl;
pub mod master_service;
pub mod protocol;
pub mod util;
