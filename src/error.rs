use thiserror::Error;

/// Errors the master surfaces to clients. `Display` is the exact message
/// that follows the `ERROR: ` prefix on the wire, so these variants are
/// part of the protocol.
///
/// Transport failures against data nodes are not represented here: they
/// are swallowed at the call site, flip the node's alive flag, and show up
/// downstream as `NotFound` or a `WARNING:` line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DfsError {
    #[error("File not found")]
    NotFound,

    /// Zero alive data nodes at placement time.
    #[error("No alive data nodes")]
    NoAliveNodes,

    /// A chunk received zero replica acks; metadata keeps the chunks
    /// placed before the failing one.
    #[error("Write failed")]
    WriteFailed,

    /// Append refused because a chunk of the current content could not be
    /// read from any replica. Rewriting around the hole would corrupt the
    /// file.
    #[error("Append failed (chunk {0} unavailable)")]
    AppendDegraded(u64),

    #[error("Invalid request")]
    InvalidRequest,
}
