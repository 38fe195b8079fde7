//! Request handling for a data node: parse one node frame per
//! connection, run it against the chunk store, reply.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::datanode_service::DataNodeService;
use crate::protocol::{NodeCommand, Reply};

impl DataNodeService {
    /// Dispatch one node command. `None` closes the connection without a
    /// reply, which the master counts as a failed call.
    pub async fn handle(&self, cmd: NodeCommand) -> Option<Reply> {
        match cmd {
            NodeCommand::Write { file, cid, body } => {
                match self.save_chunk(&file, cid, body).await {
                    Ok(()) => Some(Reply::Ok),
                    Err(e) => {
                        error!("write of {file}:{cid} failed: {e}");
                        None
                    }
                }
            }
            NodeCommand::Read { file, cid } => Some(Reply::Body {
                data: self.load_chunk(&file, cid).await,
                warnings: Vec::new(),
            }),
            NodeCommand::Delete { file, cid } => {
                self.remove_chunk(&file, cid).await;
                Some(Reply::Ok)
            }
            NodeCommand::DeleteFile { file } => {
                Some(Reply::OkCount(self.purge_file(&file).await))
            }
        }
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
            return Ok(());
        }
        let reply = match NodeCommand::parse(&frame) {
            Ok(cmd) => self.handle(cmd).await,
            Err(_) => {
                debug!("dropping malformed node frame ({} bytes)", frame.len());
                None
            }
        };
        if let Some(reply) = reply {
            stream.write_all(&reply.encode()).await?;
        }
        stream.shutdown().await?;
        Ok(())
    }
}
