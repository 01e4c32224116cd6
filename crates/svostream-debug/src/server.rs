//! TCP debug server

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::protocol::{DebugCommand, DebugResponse, DiagnosticsSnapshot, ResponseData};

/// Trait that the application implements to answer debug commands
pub trait DebugHandler: Send + Sync + 'static {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse;
}

/// Handler that answers every command from the last published snapshot.
///
/// The engine thread calls [`SnapshotHandler::publish`]; the server never
/// sees live engine state.
#[derive(Debug, Default)]
pub struct SnapshotHandler {
    latest: Option<DiagnosticsSnapshot>,
}

impl SnapshotHandler {
    /// Replace the published snapshot
    pub fn publish(&mut self, snapshot: DiagnosticsSnapshot) {
        self.latest = Some(snapshot);
    }

    /// Last published snapshot, if any
    pub fn latest(&self) -> Option<&DiagnosticsSnapshot> {
        self.latest.as_ref()
    }
}

impl DebugHandler for SnapshotHandler {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
        if cmd == DebugCommand::Ping {
            return DebugResponse::pong();
        }
        let Some(snapshot) = &self.latest else {
            return DebugResponse::error("No diagnostics published yet");
        };

        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),
            DebugCommand::GetStats => DebugResponse::ok(ResponseData::Stats {
                tick: snapshot.tick,
                pool: snapshot.pool,
                tree: snapshot.tree,
                streaming: snapshot.streaming,
            }),
            DebugCommand::ListChunks { dirty_only } => DebugResponse::ok(ResponseData::Chunks {
                chunks: snapshot
                    .chunks
                    .iter()
                    .filter(|c| !dirty_only || c.dirty)
                    .copied()
                    .collect(),
            }),
            DebugCommand::GetChunkInfo { x, y, z, scale } => {
                let chunk = snapshot
                    .chunks
                    .iter()
                    .find(|c| c.position == [x, y, z] && c.scale == scale)
                    .copied();
                DebugResponse::ok(ResponseData::ChunkInfo { chunk })
            }
        }
    }
}

/// Debug server handle - keep this alive to keep the server running
pub struct DebugServer {
    local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl DebugServer {
    /// Bind on `127.0.0.1:port` (0 picks a free port) and serve in the background.
    /// Must be called from within a tokio runtime.
    pub async fn bind(handler: Arc<Mutex<dyn DebugHandler>>, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Debug server listening on {}", local_addr);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::info!("Debug client connected from {}", peer);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, handler).await;
                            log::info!("Debug client disconnected: {}", peer);
                        });
                    }
                    Err(e) => {
                        log::error!("Debug server accept error: {}", e);
                    }
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<Mutex<dyn DebugHandler>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<DebugCommand>(trimmed) {
                    Ok(cmd) => {
                        log::debug!("Debug command: {:?}", cmd);
                        let mut h = handler.lock().await;
                        h.handle_command(cmd)
                    }
                    Err(e) => DebugResponse::error(format!("Invalid command JSON: {}", e)),
                };

                let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|e| {
                    format!(
                        "{{\"status\":\"error\",\"message\":\"Serialize error: {}\"}}",
                        e
                    )
                });
                resp_json.push('\n');

                if let Err(e) = writer.write_all(resp_json.as_bytes()).await {
                    log::error!("Debug server write error: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    log::error!("Debug server flush error: {}", e);
                    break;
                }
            }
            Err(e) => {
                log::error!("Debug server read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkSnapshot, PoolSnapshot};

    fn snapshot() -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            tick: 7,
            pool: PoolSnapshot {
                capacity: 64,
                live: 3,
                committed_header_pages: 1,
                committed_node_pages: 2,
            },
            chunks: vec![
                ChunkSnapshot {
                    position: [0, 0, 0],
                    scale: 6,
                    node_count: 12,
                    dirty: true,
                    ..Default::default()
                },
                ChunkSnapshot {
                    position: [64, 0, 0],
                    scale: 6,
                    node_count: 1,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_handler_before_publish() {
        let mut handler = SnapshotHandler::default();
        assert!(matches!(handler.handle_command(DebugCommand::Ping), DebugResponse::Ok { .. }));
        assert!(matches!(
            handler.handle_command(DebugCommand::GetStats),
            DebugResponse::Error { .. }
        ));
    }

    #[test]
    fn test_handler_queries() {
        let mut handler = SnapshotHandler::default();
        handler.publish(snapshot());

        match handler.handle_command(DebugCommand::ListChunks { dirty_only: true }) {
            DebugResponse::Ok { data: ResponseData::Chunks { chunks } } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].node_count, 12);
            }
            other => panic!("unexpected response {:?}", other),
        }

        match handler.handle_command(DebugCommand::GetChunkInfo { x: 64, y: 0, z: 0, scale: 6 }) {
            DebugResponse::Ok { data: ResponseData::ChunkInfo { chunk } } => {
                assert_eq!(chunk.map(|c| c.node_count), Some(1));
            }
            other => panic!("unexpected response {:?}", other),
        }

        match handler.handle_command(DebugCommand::GetStats) {
            DebugResponse::Ok { data: ResponseData::Stats { tick, pool, .. } } => {
                assert_eq!(tick, 7);
                assert_eq!(pool.live, 3);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let handler: Arc<Mutex<dyn DebugHandler>> = Arc::new(Mutex::new(SnapshotHandler::default()));
        let server = DebugServer::bind(handler, 0).await.unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"cmd\":\"Ping\"}\n").await.unwrap();

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["message"], "pong");
    }
}
