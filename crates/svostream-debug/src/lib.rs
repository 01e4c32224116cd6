//! Debug tools for svostream - TCP server exposing read-only engine diagnostics
//!
//! The engine publishes a [`DiagnosticsSnapshot`] once per tick; clients query
//! it with newline-delimited JSON commands:
//! ```ignore
//! let handler = Arc::new(Mutex::new(SnapshotHandler::default()));
//! let server = DebugServer::bind(handler.clone(), DEFAULT_PORT).await?;
//! handler.lock().await.publish(snapshot);
//! ```

pub mod protocol;
pub mod server;

pub use protocol::*;
pub use server::{DebugHandler, DebugServer, SnapshotHandler};

/// Default debug server port
pub const DEFAULT_PORT: u16 = 9743;
