//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};

/// Commands sent by a debug client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Health check
    Ping,
    /// Pool, tree and streaming counters from the latest tick
    GetStats,
    /// Every resident chunk (optionally only the dirty ones)
    ListChunks {
        #[serde(default)]
        dirty_only: bool,
    },
    /// Counters for the resident chunk at `(position, scale)`
    GetChunkInfo { x: i32, y: i32, z: i32, scale: u8 },
}

/// Responses from debug server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    Stats {
        tick: u64,
        pool: PoolSnapshot,
        tree: TreeSnapshot,
        streaming: StreamingSnapshot,
    },
    Chunks { chunks: Vec<ChunkSnapshot> },
    ChunkInfo { chunk: Option<ChunkSnapshot> },
}

/// Everything the engine publishes in one tick. Values only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub tick: u64,
    pub pool: PoolSnapshot,
    pub tree: TreeSnapshot,
    pub streaming: StreamingSnapshot,
    pub chunks: Vec<ChunkSnapshot>,
}

/// Chunk pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub capacity: u32,
    pub live: u32,
    pub committed_header_pages: u32,
    pub committed_node_pages: u64,
}

/// Shape of the two-level octree
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root_position: [i32; 3],
    pub root_scale: u8,
    pub resident_chunks: u32,
    pub root_nodes: u32,
    pub total_nodes: u64,
    pub dead_nodes: u64,
}

/// Streaming queue depths and lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingSnapshot {
    pub in_flight: u32,
    pub pending_creates: u32,
    pub pending_splits: u32,
    pub pending_merges: u32,
    pub submitted: u64,
    pub finalized: u64,
    pub discarded: u64,
    pub creates: u64,
    pub splits: u64,
    pub merges: u64,
    pub avg_job_ms: f32,
}

/// Per-chunk node storage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub position: [i32; 3],
    pub scale: u8,
    pub node_count: u32,
    pub committed_nodes: u32,
    pub dead_nodes: u32,
    pub spilled: bool,
    pub dirty: bool,
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: DebugCommand =
            serde_json::from_str(r#"{"cmd":"GetChunkInfo","params":{"x":0,"y":32,"z":-32,"scale":5}}"#)
                .unwrap();
        assert_eq!(
            cmd,
            DebugCommand::GetChunkInfo { x: 0, y: 32, z: -32, scale: 5 }
        );

        let cmd: DebugCommand = serde_json::from_str(r#"{"cmd":"ListChunks","params":{}}"#).unwrap();
        assert_eq!(cmd, DebugCommand::ListChunks { dirty_only: false });

        let cmd: DebugCommand = serde_json::from_str(r#"{"cmd":"Ping"}"#).unwrap();
        assert_eq!(cmd, DebugCommand::Ping);
    }

    #[test]
    fn test_response_tagging() {
        let json = serde_json::to_value(DebugResponse::pong()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["message"], "pong");

        let json = serde_json::to_value(DebugResponse::error("nope")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "nope");
    }
}
