//! Streaming configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::memory::pool::PoolLimits;
use crate::streaming::lod::LodConfig;
use crate::voxel::svo::{MAX_DEPTH, NULL_CHUNK};

/// Configuration for the octree and the streaming pipeline.
///
/// Every field has a default, so a JSON file only needs to list overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Root footprint side is `2^root_scale` world units.
    pub root_scale: u8,
    /// Leaf chunks hold `2^chunk_depth` voxels per side at every LOD.
    pub chunk_depth: u8,
    /// Finest chunk scale (full resolution when equal to `chunk_depth`).
    pub min_chunk_scale: u8,
    /// Scale of freshly created top-level chunks.
    pub max_chunk_scale: u8,
    /// Distance to LOD mapping.
    pub lod: LodConfig,
    /// Top-level cells closer than this (to their centre) get created.
    pub load_radius: f64,
    /// Extra distance past the quarter-root threshold before the root moves.
    pub root_hysteresis: f64,
    /// Operations submitted per tick (a split counts once).
    pub ops_per_tick: usize,
    /// Completed jobs finalized per tick.
    pub finalize_per_tick: usize,
    /// Upper bound on jobs queued or running on workers.
    pub max_in_flight: usize,
    /// Worker count; `None` uses logical cores minus one.
    pub worker_threads: Option<usize>,
    /// Seed handed to the generator.
    pub seed: u32,
    /// Chunk slots reserved by the pool (root included).
    pub max_chunks: u32,
    /// Node capacity reserved per chunk.
    pub max_nodes_per_chunk: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            root_scale: 12,
            chunk_depth: 5,
            min_chunk_scale: 5,
            max_chunk_scale: 9,
            lod: LodConfig::default(),
            load_radius: 1500.0,
            root_hysteresis: 64.0,
            ops_per_tick: 16,
            finalize_per_tick: 32,
            max_in_flight: 64,
            worker_threads: None,
            seed: 12345,
            max_chunks: 8192,
            max_nodes_per_chunk: 65536,
        }
    }
}

impl StreamingConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check the scale hierarchy and pool limits.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.chunk_depth == 0 || self.chunk_depth as usize > MAX_DEPTH {
            return fail(format!("chunk_depth must be in 1..={}", MAX_DEPTH));
        }
        if self.min_chunk_scale < self.chunk_depth {
            return fail("min_chunk_scale must be >= chunk_depth".into());
        }
        if self.min_chunk_scale > self.max_chunk_scale {
            return fail("min_chunk_scale must be <= max_chunk_scale".into());
        }
        if self.max_chunk_scale >= self.root_scale {
            return fail("max_chunk_scale must be < root_scale".into());
        }
        if self.root_scale > 30 {
            return fail("root_scale must be <= 30".into());
        }
        if (self.root_scale - self.min_chunk_scale) as usize > MAX_DEPTH {
            return fail(format!(
                "root_scale - min_chunk_scale must be <= {}",
                MAX_DEPTH
            ));
        }
        if self.max_chunks < 2 || self.max_chunks > NULL_CHUNK as u32 {
            return fail(format!("max_chunks must be in 2..={}", NULL_CHUNK));
        }
        if self.max_nodes_per_chunk < 8 || self.max_nodes_per_chunk > 1 << 16 {
            return fail("max_nodes_per_chunk must be in 8..=65536".into());
        }
        if !(self.root_hysteresis >= 0.0) {
            return fail("root_hysteresis must be non-negative".into());
        }
        if !(self.lod.unit > 0.0) {
            return fail("lod.unit must be positive".into());
        }
        if self.ops_per_tick == 0 || self.finalize_per_tick == 0 || self.max_in_flight == 0 {
            return fail("per-tick budgets must be non-zero".into());
        }
        if self.worker_threads == Some(0) {
            return fail("worker_threads must be non-zero".into());
        }
        Ok(())
    }

    /// Pool limits derived from this configuration.
    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_chunks: self.max_chunks,
            max_nodes: self.max_nodes_per_chunk,
        }
    }

    /// Worker count after applying the default.
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        StreamingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_scales() {
        let config = StreamingConfig {
            max_chunk_scale: 12,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = StreamingConfig {
            min_chunk_scale: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamingConfig {
            max_chunks: 70_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StreamingConfig =
            serde_json::from_str(r#"{ "root_scale": 10, "max_chunk_scale": 8 }"#).unwrap();
        assert_eq!(config.root_scale, 10);
        assert_eq!(config.max_chunk_scale, 8);
        assert_eq!(config.chunk_depth, StreamingConfig::default().chunk_depth);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("streaming.json");

        let config = StreamingConfig {
            seed: 99,
            worker_threads: Some(2),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = StreamingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "chunk_depth": 0 }"#).unwrap();
        assert!(matches!(StreamingConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(StreamingConfig::load(&path), Err(Error::Json(_))));
    }
}
