//! svostream - sparse voxel octree storage with LOD streaming
//!
//! A two-level octree (a root chunk indexing resident leaf chunks) backed by
//! a reserved-address-space chunk pool, kept populated around a moving
//! viewer by a worker-pool streaming pipeline.

pub mod core;
pub mod memory;
pub mod voxel;
pub mod generation;
pub mod streaming;
pub mod debug;
