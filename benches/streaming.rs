use criterion::{Criterion, black_box, criterion_group, criterion_main};

use glam::IVec3;

use svostream::core::config::StreamingConfig;
use svostream::generation::{TerrainGenerator, TerrainParams, VoxelGenerator};
use svostream::memory::pool::{ChunkPool, PoolLimits};
use svostream::voxel::svo::builder::create_test_sphere;
use svostream::voxel::svo::{ChunkKey, ChunkSpec, Svo, bulk_build};
use svostream::voxel::voxel::materials;

fn pool() -> ChunkPool {
    ChunkPool::new(PoolLimits {
        max_chunks: 4,
        max_nodes: 65536,
    })
    .unwrap()
}

fn bench_bulk_build_sphere(c: &mut Criterion) {
    let mut pool = pool();
    let key = ChunkKey::new(IVec3::ZERO, 5);
    let voxels = create_test_sphere(32, 14.0, materials::STONE);
    let mut chunk = pool.alloc_chunk(ChunkSpec::leaf(key, 5), 0);

    c.bench_function("bulk_build_sphere_32", |b| {
        b.iter(|| bulk_build(black_box(&mut chunk), black_box(&voxels)));
    });
    pool.free_chunk(chunk);
}

fn bench_bulk_build_terrain(c: &mut Criterion) {
    let mut pool = pool();
    let generator = TerrainGenerator::new(TerrainParams::default(), 12345);
    let key = ChunkKey::new(IVec3::new(0, 0, 0), 5);
    let voxels = generator.generate(key, 5, 12345);
    let mut chunk = pool.alloc_chunk(ChunkSpec::leaf(key, 5), 0);

    c.bench_function("bulk_build_terrain_32", |b| {
        b.iter(|| bulk_build(black_box(&mut chunk), black_box(&voxels)));
    });
    pool.free_chunk(chunk);
}

fn bench_terrain_generate(c: &mut Criterion) {
    let generator = TerrainGenerator::new(TerrainParams::default(), 12345);
    let key = ChunkKey::new(IVec3::new(0, 0, 0), 5);

    c.bench_function("terrain_generate_32", |b| {
        b.iter(|| generator.generate(black_box(key), 5, 12345));
    });
}

fn bench_chunk_write(c: &mut Criterion) {
    let mut pool = pool();
    let key = ChunkKey::new(IVec3::ZERO, 5);
    let mut chunk = pool.alloc_chunk(ChunkSpec::leaf(key, 5), 0);

    c.bench_function("chunk_write_4096", |b| {
        b.iter(|| {
            chunk.reset(0);
            for i in 0..4096i32 {
                let pos = IVec3::new(i & 31, (i >> 5) & 31, (i * 7) & 31);
                chunk.write(pos, 0, black_box((i & 3) as u16 + 1));
            }
        });
    });
    pool.free_chunk(chunk);
}

fn bench_svo_read(c: &mut Criterion) {
    let config = StreamingConfig {
        root_scale: 9,
        chunk_depth: 5,
        min_chunk_scale: 5,
        max_chunk_scale: 7,
        max_chunks: 64,
        max_nodes_per_chunk: 65536,
        ..Default::default()
    };
    let mut svo = Svo::new(&config).unwrap();
    let voxels = create_test_sphere(32, 14.0, materials::STONE);
    for octant in 0..8u8 {
        let key = ChunkKey::new(IVec3::ZERO, 6).child(octant);
        let mut chunk = svo.alloc_leaf(key);
        bulk_build(&mut chunk, &voxels);
        svo.insert_chunk(chunk);
    }

    c.bench_function("svo_read_4096", |b| {
        b.iter(|| {
            let mut solid = 0u32;
            for i in 0..4096i32 {
                let pos = IVec3::new(i & 63, (i >> 6) & 63, (i * 13) & 63);
                if !svo.read(black_box(pos)).is_empty() {
                    solid += 1;
                }
            }
            solid
        });
    });
}

criterion_group!(
    benches,
    bench_bulk_build_sphere,
    bench_bulk_build_terrain,
    bench_terrain_generate,
    bench_chunk_write,
    bench_svo_read,
);
criterion_main!(benches);
