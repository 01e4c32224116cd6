//! Streaming demo: flies a viewer over procedural terrain and streams the
//! octree around it.
//!
//! Usage: cargo run --release --bin stream_demo -- [OPTIONS]
//!
//! Options:
//!   --ticks <N>         Ticks to run (default: 600)
//!   --seed <SEED>       Terrain seed (default: from config)
//!   --speed <UNITS>     Viewer movement per tick along +x (default: 4.0)
//!   --tick-ms <MS>      Sleep between ticks (default: 16)
//!   --config <PATH>     Streaming config JSON (default: built-in defaults)
//!   --debug-port <PORT> Serve diagnostics on this TCP port

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::DVec3;

use svostream::core::config::StreamingConfig;
use svostream::core::logging;
use svostream::debug::{DebugPublisher, snapshot};
use svostream::generation::{TerrainGenerator, TerrainParams};
use svostream::streaming::StreamingPipeline;
use svostream_debug::DebugServer;

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let ticks = parse_arg::<u64>(&args, "--ticks").unwrap_or(600);
    let speed = parse_arg::<f64>(&args, "--speed").unwrap_or(4.0);
    let tick_ms = parse_arg::<u64>(&args, "--tick-ms").unwrap_or(16);
    let debug_port = parse_arg::<u16>(&args, "--debug-port");

    let mut config = match parse_arg::<PathBuf>(&args, "--config") {
        Some(path) => match StreamingConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };
    if let Some(seed) = parse_arg::<u32>(&args, "--seed") {
        config.seed = seed;
    }

    let params = TerrainParams::default();
    let generator = Arc::new(TerrainGenerator::new(params.clone(), config.seed));
    let mut pipeline = match StreamingPipeline::new(config, generator.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::error!("Failed to start streaming: {}", e);
            std::process::exit(1);
        }
    };

    // The server runs on its own runtime; the engine loop only publishes
    let publisher = DebugPublisher::new();
    let _debug = debug_port.and_then(|port| start_debug_server(&publisher, port));

    println!("=== svostream demo ===");
    println!("Ticks: {}, speed: {} units/tick", ticks, speed);
    println!("Seed:  {}", pipeline.config().seed);
    println!();

    let start = Instant::now();
    let mut x = 0.0;
    for tick in 0..ticks {
        let ground = generator.height_at(x, 0.0).max(params.sea_level);
        let viewer = DVec3::new(x, ground + 32.0, 0.0);

        let report = pipeline.tick(viewer);
        if let Some(shift) = report.root_shift {
            log::info!(
                "Root moved by {} to {}",
                shift,
                pipeline.svo().root().position()
            );
        }
        if debug_port.is_some() {
            publisher.publish(snapshot(&pipeline));
        }

        if tick % 60 == 0 {
            let tree = pipeline.svo().stats();
            let stats = pipeline.stats();
            log::info!(
                "Tick {}: viewer x={:.0}, {} chunks, {} nodes ({} dead), {} in flight, avg job {:.2}ms",
                tick,
                x,
                tree.resident_chunks,
                tree.total_nodes,
                tree.dead_nodes,
                pipeline.in_flight(),
                stats.avg_job_ms()
            );
        }

        x += speed;
        std::thread::sleep(Duration::from_millis(tick_ms));
    }

    let stats = pipeline.stats();
    let tree = pipeline.svo().stats();
    println!();
    println!("=== Done in {:.1}s ===", start.elapsed().as_secs_f32());
    println!("Chunks resident:  {}", tree.resident_chunks);
    println!("Nodes:            {} ({} dead)", tree.total_nodes, tree.dead_nodes);
    println!(
        "Node pages:       {} committed",
        tree.pool.committed_node_pages
    );
    println!(
        "Jobs:             {} submitted, {} finalized, {} discarded",
        stats.submitted_jobs, stats.finalized_jobs, stats.discarded_jobs
    );
    println!(
        "Operations:       {} creates, {} splits, {} merges, {} root moves",
        stats.creates, stats.splits, stats.merges, stats.root_moves
    );
    println!(
        "Job time:         {:.2}ms avg work, {:.2}ms avg queue",
        stats.avg_job_ms(),
        stats.avg_queue_ms()
    );
}

/// Start the diagnostics server on a background runtime. The returned
/// server and runtime must outlive the demo loop.
fn start_debug_server(
    publisher: &DebugPublisher,
    port: u16,
) -> Option<(DebugServer, tokio::runtime::Runtime)> {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("svo-debug")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::warn!("Debug runtime failed to start: {}", e);
            return None;
        }
    };

    match runtime.block_on(DebugServer::bind(publisher.handler(), port)) {
        Ok(server) => Some((server, runtime)),
        Err(e) => {
            log::warn!("Debug server failed to bind port {}: {}", port, e);
            None
        }
    }
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}
