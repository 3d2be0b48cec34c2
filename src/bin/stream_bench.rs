//! # Stream Bench
//!
//! Drives a workload through the full submission pipeline against the
//! in-process renderer and reports the stream statistics.
//!
//! ## Workloads
//!
//! - **`small`**: fire-and-forget commands copied directly into the ring.
//! - **`large`**: payloads above the direct threshold, sent through the
//!   upload buffer.
//! - **`reply`**: write/read pairs, each read waiting for its reply.
//! - **`timeline`**: queue submissions signaling a timeline semaphore.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use vnstream::workload::{self, RunSummary};
use vnstream::{
    Device, DeviceCreateInfo, Instance, SimConfig, SimRenderer, StreamConfig, StreamStats,
    WaitPolicy, DEFAULT_API_VERSION,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Command stream benchmark against a simulated renderer")]
struct Args {
    /// Workload: small, large, reply or timeline
    #[arg(long, default_value = "small")]
    workload: String,

    /// Number of commands (or submissions for timeline)
    #[arg(long, default_value = "10000")]
    count: usize,

    /// Payload size in bytes
    #[arg(long, default_value = "64")]
    size: usize,

    /// Batches per submission (timeline only)
    #[arg(long, default_value = "4")]
    batches: usize,

    /// Ring buffer size in bytes (power of two)
    #[arg(long)]
    ring_size: Option<u32>,

    /// Busy-poll instead of yielding while waiting
    #[arg(long)]
    spin: bool,

    /// Simulated GPU time per batch in microseconds
    #[arg(long, default_value = "0")]
    gpu_delay_us: u64,

    /// JSON stream configuration file
    #[arg(long)]
    config: Option<String>,

    /// Output file for results
    #[arg(long)]
    out: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("failed to load stream config {}", path))?,
        None => StreamConfig::from_env().context("failed to read stream config from env")?,
    };
    if let Some(ring_size) = args.ring_size {
        config.ring_buffer_size = ring_size;
    }
    if args.spin {
        config.wait_policy = WaitPolicy::Spin;
    }

    info!("[BENCH:INIT] Workload: {}, count: {}", args.workload, args.count);
    info!(
        "[BENCH:INIT] Ring: {} bytes, direct threshold: {} bytes",
        config.ring_buffer_size, config.direct_threshold
    );

    let renderer = SimRenderer::new(SimConfig {
        gpu_batch_delay: Duration::from_micros(args.gpu_delay_us),
        ..SimConfig::default()
    })
    .context("failed to start simulated renderer")?;
    let instance = Instance::new(renderer, DEFAULT_API_VERSION, config)
        .context("failed to connect to renderer")?;
    info!("[BENCH:INIT] Connected, renderer version {:#x}", instance.renderer_version());

    let start = Instant::now();
    let summary = match args.workload.as_str() {
        "small" => run_stream(&instance, workload::generate_small(args.count, args.size))?,
        "large" => run_stream(&instance, workload::generate_large(args.count, args.size))?,
        "reply" => run_stream(&instance, workload::generate_reply(args.count, args.size))?,
        "timeline" => {
            let device = Device::new(instance.clone(), &DeviceCreateInfo::single_family(0, 1))
                .context("failed to create device")?;
            let summary = workload::run_timeline(&device, args.count, args.batches)?;
            device.wait_idle()?;
            summary
        }
        other => {
            warn!("[BENCH:INIT] Unknown workload '{}', using small", other);
            run_stream(&instance, workload::generate_small(args.count, args.size))?
        }
    };
    let elapsed = start.elapsed();
    let stats = instance.stats();

    info!("[BENCH:DONE] Commands: {}", summary.commands);
    info!("[BENCH:DONE] Replies: {}", summary.replies);
    info!(
        "[BENCH:DONE] Wall time: {:.2} ms",
        elapsed.as_secs_f64() * 1000.0
    );
    info!(
        "[BENCH:DONE] Throughput: {:.2} commands/sec",
        summary.commands as f64 / elapsed.as_secs_f64()
    );
    info!(
        "[BENCH:STATS] Submitted: {}, dropped: {}, notifies: {}, roundtrips: {}",
        stats.commands_submitted, stats.commands_dropped, stats.notifies, stats.roundtrips
    );
    info!(
        "[BENCH:STATS] Uploads: {}, reply grows: {}, ring-full stalls: {}",
        stats.indirect_uploads, stats.reply_grows, stats.ring_full_stalls
    );

    if let Some(ref out_file) = args.out {
        save_results(out_file, &args, &summary, &stats, elapsed)?;
    }

    Ok(())
}

fn run_stream(instance: &Instance, items: Vec<workload::WorkItem>) -> Result<RunSummary> {
    info!("[BENCH:RUN] Streaming {} commands", items.len());
    Ok(workload::run_commands(instance, &items)?)
}

fn save_results(
    path: &str,
    args: &Args,
    summary: &RunSummary,
    stats: &StreamStats,
    elapsed: Duration,
) -> Result<()> {
    use serde_json::json;
    use std::fs::File;
    use std::io::Write;

    let results = json!({
        "bench": {
            "workload": args.workload,
            "count": args.count,
            "size": args.size,
            "wall_time_ms": elapsed.as_secs_f64() * 1000.0,
            "throughput_per_sec": summary.commands as f64 / elapsed.as_secs_f64(),
            "summary": summary,
            "stats": stats,
        }
    });

    let mut file = File::create(path).with_context(|| format!("failed to create {}", path))?;
    writeln!(file, "{}", serde_json::to_string_pretty(&results)?)?;
    info!("[BENCH:DONE] Saved results to {}", path);

    Ok(())
}
