//! # Streaming Workloads
//!
//! Command mixes used to exercise and benchmark the submission pipeline.
//!
//! - **Small (`generate_small`)**: many tiny fire-and-forget commands. Every
//!   one fits under the direct threshold and is copied straight into the
//!   ring, so this is bound by per-command overhead and ring backpressure.
//! - **Large (`generate_large`)**: payloads above the direct threshold. These
//!   go through the upload buffer and reach the renderer as
//!   `ExecuteCommandStreams`.
//! - **Reply (`generate_reply`)**: alternating writes and synchronous reads.
//!   Each read waits for the renderer, so this measures reply latency and
//!   reply buffer growth.
//! - **Timeline (`run_timeline`)**: queue submissions signaling a timeline
//!   semaphore, which takes the multi-trip submission path.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::device::Device;
use crate::error::{Error, Result, Status};
use crate::instance::Instance;
use crate::protocol::{Command, Reply, RESULT_SUCCESS};
use crate::queue::SubmitInfo;
use crate::semaphore::{SemaphorePoint, SemaphoreType};

/// One command and whether the caller waits for its reply.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub command: Command,
    pub want_reply: bool,
}

impl WorkItem {
    pub fn fire(command: Command) -> Self {
        Self {
            command,
            want_reply: false,
        }
    }

    pub fn call(command: Command) -> Self {
        Self {
            command,
            want_reply: true,
        }
    }
}

/// What a workload run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub commands: u64,
    pub replies: u64,
    pub payload_bytes: u64,
    pub wall_time_ms: f64,
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    (0..len).map(|i| (i as u64 ^ seed) as u8).collect()
}

/// Generate `count` small writes of `size` bytes each.
pub fn generate_small(count: usize, size: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| {
            WorkItem::fire(Command::WriteBlob {
                blob_id: (i % 64) as u64,
                data: payload(size, i as u64),
            })
        })
        .collect()
}

/// Generate `count` writes of `size` bytes, meant to exceed the direct
/// submission threshold.
pub fn generate_large(count: usize, size: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| {
            WorkItem::fire(Command::WriteBlob {
                blob_id: 1000 + (i % 8) as u64,
                data: payload(size, i as u64),
            })
        })
        .collect()
}

/// Generate `count` write/read pairs. Every read returns the whole blob.
pub fn generate_reply(count: usize, size: usize) -> Vec<WorkItem> {
    let mut items = Vec::with_capacity(count * 2);
    for i in 0..count {
        let blob_id = 2000 + i as u64;
        items.push(WorkItem::fire(Command::WriteBlob {
            blob_id,
            data: payload(size, blob_id),
        }));
        items.push(WorkItem::call(Command::ReadBlob {
            blob_id,
            offset: 0,
            size: size as u64,
        }));
    }
    items
}

/// Push `items` through `instance`, checking every reply.
pub fn run_commands(instance: &Instance, items: &[WorkItem]) -> Result<RunSummary> {
    let start = Instant::now();
    let mut summary = RunSummary::default();

    for item in items {
        if let Command::WriteBlob { data, .. } = &item.command {
            summary.payload_bytes += data.len() as u64;
        }
        summary.commands += 1;

        if !item.want_reply {
            instance.call_async(&item.command)?;
            continue;
        }

        let reply = instance.call(&item.command)?;
        if reply.result() != RESULT_SUCCESS {
            return Err(Error::DeviceLost(format!(
                "{:?} returned {}",
                reply.command_type(),
                reply.result()
            )));
        }
        if let Reply::ReadBlob { data, .. } = &reply {
            summary.payload_bytes += data.len() as u64;
        }
        summary.replies += 1;
    }

    instance.ring_wait_all();
    summary.wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    debug!(
        "ran {} commands ({} replies) in {:.2} ms",
        summary.commands, summary.replies, summary.wall_time_ms
    );
    Ok(summary)
}

/// Submit `submits` times to the first queue of `device`, each submission
/// carrying `batches` batches that signal a timeline semaphore one step
/// further, then wait for the final value.
pub fn run_timeline(device: &Device, submits: usize, batches: usize) -> Result<RunSummary> {
    let queue = device
        .queues()
        .first()
        .ok_or_else(|| Error::InitializationFailed("device has no queues".into()))?;
    let timeline = device.create_semaphore(SemaphoreType::Timeline, 0)?;

    let start = Instant::now();
    let mut value = 0u64;
    for _ in 0..submits {
        let signals: Vec<[SemaphorePoint<'_>; 1]> = (0..batches)
            .map(|_| {
                value += 1;
                [SemaphorePoint::new(&timeline, value)]
            })
            .collect();
        let infos: Vec<SubmitInfo<'_>> = signals
            .iter()
            .map(|signal| SubmitInfo {
                command_buffer_count: 1,
                signal_semaphores: signal,
                ..SubmitInfo::default()
            })
            .collect();
        queue.submit(&infos, None)?;
    }

    let status = device.wait_semaphores(
        &[SemaphorePoint::new(&timeline, value)],
        false,
        Duration::from_secs(30),
    )?;
    if status != Status::Success {
        return Err(Error::DeviceLost(format!(
            "timeline stuck below {}",
            value
        )));
    }

    Ok(RunSummary {
        commands: (submits * batches) as u64,
        replies: 0,
        payload_bytes: 0,
        wall_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}
