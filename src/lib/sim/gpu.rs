//! Simulated GPU queues.
//!
//! Each remote queue is a thread draining a FIFO of jobs. Batches take a
//! configurable amount of time; sync signals queued behind them fire only
//! once everything ahead of them ran. Cross-queue semaphore waits are not
//! modeled: a queue never stalls on another queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::sync::{SyncCell, SyncHub};
use crate::error::{Error, Result};
use crate::protocol::SubmitBatch;
use crate::shm::Bo;

/// Remote fence and semaphore state, updated as batches retire.
#[derive(Debug, Default)]
pub(crate) struct RemoteObjects {
    pub fences: HashMap<u64, bool>,
    /// Semaphore id to current value (0/1 for binary).
    pub semaphores: HashMap<u64, u64>,
}

impl RemoteObjects {
    fn retire(&mut self, batch: &SubmitBatch) {
        for signal in &batch.signal_semaphores {
            if let Some(value) = self.semaphores.get_mut(&signal.semaphore_id) {
                *value = signal.value.max(1);
            }
        }
    }
}

pub(crate) enum GpuJob {
    Execute(SubmitBatch),
    SignalFence(u64),
    /// Host-visible signals. The buffers stay referenced until they fire.
    Signal {
        syncs: Vec<(Arc<SyncCell>, u64)>,
        bos: Vec<Bo>,
    },
}

/// Handle to one queue thread. Dropping it finishes queued work first.
pub(crate) struct GpuQueue {
    device_id: u64,
    jobs: Option<Sender<GpuJob>>,
    executed: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl GpuQueue {
    pub fn spawn(
        queue_id: u64,
        device_id: u64,
        batch_delay: Duration,
        objects: Arc<Mutex<RemoteObjects>>,
        hub: Arc<SyncHub>,
    ) -> Result<GpuQueue> {
        let (tx, rx) = mpsc::channel();
        let executed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&executed);
        let thread = thread::Builder::new()
            .name(format!("sim-gpu-{}", queue_id))
            .spawn(move || run_queue(rx, batch_delay, objects, hub, counter))
            .map_err(|e| Error::InitializationFailed(format!("cannot spawn queue thread: {}", e)))?;

        debug!("queue {} online", queue_id);
        Ok(GpuQueue {
            device_id,
            jobs: Some(tx),
            executed,
            thread: Some(thread),
        })
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn push(&self, job: GpuJob) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| Error::DeviceLost("queue is shutting down".into()))?
            .send(job)
            .map_err(|_| Error::DeviceLost("queue thread exited".into()))
    }

    /// Batches run so far.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }
}

impl Drop for GpuQueue {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_queue(
    jobs: Receiver<GpuJob>,
    batch_delay: Duration,
    objects: Arc<Mutex<RemoteObjects>>,
    hub: Arc<SyncHub>,
    executed: Arc<AtomicU64>,
) {
    while let Ok(job) = jobs.recv() {
        match job {
            GpuJob::Execute(batch) => {
                if !batch_delay.is_zero() {
                    thread::sleep(batch_delay);
                }
                objects.lock().retire(&batch);
                executed.fetch_add(1, Ordering::Release);
                trace!(
                    "batch done: {} command buffers, {} signals",
                    batch.command_buffer_count,
                    batch.signal_semaphores.len()
                );
            }
            GpuJob::SignalFence(fence_id) => {
                if let Some(signaled) = objects.lock().fences.get_mut(&fence_id) {
                    *signaled = true;
                }
            }
            GpuJob::Signal { syncs, bos } => {
                for (cell, value) in &syncs {
                    hub.signal(cell, *value);
                }
                drop(bos);
            }
        }
    }
}
