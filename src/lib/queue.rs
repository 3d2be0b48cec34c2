//! # Queue Submission
//!
//! The renderer executes batches in order but only tells the driver about
//! completion through renderer syncs. A submission therefore has two halves:
//! the `QueueSubmit` command carrying the batches, and a renderer submit that
//! asks the same queue to signal the host-visible syncs once it gets there.
//!
//! ```text
//!  no timeline signal:   QueueSubmit[b0..bn] ──> syncs[all] ──> roundtrip
//!
//!  timeline signal:      QueueSubmit[b0] ──> ring idle ──> syncs[b0] ──> roundtrip
//!                        QueueSubmit[b1] ──> ring idle ──> syncs[b1] ──> roundtrip
//!                        ...
//!                        QueueSubmit[bn] (+fence) ──> syncs[bn, fence] ──> roundtrip
//! ```
//!
//! Splitting per batch is what keeps timeline values in order: a value set
//! by batch `i` is only registered once batch `i` has been handed to the
//! queue, never coalesced with a later batch's value.

use std::mem;
use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::fence::Fence;
use crate::instance::{next_object_id, Instance};
use crate::protocol::{Command, QueueCreateInfo, SemaphoreValue, SubmitBatch};
use crate::renderer::{RendererSubmit, RendererSubmitBatch, RendererWait, SyncRef};
use crate::semaphore::{Semaphore, SemaphorePoint};
use crate::sync::{ActiveSlot, SyncPayload};

/// One batch of a submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [SemaphorePoint<'a>],
    /// Command buffers, or bind operations for sparse binding.
    pub command_buffer_count: u32,
    pub signal_semaphores: &'a [SemaphorePoint<'a>],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitKind {
    Submit,
    BindSparse,
}

impl SubmitKind {
    fn api_name(self) -> &'static str {
        match self {
            SubmitKind::Submit => "vkQueueSubmit",
            SubmitKind::BindSparse => "vkQueueBindSparse",
        }
    }

    fn command(self, queue_id: u64, batches: Vec<SubmitBatch>, fence_id: u64) -> Command {
        match self {
            SubmitKind::Submit => Command::QueueSubmit {
                queue_id,
                batches,
                fence_id,
            },
            SubmitKind::BindSparse => Command::QueueBindSparse {
                queue_id,
                batches,
                fence_id,
            },
        }
    }
}

/// A submission ready to go out: the batches as the renderer sees them and
/// the host-visible syncs each batch signals, flattened.
struct PreparedSubmit<'a> {
    batches: Vec<SubmitBatch>,
    /// Signal syncs of every batch in order, then the fence sync.
    syncs: Vec<SyncRef>,
    sync_values: Vec<u64>,
    batch_sync_counts: Vec<usize>,
    has_timeline_signal: bool,
    fence_id: u64,
    /// Waits satisfied by a temporary import, released after submission.
    consumed_waits: Vec<&'a Semaphore>,
}

impl<'a> PreparedSubmit<'a> {
    fn new(infos: &[SubmitInfo<'a>], fence: Option<&Fence>) -> Result<Self> {
        let mut signal_count = 0;
        let mut device_only_count = 0;
        let mut timeline_count = 0;
        for info in infos {
            for signal in info.signal_semaphores {
                signal_count += 1;
                let state = signal.semaphore.lock_state();
                // A presentation-signaled semaphore must also be waited on,
                // which resets it before its batch goes out.
                let payload = if state.is_externally_signaled() {
                    state.permanent()
                } else {
                    state.payload()
                };
                if matches!(payload, SyncPayload::DeviceOnly) {
                    device_only_count += 1;
                } else if signal.semaphore.is_timeline() {
                    timeline_count += 1;
                }
            }
        }
        let sync_count = signal_count - device_only_count + usize::from(fence.is_some());

        let mut prepared = PreparedSubmit {
            batches: Vec::with_capacity(infos.len()),
            syncs: Vec::with_capacity(sync_count),
            sync_values: Vec::with_capacity(sync_count),
            batch_sync_counts: Vec::with_capacity(infos.len()),
            has_timeline_signal: timeline_count > 0,
            fence_id: fence.map_or(0, Fence::id),
            consumed_waits: Vec::new(),
        };

        for info in infos {
            let mut waits = Vec::with_capacity(info.wait_semaphores.len());
            for wait in info.wait_semaphores {
                let mut state = wait.semaphore.lock_state();
                if state.is_externally_signaled() {
                    Semaphore::reset_wsi(&mut state)?;
                    continue;
                }
                if state.active() == ActiveSlot::Temporary {
                    prepared.consumed_waits.push(wait.semaphore);
                }
                waits.push(SemaphoreValue {
                    semaphore_id: wait.semaphore.id(),
                    value: wait.value,
                });
            }

            let first_sync = prepared.syncs.len();
            for signal in info.signal_semaphores {
                let state = signal.semaphore.lock_state();
                match state.payload() {
                    SyncPayload::DeviceOnly => {}
                    SyncPayload::Sync(sync) => {
                        prepared.syncs.push(sync.clone());
                        prepared.sync_values.push(if signal.semaphore.is_timeline() {
                            signal.value
                        } else {
                            1
                        });
                    }
                    other => panic!(
                        "cannot signal semaphore {} with payload {:?}",
                        signal.semaphore.id(),
                        other
                    ),
                }
            }
            prepared
                .batch_sync_counts
                .push(prepared.syncs.len() - first_sync);

            prepared.batches.push(SubmitBatch {
                wait_semaphores: waits,
                command_buffer_count: info.command_buffer_count,
                signal_semaphores: info
                    .signal_semaphores
                    .iter()
                    .map(|signal| SemaphoreValue {
                        semaphore_id: signal.semaphore.id(),
                        value: signal.value,
                    })
                    .collect(),
            });
        }

        if let Some(fence) = fence {
            prepared.syncs.push(fence.submit_sync());
            prepared.sync_values.push(1);
        }
        Ok(prepared)
    }
}

/// A device queue.
pub struct Queue {
    instance: Arc<Instance>,
    id: u64,
    family_index: u32,
    index: u32,
    flags: u32,
    sync_queue_index: u32,
    idle_sync: SyncRef,
    /// Last value the idle sync was asked to reach.
    idle_value: Mutex<u64>,
}

impl Queue {
    pub(crate) fn new(
        instance: Arc<Instance>,
        device_id: u64,
        family: &QueueCreateInfo,
        index: u32,
        sync_queue_index: u32,
    ) -> Result<Queue> {
        let idle_sync = instance.renderer().sync_create_cpu()?;
        let id = next_object_id();
        instance.call_async(&Command::GetDeviceQueue2 {
            device_id,
            family_index: family.family_index,
            queue_index: index,
            flags: family.flags,
            queue_id: id,
        })?;

        Ok(Queue {
            instance,
            id,
            family_index: family.family_index,
            index,
            flags: family.flags,
            sync_queue_index,
            idle_sync,
            idle_value: Mutex::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn sync_queue_index(&self) -> u32 {
        self.sync_queue_index
    }

    /// Submit `batches`, signaling `fence` once all of them complete.
    pub fn submit(&self, batches: &[SubmitInfo<'_>], fence: Option<&Fence>) -> Result<()> {
        let result = self.submit_batches(SubmitKind::Submit, batches, fence);
        self.instance.log_result(SubmitKind::Submit.api_name(), result)
    }

    /// Sparse binding goes through the same synchronization as `submit`.
    pub fn bind_sparse(&self, batches: &[SubmitInfo<'_>], fence: Option<&Fence>) -> Result<()> {
        let result = self.submit_batches(SubmitKind::BindSparse, batches, fence);
        self.instance
            .log_result(SubmitKind::BindSparse.api_name(), result)
    }

    fn submit_batches(
        &self,
        kind: SubmitKind,
        infos: &[SubmitInfo<'_>],
        fence: Option<&Fence>,
    ) -> Result<()> {
        let mut prepared = PreparedSubmit::new(infos, fence)?;
        let consumed_waits = mem::take(&mut prepared.consumed_waits);
        trace!(
            queue = self.id,
            batches = prepared.batches.len(),
            syncs = prepared.syncs.len(),
            timeline = prepared.has_timeline_signal,
            "{}",
            kind.api_name()
        );

        // The remote may have consumed the waits even if a later step failed.
        let result = self.send_prepared(kind, prepared);
        for semaphore in consumed_waits {
            semaphore.lock_state().restore_permanent();
        }
        result
    }

    fn send_prepared(&self, kind: SubmitKind, prepared: PreparedSubmit<'_>) -> Result<()> {
        let PreparedSubmit {
            mut batches,
            syncs,
            sync_values,
            batch_sync_counts,
            has_timeline_signal,
            fence_id,
            ..
        } = prepared;

        if has_timeline_signal {
            // Timeline signals imply at least one batch.
            let last = batches.pop().unwrap_or_default();
            let mut sync_base = 0;
            for (batch, &count) in batches.into_iter().zip(&batch_sync_counts) {
                self.instance
                    .call_async(&kind.command(self.id, vec![batch], 0))?;
                self.instance.ring_wait_all();
                if count > 0 {
                    let range = sync_base..sync_base + count;
                    self.submit_syncs(&syncs[range.clone()], &sync_values[range])?;
                }
                sync_base += count;
            }

            self.instance
                .call(&kind.command(self.id, vec![last], fence_id))?;
            if sync_base < syncs.len() {
                self.submit_syncs(&syncs[sync_base..], &sync_values[sync_base..])?;
            }
        } else {
            self.instance
                .call(&kind.command(self.id, batches, fence_id))?;
            if !syncs.is_empty() {
                self.submit_syncs(&syncs, &sync_values)?;
            }
        }
        Ok(())
    }

    /// Ask the renderer to signal `syncs` once this queue reaches the work
    /// submitted so far.
    fn submit_syncs(&self, syncs: &[SyncRef], sync_values: &[u64]) -> Result<()> {
        let batch = RendererSubmitBatch {
            sync_queue_index: self.sync_queue_index,
            vk_queue_id: self.id,
            syncs,
            sync_values,
        };
        self.instance.renderer().submit(&RendererSubmit {
            bos: &[],
            batches: slice::from_ref(&batch),
        })?;
        self.instance.roundtrip()
    }

    /// Block until everything submitted to this queue has executed.
    pub fn wait_idle(&self) -> Result<()> {
        self.instance.ring_wait_all();

        let value = {
            let mut idle_value = self.idle_value.lock();
            *idle_value += 1;
            let value = *idle_value;
            let syncs = slice::from_ref(&self.idle_sync);
            let batch = RendererSubmitBatch {
                sync_queue_index: self.sync_queue_index,
                vk_queue_id: self.id,
                syncs,
                sync_values: slice::from_ref(&value),
            };
            let result = self.instance.renderer().submit(&RendererSubmit {
                bos: &[],
                batches: slice::from_ref(&batch),
            });
            self.instance.log_result("vkQueueWaitIdle", result)?;
            value
        };

        let result = self.instance.renderer().wait(&RendererWait {
            wait_any: false,
            timeout: std::time::Duration::MAX,
            syncs: slice::from_ref(&self.idle_sync),
            sync_values: slice::from_ref(&value),
        });
        self.instance.log_result("vkQueueWaitIdle", result).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::device::{Device, DeviceCreateInfo};
    use crate::error::Status;
    use crate::instance::DEFAULT_API_VERSION;
    use crate::semaphore::SemaphoreType;
    use crate::sim::{SimConfig, SimRenderer};
    use crate::sync::{HandleType, ImportFdInfo};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn device_with(sim_config: SimConfig) -> (Arc<SimRenderer>, Device) {
        let sim = SimRenderer::new(sim_config).unwrap();
        let instance =
            Instance::new(sim.clone(), DEFAULT_API_VERSION, StreamConfig::default()).unwrap();
        let device = Device::new(instance, &DeviceCreateInfo::single_family(0, 1)).unwrap();
        (sim, device)
    }

    fn slow_gpu() -> SimConfig {
        SimConfig {
            gpu_batch_delay: Duration::from_millis(100),
            ..SimConfig::default()
        }
    }

    #[test]
    fn test_fence_not_ready_then_signaled() {
        let (_sim, device) = device_with(slow_gpu());
        let queue = device.queue(0, 0).unwrap();
        let fence = device.create_fence(false).unwrap();

        let batch = SubmitInfo {
            command_buffer_count: 1,
            ..SubmitInfo::default()
        };
        queue.submit(&[batch], Some(&fence)).unwrap();

        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::ZERO)
                .unwrap(),
            Status::NotReady
        );
        assert_eq!(device.get_fence_status(&fence).unwrap(), Status::NotReady);

        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::from_secs(10))
                .unwrap(),
            Status::Success
        );
        assert_eq!(device.get_fence_status(&fence).unwrap(), Status::Success);
    }

    #[test]
    fn test_timeline_value_waits_for_its_batch() {
        let (sim, device) = device_with(slow_gpu());
        let queue = device.queue(0, 0).unwrap();
        let timeline = device.create_semaphore(SemaphoreType::Timeline, 0).unwrap();

        let released = AtomicBool::new(false);
        let observed_seven = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                let point = [SemaphorePoint::new(&timeline, 6)];
                let status = device
                    .wait_semaphores(&point, false, Duration::from_secs(10))
                    .unwrap();
                assert_eq!(status, Status::Success);
                released.store(true, Ordering::SeqCst);
                let value = device.get_semaphore_counter_value(&timeline).unwrap();
                observed_seven.store(value >= 7, Ordering::SeqCst);
            });

            let five = [SemaphorePoint::new(&timeline, 5)];
            let seven = [SemaphorePoint::new(&timeline, 7)];
            let batches = [
                SubmitInfo {
                    command_buffer_count: 1,
                    ..SubmitInfo::default()
                },
                SubmitInfo {
                    command_buffer_count: 1,
                    signal_semaphores: &five,
                    ..SubmitInfo::default()
                },
                SubmitInfo {
                    command_buffer_count: 1,
                    signal_semaphores: &seven,
                    ..SubmitInfo::default()
                },
            ];
            queue.submit(&batches, None).unwrap();
        });

        // Batch 2 alone publishes 5, which must not release a waiter on 6.
        assert!(released.load(Ordering::SeqCst));
        assert!(observed_seven.load(Ordering::SeqCst));
        assert_eq!(device.get_semaphore_counter_value(&timeline).unwrap(), 7);
        let sync_id = timeline.lock_state().payload().expect_sync().id();
        assert_eq!(sim.sync_history(sync_id), vec![5, 7]);
    }

    #[test]
    fn test_timeline_values_publish_in_batch_order() {
        let (sim, device) = device_with(SimConfig {
            gpu_batch_delay: Duration::from_millis(20),
            ..SimConfig::default()
        });
        let queue = device.queue(0, 0).unwrap();
        let timeline = device.create_semaphore(SemaphoreType::Timeline, 0).unwrap();
        let sync_id = timeline.lock_state().payload().expect_sync().id();

        let values: Vec<[SemaphorePoint<'_>; 1]> = (1..=4u64)
            .map(|value| [SemaphorePoint::new(&timeline, value * 10)])
            .collect();
        let batches: Vec<SubmitInfo<'_>> = values
            .iter()
            .map(|signal| SubmitInfo {
                command_buffer_count: 1,
                signal_semaphores: signal,
                ..SubmitInfo::default()
            })
            .collect();
        queue.submit(&batches, None).unwrap();
        queue.wait_idle().unwrap();

        assert_eq!(sim.sync_history(sync_id), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_wsi_wait_is_filtered_and_reset() {
        let (sim, device) = device_with(SimConfig::default());
        let queue = device.queue(0, 0).unwrap();
        let acquired = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();
        acquired.signal_wsi();

        let waits = [SemaphorePoint::binary(&acquired)];
        let batch = SubmitInfo {
            wait_semaphores: &waits,
            command_buffer_count: 1,
            ..SubmitInfo::default()
        };
        queue.submit(&[batch], None).unwrap();

        assert!(!acquired.lock_state().is_externally_signaled());
        let sent = sim.last_submit(queue.id()).unwrap();
        assert!(sent[0].wait_semaphores.is_empty());

        // Waiting again without a new signal goes to the renderer.
        queue.submit(&[batch], None).unwrap();
        let sent = sim.last_submit(queue.id()).unwrap();
        assert_eq!(sent[0].wait_semaphores.len(), 1);
    }

    #[test]
    fn test_temporary_import_is_consumed_by_wait() {
        let (_sim, device) = device_with(SimConfig::default());
        let queue = device.queue(0, 0).unwrap();
        let semaphore = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();
        device
            .import_semaphore_fd(
                &semaphore,
                ImportFdInfo {
                    fd: None,
                    handle_type: HandleType::SyncFile,
                    temporary: true,
                },
            )
            .unwrap();

        let waits = [SemaphorePoint::binary(&semaphore)];
        queue
            .submit(
                &[SubmitInfo {
                    wait_semaphores: &waits,
                    command_buffer_count: 1,
                    ..SubmitInfo::default()
                }],
                None,
            )
            .unwrap();

        let state = semaphore.lock_state();
        assert_eq!(state.active(), ActiveSlot::Permanent);
        assert!(matches!(state.payload(), SyncPayload::DeviceOnly));
    }

    #[test]
    fn test_failed_submit_releases_temporary_wait() {
        let (_sim, device) = device_with(SimConfig::default());
        let queue = device.queue(0, 0).unwrap();
        let semaphore = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();
        device
            .import_semaphore_fd(
                &semaphore,
                ImportFdInfo {
                    fd: None,
                    handle_type: HandleType::SyncFile,
                    temporary: true,
                },
            )
            .unwrap();
        assert_eq!(semaphore.lock_state().active(), ActiveSlot::Temporary);

        // The remote queue is gone, so QueueSubmit reports device loss.
        device
            .instance()
            .call(&Command::DestroyDevice {
                device_id: device.id(),
            })
            .unwrap();

        let waits = [SemaphorePoint::binary(&semaphore)];
        let result = queue.submit(
            &[SubmitInfo {
                wait_semaphores: &waits,
                command_buffer_count: 1,
                ..SubmitInfo::default()
            }],
            None,
        );
        assert!(result.is_err());
        assert_eq!(semaphore.lock_state().active(), ActiveSlot::Permanent);
    }

    #[test]
    fn test_binary_signal_with_real_sync() {
        let (_sim, device) = device_with(SimConfig::default());
        let queue = device.queue(0, 0).unwrap();
        let source = device.create_semaphore(SemaphoreType::Timeline, 0).unwrap();
        let fd = device.get_semaphore_fd(&source, HandleType::OpaqueFd).unwrap();

        let binary = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();
        device
            .import_semaphore_fd(
                &binary,
                ImportFdInfo {
                    fd: Some(fd),
                    handle_type: HandleType::OpaqueFd,
                    temporary: false,
                },
            )
            .unwrap();

        let signals = [SemaphorePoint::binary(&binary)];
        queue
            .submit(
                &[SubmitInfo {
                    command_buffer_count: 1,
                    signal_semaphores: &signals,
                    ..SubmitInfo::default()
                }],
                None,
            )
            .unwrap();
        queue.wait_idle().unwrap();
        assert_eq!(device.get_semaphore_counter_value(&source).unwrap(), 1);
    }

    #[test]
    fn test_bind_sparse_signals_fence() {
        let (sim, device) = device_with(SimConfig::default());
        let queue = device.queue(0, 0).unwrap();
        let fence = device.create_fence(false).unwrap();

        queue
            .bind_sparse(
                &[SubmitInfo {
                    command_buffer_count: 2,
                    ..SubmitInfo::default()
                }],
                Some(&fence),
            )
            .unwrap();
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::from_secs(10))
                .unwrap(),
            Status::Success
        );
        assert_eq!(sim.last_submit(queue.id()).unwrap()[0].command_buffer_count, 2);
    }

    #[test]
    fn test_wait_idle_covers_submitted_work() {
        let (sim, device) = device_with(SimConfig {
            gpu_batch_delay: Duration::from_millis(30),
            ..SimConfig::default()
        });
        let queue = device.queue(0, 0).unwrap();
        let batch = SubmitInfo {
            command_buffer_count: 1,
            ..SubmitInfo::default()
        };
        queue.submit(&[batch, batch, batch], None).unwrap();
        queue.wait_idle().unwrap();
        assert_eq!(sim.executed_batches(queue.id()), 3);

        queue.wait_idle().unwrap();
    }
}
