//! # Fences
//!
//! A fence's permanent payload is always a renderer sync: 0 while unsignaled,
//! 1 once the GPU (or the driver) signals it. Imports and the presentation
//! path can park a temporary payload in front of it.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::device::Device;
use crate::error::{Error, ImportFdError, Result, Status};
use crate::instance::{next_object_id, Instance};
use crate::protocol::Command;
use crate::renderer::{RendererWait, SyncRef};
use crate::sync::{poll_status, ActiveSlot, HandleType, ImportFdInfo, SyncPayload, SyncState};

pub struct Fence {
    instance: Arc<Instance>,
    device_id: u64,
    id: u64,
    state: Mutex<SyncState>,
}

impl Fence {
    fn new(device: &Device, signaled: bool) -> Result<Fence> {
        let instance = Arc::clone(device.instance());
        let renderer = instance.renderer();
        let permanent = renderer.sync_create_fence(signaled)?;
        let temporary = renderer.sync_create_empty()?;

        let id = next_object_id();
        instance.call_async(&Command::CreateFence {
            device_id: device.id(),
            fence_id: id,
            signaled,
        })?;

        Ok(Fence {
            device_id: device.id(),
            id,
            state: Mutex::new(SyncState::new(
                SyncPayload::Sync(permanent.clone()),
                permanent,
                temporary,
            )),
            instance,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the fence signaled on behalf of the presentation engine. The
    /// next wait observes it once.
    pub fn signal_wsi(&self) {
        self.state.lock().signal_wsi();
    }

    /// The sync a queue submission signals.
    pub(crate) fn submit_sync(&self) -> SyncRef {
        self.state.lock().payload().expect_sync().clone()
    }

    fn reset_payload(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.restore_permanent();
        state.permanent().expect_sync().reset(0)
    }

    /// Drop a temporary payload once a wait observed it signaled.
    fn consume_temporary(&self) {
        let mut state = self.state.lock();
        if state.active() != ActiveSlot::Temporary {
            return;
        }
        let signaled = match state.payload() {
            SyncPayload::ExternallySignaled => true,
            SyncPayload::Sync(sync) => sync.read().map_or(false, |value| value != 0),
            _ => false,
        };
        if signaled {
            state.restore_permanent();
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Err(err) = self.instance.call_async(&Command::DestroyFence {
            device_id: self.device_id,
            fence_id: self.id,
        }) {
            warn!("failed to destroy fence {}: {}", self.id, err);
        }
        self.state.get_mut().release_all();
    }
}

impl Device {
    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let result = Fence::new(self, signaled);
        self.instance.log_result("vkCreateFence", result)
    }

    pub fn reset_fences(&self, fences: &[&Fence]) -> Result<()> {
        let result = self.instance.call_async(&Command::ResetFences {
            device_id: self.id(),
            fence_ids: fences.iter().map(|fence| fence.id).collect(),
        });
        self.instance.log_result("vkResetFences", result)?;

        for fence in fences {
            let result = fence.reset_payload();
            self.instance.log_result("vkResetFences", result)?;
        }
        Ok(())
    }

    pub fn get_fence_status(&self, fence: &Fence) -> Result<Status> {
        let state = fence.state.lock();
        match state.payload() {
            SyncPayload::Sync(sync) => {
                let result = sync.read();
                let value = self.instance.log_result("vkGetFenceStatus", result)?;
                Ok(if value != 0 {
                    Status::Success
                } else {
                    Status::NotReady
                })
            }
            SyncPayload::ExternallySignaled => Ok(Status::Success),
            other => panic!("fence {} has payload {:?}", fence.id, other),
        }
    }

    /// Wait for all (or any) of `fences`.
    ///
    /// Presentation-signaled fences count as signaled. Signaled temporary
    /// payloads are consumed once the wait succeeds.
    pub fn wait_for_fences(
        &self,
        fences: &[&Fence],
        wait_all: bool,
        timeout: Duration,
    ) -> Result<Status> {
        let mut syncs = Vec::with_capacity(fences.len());
        let mut signaled = Vec::new();
        for fence in fences {
            let state = fence.state.lock();
            match state.payload() {
                SyncPayload::Sync(sync) => syncs.push(sync.clone()),
                SyncPayload::ExternallySignaled => signaled.push(*fence),
                other => panic!("cannot wait on fence {} with payload {:?}", fence.id, other),
            }
        }

        let status = if !syncs.is_empty() && (wait_all || signaled.is_empty()) {
            let values = vec![1; syncs.len()];
            let result = self.instance.renderer().wait(&RendererWait {
                wait_any: !wait_all,
                timeout,
                syncs: &syncs,
                sync_values: &values,
            });
            poll_status(timeout, self.instance.log_result("vkWaitForFences", result)?)
        } else {
            Status::Success
        };

        if status.is_success() {
            for fence in fences {
                fence.consume_temporary();
            }
        }
        Ok(status)
    }

    pub fn import_fence_fd(&self, fence: &Fence, info: ImportFdInfo) -> Result<(), ImportFdError> {
        let result = fence.state.lock().import_fd(info);
        if let Err(err) = &result {
            if self.instance.config().debug.result {
                warn!("vkImportFenceFdKHR failed: {}", err);
            }
        }
        result
    }

    /// Export the fence payload. A sync file export also resets the fence.
    pub fn get_fence_fd(&self, fence: &Fence, handle_type: HandleType) -> Result<OwnedFd> {
        let sync_file = handle_type == HandleType::SyncFile;
        let sync = fence.state.lock().payload().expect_sync().clone();
        let result = sync
            .export_syncobj(sync_file)
            .map_err(|err| {
                warn!("fence {} export failed: {}", fence.id, err);
                Error::TooManyObjects
            });
        let fd = self.instance.log_result("vkGetFenceFdKHR", result)?;

        if sync_file {
            self.reset_fences(&[fence])?;
        }
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::device::DeviceCreateInfo;
    use crate::instance::DEFAULT_API_VERSION;
    use crate::sim::{SimConfig, SimRenderer};

    fn device(sim: &Arc<SimRenderer>) -> Device {
        let instance =
            Instance::new(sim.clone(), DEFAULT_API_VERSION, StreamConfig::default()).unwrap();
        Device::new(instance, &DeviceCreateInfo::single_family(0, 1)).unwrap()
    }

    #[test]
    fn test_create_signaled_and_reset() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);

        let fence = device.create_fence(true).unwrap();
        assert_eq!(device.get_fence_status(&fence).unwrap(), Status::Success);

        device.reset_fences(&[&fence]).unwrap();
        assert_eq!(device.get_fence_status(&fence).unwrap(), Status::NotReady);
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::ZERO)
                .unwrap(),
            Status::NotReady
        );
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::from_millis(5))
                .unwrap(),
            Status::Timeout
        );
    }

    #[test]
    fn test_wsi_signal_is_one_shot() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let fence = device.create_fence(false).unwrap();

        fence.signal_wsi();
        assert_eq!(device.get_fence_status(&fence).unwrap(), Status::Success);
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::ZERO)
                .unwrap(),
            Status::Success
        );

        // The signal was consumed by the wait.
        assert_eq!(device.get_fence_status(&fence).unwrap(), Status::NotReady);
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::ZERO)
                .unwrap(),
            Status::NotReady
        );
    }

    #[test]
    fn test_wait_any_skips_remote_wait_when_one_is_signaled() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let pending = device.create_fence(false).unwrap();
        let presented = device.create_fence(false).unwrap();
        presented.signal_wsi();

        let status = device
            .wait_for_fences(&[&pending, &presented], false, Duration::from_secs(10))
            .unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(device.get_fence_status(&presented).unwrap(), Status::NotReady);
    }

    #[test]
    fn test_sync_file_export_resets_fence() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let source = device.create_fence(true).unwrap();

        let fd = device.get_fence_fd(&source, HandleType::SyncFile).unwrap();
        assert_eq!(device.get_fence_status(&source).unwrap(), Status::NotReady);

        let target = device.create_fence(false).unwrap();
        device
            .import_fence_fd(
                &target,
                ImportFdInfo {
                    fd: Some(fd),
                    handle_type: HandleType::SyncFile,
                    temporary: true,
                },
            )
            .unwrap();
        assert_eq!(device.get_fence_status(&target).unwrap(), Status::Success);

        // Reset drops the temporary payload.
        device.reset_fences(&[&target]).unwrap();
        assert_eq!(device.get_fence_status(&target).unwrap(), Status::NotReady);
    }

    #[test]
    fn test_import_signaled_without_fd() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let fence = device.create_fence(false).unwrap();

        device
            .import_fence_fd(
                &fence,
                ImportFdInfo {
                    fd: None,
                    handle_type: HandleType::SyncFile,
                    temporary: true,
                },
            )
            .unwrap();
        assert_eq!(fence.state.lock().active(), ActiveSlot::Temporary);
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::ZERO)
                .unwrap(),
            Status::Success
        );

        // One wait consumes the import.
        assert_eq!(fence.state.lock().active(), ActiveSlot::Permanent);
        assert_eq!(
            device
                .wait_for_fences(&[&fence], true, Duration::ZERO)
                .unwrap(),
            Status::NotReady
        );
    }

    #[test]
    fn test_wait_any_keeps_unsignaled_import() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let source = device.create_fence(false).unwrap();
        let fd = device.get_fence_fd(&source, HandleType::OpaqueFd).unwrap();

        let imported = device.create_fence(false).unwrap();
        device
            .import_fence_fd(
                &imported,
                ImportFdInfo {
                    fd: Some(fd),
                    handle_type: HandleType::OpaqueFd,
                    temporary: true,
                },
            )
            .unwrap();
        let presented = device.create_fence(false).unwrap();
        presented.signal_wsi();

        let status = device
            .wait_for_fences(&[&imported, &presented], false, Duration::ZERO)
            .unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(imported.state.lock().active(), ActiveSlot::Temporary);
        assert_eq!(presented.state.lock().active(), ActiveSlot::Permanent);
    }

    #[test]
    fn test_drop_destroys_remote_fence() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let fence = device.create_fence(false).unwrap();
        device.instance().ring_wait_all();
        assert_eq!(sim.fence_count(), 1);

        drop(fence);
        device.instance().ring_wait_all();
        assert_eq!(sim.fence_count(), 0);
    }
}
