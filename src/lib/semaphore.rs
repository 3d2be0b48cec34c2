//! # Semaphores
//!
//! Binary semaphores start `DeviceOnly`: the renderer orders waits and
//! signals between queues and the driver never looks at them. Timeline
//! semaphores need host-visible values, so their permanent payload is a
//! renderer sync holding the counter.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::device::Device;
use crate::error::{Error, ImportFdError, Result, Status};
use crate::instance::{next_object_id, Instance};
use crate::protocol::Command;
use crate::renderer::RendererWait;
use crate::sync::{poll_status, HandleType, ImportFdInfo, SyncPayload, SyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreType {
    Binary,
    Timeline,
}

/// A semaphore together with a value. The value is ignored for binary
/// semaphores.
#[derive(Debug, Clone, Copy)]
pub struct SemaphorePoint<'a> {
    pub semaphore: &'a Semaphore,
    pub value: u64,
}

impl<'a> SemaphorePoint<'a> {
    pub fn new(semaphore: &'a Semaphore, value: u64) -> Self {
        Self { semaphore, value }
    }

    pub fn binary(semaphore: &'a Semaphore) -> Self {
        Self {
            semaphore,
            value: 0,
        }
    }
}

pub struct Semaphore {
    instance: Arc<Instance>,
    device_id: u64,
    id: u64,
    semaphore_type: SemaphoreType,
    state: Mutex<SyncState>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("type", &self.semaphore_type)
            .finish()
    }
}

impl Semaphore {
    fn new(device: &Device, semaphore_type: SemaphoreType, initial_value: u64) -> Result<Semaphore> {
        let instance = Arc::clone(device.instance());
        let renderer = instance.renderer();
        let state = match semaphore_type {
            SemaphoreType::Timeline => {
                let sync = renderer.sync_create_semaphore(true, initial_value)?;
                SyncState::new(
                    SyncPayload::Sync(sync.clone()),
                    sync,
                    renderer.sync_create_empty()?,
                )
            }
            SemaphoreType::Binary => SyncState::new(
                SyncPayload::DeviceOnly,
                renderer.sync_create_empty()?,
                renderer.sync_create_empty()?,
            ),
        };

        let id = next_object_id();
        instance.call_async(&Command::CreateSemaphore {
            device_id: device.id(),
            semaphore_id: id,
            timeline: semaphore_type == SemaphoreType::Timeline,
            initial_value,
        })?;

        Ok(Semaphore {
            device_id: device.id(),
            id,
            semaphore_type,
            state: Mutex::new(state),
            instance,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn semaphore_type(&self) -> SemaphoreType {
        self.semaphore_type
    }

    pub fn is_timeline(&self) -> bool {
        self.semaphore_type == SemaphoreType::Timeline
    }

    /// Mark the semaphore signaled on behalf of the presentation engine.
    /// The next queue submission waiting on it consumes the signal.
    pub fn signal_wsi(&self) {
        self.state.lock().signal_wsi();
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock()
    }

    /// Drop a presentation signal or temporary import and return to the
    /// permanent payload.
    pub(crate) fn reset_wsi(state: &mut SyncState) -> Result<()> {
        state.restore_permanent();
        if let SyncPayload::Sync(sync) = state.permanent() {
            sync.reset(0)?;
        }
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(err) = self.instance.call_async(&Command::DestroySemaphore {
            device_id: self.device_id,
            semaphore_id: self.id,
        }) {
            warn!("failed to destroy semaphore {}: {}", self.id, err);
        }
        self.state.get_mut().release_all();
    }
}

impl Device {
    pub fn create_semaphore(
        &self,
        semaphore_type: SemaphoreType,
        initial_value: u64,
    ) -> Result<Semaphore> {
        let result = Semaphore::new(self, semaphore_type, initial_value);
        self.instance.log_result("vkCreateSemaphore", result)
    }

    pub fn get_semaphore_counter_value(&self, semaphore: &Semaphore) -> Result<u64> {
        let sync = semaphore.state.lock().payload().expect_sync().clone();
        let result = sync.read();
        self.instance.log_result("vkGetSemaphoreCounterValue", result)
    }

    /// Signal a timeline semaphore from the host.
    pub fn signal_semaphore(&self, semaphore: &Semaphore, value: u64) -> Result<()> {
        let result = self.instance.call_async(&Command::SignalSemaphore {
            device_id: self.id(),
            semaphore_id: semaphore.id,
            value,
        });
        self.instance.log_result("vkSignalSemaphore", result)?;

        let sync = semaphore.state.lock().payload().expect_sync().clone();
        let result = sync.write(value);
        self.instance.log_result("vkSignalSemaphore", result)
    }

    /// Wait for timeline semaphores to reach their values.
    pub fn wait_semaphores(
        &self,
        points: &[SemaphorePoint<'_>],
        wait_any: bool,
        timeout: Duration,
    ) -> Result<Status> {
        let syncs: Vec<_> = points
            .iter()
            .map(|point| point.semaphore.state.lock().payload().expect_sync().clone())
            .collect();
        let values: Vec<u64> = points.iter().map(|point| point.value).collect();

        let result = self.instance.renderer().wait(&RendererWait {
            wait_any,
            timeout,
            syncs: &syncs,
            sync_values: &values,
        });
        let status = self.instance.log_result("vkWaitSemaphores", result)?;
        Ok(poll_status(timeout, status))
    }

    pub fn import_semaphore_fd(
        &self,
        semaphore: &Semaphore,
        info: ImportFdInfo,
    ) -> Result<(), ImportFdError> {
        let result = semaphore.state.lock().import_fd(info);
        if let Err(err) = &result {
            if self.instance.config().debug.result {
                warn!("vkImportSemaphoreFdKHR failed: {}", err);
            }
        }
        result
    }

    /// Export the semaphore payload. A sync file export unsignals the
    /// semaphore.
    pub fn get_semaphore_fd(&self, semaphore: &Semaphore, handle_type: HandleType) -> Result<OwnedFd> {
        let sync_file = handle_type == HandleType::SyncFile;
        let mut state = semaphore.state.lock();
        let result = state
            .payload()
            .expect_sync()
            .export_syncobj(sync_file)
            .map_err(|err| {
                warn!("semaphore {} export failed: {}", semaphore.id, err);
                Error::TooManyObjects
            });
        let fd = self.instance.log_result("vkGetSemaphoreFdKHR", result)?;

        if sync_file {
            let result = Semaphore::reset_wsi(&mut state);
            self.instance.log_result("vkGetSemaphoreFdKHR", result)?;
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
    use crate::sync::ActiveSlot;

    fn device(sim: &Arc<SimRenderer>) -> Device {
        let instance =
            Instance::new(sim.clone(), DEFAULT_API_VERSION, StreamConfig::default()).unwrap();
        Device::new(instance, &DeviceCreateInfo::single_family(0, 1)).unwrap()
    }

    #[test]
    fn test_timeline_host_signal_and_wait() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let timeline = device.create_semaphore(SemaphoreType::Timeline, 3).unwrap();
        assert_eq!(device.get_semaphore_counter_value(&timeline).unwrap(), 3);

        let point = [SemaphorePoint::new(&timeline, 5)];
        assert_eq!(
            device.wait_semaphores(&point, false, Duration::ZERO).unwrap(),
            Status::NotReady
        );

        device.signal_semaphore(&timeline, 5).unwrap();
        assert_eq!(device.get_semaphore_counter_value(&timeline).unwrap(), 5);
        assert_eq!(
            device
                .wait_semaphores(&point, false, Duration::from_secs(1))
                .unwrap(),
            Status::Success
        );
    }

    #[test]
    fn test_wait_any_and_all() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let a = device.create_semaphore(SemaphoreType::Timeline, 10).unwrap();
        let b = device.create_semaphore(SemaphoreType::Timeline, 0).unwrap();
        let points = [SemaphorePoint::new(&a, 10), SemaphorePoint::new(&b, 1)];

        assert_eq!(
            device
                .wait_semaphores(&points, true, Duration::from_millis(1))
                .unwrap(),
            Status::Success
        );
        assert_eq!(
            device
                .wait_semaphores(&points, false, Duration::from_millis(1))
                .unwrap(),
            Status::Timeout
        );
    }

    #[test]
    fn test_binary_starts_device_only() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let binary = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();
        assert!(matches!(
            binary.lock_state().payload(),
            SyncPayload::DeviceOnly
        ));
    }

    #[test]
    fn test_opaque_export_shares_counter() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let source = device.create_semaphore(SemaphoreType::Timeline, 7).unwrap();
        let fd = device.get_semaphore_fd(&source, HandleType::OpaqueFd).unwrap();

        let target = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();
        device
            .import_semaphore_fd(
                &target,
                ImportFdInfo {
                    fd: Some(fd),
                    handle_type: HandleType::OpaqueFd,
                    temporary: false,
                },
            )
            .unwrap();
        assert_eq!(target.lock_state().active(), ActiveSlot::Permanent);

        device.signal_semaphore(&source, 9).unwrap();
        let value = target.lock_state().payload().expect_sync().read().unwrap();
        assert_eq!(value, 9);
    }

    #[test]
    fn test_sync_file_export_unsignals() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
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

        let _fd = device
            .get_semaphore_fd(&semaphore, HandleType::SyncFile)
            .unwrap();
        let state = semaphore.lock_state();
        assert_eq!(state.active(), ActiveSlot::Permanent);
        assert!(matches!(state.payload(), SyncPayload::DeviceOnly));
    }

    #[test]
    fn test_failed_import_keeps_descriptor() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let device = device(&sim);
        let semaphore = device.create_semaphore(SemaphoreType::Binary, 0).unwrap();

        let file = std::fs::File::open("/dev/null").unwrap();
        let err = device
            .import_semaphore_fd(
                &semaphore,
                ImportFdInfo {
                    fd: Some(OwnedFd::from(file)),
                    handle_type: HandleType::SyncFile,
                    temporary: true,
                },
            )
            .unwrap_err();
        assert!(err.fd.is_some());
    }
}
