//! Renderer-side sync objects.
//!
//! A sync is a 64-bit counter cell. Several [`SimSync`] handles can share one
//! cell after an opaque import, which is how payloads cross between objects.
//! Every store goes through the [`SyncHub`], which wakes all waiters; waits
//! then recheck their own conditions.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::sys::stat::fstat;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result, Status};
use crate::renderer::{RendererSync, SyncRef};

/// Shared counter behind one or more syncs.
#[derive(Debug, Default)]
pub(crate) struct SyncCell {
    value: AtomicU64,
    /// Values stored by queue signals, oldest first.
    history: Mutex<Vec<u64>>,
}

impl SyncCell {
    pub fn new(value: u64) -> Arc<SyncCell> {
        Arc::new(SyncCell {
            value: AtomicU64::new(value),
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<u64> {
        self.history.lock().clone()
    }
}

/// Registry of live syncs and exported handles.
#[derive(Default)]
pub(crate) struct SyncHub {
    next_id: AtomicU32,
    syncs: Mutex<HashMap<u32, Weak<SimSync>>>,
    /// Exported handles by (device, inode).
    exports: Mutex<HashMap<(u64, u64), Arc<SyncCell>>>,
    signal_lock: Mutex<()>,
    signaled: Condvar,
}

impl SyncHub {
    pub fn new() -> Arc<SyncHub> {
        Arc::new(SyncHub {
            next_id: AtomicU32::new(1),
            ..SyncHub::default()
        })
    }

    pub fn create(self: &Arc<Self>, cell: Option<Arc<SyncCell>>) -> Arc<SimSync> {
        let sync = Arc::new(SimSync {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            hub: Arc::clone(self),
            cell: Mutex::new(cell),
        });
        self.syncs.lock().insert(sync.id, Arc::downgrade(&sync));
        sync
    }

    /// The cell currently behind the sync with renderer id `id`.
    pub fn resolve(&self, id: u32) -> Result<Arc<SyncCell>> {
        let sync = self
            .syncs
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::DeviceLost(format!("unknown sync {}", id)))?;
        sync.cell()
    }

    pub fn resolve_all(&self, syncs: &[SyncRef], values: &[u64]) -> Result<Vec<(Arc<SyncCell>, u64)>> {
        syncs
            .iter()
            .zip(values)
            .map(|(sync, &value)| Ok((self.resolve(sync.id())?, value)))
            .collect()
    }

    /// Store `value` and wake every waiter.
    pub fn store(&self, cell: &SyncCell, value: u64) {
        cell.value.store(value, Ordering::SeqCst);
        let _guard = self.signal_lock.lock();
        self.signaled.notify_all();
    }

    /// Store on behalf of a queue.
    pub fn signal(&self, cell: &SyncCell, value: u64) {
        cell.history.lock().push(value);
        self.store(cell, value);
    }

    /// Block until all (or any) cells reach their values.
    pub fn wait(&self, cells: &[(Arc<SyncCell>, u64)], wait_any: bool, timeout: Duration) -> Status {
        let satisfied = || {
            if cells.is_empty() {
                return true;
            }
            let mut reached = cells.iter().map(|(cell, value)| cell.value() >= *value);
            if wait_any {
                reached.any(|r| r)
            } else {
                reached.all(|r| r)
            }
        };

        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.signal_lock.lock();
        loop {
            if satisfied() {
                return Status::Success;
            }
            match deadline {
                Some(deadline) => {
                    if self.signaled.wait_until(&mut guard, deadline).timed_out() {
                        return if satisfied() {
                            Status::Success
                        } else {
                            Status::Timeout
                        };
                    }
                }
                None => self.signaled.wait(&mut guard),
            }
        }
    }

    fn export(&self, cell: Arc<SyncCell>) -> Result<OwnedFd> {
        let name = CString::new("vnstream-sync").map_err(|_| Error::TooManyObjects)?;
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::from(nix::Error::last()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let stat = fstat(fd.as_raw_fd())?;
        self.exports
            .lock()
            .insert((stat.st_dev as u64, stat.st_ino as u64), cell);
        Ok(fd)
    }

    fn import(&self, fd: BorrowedFd<'_>) -> Result<Arc<SyncCell>> {
        let stat = fstat(fd.as_raw_fd()).map_err(|_| Error::InvalidExternalHandle)?;
        self.exports
            .lock()
            .get(&(stat.st_dev as u64, stat.st_ino as u64))
            .cloned()
            .ok_or(Error::InvalidExternalHandle)
    }
}

/// A renderer sync handle. Empty until initialized or imported.
pub struct SimSync {
    id: u32,
    hub: Arc<SyncHub>,
    cell: Mutex<Option<Arc<SyncCell>>>,
}

impl SimSync {
    fn cell(&self) -> Result<Arc<SyncCell>> {
        self.cell
            .lock()
            .clone()
            .ok_or_else(|| Error::DeviceLost(format!("sync {} has no payload", self.id)))
    }
}

impl fmt::Debug for SimSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.cell.lock().as_ref().map(|cell| cell.value());
        f.debug_struct("SimSync")
            .field("id", &self.id)
            .field("value", &value)
            .finish()
    }
}

impl RendererSync for SimSync {
    fn id(&self) -> u32 {
        self.id
    }

    fn init_signaled(&self) -> Result<()> {
        *self.cell.lock() = Some(SyncCell::new(1));
        Ok(())
    }

    fn init_syncobj(&self, fd: BorrowedFd<'_>, _sync_file: bool) -> Result<()> {
        let cell = self.hub.import(fd)?;
        *self.cell.lock() = Some(cell);
        Ok(())
    }

    fn release(&self) {
        *self.cell.lock() = None;
    }

    /// A sync file of an already signaled payload is a fresh signaled
    /// handle; a pending one tracks the payload until it signals.
    fn export_syncobj(&self, sync_file: bool) -> Result<OwnedFd> {
        let cell = self.cell()?;
        if sync_file && cell.value() != 0 {
            return self.hub.export(SyncCell::new(1));
        }
        self.hub.export(cell)
    }

    fn reset(&self, initial_value: u64) -> Result<()> {
        let mut cell = self.cell.lock();
        match cell.as_ref() {
            Some(shared) => self.hub.store(shared, initial_value),
            None => *cell = Some(SyncCell::new(initial_value)),
        }
        Ok(())
    }

    fn read(&self) -> Result<u64> {
        Ok(self.cell()?.value())
    }

    fn write(&self, value: u64) -> Result<()> {
        let cell = self.cell()?;
        self.hub.store(&cell, value);
        Ok(())
    }
}

impl Drop for SimSync {
    fn drop(&mut self) {
        self.hub.syncs.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::thread;

    #[test]
    fn test_wait_wakes_on_store() {
        let hub = SyncHub::new();
        let sync = hub.create(Some(SyncCell::new(0)));
        let cell = hub.resolve(sync.id()).unwrap();

        let waiter = {
            let hub = Arc::clone(&hub);
            let cell = Arc::clone(&cell);
            thread::spawn(move || hub.wait(&[(cell, 3)], false, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(10));
        hub.signal(&cell, 3);
        assert_eq!(waiter.join().unwrap(), Status::Success);
        assert_eq!(cell.history(), vec![3]);
    }

    #[test]
    fn test_wait_times_out() {
        let hub = SyncHub::new();
        let cell = SyncCell::new(0);
        assert_eq!(
            hub.wait(&[(cell, 1)], false, Duration::from_millis(2)),
            Status::Timeout
        );
    }

    #[test]
    fn test_export_import_by_inode() {
        let hub = SyncHub::new();
        let source = hub.create(Some(SyncCell::new(4)));
        let fd = source.export_syncobj(false).unwrap();

        let target = hub.create(None);
        target.init_syncobj(fd.as_fd(), false).unwrap();
        source.write(8).unwrap();
        assert_eq!(target.read().unwrap(), 8);
    }

    #[test]
    fn test_resolve_after_drop_fails() {
        let hub = SyncHub::new();
        let sync = hub.create(Some(SyncCell::new(0)));
        let id = sync.id();
        drop(sync);
        assert!(hub.resolve(id).is_err());
    }
}
