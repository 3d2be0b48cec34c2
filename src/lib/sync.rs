//! # Sync Payloads
//!
//! Fences and semaphores do not map one-to-one onto renderer sync objects.
//! Each one carries two payload slots, and exactly one of them is active:
//!
//! ```text
//!              ┌──────────────┐   import (temporary) / WSI signal
//!   create ──> │  permanent   │ ─────────────────────────────┐
//!              └──────────────┘                              v
//!                     ^                              ┌──────────────┐
//!                     └──── reset / WSI consumed ─── │  temporary   │
//!                                                    └──────────────┘
//! ```
//!
//! A slot holds one of four payloads. `DeviceOnly` means only the GPU ever
//! observes the signal (binary semaphores by default). `Sync` is a renderer
//! sync object the driver can read and wait on. `ExternallySignaled` is a
//! placeholder stamped by the presentation path, consumed by the next wait.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use crate::error::{Error, ImportFdError, Result, Status};
use crate::renderer::SyncRef;

/// Kind of OS handle exchanged on import and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    /// Shares the whole payload.
    OpaqueFd,
    /// Captures a single pending signal.
    SyncFile,
}

/// Descriptor import request. `fd` of `None` with a sync file means the
/// signal already happened.
#[derive(Debug)]
pub struct ImportFdInfo {
    pub fd: Option<OwnedFd>,
    pub handle_type: HandleType,
    pub temporary: bool,
}

/// What currently backs a fence or semaphore.
#[derive(Debug, Clone)]
pub enum SyncPayload {
    Invalid,
    DeviceOnly,
    Sync(SyncRef),
    ExternallySignaled,
}

impl SyncPayload {
    /// The renderer sync, for payloads that must have one.
    ///
    /// Panics otherwise: waiting on or exporting a payload without a sync
    /// object is a caller sequencing bug.
    pub fn expect_sync(&self) -> &SyncRef {
        match self {
            SyncPayload::Sync(sync) => sync,
            other => panic!("payload {:?} has no sync object", other),
        }
    }
}

/// Which slot is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSlot {
    Permanent,
    Temporary,
}

/// One payload slot and the renderer sync that imports reinitialize.
#[derive(Debug)]
struct PayloadSlot {
    payload: SyncPayload,
    backing: SyncRef,
}

impl PayloadSlot {
    fn release(&mut self) {
        if let SyncPayload::Sync(sync) = &self.payload {
            sync.release();
        }
        self.payload = SyncPayload::Invalid;
    }

    fn import(&mut self, fd: Option<BorrowedFd<'_>>, sync_file: bool) -> Result<()> {
        self.release();
        match fd {
            Some(fd) => self.backing.init_syncobj(fd, sync_file)?,
            None if sync_file => self.backing.init_signaled()?,
            None => return Err(Error::InvalidExternalHandle),
        }
        self.payload = SyncPayload::Sync(self.backing.clone());
        Ok(())
    }
}

/// Payload state of a fence or semaphore. Callers keep it behind a lock.
#[derive(Debug)]
pub(crate) struct SyncState {
    permanent: PayloadSlot,
    temporary: PayloadSlot,
    active: ActiveSlot,
}

impl SyncState {
    /// `temporary_backing` must be an empty sync.
    pub fn new(permanent: SyncPayload, permanent_backing: SyncRef, temporary_backing: SyncRef) -> Self {
        Self {
            permanent: PayloadSlot {
                payload: permanent,
                backing: permanent_backing,
            },
            temporary: PayloadSlot {
                payload: SyncPayload::Invalid,
                backing: temporary_backing,
            },
            active: ActiveSlot::Permanent,
        }
    }

    pub fn active(&self) -> ActiveSlot {
        self.active
    }

    /// The payload callers see.
    pub fn payload(&self) -> &SyncPayload {
        match self.active {
            ActiveSlot::Permanent => &self.permanent.payload,
            ActiveSlot::Temporary => &self.temporary.payload,
        }
    }

    pub fn permanent(&self) -> &SyncPayload {
        &self.permanent.payload
    }

    pub fn is_externally_signaled(&self) -> bool {
        matches!(self.payload(), SyncPayload::ExternallySignaled)
    }

    /// Stamp the object as signaled by the presentation engine.
    pub fn signal_wsi(&mut self) {
        self.temporary.release();
        self.temporary.payload = SyncPayload::ExternallySignaled;
        self.active = ActiveSlot::Temporary;
    }

    /// Drop any temporary payload and fall back to the permanent one.
    pub fn restore_permanent(&mut self) {
        self.temporary.release();
        self.active = ActiveSlot::Permanent;
    }

    /// Install an imported payload. `fd` is `None` for a sync file that is
    /// already signaled.
    pub fn import(
        &mut self,
        temporary: bool,
        fd: Option<BorrowedFd<'_>>,
        sync_file: bool,
    ) -> Result<()> {
        let (slot, active) = if temporary {
            (&mut self.temporary, ActiveSlot::Temporary)
        } else {
            (&mut self.permanent, ActiveSlot::Permanent)
        };
        slot.import(fd, sync_file)?;
        self.active = active;
        Ok(())
    }

    /// Import from a descriptor. The descriptor is closed on success and
    /// handed back on failure.
    pub fn import_fd(&mut self, info: ImportFdInfo) -> Result<(), ImportFdError> {
        let ImportFdInfo {
            fd,
            handle_type,
            temporary,
        } = info;
        let sync_file = handle_type == HandleType::SyncFile;
        match self.import(temporary, fd.as_ref().map(AsFd::as_fd), sync_file) {
            Ok(()) => Ok(()),
            Err(error) => Err(ImportFdError { error, fd }),
        }
    }

    /// Release both slots. Used on destruction.
    pub fn release_all(&mut self) {
        self.temporary.release();
        self.permanent.release();
        self.active = ActiveSlot::Permanent;
    }
}

/// A timed-out zero-timeout wait is a poll that found nothing.
pub(crate) fn poll_status(timeout: Duration, status: Status) -> Status {
    if status == Status::Timeout && timeout.is_zero() {
        Status::NotReady
    } else {
        status
    }
}
