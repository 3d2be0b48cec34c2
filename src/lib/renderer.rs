//! # Renderer Interface
//!
//! The renderer is the remote process that owns the real GPU. The driver only
//! talks to it through this trait: buffer object allocation, out-of-band
//! command submission, and sync objects that both sides can observe. The
//! in-process [`crate::sim::SimRenderer`] implements it for tests and the
//! bench binary.

use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, Status};
use crate::shm::Bo;

/// Pack an API version number.
pub const fn make_api_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

pub const fn api_version_major(version: u32) -> u32 {
    version >> 22
}

pub const fn api_version_minor(version: u32) -> u32 {
    (version >> 12) & 0x3ff
}

/// Wire format the driver speaks. The renderer must match exactly.
pub const WIRE_FORMAT_VERSION: u32 = 1;
/// Oldest renderer API version the driver accepts.
pub const MIN_RENDERER_VERSION: u32 = make_api_version(1, 1, 0);
/// Newest API version the driver can expose.
pub const MAX_API_VERSION: u32 = make_api_version(1, 3, 0);
/// Newest protocol description the driver was generated from.
pub const MAX_XML_VERSION: u32 = make_api_version(1, 3, 246);
pub const EXT_COMMAND_SERIALIZATION_SPEC_VERSION: u32 = 1;
pub const MESA_PROTOCOL_SPEC_VERSION: u32 = 1;

/// Capabilities advertised by the renderer at connection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererInfo {
    pub wire_format_version: u32,
    pub xml_version: u32,
    pub ext_command_serialization_spec_version: u32,
    pub mesa_protocol_spec_version: u32,
    /// Number of sync queues the renderer can signal from.
    pub max_sync_queue_count: u32,
}

/// A sync object shared with the renderer: a 64-bit counter the GPU side
/// advances and the driver can read, write, wait on, import and export.
pub trait RendererSync: Send + Sync + fmt::Debug {
    /// Renderer-side handle used to name the sync in submissions.
    fn id(&self) -> u32;
    /// Turn an empty sync into an already signaled one.
    fn init_signaled(&self) -> Result<()>;
    /// Adopt the payload behind `fd`. The descriptor stays owned by the
    /// caller, who closes it once this succeeds.
    fn init_syncobj(&self, fd: BorrowedFd<'_>, sync_file: bool) -> Result<()>;
    /// Drop the payload, leaving an empty sync.
    fn release(&self);
    /// Export the payload. With `sync_file` the handle captures only the
    /// currently pending signal.
    fn export_syncobj(&self, sync_file: bool) -> Result<OwnedFd>;
    fn reset(&self, initial_value: u64) -> Result<()>;
    fn read(&self) -> Result<u64>;
    fn write(&self, value: u64) -> Result<()>;
}

pub type SyncRef = Arc<dyn RendererSync>;

/// Signal operations the renderer performs once a queue reaches them.
#[derive(Debug, Clone, Copy)]
pub struct RendererSubmitBatch<'a> {
    pub sync_queue_index: u32,
    pub vk_queue_id: u64,
    pub syncs: &'a [SyncRef],
    pub sync_values: &'a [u64],
}

#[derive(Debug, Clone, Copy)]
pub struct RendererSubmit<'a> {
    pub bos: &'a [Bo],
    pub batches: &'a [RendererSubmitBatch<'a>],
}

/// `Duration::MAX` waits forever.
#[derive(Debug, Clone, Copy)]
pub struct RendererWait<'a> {
    pub wait_any: bool,
    pub timeout: Duration,
    pub syncs: &'a [SyncRef],
    pub sync_values: &'a [u64],
}

/// The remote side of the connection.
pub trait Renderer: Send + Sync {
    fn info(&self) -> &RendererInfo;

    /// Allocate a CPU-visible buffer object of at least `size` bytes.
    fn bo_create_cpu(&self, size: usize) -> Result<Bo>;

    /// Execute `cs` out of band, bypassing any ring.
    fn submit_simple(&self, cs: &[u8]) -> Result<()>;

    /// Queue sync signals behind the work already submitted to each queue.
    fn submit(&self, submit: &RendererSubmit<'_>) -> Result<()>;

    /// Wait for all (or any) syncs to reach their values.
    fn wait(&self, wait: &RendererWait<'_>) -> Result<Status>;

    /// A plain counter starting at 0.
    fn sync_create_cpu(&self) -> Result<SyncRef>;
    /// A binary sync backing a fence.
    fn sync_create_fence(&self, signaled: bool) -> Result<SyncRef>;
    /// A sync backing a semaphore. Binary semaphores ignore `initial_value`.
    fn sync_create_semaphore(&self, timeline: bool, initial_value: u64) -> Result<SyncRef>;
    /// A sync without payload, to be filled by an import.
    fn sync_create_empty(&self) -> Result<SyncRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_packing() {
        let v = make_api_version(1, 3, 246);
        assert_eq!(api_version_major(v), 1);
        assert_eq!(api_version_minor(v), 3);
        assert_eq!(v & 0xfff, 246);
        assert!(MIN_RENDERER_VERSION < MAX_API_VERSION);
    }
}
