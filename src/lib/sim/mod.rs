//! # In-Process Renderer
//!
//! [`SimRenderer`] stands in for the remote renderer process. Buffer objects
//! are real POSIX shared memory segments mapped twice, once for the driver
//! and once for the renderer side, so every byte crosses the same kind of
//! mapping it would between processes. A worker thread services rings and
//! out-of-band submissions; every remote queue gets its own GPU thread.

mod gpu;
mod sync;
mod worker;

use std::collections::{HashMap, HashSet};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use self::sync::SimSync;

use self::gpu::{GpuJob, GpuQueue, RemoteObjects};
use self::sync::{SyncCell, SyncHub};
use self::worker::{Control, Worker};
use crate::cs::CsDecoder;
use crate::error::{Error, Result, Status};
use crate::protocol::{Command, SubmitBatch};
use crate::renderer::{
    make_api_version, Renderer, RendererInfo, RendererSubmit, RendererWait, SyncRef,
    EXT_COMMAND_SERIALIZATION_SPEC_VERSION, MESA_PROTOCOL_SPEC_VERSION, WIRE_FORMAT_VERSION,
};
use crate::shm::{Bo, SharedMemory, WeakBo};

/// What the simulated renderer advertises and how fast its GPU is.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub wire_format_version: u32,
    /// Reported by `EnumerateInstanceVersion`.
    pub instance_version: u32,
    pub xml_version: u32,
    pub max_sync_queue_count: u32,
    /// Time each submitted batch occupies its queue.
    pub gpu_batch_delay: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            wire_format_version: WIRE_FORMAT_VERSION,
            instance_version: make_api_version(1, 3, 280),
            xml_version: make_api_version(1, 3, 280),
            max_sync_queue_count: 64,
            gpu_batch_delay: Duration::ZERO,
        }
    }
}

/// The renderer's mapping of a driver buffer object.
pub(crate) struct SimResource {
    pub bo: Bo,
    /// The driver's handle. Once it is gone the mapping can go too.
    pub driver: WeakBo,
}

/// Renderer-side tables touched by the worker.
#[derive(Default)]
pub(crate) struct SimState {
    pub resources: HashMap<u32, SimResource>,
    pub instances: HashSet<u64>,
    pub devices: HashSet<u64>,
    pub queues: HashMap<u64, GpuQueue>,
    pub blobs: HashMap<u64, Vec<u8>>,
    /// Batches of the most recent submission per queue.
    pub last_submits: HashMap<u64, Vec<SubmitBatch>>,
}

impl SimState {
    /// Forget mappings whose driver handles were all dropped.
    fn prune_resources(&mut self) {
        self.resources.retain(|_, res| !res.driver.is_dropped());
    }
}

pub(crate) struct SimShared {
    pub config: SimConfig,
    pub hub: Arc<SyncHub>,
    pub state: Mutex<SimState>,
    pub objects: Arc<Mutex<RemoteObjects>>,
    pub ring_count: AtomicUsize,
}

pub struct SimRenderer {
    info: RendererInfo,
    shared: Arc<SimShared>,
    next_res_id: AtomicU32,
    /// Allocations left before `bo_create_cpu` starts failing.
    alloc_budget: Mutex<Option<usize>>,
    fail_notifies: AtomicBool,
    control: Mutex<Sender<Control>>,
    worker: Option<JoinHandle<()>>,
}

impl SimRenderer {
    pub fn new(config: SimConfig) -> Result<Arc<SimRenderer>> {
        let info = RendererInfo {
            wire_format_version: config.wire_format_version,
            xml_version: config.xml_version,
            ext_command_serialization_spec_version: EXT_COMMAND_SERIALIZATION_SPEC_VERSION,
            mesa_protocol_spec_version: MESA_PROTOCOL_SPEC_VERSION,
            max_sync_queue_count: config.max_sync_queue_count,
        };
        let shared = Arc::new(SimShared {
            config,
            hub: SyncHub::new(),
            state: Mutex::new(SimState::default()),
            objects: Arc::new(Mutex::new(RemoteObjects::default())),
            ring_count: AtomicUsize::new(0),
        });

        let (tx, rx) = mpsc::channel();
        let worker = Worker::new(Arc::clone(&shared), rx);
        let handle = thread::Builder::new()
            .name("sim-renderer".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::InitializationFailed(format!("cannot spawn renderer: {}", e)))?;

        Ok(Arc::new(SimRenderer {
            info,
            shared,
            next_res_id: AtomicU32::new(1),
            alloc_budget: Mutex::new(None),
            fail_notifies: AtomicBool::new(false),
            control: Mutex::new(tx),
            worker: Some(handle),
        }))
    }

    fn send(&self, msg: Control) -> Result<()> {
        self.control
            .lock()
            .send(msg)
            .map_err(|_| Error::DeviceLost("renderer worker exited".into()))
    }

    /// Rings the renderer is currently servicing.
    pub fn ring_count(&self) -> usize {
        self.shared.ring_count.load(Ordering::Acquire)
    }

    /// Block until the worker handled everything submitted before this call.
    pub fn sync_control(&self) {
        let (tx, rx) = mpsc::channel();
        if self.send(Control::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Let `count` more buffer allocations succeed, then fail the rest.
    /// `None` lifts the limit.
    pub fn fail_allocations_after(&self, count: Option<usize>) {
        *self.alloc_budget.lock() = count;
    }

    /// Make out-of-band `NotifyRing` submissions fail.
    pub fn fail_notifies(&self, fail: bool) {
        self.fail_notifies.store(fail, Ordering::Release);
    }

    /// Buffer objects the renderer still has mapped.
    pub fn resource_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.prune_resources();
        state.resources.len()
    }

    pub fn device_count(&self) -> usize {
        self.shared.state.lock().devices.len()
    }

    pub fn fence_count(&self) -> usize {
        self.shared.objects.lock().fences.len()
    }

    /// Values queues stored into the sync with renderer id `sync_id`.
    pub fn sync_history(&self, sync_id: u32) -> Vec<u64> {
        self.shared
            .hub
            .resolve(sync_id)
            .map(|cell| cell.history())
            .unwrap_or_default()
    }

    pub fn last_submit(&self, queue_id: u64) -> Option<Vec<SubmitBatch>> {
        self.shared.state.lock().last_submits.get(&queue_id).cloned()
    }

    pub fn executed_batches(&self, queue_id: u64) -> u64 {
        self.shared
            .state
            .lock()
            .queues
            .get(&queue_id)
            .map_or(0, GpuQueue::executed)
    }

    fn new_sync(&self, value: Option<u64>) -> SyncRef {
        self.shared.hub.create(value.map(SyncCell::new))
    }
}

impl Renderer for SimRenderer {
    fn info(&self) -> &RendererInfo {
        &self.info
    }

    fn bo_create_cpu(&self, size: usize) -> Result<Bo> {
        static SEGMENT_SEQ: AtomicU32 = AtomicU32::new(0);

        if let Some(left) = self.alloc_budget.lock().as_mut() {
            if *left == 0 {
                return Err(Error::OutOfDeviceMemory);
            }
            *left -= 1;
        }

        let res_id = self.next_res_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "/vnstream-{}-{}",
            process::id(),
            SEGMENT_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let driver_side = SharedMemory::create(&name, size)?;
        let renderer_side = SharedMemory::open(&name)?;
        let bo = Bo::new(res_id, driver_side);

        let mut state = self.shared.state.lock();
        state.prune_resources();
        state.resources.insert(
            res_id,
            SimResource {
                bo: Bo::new(res_id, renderer_side),
                driver: bo.downgrade(),
            },
        );
        Ok(bo)
    }

    fn submit_simple(&self, cs: &[u8]) -> Result<()> {
        if self.fail_notifies.load(Ordering::Acquire) {
            if let Ok((Command::NotifyRing { ring_id, .. }, _)) =
                Command::decode(&mut CsDecoder::new(cs))
            {
                return Err(Error::DeviceLost(format!("notify for ring {} lost", ring_id)));
            }
        }
        self.send(Control::Execute(cs.to_vec()))
    }

    fn submit(&self, submit: &RendererSubmit<'_>) -> Result<()> {
        for batch in submit.batches {
            if batch.sync_queue_index >= self.info.max_sync_queue_count {
                return Err(Error::DeviceLost(format!(
                    "sync queue {} out of range",
                    batch.sync_queue_index
                )));
            }
            let syncs = self.shared.hub.resolve_all(batch.syncs, batch.sync_values)?;
            let state = self.shared.state.lock();
            let queue = state.queues.get(&batch.vk_queue_id).ok_or_else(|| {
                Error::DeviceLost(format!("unknown queue {}", batch.vk_queue_id))
            })?;
            queue.push(GpuJob::Signal {
                syncs,
                bos: submit.bos.to_vec(),
            })?;
        }
        Ok(())
    }

    fn wait(&self, wait: &RendererWait<'_>) -> Result<Status> {
        let cells = self.shared.hub.resolve_all(wait.syncs, wait.sync_values)?;
        Ok(self.shared.hub.wait(&cells, wait.wait_any, wait.timeout))
    }

    fn sync_create_cpu(&self) -> Result<SyncRef> {
        Ok(self.new_sync(Some(0)))
    }

    fn sync_create_fence(&self, signaled: bool) -> Result<SyncRef> {
        Ok(self.new_sync(Some(signaled as u64)))
    }

    fn sync_create_semaphore(&self, timeline: bool, initial_value: u64) -> Result<SyncRef> {
        Ok(self.new_sync(Some(if timeline { initial_value } else { 0 })))
    }

    fn sync_create_empty(&self) -> Result<SyncRef> {
        Ok(self.new_sync(None))
    }
}

impl Drop for SimRenderer {
    fn drop(&mut self) {
        if self.send(Control::Shutdown).is_err() {
            warn!("renderer worker already gone");
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let queues: Vec<GpuQueue> = self
            .shared
            .state
            .lock()
            .queues
            .drain()
            .map(|(_, queue)| queue)
            .collect();
        debug!("renderer shut down, {} queues retired", queues.len());
    }
}
