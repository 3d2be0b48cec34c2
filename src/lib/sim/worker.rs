//! # Renderer Worker
//!
//! One thread plays the remote renderer. It polls every ring it knows about,
//! decodes the command streams it finds, and executes them against the
//! simulated object tables. Out-of-band messages arrive on a channel; before
//! acting on one, the worker drains all ring work that was published ahead
//! of it.
//!
//! ```text
//!   control channel ──> [drain rings] ──> execute
//!   ring tail moved ──> read [head, tail) ──> execute ──> head = tail
//!   ring quiet for idle_timeout ──> status |= IDLE, sleep until notified
//! ```

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::gpu::{GpuJob, GpuQueue};
use super::SimShared;
use crate::cs::CsDecoder;
use crate::error::{Error, Result};
use crate::protocol::{
    error_code, Command, CommandStreamDescription, CommandType, Reply, RingCreateInfo,
    SubmitBatch, COMMAND_FLAG_GENERATE_REPLY, RESULT_ERROR_DEVICE_LOST, RESULT_SUCCESS,
};
use crate::ring::{RingLayout, RingReader};
use crate::shm::Bo;

/// How often a worker with only idle rings looks at them anyway.
const IDLE_RECHECK: Duration = Duration::from_millis(5);
/// Nesting limit for `ExecuteCommandStreams`.
const MAX_STREAM_DEPTH: usize = 4;

pub(crate) enum Control {
    /// A command stream submitted out of band.
    Execute(Vec<u8>),
    /// Acknowledge once everything queued before it was handled.
    Barrier(Sender<()>),
    Shutdown,
}

struct SimRing {
    reader: RingReader,
    idle_timeout: Duration,
    last_activity: Instant,
    idle: bool,
}

struct ReplyStream {
    bo: Bo,
    offset: usize,
    size: usize,
    position: usize,
}

pub(crate) struct Worker {
    shared: Arc<SimShared>,
    control: Receiver<Control>,
    rings: HashMap<u64, SimRing>,
    reply: Option<ReplyStream>,
}

impl Worker {
    pub fn new(shared: Arc<SimShared>, control: Receiver<Control>) -> Self {
        Self {
            shared,
            control,
            rings: HashMap::new(),
            reply: None,
        }
    }

    pub fn run(mut self) {
        debug!("renderer worker started");
        loop {
            let mut progressed = false;
            loop {
                match self.control.try_recv() {
                    Ok(msg) => {
                        progressed = true;
                        if !self.handle_control(msg) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            progressed |= self.service_rings();
            if progressed {
                continue;
            }

            if self.rings.values().all(|ring| ring.idle) {
                match self.control.recv_timeout(IDLE_RECHECK) {
                    Ok(msg) => {
                        if !self.handle_control(msg) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                thread::sleep(Duration::from_micros(10));
            }
        }
    }

    /// Returns false on shutdown.
    fn handle_control(&mut self, msg: Control) -> bool {
        match msg {
            Control::Execute(cs) => {
                self.drain_rings();
                self.execute_stream(&cs, 0);
                true
            }
            Control::Barrier(done) => {
                self.drain_rings();
                let _ = done.send(());
                true
            }
            Control::Shutdown => {
                debug!("renderer worker stopping");
                false
            }
        }
    }

    fn ring_ids(&self) -> Vec<u64> {
        self.rings.keys().copied().collect()
    }

    fn drain_rings(&mut self) {
        for id in self.ring_ids() {
            self.process_ring(id);
        }
    }

    /// Execute everything between head and tail. Returns whether there was
    /// anything.
    fn process_ring(&mut self, ring_id: u64) -> bool {
        let (bytes, end) = match self.rings.get(&ring_id) {
            Some(ring) => {
                let tail = ring.reader.tail();
                if tail == ring.reader.head() {
                    return false;
                }
                (ring.reader.read_to(tail), tail)
            }
            None => return false,
        };

        self.execute_stream(&bytes, 0);

        if let Some(ring) = self.rings.get_mut(&ring_id) {
            ring.reader.set_head(end);
            ring.last_activity = Instant::now();
            if ring.idle {
                ring.reader.set_idle(false);
                ring.idle = false;
            }
        }
        true
    }

    fn service_rings(&mut self) -> bool {
        let mut progressed = false;
        for id in self.ring_ids() {
            if self.process_ring(id) {
                progressed = true;
                continue;
            }
            if let Some(ring) = self.rings.get_mut(&id) {
                if ring.idle || ring.last_activity.elapsed() < ring.idle_timeout {
                    continue;
                }
                ring.reader.set_idle(true);
                ring.idle = true;
                // Work published before the flag flipped carries no notify.
                if ring.reader.tail() != ring.reader.head() {
                    ring.reader.set_idle(false);
                    ring.idle = false;
                } else {
                    trace!("ring {} idle", id);
                }
            }
        }
        progressed
    }

    fn execute_stream(&mut self, bytes: &[u8], depth: usize) {
        let mut dec = CsDecoder::new(bytes);
        while !dec.is_empty() {
            let (cmd, flags) = match Command::decode(&mut dec) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!("dropping rest of command stream: {}", err);
                    return;
                }
            };
            let reply = self.dispatch(cmd, depth);
            if flags & COMMAND_FLAG_GENERATE_REPLY != 0 {
                if let Some(reply) = reply {
                    self.write_reply(&reply);
                }
            }
        }
    }

    fn dispatch(&mut self, cmd: Command, depth: usize) -> Option<Reply> {
        let command = cmd.command_type();
        trace!("executing {:?}", command);

        let result = match cmd {
            Command::CreateRing { ring_id, info } => {
                self.create_ring(ring_id, &info);
                return None;
            }
            Command::DestroyRing { ring_id } => {
                if self.rings.remove(&ring_id).is_some() {
                    self.shared.ring_count.fetch_sub(1, Ordering::AcqRel);
                    debug!("ring {} destroyed", ring_id);
                }
                return None;
            }
            Command::NotifyRing { ring_id, .. } => {
                if let Some(ring) = self.rings.get_mut(&ring_id) {
                    ring.reader.set_idle(false);
                    ring.idle = false;
                    ring.last_activity = Instant::now();
                }
                return None;
            }
            Command::WriteRingExtra {
                ring_id,
                offset,
                value,
            } => {
                if let Some(ring) = self.rings.get(&ring_id) {
                    if offset + 4 <= ring.reader.layout().extra_size as u64 {
                        ring.reader.write_extra(offset as u32, value);
                    } else {
                        warn!("ring {}: extra offset {} out of range", ring_id, offset);
                    }
                }
                return None;
            }
            Command::SetReplyCommandStream { stream } => {
                self.set_reply_stream(&stream);
                return None;
            }
            Command::SeekReplyCommandStream { position } => {
                if let Some(reply) = &mut self.reply {
                    reply.position = position as usize;
                }
                return None;
            }
            Command::ExecuteCommandStreams { streams, .. } => {
                self.execute_indirect(&streams, depth);
                return None;
            }
            Command::EnumerateInstanceVersion => {
                return Some(Reply::EnumerateInstanceVersion {
                    result: RESULT_SUCCESS,
                    api_version: self.shared.config.instance_version,
                });
            }
            Command::ReadBlob {
                blob_id,
                offset,
                size,
            } => return Some(self.read_blob(blob_id, offset, size)),
            other => self.dispatch_object(other),
        };

        let result = match result {
            Ok(()) => RESULT_SUCCESS,
            Err(err) => {
                debug!("{:?} failed: {}", command, err);
                error_code(&err)
            }
        };
        Some(Reply::Result { command, result })
    }

    fn dispatch_object(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::CreateInstance { instance_id, .. } => {
                self.shared.state.lock().instances.insert(instance_id);
            }
            Command::DestroyInstance { instance_id } => {
                self.shared.state.lock().instances.remove(&instance_id);
            }
            Command::CreateDevice { device_id, .. } => {
                self.shared.state.lock().devices.insert(device_id);
            }
            Command::DestroyDevice { device_id } => {
                let retired: Vec<GpuQueue> = {
                    let mut state = self.shared.state.lock();
                    state.devices.remove(&device_id);
                    let ids: Vec<u64> = state
                        .queues
                        .iter()
                        .filter(|(_, queue)| queue.device_id() == device_id)
                        .map(|(id, _)| *id)
                        .collect();
                    ids.iter().filter_map(|id| state.queues.remove(id)).collect()
                };
                // Joining waits for queued work, which must not hold the lock.
                drop(retired);
            }
            Command::GetDeviceQueue2 {
                device_id,
                queue_id,
                ..
            } => {
                if !self.shared.state.lock().devices.contains(&device_id) {
                    return Err(Error::DeviceLost(format!("unknown device {}", device_id)));
                }
                let queue = GpuQueue::spawn(
                    queue_id,
                    device_id,
                    self.shared.config.gpu_batch_delay,
                    Arc::clone(&self.shared.objects),
                    Arc::clone(&self.shared.hub),
                )?;
                self.shared.state.lock().queues.insert(queue_id, queue);
            }
            Command::CreateFence {
                fence_id, signaled, ..
            } => {
                self.shared.objects.lock().fences.insert(fence_id, signaled);
            }
            Command::DestroyFence { fence_id, .. } => {
                self.shared.objects.lock().fences.remove(&fence_id);
            }
            Command::ResetFences { fence_ids, .. } => {
                let mut objects = self.shared.objects.lock();
                for id in fence_ids {
                    if let Some(signaled) = objects.fences.get_mut(&id) {
                        *signaled = false;
                    }
                }
            }
            Command::CreateSemaphore {
                semaphore_id,
                initial_value,
                ..
            } => {
                self.shared
                    .objects
                    .lock()
                    .semaphores
                    .insert(semaphore_id, initial_value);
            }
            Command::DestroySemaphore { semaphore_id, .. } => {
                self.shared.objects.lock().semaphores.remove(&semaphore_id);
            }
            Command::SignalSemaphore {
                semaphore_id,
                value,
                ..
            } => {
                if let Some(current) = self.shared.objects.lock().semaphores.get_mut(&semaphore_id) {
                    *current = value;
                }
            }
            Command::QueueSubmit {
                queue_id,
                batches,
                fence_id,
            }
            | Command::QueueBindSparse {
                queue_id,
                batches,
                fence_id,
            } => self.queue_submit(queue_id, batches, fence_id)?,
            Command::WriteBlob { blob_id, data } => {
                self.shared.state.lock().blobs.insert(blob_id, data);
            }
            other => {
                return Err(Error::MalformedStream(format!(
                    "{:?} is not an object command",
                    other.command_type()
                )))
            }
        }
        Ok(())
    }

    fn queue_submit(&mut self, queue_id: u64, batches: Vec<SubmitBatch>, fence_id: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        let queue = state
            .queues
            .get(&queue_id)
            .ok_or_else(|| Error::DeviceLost(format!("unknown queue {}", queue_id)))?;
        for batch in &batches {
            queue.push(GpuJob::Execute(batch.clone()))?;
        }
        if fence_id != 0 {
            queue.push(GpuJob::SignalFence(fence_id))?;
        }
        state.last_submits.insert(queue_id, batches);
        Ok(())
    }

    fn read_blob(&self, blob_id: u64, offset: u64, size: u64) -> Reply {
        let state = self.shared.state.lock();
        let range = offset
            .checked_add(size)
            .map(|end| offset as usize..end as usize);
        match (state.blobs.get(&blob_id), range) {
            (Some(data), Some(range)) if range.end <= data.len() => Reply::ReadBlob {
                result: RESULT_SUCCESS,
                data: data[range].to_vec(),
            },
            _ => Reply::ReadBlob {
                result: RESULT_ERROR_DEVICE_LOST,
                data: vec![0; size as usize],
            },
        }
    }

    fn resource(&self, res_id: u32) -> Option<Bo> {
        self.shared
            .state
            .lock()
            .resources
            .get(&res_id)
            .map(|res| res.bo.clone())
    }

    fn create_ring(&mut self, ring_id: u64, info: &RingCreateInfo) {
        if !info.buffer_size.is_power_of_two() {
            warn!("ring {}: buffer size {} is not a power of two", ring_id, info.buffer_size);
            return;
        }
        let layout = RingLayout::new(info.buffer_size);
        let matches = layout.head_offset == info.head_offset
            && layout.tail_offset == info.tail_offset
            && layout.status_offset == info.status_offset
            && layout.buffer_offset == info.buffer_offset
            && layout.extra_offset == info.extra_offset
            && layout.extra_size == info.extra_size;
        if !matches {
            warn!("ring {}: unsupported layout {:?}", ring_id, info);
            return;
        }
        let bo = match self.resource(info.resource_id) {
            Some(bo) if bo.size() >= layout.bo_size as usize => bo,
            _ => {
                warn!("ring {}: bad resource {}", ring_id, info.resource_id);
                return;
            }
        };

        self.rings.insert(
            ring_id,
            SimRing {
                reader: RingReader::new(bo, layout),
                idle_timeout: Duration::from_nanos(info.idle_timeout_ns),
                last_activity: Instant::now(),
                idle: false,
            },
        );
        self.shared.ring_count.fetch_add(1, Ordering::AcqRel);
        debug!("ring {} created over resource {}", ring_id, info.resource_id);
    }

    fn set_reply_stream(&mut self, stream: &CommandStreamDescription) {
        match self.resource(stream.resource_id) {
            Some(bo) if stream.offset + stream.size <= bo.size() as u64 => {
                self.reply = Some(ReplyStream {
                    bo,
                    offset: stream.offset as usize,
                    size: stream.size as usize,
                    position: 0,
                });
            }
            _ => warn!("bad reply stream resource {}", stream.resource_id),
        }
    }

    fn write_reply(&mut self, reply: &Reply) {
        let Some(stream) = &mut self.reply else {
            warn!("{:?} reply without a reply stream", reply.command_type());
            return;
        };
        let bytes = reply.to_bytes();
        if stream.position + bytes.len() > stream.size {
            warn!(
                "{:?} reply of {} bytes overflows reply stream at {}",
                reply.command_type(),
                bytes.len(),
                stream.position
            );
            return;
        }
        stream.bo.write_bytes(stream.offset + stream.position, &bytes);
        stream.position += bytes.len();
    }

    fn execute_indirect(&mut self, streams: &[CommandStreamDescription], depth: usize) {
        if depth >= MAX_STREAM_DEPTH {
            warn!("command streams nested too deep");
            return;
        }
        for stream in streams {
            let bytes = match self.resource(stream.resource_id) {
                Some(bo) if stream.offset + stream.size <= bo.size() as u64 => {
                    bo.read_vec(stream.offset as usize, stream.size as usize)
                }
                _ => {
                    warn!(
                        "{:?}: bad resource {}",
                        CommandType::ExecuteCommandStreams,
                        stream.resource_id
                    );
                    continue;
                }
            };
            self.execute_stream(&bytes, depth + 1);
        }
    }
}
