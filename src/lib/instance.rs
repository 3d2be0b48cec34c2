//! # Instance: Submission Pipeline, Reply Channel and Roundtrips
//!
//! An [`Instance`] is one connection to the renderer. It owns the transport
//! ring, the upload buffer used for oversized commands, and the reply buffer
//! the renderer writes synchronous results into.
//!
//! ## Submission Flow
//!
//! ```text
//!  caller ──encode──> CsEncoder
//!                        │
//!            ┌───────────┴──── ring lock ─────────────────────────────┐
//!            │ empty? ──yes──> dropped++                               │
//!            │ commit                                                  │
//!            │ len > direct threshold ? upload, ExecuteCommandStreams  │
//!            │ reply? ──> reply buffer (grow: SetReply + roundtrip)    │
//!            │            Seek(offset) through the ring                │
//!            │ write stream into ring                                  │
//!            │ IDLE status ──> NotifyRing (out of band)                │
//!            └─────────────────────────────────────────────────────────┘
//!                        │
//!            reply? wait for ring head to pass seqno, decode
//! ```
//!
//! Roundtrips bypass the ring entirely: a `WriteRingExtra` sent out of band
//! asks the renderer to store a counter in the ring's extra region once the
//! ring work written before it has been processed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{DebugFlags, StreamConfig};
use crate::cs::{CsAllocator, CsDecoder, CsDescriptor, CsEncoder};
use crate::error::{Error, Result};
use crate::protocol::{
    check_result, Command, CommandStreamDescription, Reply, RingCreateInfo,
    COMMAND_FLAG_GENERATE_REPLY,
};
use crate::renderer::{
    api_version_major, api_version_minor, make_api_version, Renderer, RendererInfo,
    EXT_COMMAND_SERIALIZATION_SPEC_VERSION, MAX_XML_VERSION, MESA_PROTOCOL_SPEC_VERSION,
    MAX_API_VERSION, MIN_RENDERER_VERSION, WIRE_FORMAT_VERSION,
};
use crate::ring::{Ring, RingLayout, RingWaiter};
use crate::shm::Bo;
use crate::stats::{StreamCounters, StreamStats};
use crate::wait;

/// Next id for any object the renderer knows about. Never 0.
pub(crate) fn next_object_id() -> u64 {
    static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where the renderer currently writes replies.
#[derive(Default)]
struct ReplyBuffer {
    bo: Option<Bo>,
    used: usize,
}

impl ReplyBuffer {
    fn size(&self) -> usize {
        self.bo.as_ref().map_or(0, Bo::size)
    }
}

/// Everything guarded by the submission lock.
struct RingState {
    ring: Ring,
    upload: CsEncoder,
    reply: ReplyBuffer,
    /// A NotifyRing failed; send one with the next submission.
    notify_pending: bool,
}

/// Connection to a renderer.
pub struct Instance {
    renderer: Arc<dyn Renderer>,
    config: StreamConfig,
    renderer_info: RendererInfo,
    renderer_version: u32,

    instance_id: u64,
    remote_created: bool,

    ring_id: u64,
    ring: Mutex<RingState>,
    ring_waiter: RingWaiter,

    /// Next roundtrip seqno, serialized separately from ring submission.
    roundtrip_next: Mutex<u32>,

    counters: StreamCounters,
}

impl Instance {
    /// Connect to `renderer` and create the remote instance.
    ///
    /// `api_version` is what the application asks for. On failure everything
    /// set up so far is torn down before the error is returned.
    pub fn new(
        renderer: Arc<dyn Renderer>,
        api_version: u32,
        config: StreamConfig,
    ) -> Result<Arc<Instance>> {
        config.validate()?;

        if api_version_major(api_version) >= 2 {
            return Err(Error::IncompatibleDriver);
        }

        let renderer_info = Self::check_renderer(renderer.as_ref(), &config.debug)?;

        let layout = RingLayout::new(config.ring_buffer_size);
        let ring_bo = renderer.bo_create_cpu(layout.bo_size as usize).map_err(|err| {
            if config.debug.init {
                info!("failed to allocate ring bo: {}", err);
            }
            err
        })?;
        let ring = Ring::new(ring_bo, layout, config.wait_policy);
        let ring_waiter = ring.waiter();
        let ring_id = next_object_id();

        let create_ring = Command::CreateRing {
            ring_id,
            info: RingCreateInfo {
                resource_id: ring.bo().res_id(),
                head_offset: layout.head_offset,
                tail_offset: layout.tail_offset,
                status_offset: layout.status_offset,
                buffer_offset: layout.buffer_offset,
                buffer_size: layout.buffer_size,
                extra_offset: layout.extra_offset,
                extra_size: layout.extra_size,
                size: layout.bo_size as u64,
                idle_timeout_ns: config.ring_idle_timeout.as_nanos() as u64,
            },
        };
        renderer.submit_simple(&create_ring.to_bytes(0))?;

        let upload = CsEncoder::indirect(config.upload_min_size);

        // From here on, dropping `instance` sends DestroyRing.
        let mut instance = Instance {
            renderer,
            renderer_info,
            renderer_version: 0,
            instance_id: next_object_id(),
            remote_created: false,
            ring_id,
            ring: Mutex::new(RingState {
                ring,
                upload,
                reply: ReplyBuffer::default(),
                notify_pending: false,
            }),
            ring_waiter,
            roundtrip_next: Mutex::new(1),
            counters: StreamCounters::default(),
            config,
        };

        if instance.config.debug.init {
            info!(
                "ring {} created: buffer {} bytes, idle timeout {:?}",
                ring_id, layout.buffer_size, instance.config.ring_idle_timeout
            );
        }

        instance.renderer_version = instance.init_version(api_version)?;

        instance.call(&Command::CreateInstance {
            instance_id: instance.instance_id,
            api_version: instance.renderer_version,
        })?;
        instance.remote_created = true;

        Ok(Arc::new(instance))
    }

    fn check_renderer(renderer: &dyn Renderer, debug: &DebugFlags) -> Result<RendererInfo> {
        let mut info = renderer.info().clone();

        if info.wire_format_version != WIRE_FORMAT_VERSION {
            if debug.init {
                info!(
                    "wire format version {} != {}",
                    info.wire_format_version, WIRE_FORMAT_VERSION
                );
            }
            return Err(Error::InitializationFailed(format!(
                "wire format version {} != {}",
                info.wire_format_version, WIRE_FORMAT_VERSION
            )));
        }

        info.xml_version = info.xml_version.min(MAX_XML_VERSION);
        info.ext_command_serialization_spec_version = info
            .ext_command_serialization_spec_version
            .min(EXT_COMMAND_SERIALIZATION_SPEC_VERSION);
        info.mesa_protocol_spec_version = info
            .mesa_protocol_spec_version
            .min(MESA_PROTOCOL_SPEC_VERSION);

        if debug.init {
            info!("connected to renderer");
            info!("wire format version {}", info.wire_format_version);
            info!(
                "xml version {}.{}.{}",
                api_version_major(info.xml_version),
                api_version_minor(info.xml_version),
                info.xml_version & 0xfff
            );
            info!(
                "command serialization spec version {}",
                info.ext_command_serialization_spec_version
            );
            info!("protocol spec version {}", info.mesa_protocol_spec_version);
        }

        Ok(info)
    }

    fn init_version(&self, app_version: u32) -> Result<u32> {
        let reply = self.call(&Command::EnumerateInstanceVersion)?;
        let remote_version = match reply {
            Reply::EnumerateInstanceVersion { api_version, .. } => api_version,
            other => {
                return Err(Error::MalformedStream(format!(
                    "unexpected reply {:?}",
                    other
                )))
            }
        };

        if remote_version < MIN_RENDERER_VERSION {
            if self.config.debug.init {
                info!(
                    "unsupported renderer instance version {}.{}",
                    api_version_major(remote_version),
                    api_version_minor(remote_version)
                );
            }
            return Err(Error::InitializationFailed(format!(
                "renderer instance version {}.{} is too old",
                api_version_major(remote_version),
                api_version_minor(remote_version)
            )));
        }

        let version = app_version.max(MIN_RENDERER_VERSION).min(MAX_API_VERSION);
        if self.config.debug.init {
            info!(
                "instance version {}.{}.{}",
                api_version_major(version),
                api_version_minor(version),
                version & 0xfff
            );
        }
        Ok(version)
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn renderer_info(&self) -> &RendererInfo {
        &self.renderer_info
    }

    /// API version requested from the renderer.
    pub fn renderer_version(&self) -> u32 {
        self.renderer_version
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn id(&self) -> u64 {
        self.instance_id
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot(self.ring_waiter.stall_count())
    }

    /// Ask the renderer to publish a new roundtrip seqno once it has
    /// processed everything written to the ring so far.
    pub fn submit_roundtrip(&self) -> Result<u32> {
        let mut next = self.roundtrip_next.lock();
        let seqno = *next;
        let cmd = Command::WriteRingExtra {
            ring_id: self.ring_id,
            offset: 0,
            value: seqno,
        };
        self.renderer.submit_simple(&cmd.to_bytes(0))?;
        *next = next.wrapping_add(1);
        StreamCounters::bump(&self.counters.roundtrips);
        Ok(seqno)
    }

    /// Wait until the renderer published `seqno` (or something after it).
    pub fn wait_roundtrip(&self, seqno: u32) {
        let extra = self.ring_waiter.extra();
        wait::poll_until(self.config.wait_policy, || {
            wait::seqno_reached(extra.load(Ordering::Acquire), seqno)
        });
    }

    pub fn roundtrip(&self) -> Result<()> {
        let seqno = self.submit_roundtrip()?;
        self.wait_roundtrip(seqno);
        Ok(())
    }

    /// Wait for the renderer to consume everything already in the ring.
    pub fn ring_wait_all(&self) {
        self.ring_waiter.wait_all();
    }

    /// Submit a command, optionally with a reply.
    ///
    /// Returns the decoded reply when one was requested. Result codes are
    /// not checked here; see [`Instance::call`].
    pub fn submit_command(&self, cmd: &Command, want_reply: bool) -> Result<Option<Reply>> {
        let reply_size = if want_reply {
            cmd.reply_size().ok_or_else(|| {
                Error::MalformedStream(format!("{:?} has no reply", cmd.command_type()))
            })?
        } else {
            0
        };
        let flags = if want_reply {
            COMMAND_FLAG_GENERATE_REPLY
        } else {
            0
        };

        let size = cmd.encoded_size();
        let mut cs = CsEncoder::direct(size);
        cs.reserve(size, None)?;
        cmd.encode(&mut cs, flags);

        match self.submit_encoded(&mut cs, reply_size)? {
            Some(bytes) => {
                let mut dec = CsDecoder::new(&bytes);
                Ok(Some(Reply::decode(&mut dec, cmd.command_type())?))
            }
            None => Ok(None),
        }
    }

    /// Synchronous call: submit with a reply and fail on an error result.
    pub fn call(&self, cmd: &Command) -> Result<Reply> {
        let reply = self
            .submit_command(cmd, true)?
            .ok_or_else(|| Error::DeviceLost(format!("{:?} dropped", cmd.command_type())))?;
        check_result(reply.result())?;
        Ok(reply)
    }

    /// Fire-and-forget submission.
    pub fn call_async(&self, cmd: &Command) -> Result<()> {
        self.submit_command(cmd, false).map(|_| ())
    }

    /// Submit an already encoded stream.
    ///
    /// With `reply_size > 0` a reply region of that size is reserved and its
    /// bytes are returned once the renderer has passed the command. An empty
    /// stream is counted as dropped and returns `None`.
    pub fn submit_encoded(&self, cs: &mut CsEncoder, reply_size: usize) -> Result<Option<Vec<u8>>> {
        let mut state = self.ring.lock();

        if cs.is_empty() {
            StreamCounters::bump(&self.counters.commands_dropped);
            trace!("dropping empty command stream");
            return Ok(None);
        }
        cs.commit();

        let (reply, seqno) = match self.submit_locked(&mut state, cs, reply_size) {
            Ok(submitted) => submitted,
            Err(err) => {
                StreamCounters::bump(&self.counters.commands_dropped);
                warn!("command stream dropped: {}", err);
                return Err(err);
            }
        };
        drop(state);

        StreamCounters::bump(&self.counters.commands_submitted);

        match reply {
            Some((bo, offset)) => {
                self.ring_waiter.wait_seqno(seqno);
                Ok(Some(bo.read_vec(offset, reply_size)))
            }
            None => Ok(None),
        }
    }

    fn submit_locked(
        &self,
        state: &mut RingState,
        cs: &CsEncoder,
        reply_size: usize,
    ) -> Result<(Option<(Bo, usize)>, u32)> {
        // Everything that can fail happens before the first ring write.
        let (bytes, bos) = self.prepare_stream_locked(state, cs)?;
        let reply = if reply_size > 0 {
            Some(self.get_reply_bo_locked(state, reply_size)?)
        } else {
            None
        };
        let seqno = self.ring_write_locked(state, &bytes, bos, reply.as_ref().map(|(bo, _)| bo));
        Ok((reply, seqno))
    }

    fn grow_reply_bo_locked(&self, state: &mut RingState, size: usize) -> Result<()> {
        let mut bo_size = match state.reply.size() {
            0 => self.config.reply_min_size,
            current => current,
        };
        while bo_size < size {
            bo_size = bo_size.checked_mul(2).ok_or(Error::OutOfHostMemory)?;
        }

        let bo = self.renderer.bo_create_cpu(bo_size)?;
        debug!(
            "reply buffer {} -> {} bytes (res {})",
            state.reply.size(),
            bo_size,
            bo.res_id()
        );
        state.reply = ReplyBuffer {
            bo: Some(bo),
            used: 0,
        };
        StreamCounters::bump(&self.counters.reply_grows);
        Ok(())
    }

    /// Reserve `size` bytes of reply space and point the renderer at them.
    fn get_reply_bo_locked(&self, state: &mut RingState, size: usize) -> Result<(Bo, usize)> {
        if state.reply.used + size > state.reply.size() {
            self.grow_reply_bo_locked(state, size)?;

            let bo = match &state.reply.bo {
                Some(bo) => bo.clone(),
                None => return Err(Error::OutOfHostMemory),
            };
            let set_reply = Command::SetReplyCommandStream {
                stream: CommandStreamDescription::new(bo.res_id(), 0, bo.size() as u64),
            };
            let mut enc = CsEncoder::direct(set_reply.encoded_size());
            set_reply.encode(&mut enc, 0);
            enc.commit();

            // The renderer must see the new buffer before the ring names it.
            self.roundtrip()?;
            self.ring_submit_locked(state, &enc, None)?;
        }

        // TODO: drop the per-reply seek once replies carry their own offset.
        let offset = state.reply.used;
        let seek = Command::SeekReplyCommandStream {
            position: offset as u64,
        };
        let mut enc = CsEncoder::direct(seek.encoded_size());
        seek.encode(&mut enc, 0);
        enc.commit();
        self.ring_submit_locked(state, &enc, None)?;

        state.reply.used += size;
        match &state.reply.bo {
            Some(bo) => Ok((bo.clone(), offset)),
            None => Err(Error::OutOfHostMemory),
        }
    }

    /// Copy an oversized direct stream into the upload buffer.
    fn upload_locked(&self, state: &mut RingState, cs: &CsEncoder) -> Result<Vec<CsDescriptor>> {
        let bytes = cs.committed_bytes();

        state.upload.reset();
        state.upload.reserve(bytes.len(), Some(self))?;
        state.upload.write_bytes(&bytes);
        state.upload.commit();
        self.wait_roundtrip(state.upload.current_buffer_roundtrip());

        StreamCounters::bump(&self.counters.indirect_uploads);
        trace!("uploaded {} byte command stream", bytes.len());
        Ok(state.upload.descriptors())
    }

    fn ring_submit_locked(
        &self,
        state: &mut RingState,
        cs: &CsEncoder,
        extra_bo: Option<&Bo>,
    ) -> Result<u32> {
        let (bytes, bos) = self.prepare_stream_locked(state, cs)?;
        Ok(self.ring_write_locked(state, &bytes, bos, extra_bo))
    }

    /// The bytes that go into the ring for `cs`, and the buffers they name.
    fn prepare_stream_locked(
        &self,
        state: &mut RingState,
        cs: &CsEncoder,
    ) -> Result<(Vec<u8>, Vec<Bo>)> {
        let direct = cs.committed_len() <= self.config.direct_threshold;

        if direct {
            Ok((cs.committed_bytes(), Vec::with_capacity(1)))
        } else {
            let descs = if cs.is_indirect() {
                cs.descriptors()
            } else {
                self.upload_locked(state, cs)?
            };
            let exec = Command::ExecuteCommandStreams {
                streams: descs
                    .iter()
                    .map(|desc| {
                        CommandStreamDescription::new(
                            desc.bo.res_id(),
                            desc.offset as u64,
                            desc.size as u64,
                        )
                    })
                    .collect(),
                flags: 0,
            };
            let bos: Vec<Bo> = descs.into_iter().map(|desc| desc.bo).collect();
            Ok((exec.to_bytes(0), bos))
        }
    }

    /// Write prepared bytes into the ring and wake the renderer if needed.
    /// Once the bytes are in, the command counts as transmitted.
    fn ring_write_locked(
        &self,
        state: &mut RingState,
        bytes: &[u8],
        mut bos: Vec<Bo>,
        extra_bo: Option<&Bo>,
    ) -> u32 {
        if let Some(bo) = extra_bo {
            bos.push(bo.clone());
        }

        let submitted = state.ring.submit(bytes, &bos);
        if submitted.notify || state.notify_pending {
            let notify = Command::NotifyRing {
                ring_id: self.ring_id,
                seqno: submitted.seqno,
                flags: 0,
            };
            match self.renderer.submit_simple(&notify.to_bytes(0)) {
                Ok(()) => {
                    state.notify_pending = false;
                    StreamCounters::bump(&self.counters.notifies);
                }
                Err(err) => {
                    warn!("failed to notify ring {}: {}", self.ring_id, err);
                    state.notify_pending = true;
                }
            }
        }
        submitted.seqno
    }

    /// Pass `result` through, logging failures when result debugging is on.
    pub(crate) fn log_result<T>(&self, api: &str, result: Result<T>) -> Result<T> {
        if self.config.debug.result {
            if let Err(err) = &result {
                warn!("{} failed: {}", api, err);
            }
        }
        result
    }
}

impl CsAllocator for Instance {
    fn alloc_buffer(&self, size: usize) -> Result<(Bo, u32)> {
        let bo = self.renderer.bo_create_cpu(size)?;
        let roundtrip = self.submit_roundtrip()?;
        Ok((bo, roundtrip))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.remote_created {
            if let Err(err) = self.call(&Command::DestroyInstance {
                instance_id: self.instance_id,
            }) {
                warn!("failed to destroy remote instance: {}", err);
            }
        }

        let destroy = Command::DestroyRing {
            ring_id: self.ring_id,
        };
        if let Err(err) = self.renderer.submit_simple(&destroy.to_bytes(0)) {
            warn!("failed to destroy ring {}: {}", self.ring_id, err);
        }
        debug!("instance {} torn down", self.instance_id);
    }
}

/// Default API version an application gets when it does not care.
pub const DEFAULT_API_VERSION: u32 = make_api_version(1, 3, 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandType, RESULT_SUCCESS};
    use crate::sim::{SimConfig, SimRenderer};

    fn connect(config: StreamConfig) -> (Arc<SimRenderer>, Arc<Instance>) {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let instance = Instance::new(sim.clone(), DEFAULT_API_VERSION, config).unwrap();
        (sim, instance)
    }

    #[test]
    fn test_connect_and_versions() {
        let (_sim, instance) = connect(StreamConfig::default());
        assert_eq!(instance.renderer_version(), DEFAULT_API_VERSION);
        assert_eq!(instance.renderer_info().wire_format_version, WIRE_FORMAT_VERSION);
    }

    #[test]
    fn test_old_app_version_is_raised() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let instance =
            Instance::new(sim, make_api_version(1, 0, 0), StreamConfig::default()).unwrap();
        assert_eq!(instance.renderer_version(), MIN_RENDERER_VERSION);
    }

    #[test]
    fn test_newer_app_version_is_clamped() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let instance =
            Instance::new(sim, make_api_version(1, 4, 0), StreamConfig::default()).unwrap();
        assert_eq!(instance.renderer_version(), MAX_API_VERSION);
    }

    #[test]
    fn test_wire_version_mismatch_fails_init() {
        let sim = SimRenderer::new(SimConfig {
            wire_format_version: WIRE_FORMAT_VERSION + 1,
            ..SimConfig::default()
        })
        .unwrap();
        let err = Instance::new(sim.clone(), DEFAULT_API_VERSION, StreamConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::InitializationFailed(_)));
        assert_eq!(sim.ring_count(), 0);
    }

    #[test]
    fn test_old_renderer_fails_init_and_tears_down_ring() {
        let sim = SimRenderer::new(SimConfig {
            instance_version: make_api_version(1, 0, 0),
            ..SimConfig::default()
        })
        .unwrap();
        let err = Instance::new(sim.clone(), DEFAULT_API_VERSION, StreamConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::InitializationFailed(_)));
        sim.sync_control();
        assert_eq!(sim.ring_count(), 0);
    }

    #[test]
    fn test_incompatible_api_version() {
        let sim = SimRenderer::new(SimConfig::default()).unwrap();
        let err = Instance::new(sim, make_api_version(2, 0, 0), StreamConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::IncompatibleDriver));
    }

    #[test]
    fn test_empty_command_is_dropped() {
        let (_sim, instance) = connect(StreamConfig::default());
        let before = instance.stats();
        let mut cs = CsEncoder::direct(64);
        assert!(instance.submit_encoded(&mut cs, 8).unwrap().is_none());
        let after = instance.stats();
        assert_eq!(after.commands_dropped, before.commands_dropped + 1);
        assert_eq!(after.commands_submitted, before.commands_submitted);
    }

    #[test]
    fn test_roundtrip_advances() {
        let (_sim, instance) = connect(StreamConfig::default());
        let first = instance.submit_roundtrip().unwrap();
        let second = instance.submit_roundtrip().unwrap();
        assert_eq!(second, first.wrapping_add(1));
        instance.wait_roundtrip(second);
        instance.wait_roundtrip(first);
    }

    #[test]
    fn test_reply_buffer_grows_and_stays_byte_exact() {
        let (_sim, instance) = connect(StreamConfig::default());
        let grows_before = instance.stats().reply_grows;

        let small: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        instance
            .call(&Command::WriteBlob {
                blob_id: 1,
                data: small.clone(),
            })
            .unwrap();

        // 2 MiB does not fit the 1 MiB reply buffer.
        let big: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        instance
            .call(&Command::WriteBlob {
                blob_id: 2,
                data: big.clone(),
            })
            .unwrap();

        let first = instance
            .call(&Command::ReadBlob {
                blob_id: 1,
                offset: 0,
                size: small.len() as u64,
            })
            .unwrap();
        let second = instance
            .call(&Command::ReadBlob {
                blob_id: 2,
                offset: 0,
                size: big.len() as u64,
            })
            .unwrap();

        assert_eq!(
            first,
            Reply::ReadBlob {
                result: RESULT_SUCCESS,
                data: small
            }
        );
        match second {
            Reply::ReadBlob { result, data } => {
                assert_eq!(result, RESULT_SUCCESS);
                assert!(data == big);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let stats = instance.stats();
        assert!(stats.reply_grows > grows_before);
        let state = instance.ring.lock();
        assert!(state.reply.size() >= 2 * 1024 * 1024 + 16);
        assert!(state.reply.used <= state.reply.size());
    }

    #[test]
    fn test_large_command_goes_through_upload() {
        let (_sim, instance) = connect(StreamConfig::default());
        let uploads_before = instance.stats().indirect_uploads;

        let data = vec![0x5Au8; 8192];
        instance
            .call(&Command::WriteBlob {
                blob_id: 7,
                data: data.clone(),
            })
            .unwrap();
        assert_eq!(instance.stats().indirect_uploads, uploads_before + 1);

        let reply = instance
            .call(&Command::ReadBlob {
                blob_id: 7,
                offset: 4096,
                size: 16,
            })
            .unwrap();
        assert_eq!(
            reply,
            Reply::ReadBlob {
                result: RESULT_SUCCESS,
                data: vec![0x5A; 16]
            }
        );
    }

    #[test]
    fn test_indirect_encoder_submits_without_upload() {
        let (_sim, instance) = connect(StreamConfig::default());
        let uploads_before = instance.stats().indirect_uploads;

        let cmd = Command::WriteBlob {
            blob_id: 3,
            data: vec![1u8; 4096],
        };
        let mut cs = CsEncoder::indirect(64 * 1024);
        cs.reserve(cmd.encoded_size(), Some(instance.as_ref())).unwrap();
        cmd.encode(&mut cs, 0);
        instance.wait_roundtrip(cs.current_buffer_roundtrip());
        instance.submit_encoded(&mut cs, 0).unwrap();

        let reply = instance
            .call(&Command::ReadBlob {
                blob_id: 3,
                offset: 0,
                size: 4,
            })
            .unwrap();
        assert_eq!(reply.command_type(), CommandType::ReadBlob);
        assert_eq!(instance.stats().indirect_uploads, uploads_before);
    }

    #[test]
    fn test_idle_ring_is_notified() {
        let config = StreamConfig {
            ring_idle_timeout: std::time::Duration::from_millis(1),
            ..StreamConfig::default()
        };
        let (_sim, instance) = connect(config);
        std::thread::sleep(std::time::Duration::from_millis(50));

        instance
            .call_async(&Command::WriteBlob {
                blob_id: 4,
                data: vec![3u8; 16],
            })
            .unwrap();
        instance.ring_wait_all();
        assert!(instance.stats().notifies >= 1);
    }

    #[test]
    fn test_ring_never_overruns_under_load() {
        let config = StreamConfig {
            ring_buffer_size: 4096,
            direct_threshold: 1024,
            ..StreamConfig::default()
        };
        let (_sim, instance) = connect(config);
        for i in 0..500u64 {
            instance
                .call_async(&Command::WriteBlob {
                    blob_id: 100 + i,
                    data: vec![i as u8; 900],
                })
                .unwrap();
        }
        instance.ring_wait_all();
        let reply = instance
            .call(&Command::ReadBlob {
                blob_id: 599,
                offset: 0,
                size: 900,
            })
            .unwrap();
        assert_eq!(
            reply,
            Reply::ReadBlob {
                result: RESULT_SUCCESS,
                data: vec![499u64 as u8; 900]
            }
        );
        assert_eq!(instance.stats().commands_dropped, 0);
    }

    #[test]
    fn test_failed_upload_transmits_nothing() {
        let (sim, instance) = connect(StreamConfig::default());
        instance
            .call(&Command::WriteBlob {
                blob_id: 8,
                data: vec![1u8; 16],
            })
            .unwrap();

        sim.fail_allocations_after(Some(0));
        let before = instance.stats();
        let (cur, used) = {
            let state = instance.ring.lock();
            (state.ring.cur(), state.reply.used)
        };

        let err = instance
            .call(&Command::WriteBlob {
                blob_id: 8,
                data: vec![7u8; 4096],
            })
            .err()
            .unwrap();
        assert!(matches!(err, Error::OutOfDeviceMemory));

        let after = instance.stats();
        assert_eq!(after.commands_dropped, before.commands_dropped + 1);
        assert_eq!(after.commands_submitted, before.commands_submitted);
        let state = instance.ring.lock();
        assert_eq!(state.ring.cur(), cur);
        assert_eq!(state.reply.used, used);
    }

    #[test]
    fn test_failed_notify_still_submits() {
        let config = StreamConfig {
            ring_idle_timeout: std::time::Duration::from_millis(1),
            ..StreamConfig::default()
        };
        let (sim, instance) = connect(config);
        std::thread::sleep(std::time::Duration::from_millis(50));

        sim.fail_notifies(true);
        let before = instance.stats();
        instance
            .call_async(&Command::WriteBlob {
                blob_id: 9,
                data: vec![5u8; 16],
            })
            .unwrap();
        let after = instance.stats();
        assert_eq!(after.commands_submitted, before.commands_submitted + 1);
        assert_eq!(after.commands_dropped, before.commands_dropped);
        assert_eq!(after.notifies, before.notifies);
        assert!(instance.ring.lock().notify_pending);

        // The next submission sends the missed notify.
        sim.fail_notifies(false);
        let reply = instance
            .call(&Command::ReadBlob {
                blob_id: 9,
                offset: 0,
                size: 16,
            })
            .unwrap();
        assert_eq!(
            reply,
            Reply::ReadBlob {
                result: RESULT_SUCCESS,
                data: vec![5u8; 16]
            }
        );
        assert!(instance.stats().notifies > before.notifies);
        assert!(!instance.ring.lock().notify_pending);
    }
}
