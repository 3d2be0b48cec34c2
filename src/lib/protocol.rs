//! # Wire Protocol
//!
//! Every command is a header followed by its arguments, all little-endian
//! and 4-byte aligned:
//!
//! ```text
//! +--------------+--------------+---------------------------+
//! | type (u32)   | flags (u32)  | arguments ...             |
//! +--------------+--------------+---------------------------+
//! ```
//!
//! With `COMMAND_FLAG_GENERATE_REPLY` set, the renderer writes a reply at the
//! current reply-stream position. Replies start with the command type and a
//! result code.
//!
//! Command types below 100 mirror API entry points. The 100+ range is the
//! transport's own control plane (rings, reply stream, indirect execution).

use bytemuck::{Pod, Zeroable};

use crate::cs::{padded, CsDecoder, CsEncoder};
use crate::error::{Error, Result};

/// Ask the renderer to write a reply for this command.
pub const COMMAND_FLAG_GENERATE_REPLY: u32 = 1 << 0;

pub const COMMAND_HEADER_SIZE: usize = 8;

pub const RESULT_SUCCESS: i32 = 0;
pub const RESULT_NOT_READY: i32 = 1;
pub const RESULT_TIMEOUT: i32 = 2;
pub const RESULT_ERROR_OUT_OF_HOST_MEMORY: i32 = -1;
pub const RESULT_ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
pub const RESULT_ERROR_INITIALIZATION_FAILED: i32 = -3;
pub const RESULT_ERROR_DEVICE_LOST: i32 = -4;

/// Map a remote result code to the crate's error type.
pub fn check_result(code: i32) -> Result<()> {
    match code {
        RESULT_SUCCESS | RESULT_NOT_READY | RESULT_TIMEOUT => Ok(()),
        RESULT_ERROR_OUT_OF_HOST_MEMORY => Err(Error::OutOfHostMemory),
        RESULT_ERROR_OUT_OF_DEVICE_MEMORY => Err(Error::OutOfDeviceMemory),
        RESULT_ERROR_INITIALIZATION_FAILED => {
            Err(Error::InitializationFailed("renderer reported failure".into()))
        }
        RESULT_ERROR_DEVICE_LOST => Err(Error::DeviceLost("renderer reported loss".into())),
        other => Err(Error::DeviceLost(format!("unknown result code {}", other))),
    }
}

/// Inverse of [`check_result`], used by the renderer side.
pub fn error_code(err: &Error) -> i32 {
    match err {
        Error::OutOfHostMemory | Error::TooManyObjects => RESULT_ERROR_OUT_OF_HOST_MEMORY,
        Error::OutOfDeviceMemory | Error::Shm(_) => RESULT_ERROR_OUT_OF_DEVICE_MEMORY,
        Error::InitializationFailed(_) | Error::IncompatibleDriver => {
            RESULT_ERROR_INITIALIZATION_FAILED
        }
        _ => RESULT_ERROR_DEVICE_LOST,
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    CreateInstance = 0,
    DestroyInstance = 1,
    EnumerateInstanceVersion = 2,
    CreateDevice = 3,
    DestroyDevice = 4,
    GetDeviceQueue2 = 5,
    CreateFence = 6,
    DestroyFence = 7,
    ResetFences = 8,
    CreateSemaphore = 9,
    DestroySemaphore = 10,
    SignalSemaphore = 11,
    QueueSubmit = 12,
    QueueBindSparse = 13,
    WriteBlob = 14,
    ReadBlob = 15,

    CreateRing = 100,
    DestroyRing = 101,
    NotifyRing = 102,
    WriteRingExtra = 103,
    SetReplyCommandStream = 104,
    SeekReplyCommandStream = 105,
    ExecuteCommandStreams = 106,
}

impl CommandType {
    /// Control commands never produce replies.
    pub fn is_control(self) -> bool {
        self as u32 >= 100
    }
}

impl TryFrom<u32> for CommandType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        use CommandType::*;
        Ok(match value {
            0 => CreateInstance,
            1 => DestroyInstance,
            2 => EnumerateInstanceVersion,
            3 => CreateDevice,
            4 => DestroyDevice,
            5 => GetDeviceQueue2,
            6 => CreateFence,
            7 => DestroyFence,
            8 => ResetFences,
            9 => CreateSemaphore,
            10 => DestroySemaphore,
            11 => SignalSemaphore,
            12 => QueueSubmit,
            13 => QueueBindSparse,
            14 => WriteBlob,
            15 => ReadBlob,
            100 => CreateRing,
            101 => DestroyRing,
            102 => NotifyRing,
            103 => WriteRingExtra,
            104 => SetReplyCommandStream,
            105 => SeekReplyCommandStream,
            106 => ExecuteCommandStreams,
            other => {
                return Err(Error::MalformedStream(format!(
                    "unknown command type {}",
                    other
                )))
            }
        })
    }
}

/// Ring description sent once at connection setup.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RingCreateInfo {
    pub resource_id: u32,
    pub head_offset: u32,
    pub tail_offset: u32,
    pub status_offset: u32,
    pub buffer_offset: u32,
    pub buffer_size: u32,
    pub extra_offset: u32,
    pub extra_size: u32,
    pub size: u64,
    pub idle_timeout_ns: u64,
}

/// A byte range of a buffer object, as the renderer addresses it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CommandStreamDescription {
    pub resource_id: u32,
    pub _pad: u32,
    pub offset: u64,
    pub size: u64,
}

impl CommandStreamDescription {
    pub fn new(resource_id: u32, offset: u64, size: u64) -> Self {
        Self {
            resource_id,
            _pad: 0,
            offset,
            size,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct QueueCreateInfo {
    pub family_index: u32,
    pub queue_count: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SemaphoreValue {
    pub semaphore_id: u64,
    /// Ignored for binary semaphores.
    pub value: u64,
}

/// One batch of a queue submission as the renderer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitBatch {
    pub wait_semaphores: Vec<SemaphoreValue>,
    pub command_buffer_count: u32,
    pub signal_semaphores: Vec<SemaphoreValue>,
}

impl SubmitBatch {
    fn encoded_size(&self) -> usize {
        4 + 16 * self.wait_semaphores.len() + 4 + 4 + 16 * self.signal_semaphores.len()
    }

    fn encode(&self, enc: &mut CsEncoder) {
        enc.write_u32(self.wait_semaphores.len() as u32);
        for wait in &self.wait_semaphores {
            enc.write_pod(wait);
        }
        enc.write_u32(self.command_buffer_count);
        enc.write_u32(self.signal_semaphores.len() as u32);
        for signal in &self.signal_semaphores {
            enc.write_pod(signal);
        }
    }

    fn decode(dec: &mut CsDecoder<'_>) -> Result<Self> {
        let wait_count = dec.read_count(16)?;
        let wait_semaphores = (0..wait_count)
            .map(|_| dec.read_pod())
            .collect::<Result<Vec<_>>>()?;
        let command_buffer_count = dec.read_u32()?;
        let signal_count = dec.read_count(16)?;
        let signal_semaphores = (0..signal_count)
            .map(|_| dec.read_pod())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            wait_semaphores,
            command_buffer_count,
            signal_semaphores,
        })
    }
}

/// A command in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateInstance {
        instance_id: u64,
        api_version: u32,
    },
    DestroyInstance {
        instance_id: u64,
    },
    EnumerateInstanceVersion,
    CreateDevice {
        instance_id: u64,
        device_id: u64,
        queue_infos: Vec<QueueCreateInfo>,
    },
    DestroyDevice {
        device_id: u64,
    },
    GetDeviceQueue2 {
        device_id: u64,
        family_index: u32,
        queue_index: u32,
        flags: u32,
        queue_id: u64,
    },
    CreateFence {
        device_id: u64,
        fence_id: u64,
        signaled: bool,
    },
    DestroyFence {
        device_id: u64,
        fence_id: u64,
    },
    ResetFences {
        device_id: u64,
        fence_ids: Vec<u64>,
    },
    CreateSemaphore {
        device_id: u64,
        semaphore_id: u64,
        timeline: bool,
        initial_value: u64,
    },
    DestroySemaphore {
        device_id: u64,
        semaphore_id: u64,
    },
    SignalSemaphore {
        device_id: u64,
        semaphore_id: u64,
        value: u64,
    },
    QueueSubmit {
        queue_id: u64,
        batches: Vec<SubmitBatch>,
        /// 0 when no fence is attached.
        fence_id: u64,
    },
    QueueBindSparse {
        queue_id: u64,
        batches: Vec<SubmitBatch>,
        fence_id: u64,
    },
    WriteBlob {
        blob_id: u64,
        data: Vec<u8>,
    },
    ReadBlob {
        blob_id: u64,
        offset: u64,
        size: u64,
    },

    CreateRing {
        ring_id: u64,
        info: RingCreateInfo,
    },
    DestroyRing {
        ring_id: u64,
    },
    NotifyRing {
        ring_id: u64,
        seqno: u32,
        flags: u32,
    },
    WriteRingExtra {
        ring_id: u64,
        offset: u64,
        value: u32,
    },
    SetReplyCommandStream {
        stream: CommandStreamDescription,
    },
    SeekReplyCommandStream {
        position: u64,
    },
    ExecuteCommandStreams {
        streams: Vec<CommandStreamDescription>,
        flags: u32,
    },
}

fn batches_size(batches: &[SubmitBatch]) -> usize {
    4 + batches.iter().map(SubmitBatch::encoded_size).sum::<usize>()
}

fn encode_batches(enc: &mut CsEncoder, batches: &[SubmitBatch]) {
    enc.write_u32(batches.len() as u32);
    for batch in batches {
        batch.encode(enc);
    }
}

fn decode_batches(dec: &mut CsDecoder<'_>) -> Result<Vec<SubmitBatch>> {
    let count = dec.read_count(12)?;
    (0..count).map(|_| SubmitBatch::decode(dec)).collect()
}

fn read_bool(dec: &mut CsDecoder<'_>) -> Result<bool> {
    Ok(dec.read_u32()? != 0)
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::CreateInstance { .. } => CommandType::CreateInstance,
            Command::DestroyInstance { .. } => CommandType::DestroyInstance,
            Command::EnumerateInstanceVersion => CommandType::EnumerateInstanceVersion,
            Command::CreateDevice { .. } => CommandType::CreateDevice,
            Command::DestroyDevice { .. } => CommandType::DestroyDevice,
            Command::GetDeviceQueue2 { .. } => CommandType::GetDeviceQueue2,
            Command::CreateFence { .. } => CommandType::CreateFence,
            Command::DestroyFence { .. } => CommandType::DestroyFence,
            Command::ResetFences { .. } => CommandType::ResetFences,
            Command::CreateSemaphore { .. } => CommandType::CreateSemaphore,
            Command::DestroySemaphore { .. } => CommandType::DestroySemaphore,
            Command::SignalSemaphore { .. } => CommandType::SignalSemaphore,
            Command::QueueSubmit { .. } => CommandType::QueueSubmit,
            Command::QueueBindSparse { .. } => CommandType::QueueBindSparse,
            Command::WriteBlob { .. } => CommandType::WriteBlob,
            Command::ReadBlob { .. } => CommandType::ReadBlob,
            Command::CreateRing { .. } => CommandType::CreateRing,
            Command::DestroyRing { .. } => CommandType::DestroyRing,
            Command::NotifyRing { .. } => CommandType::NotifyRing,
            Command::WriteRingExtra { .. } => CommandType::WriteRingExtra,
            Command::SetReplyCommandStream { .. } => CommandType::SetReplyCommandStream,
            Command::SeekReplyCommandStream { .. } => CommandType::SeekReplyCommandStream,
            Command::ExecuteCommandStreams { .. } => CommandType::ExecuteCommandStreams,
        }
    }

    /// Encoded size including the header.
    pub fn encoded_size(&self) -> usize {
        let args = match self {
            Command::CreateInstance { .. } => 8 + 4,
            Command::DestroyInstance { .. } => 8,
            Command::EnumerateInstanceVersion => 0,
            Command::CreateDevice { queue_infos, .. } => 8 + 8 + 4 + 12 * queue_infos.len(),
            Command::DestroyDevice { .. } => 8,
            Command::GetDeviceQueue2 { .. } => 8 + 4 + 4 + 4 + 8,
            Command::CreateFence { .. } => 8 + 8 + 4,
            Command::DestroyFence { .. } => 8 + 8,
            Command::ResetFences { fence_ids, .. } => 8 + 4 + 8 * fence_ids.len(),
            Command::CreateSemaphore { .. } => 8 + 8 + 4 + 8,
            Command::DestroySemaphore { .. } => 8 + 8,
            Command::SignalSemaphore { .. } => 8 + 8 + 8,
            Command::QueueSubmit { batches, .. } | Command::QueueBindSparse { batches, .. } => {
                8 + batches_size(batches) + 8
            }
            Command::WriteBlob { data, .. } => 8 + 8 + padded(data.len()),
            Command::ReadBlob { .. } => 8 + 8 + 8,
            Command::CreateRing { .. } => 8 + std::mem::size_of::<RingCreateInfo>(),
            Command::DestroyRing { .. } => 8,
            Command::NotifyRing { .. } => 8 + 4 + 4,
            Command::WriteRingExtra { .. } => 8 + 8 + 4,
            Command::SetReplyCommandStream { .. } => {
                std::mem::size_of::<CommandStreamDescription>()
            }
            Command::SeekReplyCommandStream { .. } => 8,
            Command::ExecuteCommandStreams { streams, .. } => {
                4 + std::mem::size_of::<CommandStreamDescription>() * streams.len() + 4
            }
        };
        COMMAND_HEADER_SIZE + args
    }

    /// Size of the reply this command produces when asked for one.
    pub fn reply_size(&self) -> Option<usize> {
        match self {
            cmd if cmd.command_type().is_control() => None,
            Command::EnumerateInstanceVersion => Some(4 + 4 + 4),
            Command::ReadBlob { size, .. } => Some(4 + 4 + 8 + padded(*size as usize)),
            _ => Some(4 + 4),
        }
    }

    /// Append the command. The caller reserved `encoded_size()` bytes.
    pub fn encode(&self, enc: &mut CsEncoder, flags: u32) {
        enc.write_u32(self.command_type() as u32);
        enc.write_u32(flags);
        match self {
            Command::CreateInstance {
                instance_id,
                api_version,
            } => {
                enc.write_u64(*instance_id);
                enc.write_u32(*api_version);
            }
            Command::DestroyInstance { instance_id } => enc.write_u64(*instance_id),
            Command::EnumerateInstanceVersion => {}
            Command::CreateDevice {
                instance_id,
                device_id,
                queue_infos,
            } => {
                enc.write_u64(*instance_id);
                enc.write_u64(*device_id);
                enc.write_u32(queue_infos.len() as u32);
                for info in queue_infos {
                    enc.write_pod(info);
                }
            }
            Command::DestroyDevice { device_id } => enc.write_u64(*device_id),
            Command::GetDeviceQueue2 {
                device_id,
                family_index,
                queue_index,
                flags,
                queue_id,
            } => {
                enc.write_u64(*device_id);
                enc.write_u32(*family_index);
                enc.write_u32(*queue_index);
                enc.write_u32(*flags);
                enc.write_u64(*queue_id);
            }
            Command::CreateFence {
                device_id,
                fence_id,
                signaled,
            } => {
                enc.write_u64(*device_id);
                enc.write_u64(*fence_id);
                enc.write_u32(*signaled as u32);
            }
            Command::DestroyFence {
                device_id,
                fence_id,
            } => {
                enc.write_u64(*device_id);
                enc.write_u64(*fence_id);
            }
            Command::ResetFences {
                device_id,
                fence_ids,
            } => {
                enc.write_u64(*device_id);
                enc.write_u32(fence_ids.len() as u32);
                for id in fence_ids {
                    enc.write_u64(*id);
                }
            }
            Command::CreateSemaphore {
                device_id,
                semaphore_id,
                timeline,
                initial_value,
            } => {
                enc.write_u64(*device_id);
                enc.write_u64(*semaphore_id);
                enc.write_u32(*timeline as u32);
                enc.write_u64(*initial_value);
            }
            Command::DestroySemaphore {
                device_id,
                semaphore_id,
            } => {
                enc.write_u64(*device_id);
                enc.write_u64(*semaphore_id);
            }
            Command::SignalSemaphore {
                device_id,
                semaphore_id,
                value,
            } => {
                enc.write_u64(*device_id);
                enc.write_u64(*semaphore_id);
                enc.write_u64(*value);
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
            } => {
                enc.write_u64(*queue_id);
                encode_batches(enc, batches);
                enc.write_u64(*fence_id);
            }
            Command::WriteBlob { blob_id, data } => {
                enc.write_u64(*blob_id);
                enc.write_blob(data);
            }
            Command::ReadBlob {
                blob_id,
                offset,
                size,
            } => {
                enc.write_u64(*blob_id);
                enc.write_u64(*offset);
                enc.write_u64(*size);
            }
            Command::CreateRing { ring_id, info } => {
                enc.write_u64(*ring_id);
                enc.write_pod(info);
            }
            Command::DestroyRing { ring_id } => enc.write_u64(*ring_id),
            Command::NotifyRing {
                ring_id,
                seqno,
                flags,
            } => {
                enc.write_u64(*ring_id);
                enc.write_u32(*seqno);
                enc.write_u32(*flags);
            }
            Command::WriteRingExtra {
                ring_id,
                offset,
                value,
            } => {
                enc.write_u64(*ring_id);
                enc.write_u64(*offset);
                enc.write_u32(*value);
            }
            Command::SetReplyCommandStream { stream } => enc.write_pod(stream),
            Command::SeekReplyCommandStream { position } => enc.write_u64(*position),
            Command::ExecuteCommandStreams { streams, flags } => {
                enc.write_u32(streams.len() as u32);
                for stream in streams {
                    enc.write_pod(stream);
                }
                enc.write_u32(*flags);
            }
        }
    }

    /// Encode into a standalone buffer, for out-of-band submission.
    pub fn to_bytes(&self, flags: u32) -> Vec<u8> {
        let mut enc = CsEncoder::direct(self.encoded_size());
        self.encode(&mut enc, flags);
        enc.commit();
        enc.committed_bytes()
    }

    /// Decode the next command, returning it with its header flags.
    pub fn decode(dec: &mut CsDecoder<'_>) -> Result<(Command, u32)> {
        let cmd_type = CommandType::try_from(dec.read_u32()?)?;
        let flags = dec.read_u32()?;
        let cmd = match cmd_type {
            CommandType::CreateInstance => Command::CreateInstance {
                instance_id: dec.read_u64()?,
                api_version: dec.read_u32()?,
            },
            CommandType::DestroyInstance => Command::DestroyInstance {
                instance_id: dec.read_u64()?,
            },
            CommandType::EnumerateInstanceVersion => Command::EnumerateInstanceVersion,
            CommandType::CreateDevice => {
                let instance_id = dec.read_u64()?;
                let device_id = dec.read_u64()?;
                let count = dec.read_count(12)?;
                let queue_infos = (0..count)
                    .map(|_| dec.read_pod())
                    .collect::<Result<Vec<_>>>()?;
                Command::CreateDevice {
                    instance_id,
                    device_id,
                    queue_infos,
                }
            }
            CommandType::DestroyDevice => Command::DestroyDevice {
                device_id: dec.read_u64()?,
            },
            CommandType::GetDeviceQueue2 => Command::GetDeviceQueue2 {
                device_id: dec.read_u64()?,
                family_index: dec.read_u32()?,
                queue_index: dec.read_u32()?,
                flags: dec.read_u32()?,
                queue_id: dec.read_u64()?,
            },
            CommandType::CreateFence => Command::CreateFence {
                device_id: dec.read_u64()?,
                fence_id: dec.read_u64()?,
                signaled: read_bool(dec)?,
            },
            CommandType::DestroyFence => Command::DestroyFence {
                device_id: dec.read_u64()?,
                fence_id: dec.read_u64()?,
            },
            CommandType::ResetFences => {
                let device_id = dec.read_u64()?;
                let count = dec.read_count(8)?;
                let fence_ids = (0..count)
                    .map(|_| dec.read_u64())
                    .collect::<Result<Vec<_>>>()?;
                Command::ResetFences {
                    device_id,
                    fence_ids,
                }
            }
            CommandType::CreateSemaphore => Command::CreateSemaphore {
                device_id: dec.read_u64()?,
                semaphore_id: dec.read_u64()?,
                timeline: read_bool(dec)?,
                initial_value: dec.read_u64()?,
            },
            CommandType::DestroySemaphore => Command::DestroySemaphore {
                device_id: dec.read_u64()?,
                semaphore_id: dec.read_u64()?,
            },
            CommandType::SignalSemaphore => Command::SignalSemaphore {
                device_id: dec.read_u64()?,
                semaphore_id: dec.read_u64()?,
                value: dec.read_u64()?,
            },
            CommandType::QueueSubmit => Command::QueueSubmit {
                queue_id: dec.read_u64()?,
                batches: decode_batches(dec)?,
                fence_id: dec.read_u64()?,
            },
            CommandType::QueueBindSparse => Command::QueueBindSparse {
                queue_id: dec.read_u64()?,
                batches: decode_batches(dec)?,
                fence_id: dec.read_u64()?,
            },
            CommandType::WriteBlob => Command::WriteBlob {
                blob_id: dec.read_u64()?,
                data: dec.read_blob()?.to_vec(),
            },
            CommandType::ReadBlob => Command::ReadBlob {
                blob_id: dec.read_u64()?,
                offset: dec.read_u64()?,
                size: dec.read_u64()?,
            },
            CommandType::CreateRing => Command::CreateRing {
                ring_id: dec.read_u64()?,
                info: dec.read_pod()?,
            },
            CommandType::DestroyRing => Command::DestroyRing {
                ring_id: dec.read_u64()?,
            },
            CommandType::NotifyRing => Command::NotifyRing {
                ring_id: dec.read_u64()?,
                seqno: dec.read_u32()?,
                flags: dec.read_u32()?,
            },
            CommandType::WriteRingExtra => Command::WriteRingExtra {
                ring_id: dec.read_u64()?,
                offset: dec.read_u64()?,
                value: dec.read_u32()?,
            },
            CommandType::SetReplyCommandStream => Command::SetReplyCommandStream {
                stream: dec.read_pod()?,
            },
            CommandType::SeekReplyCommandStream => Command::SeekReplyCommandStream {
                position: dec.read_u64()?,
            },
            CommandType::ExecuteCommandStreams => {
                let count =
                    dec.read_count(std::mem::size_of::<CommandStreamDescription>())?;
                let streams = (0..count)
                    .map(|_| dec.read_pod())
                    .collect::<Result<Vec<_>>>()?;
                Command::ExecuteCommandStreams {
                    streams,
                    flags: dec.read_u32()?,
                }
            }
        };
        Ok((cmd, flags))
    }
}

/// A reply written by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Commands whose only output is a result code.
    Result { command: CommandType, result: i32 },
    EnumerateInstanceVersion { result: i32, api_version: u32 },
    ReadBlob { result: i32, data: Vec<u8> },
}

impl Reply {
    pub fn command_type(&self) -> CommandType {
        match self {
            Reply::Result { command, .. } => *command,
            Reply::EnumerateInstanceVersion { .. } => CommandType::EnumerateInstanceVersion,
            Reply::ReadBlob { .. } => CommandType::ReadBlob,
        }
    }

    pub fn result(&self) -> i32 {
        match self {
            Reply::Result { result, .. }
            | Reply::EnumerateInstanceVersion { result, .. }
            | Reply::ReadBlob { result, .. } => *result,
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Reply::Result { .. } => 8,
            Reply::EnumerateInstanceVersion { .. } => 12,
            Reply::ReadBlob { data, .. } => 8 + 8 + padded(data.len()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = CsEncoder::direct(self.encoded_size());
        enc.write_u32(self.command_type() as u32);
        enc.write_i32(self.result());
        match self {
            Reply::Result { .. } => {}
            Reply::EnumerateInstanceVersion { api_version, .. } => enc.write_u32(*api_version),
            Reply::ReadBlob { data, .. } => enc.write_blob(data),
        }
        enc.commit();
        enc.committed_bytes()
    }

    /// Decode the reply to a command of type `expected`.
    pub fn decode(dec: &mut CsDecoder<'_>, expected: CommandType) -> Result<Reply> {
        let cmd_type = CommandType::try_from(dec.read_u32()?)?;
        if cmd_type != expected {
            return Err(Error::MalformedStream(format!(
                "reply for {:?} while waiting for {:?}",
                cmd_type, expected
            )));
        }
        let result = dec.read_i32()?;
        Ok(match cmd_type {
            CommandType::EnumerateInstanceVersion => Reply::EnumerateInstanceVersion {
                result,
                api_version: dec.read_u32()?,
            },
            CommandType::ReadBlob => Reply::ReadBlob {
                result,
                data: dec.read_blob()?.to_vec(),
            },
            command => Reply::Result { command, result },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(cmd: &Command, flags: u32) -> (Command, u32) {
        let bytes = cmd.to_bytes(flags);
        assert_eq!(bytes.len(), cmd.encoded_size());
        let mut dec = CsDecoder::new(&bytes);
        let decoded = Command::decode(&mut dec).unwrap();
        assert!(dec.is_empty());
        decoded
    }

    #[test]
    fn test_header_layout() {
        let bytes = Command::DestroyRing { ring_id: 3 }.to_bytes(0);
        assert_eq!(&bytes[0..4], &101u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
    }

    #[test]
    fn test_queue_submit_decodes() {
        let cmd = Command::QueueSubmit {
            queue_id: 42,
            batches: vec![
                SubmitBatch {
                    wait_semaphores: vec![SemaphoreValue {
                        semaphore_id: 1,
                        value: 5,
                    }],
                    command_buffer_count: 2,
                    signal_semaphores: vec![],
                },
                SubmitBatch {
                    wait_semaphores: vec![],
                    command_buffer_count: 0,
                    signal_semaphores: vec![SemaphoreValue {
                        semaphore_id: 9,
                        value: 7,
                    }],
                },
            ],
            fence_id: 11,
        };
        let (decoded, flags) = decode_one(&cmd, COMMAND_FLAG_GENERATE_REPLY);
        assert_eq!(decoded, cmd);
        assert_eq!(flags, COMMAND_FLAG_GENERATE_REPLY);
    }

    #[test]
    fn test_blob_padding() {
        let cmd = Command::WriteBlob {
            blob_id: 1,
            data: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(cmd.encoded_size(), 8 + 8 + 8 + 8);
        assert_eq!(decode_one(&cmd, 0).0, cmd);
    }

    #[test]
    fn test_control_commands_have_no_reply() {
        assert_eq!(Command::DestroyRing { ring_id: 1 }.reply_size(), None);
        assert_eq!(Command::EnumerateInstanceVersion.reply_size(), Some(12));
        assert_eq!(
            Command::ReadBlob {
                blob_id: 1,
                offset: 0,
                size: 5
            }
            .reply_size(),
            Some(16 + 8)
        );
    }

    #[test]
    fn test_reply_size_matches_encoding() {
        let reply = Reply::ReadBlob {
            result: RESULT_SUCCESS,
            data: vec![9; 5],
        };
        let cmd = Command::ReadBlob {
            blob_id: 1,
            offset: 0,
            size: 5,
        };
        assert_eq!(reply.to_bytes().len(), cmd.reply_size().unwrap());

        let bytes = reply.to_bytes();
        let mut dec = CsDecoder::new(&bytes);
        assert_eq!(Reply::decode(&mut dec, CommandType::ReadBlob).unwrap(), reply);
    }

    #[test]
    fn test_reply_type_mismatch() {
        let bytes = Reply::Result {
            command: CommandType::CreateFence,
            result: RESULT_SUCCESS,
        }
        .to_bytes();
        let mut dec = CsDecoder::new(&bytes);
        assert!(matches!(
            Reply::decode(&mut dec, CommandType::CreateDevice),
            Err(Error::MalformedStream(_))
        ));
    }

    #[test]
    fn test_unknown_command_type() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&55u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let mut dec = CsDecoder::new(&bytes);
        assert!(Command::decode(&mut dec).is_err());
    }

    #[test]
    fn test_check_result() {
        assert!(check_result(RESULT_SUCCESS).is_ok());
        assert!(matches!(
            check_result(RESULT_ERROR_OUT_OF_HOST_MEMORY),
            Err(Error::OutOfHostMemory)
        ));
        assert_eq!(error_code(&Error::OutOfDeviceMemory), RESULT_ERROR_OUT_OF_DEVICE_MEMORY);
    }
}
