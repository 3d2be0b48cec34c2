//! # Command Stream Encoder / Decoder
//!
//! Commands are serialized into 4-byte aligned little-endian streams. A
//! stream lives either in a plain heap buffer (direct) or in a chain of
//! shared buffer objects the renderer can read in place (indirect).
//!
//! ```text
//!  direct:    [ committed ............ | staged .. ]       (one Vec)
//!
//!  indirect:  BO#1 [ seg ]  BO#2 [ seg ........ ]  BO#3 [ used | seg | free ]
//!                   \____________ descriptors() ___________/
//! ```
//!
//! Indirect buffers double in size each time a new one is needed. After a
//! `reset` the current buffer is reused, but writes continue after the bytes
//! already handed out so in-flight readers never see them change.

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::shm::Bo;

/// Round `size` up to the 4-byte stream alignment.
pub const fn padded(size: usize) -> usize {
    (size + 3) & !3
}

/// Source of shared buffers for indirect encoders.
pub trait CsAllocator {
    /// Allocate a buffer of at least `size` bytes. Also returns a roundtrip
    /// seqno; the renderer can address the buffer once that roundtrip
    /// completes.
    fn alloc_buffer(&self, size: usize) -> Result<(Bo, u32)>;
}

/// A slice of a buffer object holding committed commands.
#[derive(Debug, Clone)]
pub struct CsDescriptor {
    pub bo: Bo,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug)]
struct CsBuffer {
    bo: Bo,
    /// First byte of this round's segment.
    start: usize,
    /// Write cursor.
    pos: usize,
    committed: usize,
}

#[derive(Debug)]
enum Storage {
    Direct {
        data: Vec<u8>,
        capacity: usize,
        committed: usize,
    },
    Indirect {
        min_buffer_size: usize,
        current: Option<CsBuffer>,
        finished: Vec<CsDescriptor>,
        finished_len: usize,
        roundtrip: u32,
    },
}

/// Serializes commands into a direct or indirect stream.
#[derive(Debug)]
pub struct CsEncoder {
    storage: Storage,
}

impl CsEncoder {
    /// A heap-backed encoder that never grows past `capacity` bytes.
    pub fn direct(capacity: usize) -> Self {
        Self {
            storage: Storage::Direct {
                data: Vec::with_capacity(capacity),
                capacity,
                committed: 0,
            },
        }
    }

    /// A buffer-object backed encoder. Buffers are at least `min_buffer_size`.
    pub fn indirect(min_buffer_size: usize) -> Self {
        Self {
            storage: Storage::Indirect {
                min_buffer_size,
                current: None,
                finished: Vec::new(),
                finished_len: 0,
                roundtrip: 0,
            },
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.storage, Storage::Indirect { .. })
    }

    /// Bytes written since the last reset, committed or not.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Direct { data, .. } => data.len(),
            Storage::Indirect {
                current,
                finished_len,
                ..
            } => finished_len + current.as_ref().map_or(0, |buf| buf.pos - buf.start),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed_len(&self) -> usize {
        match &self.storage {
            Storage::Direct { committed, .. } => *committed,
            Storage::Indirect {
                current,
                finished_len,
                ..
            } => finished_len + current.as_ref().map_or(0, |buf| buf.committed - buf.start),
        }
    }

    /// Roundtrip issued when the current indirect buffer was allocated.
    pub fn current_buffer_roundtrip(&self) -> u32 {
        match &self.storage {
            Storage::Direct { .. } => 0,
            Storage::Indirect { roundtrip, .. } => *roundtrip,
        }
    }

    /// Make `size` contiguous bytes available for writing.
    ///
    /// Indirect encoders allocate a new, larger buffer through `alloc` when
    /// the current one is full; everything written so far to the old buffer
    /// is committed at that point.
    pub fn reserve(&mut self, size: usize, alloc: Option<&dyn CsAllocator>) -> Result<()> {
        match &mut self.storage {
            Storage::Direct { data, capacity, .. } => {
                if data.len() + size > *capacity {
                    return Err(Error::OutOfHostMemory);
                }
                Ok(())
            }
            Storage::Indirect {
                min_buffer_size,
                current,
                finished,
                finished_len,
                roundtrip,
            } => {
                if let Some(buf) = current {
                    if buf.pos + size <= buf.bo.size() {
                        return Ok(());
                    }
                }

                let alloc = alloc.ok_or(Error::OutOfHostMemory)?;
                let mut buf_size = match current {
                    Some(buf) => buf.bo.size().checked_mul(2).ok_or(Error::OutOfHostMemory)?,
                    None => *min_buffer_size,
                };
                while buf_size < size {
                    buf_size = buf_size.checked_mul(2).ok_or(Error::OutOfHostMemory)?;
                }
                let (bo, new_roundtrip) = alloc.alloc_buffer(buf_size)?;

                if let Some(old) = current.take() {
                    if old.pos > old.start {
                        *finished_len += old.pos - old.start;
                        finished.push(CsDescriptor {
                            bo: old.bo,
                            offset: old.start,
                            size: old.pos - old.start,
                        });
                    }
                }
                *current = Some(CsBuffer {
                    bo,
                    start: 0,
                    pos: 0,
                    committed: 0,
                });
                *roundtrip = new_roundtrip;
                Ok(())
            }
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        match &mut self.storage {
            Storage::Direct { data, capacity, .. } => {
                assert!(
                    data.len() + bytes.len() <= *capacity,
                    "write of {} bytes past reserved space",
                    bytes.len()
                );
                data.extend_from_slice(bytes);
            }
            Storage::Indirect { current, .. } => match current {
                Some(buf) if buf.pos + bytes.len() <= buf.bo.size() => {
                    buf.bo.write_bytes(buf.pos, bytes);
                    buf.pos += bytes.len();
                }
                _ => panic!("write of {} bytes past reserved space", bytes.len()),
            },
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Raw bytes, zero padded to 4.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_raw(bytes);
        let pad = padded(bytes.len()) - bytes.len();
        if pad > 0 {
            self.write_raw(&[0u8; 3][..pad]);
        }
    }

    /// Length-prefixed (u64) bytes, zero padded to 4.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_pod<T: Pod>(&mut self, value: &T) {
        debug_assert_eq!(std::mem::size_of::<T>() % 4, 0);
        self.write_raw(bytemuck::bytes_of(value));
    }

    /// Hand everything written so far to the transport.
    pub fn commit(&mut self) {
        match &mut self.storage {
            Storage::Direct {
                data, committed, ..
            } => *committed = data.len(),
            Storage::Indirect { current, .. } => {
                if let Some(buf) = current {
                    buf.committed = buf.pos;
                }
            }
        }
    }

    /// Start a new stream. Indirect encoders keep their current buffer and
    /// write after what was already used.
    pub fn reset(&mut self) {
        match &mut self.storage {
            Storage::Direct {
                data, committed, ..
            } => {
                data.clear();
                *committed = 0;
            }
            Storage::Indirect {
                current,
                finished,
                finished_len,
                ..
            } => {
                finished.clear();
                *finished_len = 0;
                if let Some(buf) = current {
                    buf.start = buf.pos;
                    buf.committed = buf.pos;
                }
            }
        }
    }

    /// Committed segments of an indirect stream. Empty for direct streams.
    pub fn descriptors(&self) -> Vec<CsDescriptor> {
        match &self.storage {
            Storage::Direct { .. } => Vec::new(),
            Storage::Indirect {
                current, finished, ..
            } => {
                let mut descs = finished.clone();
                if let Some(buf) = current {
                    if buf.committed > buf.start {
                        descs.push(CsDescriptor {
                            bo: buf.bo.clone(),
                            offset: buf.start,
                            size: buf.committed - buf.start,
                        });
                    }
                }
                descs
            }
        }
    }

    /// A contiguous copy of the committed bytes.
    pub fn committed_bytes(&self) -> Vec<u8> {
        match &self.storage {
            Storage::Direct {
                data, committed, ..
            } => data[..*committed].to_vec(),
            Storage::Indirect { .. } => {
                let mut out = Vec::with_capacity(self.committed_len());
                for desc in self.descriptors() {
                    out.extend(desc.bo.read_vec(desc.offset, desc.size));
                }
                out
            }
        }
    }
}

/// Reads a command stream produced by [`CsEncoder`].
#[derive(Debug)]
pub struct CsDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CsDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::MalformedStream(format!(
                "read of {} bytes at offset {} overruns {} byte stream",
                len,
                self.pos,
                self.data.len()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn peek_u32(&self) -> Result<u32> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| Error::MalformedStream("stream ends inside a header".into()))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// `len` raw bytes followed by padding to 4.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self.take(len)?;
        self.take(padded(len) - len)?;
        Ok(bytes)
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::MalformedStream(format!("blob length {} too large", len)))?;
        self.read_bytes(len)
    }

    pub fn read_pod<T: Pod>(&mut self) -> Result<T> {
        let bytes = self.take(std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Read a u32 element count and check it against what is left.
    pub fn read_count(&mut self, elem_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(elem_size) > self.remaining() {
            return Err(Error::MalformedStream(format!(
                "array of {} elements overruns stream",
                count
            )));
        }
        Ok(count)
    }
}
