//! # Transport Ring
//!
//! A single-producer/single-consumer byte ring living in one shared buffer
//! object. The driver is the only writer of `tail` and the renderer the only
//! writer of `head`, so both cursors are plain atomics with release/acquire
//! pairing and no lock is needed across the process boundary.
//!
//! ## Memory Layout
//!
//! ```text
//! +-----------+-----------+-----------+------------------------+---------+
//! | head (64) | tail (64) | status(64)| buffer (power of two)  | extra   |
//! +-----------+-----------+-----------+------------------------+---------+
//! 0           64          128         192                      192+size
//! ```
//!
//! Each cursor gets its own cache line so the two sides never false-share.
//! Cursors are byte positions that wrap at 2^32; the buffer index is the
//! position masked by `buffer_size - 1`.
//!
//! The status word carries `RING_STATUS_IDLE` when the renderer stopped
//! polling. A writer that sees it after publishing new work must send a
//! notify control message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::config::WaitPolicy;
use crate::shm::Bo;
use crate::wait;

/// The renderer is not polling the ring.
pub const RING_STATUS_IDLE: u32 = 1 << 0;

const CACHE_LINE_SIZE: u32 = 64;
/// Size of the extra region: one 32-bit roundtrip counter.
pub const RING_EXTRA_SIZE: u32 = 4;

/// Offsets and sizes of every field inside the ring's buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub head_offset: u32,
    pub tail_offset: u32,
    pub status_offset: u32,
    pub buffer_offset: u32,
    pub buffer_size: u32,
    pub extra_offset: u32,
    pub extra_size: u32,
    pub bo_size: u32,
}

impl RingLayout {
    pub fn new(buffer_size: u32) -> Self {
        assert!(buffer_size.is_power_of_two());
        let head_offset = 0;
        let tail_offset = head_offset + CACHE_LINE_SIZE;
        let status_offset = tail_offset + CACHE_LINE_SIZE;
        let buffer_offset = status_offset + CACHE_LINE_SIZE;
        let extra_offset = buffer_offset + buffer_size;
        Self {
            head_offset,
            tail_offset,
            status_offset,
            buffer_offset,
            buffer_size,
            extra_offset,
            extra_size: RING_EXTRA_SIZE,
            bo_size: extra_offset + RING_EXTRA_SIZE,
        }
    }
}

/// Is position `a` at or past position `b`, given the writer is at `cur`?
///
/// Positions wrap, so this is only meaningful while both lie within one
/// buffer's worth behind `cur`. It can give a false negative if polled
/// extremely rarely, which later polls with a larger `a` recover from.
pub fn ge_seqno(cur: u32, a: u32, b: u32) -> bool {
    if a >= b {
        cur >= a || cur < b
    } else {
        cur >= a && cur < b
    }
}

/// An in-flight submission: its end position and the buffers it keeps alive.
#[derive(Debug, Default)]
pub struct RingSubmit {
    seqno: u32,
    bos: Vec<Bo>,
}

/// Result of writing one command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSeqno {
    /// Ring position right after the written bytes.
    pub seqno: u32,
    /// The renderer was idle and needs a notify message.
    pub notify: bool,
}

/// Fields shared with lock-free waiters.
struct RingShared {
    bo: Bo,
    layout: RingLayout,
    wait_policy: WaitPolicy,
    /// Mirror of the writer position for waiters.
    cur: AtomicU32,
    stalls: AtomicU64,
}

impl RingShared {
    fn head(&self) -> &AtomicU32 {
        self.bo.atomic_u32(self.layout.head_offset as usize)
    }

    fn tail(&self) -> &AtomicU32 {
        self.bo.atomic_u32(self.layout.tail_offset as usize)
    }

    fn status(&self) -> &AtomicU32 {
        self.bo.atomic_u32(self.layout.status_offset as usize)
    }

    fn extra(&self) -> &AtomicU32 {
        self.bo.atomic_u32(self.layout.extra_offset as usize)
    }

    fn wait_seqno(&self, seqno: u32) {
        wait::poll_until(self.wait_policy, || {
            let head = self.head().load(Ordering::Acquire);
            ge_seqno(self.cur.load(Ordering::Acquire), head, seqno)
        });
    }
}

/// The writer half of the ring. Callers serialize access (the instance keeps
/// it behind its submission lock).
pub struct Ring {
    shared: Arc<RingShared>,
    cur: u32,
    buffer_mask: u32,
    /// Submits not yet passed by `head`, oldest first.
    submits: VecDeque<RingSubmit>,
    /// Retired submits kept for reuse.
    free_submits: Vec<RingSubmit>,
}

impl Ring {
    /// Number of BO slots a pooled submit record may keep.
    const POOLED_BO_SLOTS: usize = 2;

    /// Take over `bo` as ring storage. The buffer is zeroed.
    pub fn new(bo: Bo, layout: RingLayout, wait_policy: WaitPolicy) -> Self {
        assert!(bo.size() >= layout.bo_size as usize);
        bo.clear();
        Self {
            shared: Arc::new(RingShared {
                bo,
                layout,
                wait_policy,
                cur: AtomicU32::new(0),
                stalls: AtomicU64::new(0),
            }),
            cur: 0,
            buffer_mask: layout.buffer_size - 1,
            submits: VecDeque::new(),
            free_submits: Vec::new(),
        }
    }

    pub fn bo(&self) -> &Bo {
        &self.shared.bo
    }

    pub fn layout(&self) -> &RingLayout {
        &self.shared.layout
    }

    /// Current writer position.
    pub fn cur(&self) -> u32 {
        self.cur
    }

    /// How many times a writer had to wait for free space.
    pub fn stall_count(&self) -> u64 {
        self.shared.stalls.load(Ordering::Relaxed)
    }

    /// Number of submits still holding buffer references.
    pub fn pending_submits(&self) -> usize {
        self.submits.len()
    }

    /// The 32-bit counter the renderer writes on roundtrips.
    pub fn extra(&self) -> &AtomicU32 {
        self.shared.extra()
    }

    pub fn waiter(&self) -> RingWaiter {
        RingWaiter {
            shared: Arc::clone(&self.shared),
        }
    }

    fn get_submit(&mut self, bo_count: usize) -> RingSubmit {
        if bo_count <= Self::POOLED_BO_SLOTS {
            if let Some(submit) = self.free_submits.pop() {
                return submit;
            }
        }
        RingSubmit {
            seqno: 0,
            bos: Vec::with_capacity(bo_count),
        }
    }

    /// Drop the buffer references of every submit the renderer has passed.
    fn retire_submits(&mut self, head: u32) {
        while let Some(front) = self.submits.front() {
            if !ge_seqno(self.cur, head, front.seqno) {
                break;
            }
            if let Some(mut submit) = self.submits.pop_front() {
                submit.bos.clear();
                if submit.bos.capacity() <= Self::POOLED_BO_SLOTS {
                    self.free_submits.push(submit);
                }
            }
        }
    }

    /// Poll `head` once and retire what it passed.
    pub fn retire(&mut self) {
        let head = self.shared.head().load(Ordering::Acquire);
        self.retire_submits(head);
    }

    /// Block until `size` bytes are free. Returns true if we had to wait.
    fn wait_space(&mut self, size: u32) -> bool {
        let buffer_size = self.shared.layout.buffer_size;
        let mut iter = 0;
        let mut stalled = false;
        loop {
            let head = self.shared.head().load(Ordering::Acquire);
            self.retire_submits(head);
            if self.cur.wrapping_sub(head) + size <= buffer_size {
                return stalled;
            }
            if !stalled {
                stalled = true;
                self.shared.stalls.fetch_add(1, Ordering::Relaxed);
                trace!(cur = self.cur, head, size, "ring full, waiting for space");
            }
            wait::relax(self.shared.wait_policy, &mut iter);
        }
    }

    fn write_buffer(&mut self, data: &[u8]) {
        let layout = &self.shared.layout;
        let offset = self.cur & self.buffer_mask;
        let first = data.len().min((layout.buffer_size - offset) as usize);
        let base = layout.buffer_offset as usize;
        self.shared.bo.write_bytes(base + offset as usize, &data[..first]);
        if first < data.len() {
            self.shared.bo.write_bytes(base, &data[first..]);
        }
        self.cur = self.cur.wrapping_add(data.len() as u32);
    }

    /// Copy `cs` into the ring and publish it.
    ///
    /// `bos` are kept referenced until the renderer's head passes the
    /// returned seqno. Blocks while the ring lacks space.
    pub fn submit(&mut self, cs: &[u8], bos: &[Bo]) -> RingSeqno {
        let size = cs.len() as u32;
        assert!(
            size <= self.shared.layout.buffer_size,
            "command stream of {} bytes cannot fit a {} byte ring",
            size,
            self.shared.layout.buffer_size
        );

        let mut submit = self.get_submit(bos.len());
        submit.bos.extend(bos.iter().cloned());

        self.wait_space(size);
        self.write_buffer(cs);

        submit.seqno = self.cur;
        self.submits.push_back(submit);

        self.shared.cur.store(self.cur, Ordering::Release);
        self.shared.tail().store(self.cur, Ordering::SeqCst);

        // Pairs with the renderer setting IDLE and then rechecking tail.
        let status = self.shared.status().load(Ordering::SeqCst);
        RingSeqno {
            seqno: self.cur,
            notify: status & RING_STATUS_IDLE != 0,
        }
    }

    pub fn wait_seqno(&self, seqno: u32) {
        self.shared.wait_seqno(seqno)
    }

    /// Wait until the renderer consumed everything written so far.
    pub fn wait_all(&self) {
        self.shared.wait_seqno(self.cur)
    }
}

/// A handle that waits on ring progress without the submission lock.
#[derive(Clone)]
pub struct RingWaiter {
    shared: Arc<RingShared>,
}

impl RingWaiter {
    pub fn wait_seqno(&self, seqno: u32) {
        self.shared.wait_seqno(seqno)
    }

    /// Wait for everything published at the time of the call.
    pub fn wait_all(&self) {
        // Only the writer stores tail, a relaxed load sees its latest value
        // once the writer released the lock we raced with.
        let tail = self.shared.tail().load(Ordering::Relaxed);
        self.shared.wait_seqno(tail)
    }

    pub fn extra(&self) -> &AtomicU32 {
        self.shared.extra()
    }

    pub fn stall_count(&self) -> u64 {
        self.shared.stalls.load(Ordering::Relaxed)
    }
}

/// The renderer's half: consumes bytes and publishes progress.
pub struct RingReader {
    bo: Bo,
    layout: RingLayout,
    buffer_mask: u32,
}

impl RingReader {
    pub fn new(bo: Bo, layout: RingLayout) -> Self {
        assert!(bo.size() >= layout.bo_size as usize);
        Self {
            bo,
            layout,
            buffer_mask: layout.buffer_size - 1,
        }
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn head(&self) -> u32 {
        self.bo
            .atomic_u32(self.layout.head_offset as usize)
            .load(Ordering::Relaxed)
    }

    pub fn tail(&self) -> u32 {
        self.bo
            .atomic_u32(self.layout.tail_offset as usize)
            .load(Ordering::SeqCst)
    }

    /// Copy the bytes in `[head, end)`.
    pub fn read_to(&self, end: u32) -> Vec<u8> {
        let head = self.head();
        let len = end.wrapping_sub(head);
        assert!(len <= self.layout.buffer_size, "tail ran past head");

        let mut out = vec![0u8; len as usize];
        let offset = head & self.buffer_mask;
        let first = (len as usize).min((self.layout.buffer_size - offset) as usize);
        let base = self.layout.buffer_offset as usize;
        self.bo.read_bytes(base + offset as usize, &mut out[..first]);
        if first < out.len() {
            self.bo.read_bytes(base, &mut out[first..]);
        }
        out
    }

    /// Mark everything before `head` as consumed.
    pub fn set_head(&self, head: u32) {
        self.bo
            .atomic_u32(self.layout.head_offset as usize)
            .store(head, Ordering::Release);
    }

    pub fn set_idle(&self, idle: bool) {
        let status = self.bo.atomic_u32(self.layout.status_offset as usize);
        if idle {
            status.fetch_or(RING_STATUS_IDLE, Ordering::SeqCst);
        } else {
            status.fetch_and(!RING_STATUS_IDLE, Ordering::SeqCst);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.bo
            .atomic_u32(self.layout.status_offset as usize)
            .load(Ordering::SeqCst)
            & RING_STATUS_IDLE
            != 0
    }

    /// Write a value into the extra region at byte `offset`.
    pub fn write_extra(&self, offset: u32, value: u32) {
        assert!(offset + 4 <= self.layout.extra_size);
        self.bo
            .atomic_u32((self.layout.extra_offset + offset) as usize)
            .store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedMemory;
    use std::thread;
    use std::time::Duration;

    fn ring_pair(tag: &str, buffer_size: u32) -> (Ring, RingReader) {
        let layout = RingLayout::new(buffer_size);
        let name = format!("/vnstream_ring_{}_{}", tag, std::process::id());
        let bo = Bo::new(1, SharedMemory::create(&name, layout.bo_size as usize).unwrap());
        let peer = Bo::new(1, SharedMemory::open(&name).unwrap());
        (
            Ring::new(bo, layout, WaitPolicy::Relax),
            RingReader::new(peer, layout),
        )
    }

    fn scratch_bo(tag: &str) -> Bo {
        let name = format!("/vnstream_ring_bo_{}_{}", tag, std::process::id());
        Bo::new(9, SharedMemory::create(&name, 4096).unwrap())
    }

    #[test]
    fn test_layout() {
        let layout = RingLayout::new(64 * 1024);
        assert_eq!(layout.tail_offset, 64);
        assert_eq!(layout.status_offset, 128);
        assert_eq!(layout.buffer_offset, 192);
        assert_eq!(layout.extra_offset, 192 + 64 * 1024);
        assert_eq!(layout.bo_size, layout.extra_offset + 4);
    }

    #[test]
    fn test_ge_seqno() {
        assert!(ge_seqno(100, 50, 40));
        assert!(!ge_seqno(100, 40, 50));
        assert!(ge_seqno(100, 50, 50));
        // head wrapped past zero, seqno did not
        assert!(ge_seqno(10, 5, u32::MAX - 5));
        assert!(!ge_seqno(10, u32::MAX - 10, 5));
    }

    #[test]
    fn test_submit_and_read() {
        let (mut ring, reader) = ring_pair("read", 4096);
        let seq = ring.submit(&[1, 2, 3, 4, 5, 6, 7, 8], &[]);
        assert_eq!(seq.seqno, 8);
        assert!(!seq.notify);

        let tail = reader.tail();
        assert_eq!(tail, 8);
        assert_eq!(reader.read_to(tail), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        reader.set_head(tail);
        ring.wait_all();
    }

    #[test]
    fn test_idle_requests_notify() {
        let (mut ring, reader) = ring_pair("idle", 4096);
        reader.set_idle(true);
        assert!(ring.submit(&[0; 4], &[]).notify);
        reader.set_idle(false);
        assert!(!ring.submit(&[0; 4], &[]).notify);
    }

    #[test]
    fn test_retire_drops_bo_refs() {
        let (mut ring, reader) = ring_pair("retire", 4096);
        let bo = scratch_bo("retire");

        let seq = ring.submit(&[0; 16], &[bo.clone()]);
        assert_eq!(bo.ref_count(), 2);
        assert_eq!(ring.pending_submits(), 1);

        reader.set_head(seq.seqno);
        ring.retire();
        assert_eq!(bo.ref_count(), 1);
        assert_eq!(ring.pending_submits(), 0);
    }

    #[test]
    fn test_wraparound_preserves_bytes() {
        let (mut ring, reader) = ring_pair("wrap", 4096);
        let mut expected = Vec::new();
        let mut received = Vec::new();

        for round in 0..20u8 {
            let chunk: Vec<u8> = (0..1500).map(|i| (i as u8).wrapping_add(round)).collect();
            expected.extend_from_slice(&chunk);
            ring.submit(&chunk, &[]);

            let tail = reader.tail();
            assert!(tail.wrapping_sub(reader.head()) <= 4096);
            received.extend(reader.read_to(tail));
            reader.set_head(tail);
        }
        assert_eq!(received, expected);
    }

    #[test]
    fn test_backpressure_blocks_until_consumed() {
        let (mut ring, reader) = ring_pair("full", 4096);
        ring.submit(&[0xAA; 4000], &[]);

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let tail = reader.tail();
            let bytes = reader.read_to(tail);
            reader.set_head(tail);
            bytes.len()
        });

        // Needs the first submission consumed before it fits.
        ring.submit(&[0xBB; 2000], &[]);
        assert_eq!(consumer.join().unwrap(), 4000);
        assert_eq!(ring.stall_count(), 1);
    }

    #[test]
    fn test_waiter_sees_progress() {
        let (mut ring, reader) = ring_pair("waiter", 4096);
        let waiter = ring.waiter();
        let seq = ring.submit(&[0; 64], &[]);

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            reader.set_head(reader.tail());
        });
        waiter.wait_seqno(seq.seqno);
        waiter.wait_all();
        consumer.join().unwrap();
    }

    #[test]
    fn test_extra_written_by_reader() {
        let (ring, reader) = ring_pair("extra", 4096);
        reader.write_extra(0, 77);
        assert_eq!(ring.extra().load(Ordering::Acquire), 77);
    }
}
