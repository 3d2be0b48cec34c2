//! Submission counters kept per instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of an instance's stream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Commands handed to the ring
    pub commands_submitted: u64,
    /// Empty or unallocatable commands skipped
    pub commands_dropped: u64,
    /// Notify messages sent to wake an idle renderer
    pub notifies: u64,
    /// Roundtrips issued
    pub roundtrips: u64,
    /// Command streams copied into the upload buffer
    pub indirect_uploads: u64,
    /// Reply buffer reallocations
    pub reply_grows: u64,
    /// Submissions that waited for ring space
    pub ring_full_stalls: u64,
}

/// Live counters. Updated with relaxed atomics; a snapshot is not a
/// consistent cut across fields.
#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
    pub commands_submitted: AtomicU64,
    pub commands_dropped: AtomicU64,
    pub notifies: AtomicU64,
    pub roundtrips: AtomicU64,
    pub indirect_uploads: AtomicU64,
    pub reply_grows: AtomicU64,
}

impl StreamCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, ring_full_stalls: u64) -> StreamStats {
        StreamStats {
            commands_submitted: self.commands_submitted.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            notifies: self.notifies.load(Ordering::Relaxed),
            roundtrips: self.roundtrips.load(Ordering::Relaxed),
            indirect_uploads: self.indirect_uploads.load(Ordering::Relaxed),
            reply_grows: self.reply_grows.load(Ordering::Relaxed),
            ring_full_stalls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let counters = StreamCounters::default();
        StreamCounters::bump(&counters.commands_submitted);
        StreamCounters::bump(&counters.commands_submitted);
        StreamCounters::bump(&counters.notifies);

        let stats = counters.snapshot(3);
        assert_eq!(stats.commands_submitted, 2);
        assert_eq!(stats.notifies, 1);
        assert_eq!(stats.ring_full_stalls, 3);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["commands_submitted"], 2);
        assert_eq!(json["ring_full_stalls"], 3);
    }
}
