use quark::logfile::{Column, ColumnType, StructuredLogFile};

/// Per-tick traffic counters. One frame is accumulated per tick and then
/// rotated into the ring.
#[derive(Debug, Default, Copy, Clone)]
pub struct FrameStatistics {
    pub timestamp: i64,
    pub packets_received: u32,
    pub packets_sent: u32,
    pub bytes_received: u32,
    pub bytes_sent: u32,
    pub reliable_messages_received: u32,
    pub reliable_messages_sent: u32,
    pub reliable_message_bytes_received: u32,
    pub reliable_message_bytes_sent: u32,
    pub duplicate_reliable_messages_skipped: u32,
    pub unreliable_messages_received: u32,
    pub unreliable_messages_sent: u32,
    pub unreliable_message_bytes_received: u32,
    pub unreliable_message_bytes_sent: u32,
    pub node_update_messages_received: u32,
    pub node_update_messages_sent: u32,
    pub node_update_bytes_received: u32,
    pub ack_messages_sent: u32,
    pub ack_messages_received: u32,
    pub begin_snapshots_received: u32,
    pub begin_snapshots_sent: u32,
    pub end_snapshots_received: u32,
    pub end_snapshots_sent: u32,
    pub finished: bool,
}

impl FrameStatistics {
    #[inline]
    pub fn zero(&mut self) {
        *self = FrameStatistics::default();
    }
}

pub const STATISTICS_FRAMES: usize = 10;

/// Columns for the per-frame statistics CSV (client side).
pub static STATISTICS_COLUMNS: [Column; 13] = [
    Column {
        name: "Timestamp",
        kind: ColumnType::UInt64,
    },
    Column {
        name: "PacketsReceived",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "PacketsSent",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "BytesReceived",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "BytesSent",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "ReliableMessagesReceived",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "ReliableMessagesSent",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "DuplicateReliableMessagesSkipped",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "UnreliableMessagesReceived",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "UnreliableMessagesSent",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "NodeUpdateMessagesReceived",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "NodeUpdateMessagesSent",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "NodeUpdateBytesReceived",
        kind: ColumnType::UInt32,
    },
];

/// Fixed ring of the most recent frames. The frame under the cursor is the
/// one currently accumulating.
pub struct StatisticsRing {
    frames: [FrameStatistics; STATISTICS_FRAMES],
    current: usize,
}

impl StatisticsRing {
    #[inline]
    pub fn new() -> StatisticsRing {
        StatisticsRing {
            frames: [FrameStatistics::default(); STATISTICS_FRAMES],
            current: 0,
        }
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut FrameStatistics {
        &mut self.frames[self.current]
    }

    #[inline]
    pub fn current(&self) -> &FrameStatistics {
        &self.frames[self.current]
    }

    /// Completed frames available for inspection.
    #[inline]
    pub fn frame_count(&self) -> usize {
        STATISTICS_FRAMES - 1
    }

    /// The `age`-th most recent completed frame (0 = newest completed).
    pub fn frame(&self, age: usize) -> &FrameStatistics {
        let index = (self.current + STATISTICS_FRAMES - age - 1) % STATISTICS_FRAMES;
        &self.frames[index]
    }

    /// Finishes the current frame, optionally writing it to the CSV log, and
    /// starts a fresh one.
    pub fn advance(&mut self, log: &mut StructuredLogFile) {
        self.frames[self.current].finished = true;

        if log.is_open() {
            let frame = &self.frames[self.current];
            log.set_u64(0, &[frame.timestamp as u64]);
            log.set_u32(
                1,
                &[
                    frame.packets_received,
                    frame.packets_sent,
                    frame.bytes_received,
                    frame.bytes_sent,
                    frame.reliable_messages_received,
                    frame.reliable_messages_sent,
                    frame.duplicate_reliable_messages_skipped,
                    frame.unreliable_messages_received,
                    frame.unreliable_messages_sent,
                    frame.node_update_messages_received,
                    frame.node_update_messages_sent,
                    frame.node_update_bytes_received,
                ],
            );
            drop(log.flush_line());
        }

        self.current = (self.current + 1) % STATISTICS_FRAMES;
        self.frames[self.current].zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_rotation() {
        let mut ring = StatisticsRing::new();
        let mut log = StructuredLogFile::new();

        ring.current_mut().packets_received = 5;
        ring.advance(&mut log);

        // The finished frame is the newest completed one.
        assert_eq!(ring.frame(0).packets_received, 5);
        assert!(ring.frame(0).finished);

        // The new current frame is zeroed.
        assert_eq!(ring.current().packets_received, 0);
        assert!(!ring.current().finished);
    }

    #[test]
    fn test_ring_wraps() {
        let mut ring = StatisticsRing::new();
        let mut log = StructuredLogFile::new();

        for i in 0..(STATISTICS_FRAMES * 2) {
            ring.current_mut().packets_sent = i as u32;
            ring.advance(&mut log);
        }

        assert_eq!(ring.frame(0).packets_sent, (STATISTICS_FRAMES * 2 - 1) as u32);
        assert_eq!(ring.frame(1).packets_sent, (STATISTICS_FRAMES * 2 - 2) as u32);
    }
}
