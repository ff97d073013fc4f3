use crate::net::encoder::{Encoder, SnapshotEmitter};
use crate::net::message::ReliableMessage;
use crate::state::snapshot::Snapshot;
use crate::stats::FrameStatistics;
use quark::time::TICKS_PER_SECOND;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct PendingQueues {
    reliable: VecDeque<ReliableMessage>,
    unreliable: VecDeque<ReliableMessage>,
}

/// Cross-thread entry point into a send queue. Application code on any
/// thread may enqueue messages; the tick worker promotes them while holding
/// the same lock. FIFO per enqueuing thread, nothing more.
#[derive(Clone)]
pub struct MessageSender {
    pending: Arc<Mutex<PendingQueues>>,
}

impl MessageSender {
    #[inline]
    pub fn new() -> MessageSender {
        MessageSender {
            pending: Arc::new(Mutex::new(PendingQueues {
                reliable: VecDeque::new(),
                unreliable: VecDeque::new(),
            })),
        }
    }

    pub fn queue_reliable(&self, message: ReliableMessage) {
        let mut pending = self.pending.lock().expect("pending queue poisoned");
        pending.reliable.push_back(message);
    }

    pub fn queue_unreliable(&self, message: ReliableMessage) {
        let mut pending = self.pending.lock().expect("pending queue poisoned");
        pending.unreliable.push_back(message);
    }
}

/// Ordered history of outgoing snapshots plus the reliable/unreliable
/// message queues, per peer. Snapshots are retained until the peer
/// acknowledges a newer one; un-acknowledged reliable messages ride along
/// with every outgoing snapshot until their carrying sequence is covered by
/// an ack.
pub struct SnapshotSendQueue {
    queue: VecDeque<Arc<Snapshot>>,
    null_snapshot: Arc<Snapshot>,

    pending: MessageSender,
    reliable: VecDeque<ReliableMessage>,
    next_unique_index: u32,

    queued_ack: u32,
    last_acked: u32,
    last_sent: u32,
    send_throttle: i64,
}

impl SnapshotSendQueue {
    /// `null_snapshot` is the peer-agreed empty baseline (index 0) diffed
    /// against until the first acknowledgment arrives.
    pub fn new(null_snapshot: Arc<Snapshot>, now: i64) -> SnapshotSendQueue {
        Self::with_sender(null_snapshot, now, MessageSender::new())
    }

    /// Builds the queue around an externally created sender, so callers can
    /// hand the sender out before the queue (and its owning worker) exist.
    pub fn with_sender(
        null_snapshot: Arc<Snapshot>,
        now: i64,
        sender: MessageSender,
    ) -> SnapshotSendQueue {
        SnapshotSendQueue {
            queue: VecDeque::new(),
            null_snapshot,
            pending: sender,
            reliable: VecDeque::new(),
            next_unique_index: 0,
            queued_ack: 0,
            last_acked: 0,
            last_sent: 0,
            send_throttle: now,
        }
    }

    #[inline]
    pub fn sender(&self) -> MessageSender {
        self.pending.clone()
    }

    #[inline]
    pub fn queue_reliable(&self, message: ReliableMessage) {
        self.pending.queue_reliable(message);
    }

    #[inline]
    pub fn queue_unreliable(&self, message: ReliableMessage) {
        self.pending.queue_unreliable(message);
    }

    /// Schedules an acknowledgment to ride on the next outgoing snapshot.
    #[inline]
    pub fn queue_acknowledge(&mut self, snapshot_index: u32) {
        debug_assert!(snapshot_index >= self.queued_ack);
        self.queued_ack = snapshot_index;
    }

    #[inline]
    pub fn queue_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        self.last_sent = snapshot.index();
        self.queue.push_back(snapshot);
    }

    #[inline]
    pub fn last_acked(&self) -> u32 {
        self.last_acked
    }

    #[inline]
    pub fn last_sent(&self) -> u32 {
        self.last_sent
    }

    /// Emits one full update: begin marker, queued unreliable then reliable
    /// messages, the diff of the newest snapshot against the peer's
    /// last-acknowledged one, any queued ack, and the end marker. While the
    /// peer has never acknowledged anything, sends are throttled to one per
    /// second so a slow or partitioned peer is not flooded mid-handshake.
    /// Returns the index of the snapshot sent (0 if nothing was).
    pub fn send_update(
        &mut self,
        encoder: &mut Encoder,
        stats: &mut FrameStatistics,
        now: i64,
    ) -> u32 {
        let current = match self.queue.back() {
            Some(current) => current.clone(),
            None => return 0,
        };
        let current_index = current.index();

        if self.last_acked == 0 && now < self.send_throttle {
            return current_index;
        }

        // Promote pending messages into the sequenced queue and take the
        // unreliable batch, all under one lock acquisition.
        let unreliable: Vec<ReliableMessage> = {
            let mut pending = self.pending.pending.lock().expect("pending queue poisoned");
            while let Some(mut message) = pending.reliable.pop_front() {
                self.next_unique_index += 1;
                message.unique_index = self.next_unique_index;
                message.sequence_index = current_index;
                self.reliable.push_back(message);
            }
            pending.unreliable.drain(..).collect()
        };

        encoder.begin_snapshot(current_index, stats);

        for message in &unreliable {
            stats.unreliable_messages_sent += 1;
            stats.unreliable_message_bytes_sent += message.size_bytes() as u32;
            encoder.send_unreliable(message, stats);
        }

        for message in &self.reliable {
            stats.reliable_messages_sent += 1;
            stats.reliable_message_bytes_sent += message.size_bytes() as u32;
            encoder.send_reliable(message, stats);
        }

        let baseline = if self.last_acked == 0 {
            self.null_snapshot.clone()
        } else {
            self.queue.front().expect("non-empty queue").clone()
        };

        {
            let mut emitter = SnapshotEmitter {
                encoder: &mut *encoder,
                stats: &mut *stats,
            };
            baseline.diff(&current, &mut emitter);
        }

        if self.queued_ack != 0 {
            stats.ack_messages_sent += 1;
            encoder.send_acknowledge(self.queued_ack, stats);
            self.queued_ack = 0;
        }

        encoder.end_snapshot(current_index, stats);

        if self.last_acked == 0 {
            self.send_throttle = now + TICKS_PER_SECOND;
        }

        current_index
    }

    /// Processes a peer acknowledgment: drops every snapshot older than the
    /// acked one and retires reliable messages whose carrying sequence is
    /// covered. Stale acks are ignored.
    pub fn ack_snapshot(&mut self, index: u32, now: i64) {
        if index <= self.last_acked {
            return;
        }

        if self.last_acked == 0 {
            // Handshake completed; lift the once-per-second throttle.
            self.send_throttle = now;
        }

        self.last_acked = index;

        while self
            .queue
            .front()
            .map_or(false, |s| s.index() < self.last_acked)
        {
            self.queue.pop_front();
        }

        while self
            .reliable
            .front()
            .map_or(false, |m| m.sequence_index <= self.last_acked)
        {
            self.reliable.pop_front();
        }
    }
}

/// Receive-side reassembly bookkeeping for one peer's snapshot stream.
/// Counts the fragments of the current snapshot and compares against the
/// count declared by `EndSnapshot`; a shortfall marks the snapshot
/// fractured and withholds the acknowledgment, so the sender keeps diffing
/// against the last index we did confirm.
pub struct SnapshotAckTracker {
    current_index: u32,
    packets_seen: u32,
    acknowledge_count: u32,
    last_good_index: u32,
    fractured: bool,
}

impl SnapshotAckTracker {
    #[inline]
    pub fn new() -> SnapshotAckTracker {
        SnapshotAckTracker {
            current_index: 0,
            packets_seen: 0,
            acknowledge_count: 0,
            last_good_index: 0,
            fractured: false,
        }
    }

    #[inline]
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    #[inline]
    pub fn acknowledge_count(&self) -> u32 {
        self.acknowledge_count
    }

    #[inline]
    pub fn last_good_index(&self) -> u32 {
        self.last_good_index
    }

    #[inline]
    pub fn fractured(&self) -> bool {
        self.fractured
    }

    /// Accepts fragments of the current or a newer snapshot; out-of-order
    /// datagrams from an older snapshot are rejected and the caller discards
    /// the rest of that datagram.
    pub fn begin_snapshot(&mut self, index: u32) -> bool {
        if index < self.current_index {
            return false;
        }

        if index > self.current_index {
            self.current_index = index;
            self.packets_seen = 1;
        } else {
            self.packets_seen += 1;
        }

        true
    }

    /// Closes the snapshot. Returns the index to acknowledge when every
    /// declared fragment arrived, `None` when the snapshot fractured.
    pub fn end_snapshot(&mut self, index: u32, declared_count: u32) -> Option<u32> {
        if index != self.current_index || declared_count != self.packets_seen {
            self.fractured = true;
            return None;
        }

        self.acknowledge_count += 1;
        self.last_good_index = index;
        self.fractured = false;
        Some(index)
    }
}
