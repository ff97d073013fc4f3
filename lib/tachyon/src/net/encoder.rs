use crate::net::message::{ReliableMessage, RELIABLE_OVERHEAD};
use crate::net::packet_log::PacketLog;
use crate::net::socket::UdpEndpoint;
use crate::net::wire::{
    self, PacketHeader, PacketType, CREATE_WORD_SIZE, END_SNAPSHOT_SIZE, HEADER_SIZE,
};
use crate::net::DATAGRAM_SIZE;
use crate::state::snapshot::{DiffEvent, DiffSink, SnapNode, Snapshot};
use crate::stats::FrameStatistics;
use byteorder::{ByteOrder, LittleEndian};
use std::net::SocketAddr;

/// Builds MTU-sized datagrams out of mini-packets and sends them as they
/// fill. Every datagram after the first within one snapshot opens with an
/// auto-inserted `BeginSnapshot`, so fragments are self-identifying; the
/// closing `EndSnapshot` carries the datagram count so the receiver can
/// detect loss.
pub struct Encoder {
    socket: UdpEndpoint,
    target: Option<SocketAddr>,
    buf: [u8; DATAGRAM_SIZE],
    bytes_remaining: usize,
    snapshot_index: u32,
    packet_count: u32,
    log: PacketLog,
}

impl Encoder {
    /// `target` of `None` uses the socket's connected peer (client side);
    /// the server passes each peer's address explicitly.
    pub fn new(socket: UdpEndpoint, target: Option<SocketAddr>) -> Encoder {
        Encoder {
            socket,
            target,
            buf: [0u8; DATAGRAM_SIZE],
            bytes_remaining: 0,
            snapshot_index: 0,
            packet_count: 0,
            log: PacketLog::new(),
        }
    }

    #[inline]
    pub fn log_mut(&mut self) -> &mut PacketLog {
        &mut self.log
    }

    #[inline]
    fn bytes_used(&self) -> usize {
        DATAGRAM_SIZE - self.bytes_remaining
    }

    /// Reserves `size` zeroed bytes in the outgoing datagram, flushing the
    /// current one first if it cannot fit. Returns the write offset.
    fn allocate(&mut self, size: usize, stats: &mut FrameStatistics) -> usize {
        debug_assert!(size <= DATAGRAM_SIZE);

        if size > self.bytes_remaining {
            self.flush(false, stats);
        }

        let offset = self.bytes_used();
        self.bytes_remaining -= size;

        for byte in self.buf[offset..offset + size].iter_mut() {
            *byte = 0;
        }

        offset
    }

    /// Sends the accumulated datagram (if any) and opens a fresh one. A
    /// continuation datagram mid-snapshot re-announces the snapshot index.
    fn flush(&mut self, last_packet: bool, stats: &mut FrameStatistics) {
        if self.packet_count > 0 {
            let used = self.bytes_used();
            if used > 0 {
                let result = match self.target {
                    Some(addr) => self.socket.send_to(&self.buf[..used], addr),
                    None => self.socket.send(&self.buf[..used]),
                };
                drop(result);

                stats.bytes_sent += used as u32;
                stats.packets_sent += 1;
                self.log.increment_packet_index();
            }
        }

        self.bytes_remaining = DATAGRAM_SIZE;
        self.packet_count += 1;

        if !last_packet && self.packet_count > 1 {
            debug_assert!(self.snapshot_index != 0);
            let index = self.snapshot_index;
            self.begin_snapshot(index, stats);
        }
    }

    pub fn begin_snapshot(&mut self, index: u32, stats: &mut FrameStatistics) {
        let offset = self.allocate(HEADER_SIZE, stats);
        PacketHeader::fixed(PacketType::BeginSnapshot, index).write(&mut self.buf[offset..]);

        if self.snapshot_index == 0 {
            self.snapshot_index = index;
        } else {
            debug_assert_eq!(self.snapshot_index, index);
        }

        stats.begin_snapshots_sent += 1;
        self.log.set_snapshot_index(index);
        self.log
            .log_message(PacketType::BeginSnapshot, index, 0, HEADER_SIZE as u32);
    }

    /// Stamps the datagram count into the closing marker and force-flushes.
    pub fn end_snapshot(&mut self, index: u32, stats: &mut FrameStatistics) {
        debug_assert_eq!(self.snapshot_index, index);

        let offset = self.allocate(END_SNAPSHOT_SIZE, stats);
        PacketHeader::fixed(PacketType::EndSnapshot, index).write(&mut self.buf[offset..]);
        LittleEndian::write_u32(&mut self.buf[offset + HEADER_SIZE..], self.packet_count);

        self.log.log_message(
            PacketType::EndSnapshot,
            index,
            self.packet_count,
            END_SNAPSHOT_SIZE as u32,
        );

        self.flush(true, stats);
        stats.end_snapshots_sent += 1;

        self.snapshot_index = 0;
        self.packet_count = 0;
        self.bytes_remaining = 0;
        self.log.reset_indices();
    }

    pub fn send_reliable(&mut self, message: &ReliableMessage, stats: &mut FrameStatistics) {
        let total = wire::round_up4(RELIABLE_OVERHEAD + message.payload.len());
        let offset = self.allocate(total, stats);

        PacketHeader::variable(PacketType::ReliableMessage, message.opcode, total)
            .write(&mut self.buf[offset..]);
        LittleEndian::write_u32(&mut self.buf[offset + HEADER_SIZE..], message.unique_index);
        self.buf[offset + RELIABLE_OVERHEAD..offset + RELIABLE_OVERHEAD + message.payload.len()]
            .copy_from_slice(&message.payload);

        self.log
            .log_message(PacketType::ReliableMessage, message.opcode, 0, total as u32);
    }

    pub fn send_unreliable(&mut self, message: &ReliableMessage, stats: &mut FrameStatistics) {
        let total = wire::round_up4(HEADER_SIZE + message.payload.len());
        let offset = self.allocate(total, stats);

        PacketHeader::variable(PacketType::UnreliableMessage, message.opcode, total)
            .write(&mut self.buf[offset..]);
        self.buf[offset + HEADER_SIZE..offset + HEADER_SIZE + message.payload.len()]
            .copy_from_slice(&message.payload);

        self.log
            .log_message(PacketType::UnreliableMessage, message.opcode, 0, total as u32);
    }

    pub fn send_acknowledge(&mut self, snapshot_index: u32, stats: &mut FrameStatistics) {
        let offset = self.allocate(HEADER_SIZE, stats);
        PacketHeader::fixed(PacketType::Acknowledge, snapshot_index).write(&mut self.buf[offset..]);

        self.log
            .log_message(PacketType::Acknowledge, snapshot_index, 0, HEADER_SIZE as u32);
    }

    pub fn node_created(
        &mut self,
        snapshot: &Snapshot,
        node: &SnapNode,
        parent: Option<&SnapNode>,
        stats: &mut FrameStatistics,
    ) {
        let parent_id = parent.map(|p| p.id()).unwrap_or(0);
        let blob = snapshot.creation_blob(node);

        if !blob.is_empty() {
            let total = wire::round_up4(HEADER_SIZE + CREATE_WORD_SIZE + blob.len());
            let offset = self.allocate(total, stats);

            PacketHeader::variable(PacketType::NodeCreateComplex, node.id(), total)
                .write(&mut self.buf[offset..]);
            LittleEndian::write_u32(
                &mut self.buf[offset + HEADER_SIZE..],
                wire::pack_create_word(parent_id, node.node_type() as u8, 0),
            );
            let payload = offset + HEADER_SIZE + CREATE_WORD_SIZE;
            self.buf[payload..payload + blob.len()].copy_from_slice(blob);

            self.log
                .log_message(PacketType::NodeCreateComplex, node.id(), parent_id, total as u32);
        } else {
            let total = HEADER_SIZE + CREATE_WORD_SIZE;
            let offset = self.allocate(total, stats);

            PacketHeader::variable(PacketType::NodeCreateSimple, node.id(), total)
                .write(&mut self.buf[offset..]);
            LittleEndian::write_u32(
                &mut self.buf[offset + HEADER_SIZE..],
                wire::pack_create_word(parent_id, node.node_type() as u8, node.creation_code()),
            );

            self.log
                .log_message(PacketType::NodeCreateSimple, node.id(), parent_id, total as u32);
        }

        if !node.is_complex() {
            self.node_changed(snapshot, node, true, stats);
        }
    }

    /// Emits the node's storage bytes. `update_sticky` marks delta nodes so
    /// the following unchanged diff re-sends them once (the receiver's
    /// filters need a second timestamped sample to stop cleanly).
    pub fn node_changed(
        &mut self,
        snapshot: &Snapshot,
        node: &SnapNode,
        update_sticky: bool,
        stats: &mut FrameStatistics,
    ) {
        let storage = snapshot.storage(node);
        let total = wire::round_up4(HEADER_SIZE + storage.len());
        let offset = self.allocate(total, stats);

        PacketHeader::variable(PacketType::NodeUpdate, node.id(), total)
            .write(&mut self.buf[offset..]);
        self.buf[offset + HEADER_SIZE..offset + HEADER_SIZE + storage.len()]
            .copy_from_slice(storage);

        if node.node_type().is_delta() && update_sticky {
            node.set_previously_changed();
        }

        stats.node_update_messages_sent += 1;
        self.log
            .log_message(PacketType::NodeUpdate, node.id(), 0, total as u32);
    }

    pub fn node_deleted(&mut self, node: &SnapNode, stats: &mut FrameStatistics) {
        let offset = self.allocate(HEADER_SIZE, stats);
        PacketHeader::variable(PacketType::NodeDelete, node.id(), HEADER_SIZE)
            .write(&mut self.buf[offset..]);

        self.log
            .log_message(PacketType::NodeDelete, node.id(), 0, HEADER_SIZE as u32);
    }
}

/// Adapter feeding diff events into an encoder during one snapshot emission.
pub struct SnapshotEmitter<'a> {
    pub encoder: &'a mut Encoder,
    pub stats: &'a mut FrameStatistics,
}

impl<'a> DiffSink for SnapshotEmitter<'a> {
    fn emit(&mut self, event: DiffEvent<'_>) {
        match event {
            DiffEvent::Created {
                snapshot,
                node,
                parent,
            } => self.encoder.node_created(snapshot, node, parent, self.stats),
            DiffEvent::Deleted { node } => self.encoder.node_deleted(node, self.stats),
            DiffEvent::Changed { snapshot, node, .. } => {
                self.encoder.node_changed(snapshot, node, true, self.stats)
            }
            DiffEvent::Same {
                prev,
                snapshot,
                node,
            } => {
                if prev.was_previously_changed() {
                    self.encoder.node_changed(snapshot, node, false, self.stats);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::decoder::{WireEvent, WireReader};
    use crate::state::node::NodeType;
    use std::time::Duration;

    fn socket_pair() -> (UdpEndpoint, UdpEndpoint) {
        let receiver = UdpEndpoint::bind(0).unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = UdpEndpoint::connect(addr).unwrap();
        (receiver, sender)
    }

    fn recv_datagrams(socket: &UdpEndpoint, expected: usize) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let mut buf = [0u8; DATAGRAM_SIZE];

        for _ in 0..500 {
            while let Some((size, _)) = socket.recv_from(&mut buf).unwrap() {
                datagrams.push(buf[..size].to_vec());
            }
            if datagrams.len() >= expected {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(datagrams.len(), expected, "datagram count mismatch");
        datagrams
    }

    #[test]
    fn test_single_datagram_snapshot() {
        let (receiver, sender) = socket_pair();
        let mut encoder = Encoder::new(sender, None);
        let mut stats = FrameStatistics::default();

        encoder.begin_snapshot(7, &mut stats);
        encoder.send_acknowledge(3, &mut stats);
        encoder.end_snapshot(7, &mut stats);

        let datagrams = recv_datagrams(&receiver, 1);
        let events: Vec<_> = WireReader::new(&datagrams[0])
            .map(|p| p.unwrap().event_name())
            .collect();
        assert_eq!(events, vec!["BeginSnapshot", "Acknowledge", "EndSnapshot"]);

        // One datagram declared.
        let mut reader = WireReader::new(&datagrams[0]);
        reader.next();
        reader.next();
        match reader.next().unwrap().unwrap().event {
            WireEvent::EndSnapshot {
                index,
                packet_count,
            } => {
                assert_eq!(index, 7);
                assert_eq!(packet_count, 1);
            }
            _ => panic!("expected EndSnapshot"),
        }

        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.begin_snapshots_sent, 1);
        assert_eq!(stats.end_snapshots_sent, 1);
    }

    #[test]
    fn test_fragmentation_inserts_begin_markers() {
        let (receiver, sender) = socket_pair();
        let mut encoder = Encoder::new(sender, None);
        let mut stats = FrameStatistics::default();

        let mut snapshot = Snapshot::new(9);
        let root = snapshot.add_complex(None, 1);
        // Enough 64-byte string leaves to overflow two 1400-byte datagrams.
        for i in 0..60u32 {
            let mut value = [0u8; 64];
            value[0] = i as u8 + 1;
            snapshot.add_leaf(Some(root), 10 + i, NodeType::String, &value);
        }

        encoder.begin_snapshot(9, &mut stats);
        for &idx in snapshot.node(snapshot.roots()[0]).children() {
            let node = snapshot.node(idx);
            encoder.node_changed(&snapshot, node, true, &mut stats);
        }
        encoder.end_snapshot(9, &mut stats);

        let datagrams = recv_datagrams(&receiver, 3);

        // Every datagram leads with BeginSnapshot(9).
        for datagram in &datagrams {
            match WireReader::new(datagram).next().unwrap().unwrap().event {
                WireEvent::BeginSnapshot { index } => assert_eq!(index, 9),
                _ => panic!("fragment does not start with BeginSnapshot"),
            }
        }

        // The final datagram ends with the true fragment count.
        let last = datagrams.last().unwrap();
        let end = WireReader::new(last).last().unwrap().unwrap();
        match end.event {
            WireEvent::EndSnapshot {
                index,
                packet_count,
            } => {
                assert_eq!(index, 9);
                assert_eq!(packet_count, 3);
            }
            _ => panic!("expected trailing EndSnapshot"),
        }

        assert_eq!(stats.packets_sent, 3);
        // Two of the three begin markers were auto-inserted.
        assert_eq!(stats.begin_snapshots_sent, 3);
    }

    #[test]
    fn test_reliable_payload_padded() {
        let (receiver, sender) = socket_pair();
        let mut encoder = Encoder::new(sender, None);
        let mut stats = FrameStatistics::default();

        let mut message = ReliableMessage::with_payload(70, vec![1, 2, 3, 4, 5]);
        message.unique_index = 42;

        encoder.begin_snapshot(1, &mut stats);
        encoder.send_reliable(&message, &mut stats);
        encoder.end_snapshot(1, &mut stats);

        let datagrams = recv_datagrams(&receiver, 1);
        let mut found = false;
        for packet in WireReader::new(&datagrams[0]) {
            if let WireEvent::ReliableMessage {
                opcode,
                unique_index,
                payload,
            } = packet.unwrap().event
            {
                assert_eq!(opcode, 70);
                assert_eq!(unique_index, 42);
                // Payload is padded up to the 4-byte boundary.
                assert_eq!(payload.len(), 8);
                assert_eq!(&payload[..5], &[1, 2, 3, 4, 5]);
                assert_eq!(&payload[5..], &[0, 0, 0]);
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_sticky_change_marked_on_send() {
        let (_receiver, sender) = socket_pair();
        let mut encoder = Encoder::new(sender, None);
        let mut stats = FrameStatistics::default();

        let mut snapshot = Snapshot::new(2);
        let idx = snapshot.add_leaf(None, 5, NodeType::Float3Delta, &[0u8; 12]);

        encoder.begin_snapshot(2, &mut stats);
        encoder.node_changed(&snapshot, snapshot.node(idx), true, &mut stats);
        assert!(snapshot.node(idx).was_previously_changed());

        // Re-emission of an unchanged node must not re-mark.
        let mut snapshot2 = Snapshot::new(3);
        let idx2 = snapshot2.add_leaf(None, 5, NodeType::Float3Delta, &[0u8; 12]);
        encoder.node_changed(&snapshot2, snapshot2.node(idx2), false, &mut stats);
        assert!(!snapshot2.node(idx2).was_previously_changed());

        encoder.end_snapshot(2, &mut stats);
    }
}
