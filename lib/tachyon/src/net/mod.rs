pub mod decoder;
pub mod encoder;
pub mod message;
pub mod packet_log;
pub mod packet_queue;
pub mod queue;
pub mod socket;
pub mod support;
pub mod wire;

/// Target datagram size. Kept below typical Ethernet MTU so datagrams are
/// never IP-fragmented.
pub const DATAGRAM_SIZE: usize = 1400;

/// Hard cap on one reliable message including its framing overhead.
pub const MAX_RELIABLE_MESSAGE_SIZE: usize = 512;

/// Version carried in the connection handshake. Peers with a different
/// version are refused.
pub const PROTOCOL_VERSION: u16 = 4;

/// Seconds of peer silence before a connection is considered dead.
pub const TIMEOUT_SECONDS: i64 = 3;

#[cfg(test)]
mod tests {
    use crate::net::decoder::{ReliableDedup, WireEvent, WireReader};
    use crate::net::encoder::Encoder;
    use crate::net::message::{opcode, ReliableMessage};
    use crate::net::packet_queue::PacketQueue;
    use crate::net::queue::{SnapshotAckTracker, SnapshotSendQueue};
    use crate::net::socket::UdpEndpoint;
    use crate::net::DATAGRAM_SIZE;
    use crate::predict::PredictionConstants;
    use crate::state::node::{self, NodeType};
    use crate::state::object::ReplicableObject;
    use crate::state::remote::{self, RemoteFactory};
    use crate::state::snapshot::Snapshot;
    use crate::state::tree::{Backing, StateTree};
    use crate::stats::FrameStatistics;
    use hashbrown::HashSet;
    use std::time::Duration;

    struct NoFactory;

    impl RemoteFactory for NoFactory {
        fn create_remote_object(
            &mut self,
            _parent_id: u32,
            _id: u32,
            _creation_blob: &[u8],
        ) -> Option<Box<dyn ReplicableObject>> {
            None
        }
    }

    fn socket_pair() -> (UdpEndpoint, Encoder) {
        let receiver = UdpEndpoint::bind(0).unwrap();
        let addr = receiver.local_addr().unwrap();
        let encoder = Encoder::new(UdpEndpoint::connect(addr).unwrap(), None);
        (receiver, encoder)
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

    /// Applies one datagram's node events the way a receiver would after
    /// proving the snapshot whole.
    fn apply_node_events(tree: &mut StateTree, data: &[u8], constants: &PredictionConstants) {
        let mut factory = NoFactory;
        let mut remotes = HashSet::new();

        for item in WireReader::new(data) {
            match item.unwrap().event {
                WireEvent::NodeUpdate { id, storage } => {
                    tree.update_node_data(id, storage, 0, constants);
                }
                WireEvent::NodeCreate {
                    id,
                    parent_id,
                    node_type_tag,
                    creation_code,
                    blob,
                } => {
                    let node_type = NodeType::from_u8(node_type_tag).unwrap();
                    remote::handle_create_node(
                        tree,
                        &mut factory,
                        &mut remotes,
                        parent_id,
                        id,
                        node_type,
                        creation_code,
                        blob,
                        false,
                    );
                }
                WireEvent::NodeDelete { id } => {
                    remote::handle_delete_node(tree, &mut factory, &mut remotes, id);
                }
                _ => {}
            }
        }
    }

    /// Structural equality between a snapshot and a mirrored tree: every
    /// leaf in the snapshot exists in the tree with equal storage bytes.
    fn assert_mirrors(snapshot: &Snapshot, tree: &StateTree) {
        fn walk(snapshot: &Snapshot, indices: &[usize], tree: &StateTree) {
            for &idx in indices {
                let snap_node = snapshot.node(idx);
                let tree_node = tree
                    .find(snap_node.id())
                    .unwrap_or_else(|| panic!("node {} missing from mirror", snap_node.id()));
                assert_eq!(tree_node.node_type(), snap_node.node_type());

                if snap_node.is_complex() {
                    walk(snapshot, snap_node.children(), tree);
                } else {
                    let expanded = tree.expanded_bytes(snap_node.id()).unwrap();
                    let mut storage = vec![0u8; snap_node.node_type().storage_size()];
                    node::encode(snap_node.node_type(), &expanded, &mut storage);
                    assert_eq!(
                        storage[..],
                        *snapshot.storage(snap_node),
                        "node {} value mismatch",
                        snap_node.id()
                    );
                }
            }
        }
        walk(snapshot, snapshot.roots(), tree);
    }

    fn authority_tree() -> StateTree {
        let mut tree = StateTree::new(false);
        tree.create_node(0, 1, NodeType::Complex, Backing::None, 0, None, true);
        tree.create_node(
            1,
            10,
            NodeType::Float,
            Backing::owned_zeroed(NodeType::Float),
            0,
            None,
            true,
        );
        tree.create_node(
            1,
            11,
            NodeType::Float3,
            Backing::owned_zeroed(NodeType::Float3),
            1,
            None,
            true,
        );
        let mut name = [0u8; 64];
        name[..5].copy_from_slice(b"alice");
        tree.create_node(1, 12, NodeType::String, Backing::Owned(name.to_vec()), 2, None, true);
        tree
    }

    #[test]
    fn test_diff_roundtrip_reconstructs_peer_tree() {
        let constants = PredictionConstants::default();
        let (receiver, mut encoder) = socket_pair();
        let mut stats = FrameStatistics::default();

        let mut authority = authority_tree();
        let mut mirror = StateTree::new(true);
        let mut queue = SnapshotSendQueue::new(authority.null_snapshot(), 0);

        // First update: everything relative to the null snapshot.
        let snapshot_a = authority.snapshot();
        queue.queue_snapshot(snapshot_a.clone());
        queue.send_update(&mut encoder, &mut stats, 0);

        for datagram in recv_datagrams(&receiver, 1) {
            apply_node_events(&mut mirror, &datagram, &constants);
        }
        assert_mirrors(&snapshot_a, &mirror);

        // Mutate, ack, and send the incremental diff.
        let mut value = [0u8; 12];
        node::write_vec3(&mut value, glam::Vec3::new(7.0, 8.0, 9.0));
        authority.write_value(11, &value);
        authority.delete_subtree(12);

        queue.ack_snapshot(snapshot_a.index(), 1);
        let snapshot_b = authority.snapshot();
        queue.queue_snapshot(snapshot_b.clone());
        queue.send_update(&mut encoder, &mut stats, 2);

        for datagram in recv_datagrams(&receiver, 1) {
            apply_node_events(&mut mirror, &datagram, &constants);
        }

        assert_mirrors(&snapshot_b, &mirror);
        assert!(mirror.find(12).is_none(), "deleted node survived");
    }

    #[test]
    fn test_fragment_loss_suppresses_application() {
        let (receiver, mut encoder) = socket_pair();
        let mut stats = FrameStatistics::default();

        // A three-datagram snapshot.
        let mut snapshot = Snapshot::new(7);
        let root = snapshot.add_complex(None, 1);
        for i in 0..60u32 {
            let mut value = [0u8; 64];
            value[0] = i as u8 + 1;
            snapshot.add_leaf(Some(root), 10 + i, NodeType::String, &value);
        }

        encoder.begin_snapshot(7, &mut stats);
        for &idx in snapshot.node(snapshot.roots()[0]).children() {
            encoder.node_changed(&snapshot, snapshot.node(idx), true, &mut stats);
        }
        encoder.end_snapshot(7, &mut stats);

        let mut datagrams = recv_datagrams(&receiver, 3);
        // Lose the middle fragment.
        datagrams.remove(1);

        let mut tracker = SnapshotAckTracker::new();
        let mut staged = PacketQueue::new();
        let mut acked = None;

        for datagram in &datagrams {
            for item in WireReader::new(datagram) {
                let packet = item.unwrap();
                match packet.event {
                    WireEvent::BeginSnapshot { index } => {
                        assert!(tracker.begin_snapshot(index));
                        staged.set_frame(index, 0);
                    }
                    WireEvent::EndSnapshot {
                        index,
                        packet_count,
                    } => {
                        acked = tracker.end_snapshot(index, packet_count);
                        if acked.is_none() {
                            staged.reset();
                        }
                    }
                    WireEvent::NodeUpdate { .. } => {
                        staged.copy_packet(packet.raw);
                    }
                    _ => {}
                }
            }
        }

        // No acknowledgment, nothing staged, fracture visible.
        assert_eq!(acked, None);
        assert!(tracker.fractured());
        assert!(staged.is_empty());
    }

    #[test]
    fn test_duplicate_reliable_processed_once() {
        let (receiver, mut encoder) = socket_pair();
        let mut stats = FrameStatistics::default();

        let mut message = ReliableMessage::with_payload(opcode::SUBMIT_CHAT, vec![1, 2, 3, 4]);
        message.unique_index = 42;

        encoder.begin_snapshot(1, &mut stats);
        encoder.send_reliable(&message, &mut stats);
        encoder.end_snapshot(1, &mut stats);

        let datagram = recv_datagrams(&receiver, 1).remove(0);

        let mut dedup = ReliableDedup::new();
        let mut recv_stats = FrameStatistics::default();
        let mut handled = 0;

        // The same datagram delivered twice.
        for _ in 0..2 {
            for item in WireReader::new(&datagram) {
                if let WireEvent::ReliableMessage { unique_index, .. } = item.unwrap().event {
                    if dedup.accept(unique_index) {
                        recv_stats.reliable_messages_received += 1;
                        handled += 1;
                    } else {
                        recv_stats.duplicate_reliable_messages_skipped += 1;
                    }
                }
            }
        }

        assert_eq!(handled, 1);
        assert_eq!(recv_stats.reliable_messages_received, 1);
        assert_eq!(recv_stats.duplicate_reliable_messages_skipped, 1);
    }
}
