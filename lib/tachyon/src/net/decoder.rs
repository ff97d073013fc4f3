use crate::net::support::{FaultKind, NetError, NetResult};
use crate::net::wire::{PacketHeader, PacketType, CREATE_WORD_SIZE, HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};

/// One parsed mini-packet. Payload slices borrow the datagram and include
/// any 4-byte-rounding padding; consumers trim to the sizes they know.
#[derive(Debug)]
pub enum WireEvent<'a> {
    NoOp,
    Acknowledge {
        index: u32,
    },
    BeginSnapshot {
        index: u32,
    },
    EndSnapshot {
        index: u32,
        packet_count: u32,
    },
    ReliableMessage {
        opcode: u32,
        unique_index: u32,
        payload: &'a [u8],
    },
    UnreliableMessage {
        opcode: u32,
        payload: &'a [u8],
    },
    NodeUpdate {
        id: u32,
        storage: &'a [u8],
    },
    NodeCreate {
        id: u32,
        parent_id: u32,
        node_type_tag: u8,
        creation_code: u8,
        blob: &'a [u8],
    },
    NodeDelete {
        id: u32,
    },
}

#[derive(Debug)]
pub struct WirePacket<'a> {
    pub event: WireEvent<'a>,
    /// The untouched mini-packet bytes, header included; what the client
    /// copies into its staging queue.
    pub raw: &'a [u8],
}

impl<'a> WirePacket<'a> {
    pub fn event_name(&self) -> &'static str {
        match self.event {
            WireEvent::NoOp => "NoOp",
            WireEvent::Acknowledge { .. } => "Acknowledge",
            WireEvent::BeginSnapshot { .. } => "BeginSnapshot",
            WireEvent::EndSnapshot { .. } => "EndSnapshot",
            WireEvent::ReliableMessage { .. } => "ReliableMessage",
            WireEvent::UnreliableMessage { .. } => "UnreliableMessage",
            WireEvent::NodeUpdate { .. } => "NodeUpdate",
            WireEvent::NodeCreate { .. } => "NodeCreate",
            WireEvent::NodeDelete { .. } => "NodeDelete",
        }
    }
}

/// Walks a datagram's mini-packets in order. A malformed header poisons the
/// remainder of the datagram (one `Err` is yielded, then the iterator
/// ends); everything decoded before it stands.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0 }
    }

    fn fail(&mut self, error: NetError) -> Option<NetResult<WirePacket<'a>>> {
        self.pos = self.buf.len();
        Some(Err(error))
    }
}

impl<'a> Iterator for WireReader<'a> {
    type Item = NetResult<WirePacket<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        if self.pos + HEADER_SIZE > self.buf.len() {
            return self.fail(NetError::Fatal(FaultKind::Malformed));
        }

        let header = PacketHeader::read(&self.buf[self.pos..]);

        let ptype = match header.packet_type() {
            Ok(ptype) => ptype,
            Err(error) => return self.fail(error),
        };
        let count = match header.byte_count() {
            Ok(count) => count,
            Err(error) => return self.fail(error),
        };

        if self.pos + count > self.buf.len() {
            return self.fail(NetError::Fatal(FaultKind::Malformed));
        }

        let raw = &self.buf[self.pos..self.pos + count];

        let event = match ptype {
            PacketType::NoOp => WireEvent::NoOp,
            PacketType::Acknowledge => WireEvent::Acknowledge {
                index: header.sequence(),
            },
            PacketType::BeginSnapshot => WireEvent::BeginSnapshot {
                index: header.sequence(),
            },
            PacketType::EndSnapshot => WireEvent::EndSnapshot {
                index: header.sequence(),
                packet_count: LittleEndian::read_u32(&raw[HEADER_SIZE..]),
            },
            PacketType::ReliableMessage => {
                if count < HEADER_SIZE + 4 {
                    return self.fail(NetError::Fatal(FaultKind::Malformed));
                }
                WireEvent::ReliableMessage {
                    opcode: header.payload_id(),
                    unique_index: LittleEndian::read_u32(&raw[HEADER_SIZE..]),
                    payload: &raw[HEADER_SIZE + 4..],
                }
            }
            PacketType::UnreliableMessage => WireEvent::UnreliableMessage {
                opcode: header.payload_id(),
                payload: &raw[HEADER_SIZE..],
            },
            PacketType::NodeUpdate => WireEvent::NodeUpdate {
                id: header.payload_id(),
                storage: &raw[HEADER_SIZE..],
            },
            PacketType::NodeCreateSimple | PacketType::NodeCreateComplex => {
                if count < HEADER_SIZE + CREATE_WORD_SIZE {
                    return self.fail(NetError::Fatal(FaultKind::Malformed));
                }
                let word = LittleEndian::read_u32(&raw[HEADER_SIZE..]);
                let (parent_id, node_type_tag, creation_code) = crate::net::wire::unpack_create_word(word);
                WireEvent::NodeCreate {
                    id: header.payload_id(),
                    parent_id,
                    node_type_tag,
                    creation_code,
                    blob: &raw[HEADER_SIZE + CREATE_WORD_SIZE..],
                }
            }
            PacketType::NodeDelete => WireEvent::NodeDelete {
                id: header.payload_id(),
            },
        };

        self.pos += count;
        Some(Ok(WirePacket { event, raw }))
    }
}

/// Reliable-message replay guard: messages are globally ordered by their
/// `unique_index`, and anything at or below the watermark has already been
/// processed.
pub struct ReliableDedup {
    last_index: u32,
}

impl ReliableDedup {
    #[inline]
    pub fn new() -> ReliableDedup {
        ReliableDedup { last_index: 0 }
    }

    #[inline]
    pub fn last_index(&self) -> u32 {
        self.last_index
    }

    /// True exactly once per unique index.
    #[inline]
    pub fn accept(&mut self, unique_index: u32) -> bool {
        if unique_index > self.last_index {
            self.last_index = unique_index;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_fixed(buf: &mut Vec<u8>, ptype: PacketType, sequence: u32) {
        let mut header = [0u8; 4];
        PacketHeader::fixed(ptype, sequence).write(&mut header);
        buf.extend_from_slice(&header);
    }

    fn push_node_update(buf: &mut Vec<u8>, id: u32, storage: &[u8]) {
        let total = crate::net::wire::round_up4(HEADER_SIZE + storage.len());
        let mut header = [0u8; 4];
        PacketHeader::variable(PacketType::NodeUpdate, id, total).write(&mut header);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(storage);
        buf.resize(buf.len() + (total - HEADER_SIZE - storage.len()), 0);
    }

    #[test]
    fn test_walk_mixed_stream() {
        let mut buf = Vec::new();
        push_fixed(&mut buf, PacketType::BeginSnapshot, 12);
        push_node_update(&mut buf, 10, &[1, 2, 3, 4]);
        push_fixed(&mut buf, PacketType::EndSnapshot, 12);
        buf.extend_from_slice(&2u32.to_le_bytes());

        let events: Vec<String> = WireReader::new(&buf)
            .map(|p| p.unwrap().event_name().to_string())
            .collect();

        assert_eq!(events, vec!["BeginSnapshot", "NodeUpdate", "EndSnapshot"]);

        let mut reader = WireReader::new(&buf);
        match reader.next().unwrap().unwrap().event {
            WireEvent::BeginSnapshot { index } => assert_eq!(index, 12),
            _ => panic!(),
        }
        match reader.next().unwrap().unwrap().event {
            WireEvent::NodeUpdate { id, storage } => {
                assert_eq!(id, 10);
                assert_eq!(storage, &[1, 2, 3, 4]);
            }
            _ => panic!(),
        }
        match reader.next().unwrap().unwrap().event {
            WireEvent::EndSnapshot {
                index,
                packet_count,
            } => {
                assert_eq!(index, 12);
                assert_eq!(packet_count, 2);
            }
            _ => panic!(),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_empty_buffer() {
        assert!(WireReader::new(&[]).next().is_none());
    }

    #[test]
    fn test_truncated_packet_is_malformed() {
        let mut buf = Vec::new();
        push_fixed(&mut buf, PacketType::Acknowledge, 1);
        // Header claims 16 bytes but only the header is present.
        let mut header = [0u8; 4];
        PacketHeader::variable(PacketType::NodeUpdate, 2, 16).write(&mut header);
        buf.extend_from_slice(&header);

        let mut reader = WireReader::new(&buf);
        // The packet before the damage decodes fine.
        assert!(reader.next().unwrap().is_ok());
        assert_eq!(
            reader.next().unwrap().unwrap_err(),
            NetError::Fatal(FaultKind::Malformed)
        );
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let buf = [0x0Fu8, 0, 0, 0];
        let mut reader = WireReader::new(&buf);

        assert_eq!(
            reader.next().unwrap().unwrap_err(),
            NetError::Fatal(FaultKind::UnknownPacketType)
        );
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_node_create_unpack() {
        let mut buf = Vec::new();
        let total = HEADER_SIZE + CREATE_WORD_SIZE + 4;
        let mut header = [0u8; 4];
        PacketHeader::variable(PacketType::NodeCreateComplex, 300, total).write(&mut header);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&crate::net::wire::pack_create_word(7, 5, 0).to_le_bytes());
        buf.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

        match WireReader::new(&buf).next().unwrap().unwrap().event {
            WireEvent::NodeCreate {
                id,
                parent_id,
                node_type_tag,
                creation_code,
                blob,
            } => {
                assert_eq!(id, 300);
                assert_eq!(parent_id, 7);
                assert_eq!(node_type_tag, 5);
                assert_eq!(creation_code, 0);
                assert_eq!(blob, &[0xAA, 0xBB, 0xCC, 0xDD]);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_raw_slice_covers_whole_packet() {
        let mut buf = Vec::new();
        push_node_update(&mut buf, 4, &[9, 9, 9, 9]);

        let packet = WireReader::new(&buf).next().unwrap().unwrap();
        assert_eq!(packet.raw, &buf[..]);
    }

    #[test]
    fn test_dedup_accepts_once() {
        let mut dedup = ReliableDedup::new();

        assert!(dedup.accept(42));
        assert!(!dedup.accept(42));
        assert!(!dedup.accept(41));
        assert!(dedup.accept(43));
        assert_eq!(dedup.last_index(), 43);
    }
}
