use crate::net::support::{FaultKind, NetError, NetResult};
use byteorder::{ByteOrder, LittleEndian};

/// 4-bit mini-packet type tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    NoOp = 0,
    Acknowledge = 1,
    ReliableMessage = 2,
    BeginSnapshot = 3,
    EndSnapshot = 4,
    NodeUpdate = 5,
    NodeCreateSimple = 6,
    NodeCreateComplex = 7,
    NodeDelete = 8,
    UnreliableMessage = 9,
}

/// Symbolic names, indexable by the wire tag. Used by the packet CSV logs.
pub static PACKET_TYPE_NAMES: [&str; 10] = [
    "NoOp",
    "Acknowledge",
    "ReliableMessage",
    "BeginSnapshot",
    "EndSnapshot",
    "NodeUpdate",
    "NodeCreateSimple",
    "NodeCreateComplex",
    "NodeDelete",
    "UnreliableMessage",
];

impl PacketType {
    #[inline]
    pub fn from_tag(tag: u32) -> Option<PacketType> {
        match tag {
            0 => Some(PacketType::NoOp),
            1 => Some(PacketType::Acknowledge),
            2 => Some(PacketType::ReliableMessage),
            3 => Some(PacketType::BeginSnapshot),
            4 => Some(PacketType::EndSnapshot),
            5 => Some(PacketType::NodeUpdate),
            6 => Some(PacketType::NodeCreateSimple),
            7 => Some(PacketType::NodeCreateComplex),
            8 => Some(PacketType::NodeDelete),
            9 => Some(PacketType::UnreliableMessage),
            _ => None,
        }
    }

    /// Fixed-size packets reinterpret the header bits after the tag as a
    /// 28-bit sequence number instead of `id | size`.
    #[inline]
    pub fn is_fixed_size(self) -> bool {
        matches!(
            self,
            PacketType::Acknowledge | PacketType::BeginSnapshot | PacketType::EndSnapshot
        )
    }
}

pub const HEADER_SIZE: usize = 4;

/// Byte length of the `EndSnapshot` mini-packet (header + `u32` count).
pub const END_SNAPSHOT_SIZE: usize = 8;

/// Byte length of the packed word trailing a `NodeCreateSimple` or
/// `NodeCreateComplex` header (`parent_id:16 | node_type:8 | code:8`).
pub const CREATE_WORD_SIZE: usize = 4;

/// Rounds a payload size up to the 4-byte granularity all variable-size
/// mini-packets use on the wire.
#[inline]
pub fn round_up4(size: usize) -> usize {
    (size + 3) & !3
}

const TYPE_BITS: u32 = 4;
const ID_BITS: u32 = 20;
const TYPE_MASK: u32 = (1 << TYPE_BITS) - 1;
const ID_MASK: u32 = (1 << ID_BITS) - 1;
const SEQUENCE_MASK: u32 = (1 << 28) - 1;

pub const MAX_PAYLOAD_ID: u32 = ID_MASK;
pub const MAX_SEQUENCE: u32 = SEQUENCE_MASK;

/// The 32-bit mini-packet header, stored little-endian on the wire.
///
/// Two overlapping interpretations, selected by the 4-bit type tag:
///
/// - variable-size: `type:4 | payload_id:20 | byte_count_enc:8` with the
///   total packet size being `4 * (byte_count_enc + 1)`;
/// - fixed-size (`Acknowledge`, `BeginSnapshot`, `EndSnapshot`):
///   `type:4 | sequence:28`.
///
/// The layout is defined purely through shifts and masks on a `u32` so the
/// wire encoding is independent of host ABI.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader(u32);

impl PacketHeader {
    /// Builds a variable-size header. `total_size` is the full mini-packet
    /// size in bytes including this header; it must be a positive multiple
    /// of 4 no larger than 1024.
    #[inline]
    pub fn variable(ptype: PacketType, payload_id: u32, total_size: usize) -> PacketHeader {
        debug_assert!(!ptype.is_fixed_size());
        debug_assert!(payload_id <= ID_MASK);
        debug_assert!(total_size > 0 && total_size <= 1024);
        debug_assert!(total_size % 4 == 0);

        let enc = (total_size as u32 >> 2) - 1;
        PacketHeader(
            (ptype as u32 & TYPE_MASK)
                | ((payload_id & ID_MASK) << TYPE_BITS)
                | (enc << (TYPE_BITS + ID_BITS)),
        )
    }

    /// Builds a fixed-size header carrying a 28-bit sequence number.
    #[inline]
    pub fn fixed(ptype: PacketType, sequence: u32) -> PacketHeader {
        debug_assert!(ptype.is_fixed_size());
        debug_assert!(sequence <= SEQUENCE_MASK);

        PacketHeader((ptype as u32 & TYPE_MASK) | ((sequence & SEQUENCE_MASK) << TYPE_BITS))
    }

    #[inline]
    pub fn packet_type(self) -> NetResult<PacketType> {
        PacketType::from_tag(self.0 & TYPE_MASK)
            .ok_or(NetError::Fatal(FaultKind::UnknownPacketType))
    }

    /// Payload id of a variable-size packet (node id or message opcode).
    #[inline]
    pub fn payload_id(self) -> u32 {
        (self.0 >> TYPE_BITS) & ID_MASK
    }

    /// Sequence number of a fixed-size packet.
    #[inline]
    pub fn sequence(self) -> u32 {
        (self.0 >> TYPE_BITS) & SEQUENCE_MASK
    }

    /// Total byte count of the mini-packet this header starts.
    #[inline]
    pub fn byte_count(self) -> NetResult<usize> {
        let ptype = self.packet_type()?;
        let count = match ptype {
            PacketType::Acknowledge | PacketType::BeginSnapshot => HEADER_SIZE,
            PacketType::EndSnapshot => END_SNAPSHOT_SIZE,
            _ => ((self.0 >> (TYPE_BITS + ID_BITS)) as usize + 1) << 2,
        };
        Ok(count)
    }

    #[inline]
    pub fn write(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }

    #[inline]
    pub fn read(buf: &[u8]) -> PacketHeader {
        PacketHeader(LittleEndian::read_u32(buf))
    }
}

/// Packed second word of the node-create packets:
/// `parent_id:16 | node_type:8 | creation_code:8`.
#[inline]
pub fn pack_create_word(parent_id: u32, node_type: u8, creation_code: u8) -> u32 {
    debug_assert!(parent_id < 65536);
    (parent_id & 0xFFFF) | (u32::from(node_type) << 16) | (u32::from(creation_code) << 24)
}

#[inline]
pub fn unpack_create_word(word: u32) -> (u32, u8, u8) {
    (word & 0xFFFF, ((word >> 16) & 0xFF) as u8, ((word >> 24) & 0xFF) as u8)
}
