use glam::{Quat, Vec3, Vec4};
use tachyon::state::node::{self, NodeType, STRING_SIZE};
use tachyon::state::object::{MemberDef, ReplicableObject};

/// Creation-blob tags selecting the pawn subtype on the receiving side.
pub const PAWN_KIND_PLAYER: u8 = 1;
pub const PAWN_KIND_DRONE: u8 = 2;

const POSITION_OFFSET: usize = 0;
const ORIENTATION_OFFSET: usize = 12;
const NAME_OFFSET: usize = 28;
const STATE_SIZE: usize = NAME_OFFSET + STRING_SIZE;

static PAWN_MEMBERS: [MemberDef; 3] = [
    MemberDef {
        node_type: NodeType::Float3AsQwordDelta,
        offset: POSITION_OFFSET,
        size: 12,
    },
    MemberDef {
        node_type: NodeType::Float4AsHalf4Delta,
        offset: ORIENTATION_OFFSET,
        size: 16,
    },
    MemberDef {
        node_type: NodeType::String,
        offset: NAME_OFFSET,
        size: STRING_SIZE,
    },
];

/// A mobile entity: fixed-point replicated position, compressed
/// orientation, display name. Member storage is one flat expanded-layout
/// block indexed by the member table.
pub struct Pawn {
    kind: u8,
    node_id: u32,
    remote: bool,
    state: [u8; STATE_SIZE],
}

impl Pawn {
    pub fn new(kind: u8, name: &str) -> Pawn {
        let mut pawn = Pawn {
            kind,
            node_id: 0,
            remote: false,
            state: [0; STATE_SIZE],
        };
        pawn.set_orientation(Quat::IDENTITY);
        pawn.set_name(name);
        pawn
    }

    #[inline]
    pub fn kind(&self) -> u8 {
        self.kind
    }

    #[inline]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        node::read_vec3(&self.state[POSITION_OFFSET..])
    }

    #[inline]
    pub fn set_position(&mut self, position: Vec3) {
        node::write_vec3(&mut self.state[POSITION_OFFSET..POSITION_OFFSET + 12], position);
    }

    #[inline]
    pub fn orientation(&self) -> Quat {
        let v = node::read_vec4(&self.state[ORIENTATION_OFFSET..]);
        if v.length_squared() < 1.0e-6 {
            Quat::IDENTITY
        } else {
            Quat::from_vec4(v).normalize()
        }
    }

    #[inline]
    pub fn set_orientation(&mut self, orientation: Quat) {
        node::write_vec4(
            &mut self.state[ORIENTATION_OFFSET..ORIENTATION_OFFSET + 16],
            Vec4::from(orientation),
        );
    }

    pub fn name(&self) -> String {
        let buffer = &self.state[NAME_OFFSET..];
        let end = buffer.iter().position(|&c| c == 0).unwrap_or(STRING_SIZE);
        String::from_utf8_lossy(&buffer[..end]).into_owned()
    }

    pub fn set_name(&mut self, name: &str) {
        let buffer = &mut self.state[NAME_OFFSET..];
        for byte in buffer.iter_mut() {
            *byte = 0;
        }
        let bytes = name.as_bytes();
        let len = bytes.len().min(STRING_SIZE - 1);
        buffer[..len].copy_from_slice(&bytes[..len]);
    }

    /// Ids of the member nodes when the pawn was registered as a group
    /// rooted at `group_id`: (position, orientation, name).
    #[inline]
    pub fn member_node_ids(group_id: u32) -> (u32, u32, u32) {
        (group_id + 1, group_id + 2, group_id + 3)
    }
}

impl ReplicableObject for Pawn {
    fn members(&self) -> &[MemberDef] {
        &PAWN_MEMBERS
    }

    fn read_member(&self, offset: usize, size: usize, out: &mut [u8]) {
        out[..size].copy_from_slice(&self.state[offset..offset + size]);
    }

    fn write_member(&mut self, offset: usize, size: usize, data: &[u8]) {
        self.state[offset..offset + size].copy_from_slice(&data[..size]);
    }

    fn set_node_id(&mut self, id: u32) {
        self.node_id = id;
    }

    fn set_remote(&mut self, remote: bool) {
        self.remote = remote;
    }
}

/// Builds a pawn from a creation blob (first byte is the kind tag).
pub fn pawn_from_blob(blob: &[u8]) -> Option<Pawn> {
    match blob.first() {
        Some(&kind) if kind == PAWN_KIND_PLAYER || kind == PAWN_KIND_DRONE => {
            Some(Pawn::new(kind, ""))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_table_covers_state() {
        let last = PAWN_MEMBERS.last().unwrap();
        assert_eq!(last.offset + last.size, STATE_SIZE);
    }

    #[test]
    fn test_accessors_roundtrip() {
        let mut pawn = Pawn::new(PAWN_KIND_PLAYER, "Scout");

        pawn.set_position(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(pawn.position(), Vec3::new(1.0, 2.0, 3.0));

        let pose = Quat::from_rotation_y(0.5);
        pawn.set_orientation(pose);
        assert!(pawn.orientation().dot(pose).abs() > 0.999);

        assert_eq!(pawn.name(), "Scout");
    }

    #[test]
    fn test_member_read_write() {
        let mut pawn = Pawn::new(PAWN_KIND_DRONE, "");

        let member = PAWN_MEMBERS[0];
        let mut bytes = [0u8; 12];
        node::write_vec3(&mut bytes, Vec3::new(4.0, 5.0, 6.0));
        pawn.write_member(member.offset, member.size, &bytes);

        assert_eq!(pawn.position(), Vec3::new(4.0, 5.0, 6.0));

        let mut out = [0u8; 12];
        pawn.read_member(member.offset, member.size, &mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_blob_dispatch() {
        assert!(pawn_from_blob(&[PAWN_KIND_PLAYER]).is_some());
        assert!(pawn_from_blob(&[PAWN_KIND_DRONE]).is_some());
        assert!(pawn_from_blob(&[99]).is_none());
        assert!(pawn_from_blob(&[]).is_none());
    }

    #[test]
    fn test_long_name_truncates() {
        let pawn = Pawn::new(PAWN_KIND_PLAYER, &"x".repeat(100));
        assert_eq!(pawn.name().len(), STRING_SIZE - 1);
    }
}
