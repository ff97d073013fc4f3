use crate::state::node::NodeType;

/// Position of one replicable member inside an object's state. The offset
/// and size index the object's own storage; the core never interprets them
/// beyond handing them back to the object.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemberDef {
    pub node_type: NodeType,
    pub offset: usize,
    pub size: usize,
}

/// An application object whose members replicate through the state tree.
///
/// Member bytes use the canonical little-endian expanded layout of the
/// member's node type. Registration enumerates `members()` and binds one
/// node per entry; decoded updates arrive through `write_member`, snapshot
/// encoding reads through `read_member`. Objects must be `Send`: the tree
/// that owns them lives on (or moves to) the connection's tick worker.
pub trait ReplicableObject: Send {
    fn members(&self) -> &[MemberDef];

    /// Copies the expanded bytes of the member at `offset` into `out`.
    fn read_member(&self, offset: usize, size: usize, out: &mut [u8]);

    /// Stores expanded bytes into the member at `offset`.
    fn write_member(&mut self, offset: usize, size: usize, data: &[u8]);

    /// Creates a member that needs the creation blob for context (e.g. a
    /// dynamically sized attachment). Returns the new member's position, or
    /// `None` if the object cannot host it.
    fn create_dynamic_child(&mut self, _creation_blob: &[u8], _node_type: NodeType) -> Option<MemberDef> {
        None
    }

    /// Called once the object's root node id is known.
    fn set_node_id(&mut self, _id: u32) {}

    /// Marks the object as a peer-owned mirror rather than a local authority.
    fn set_remote(&mut self, _remote: bool) {}
}
