use crate::state::node::NodeType;
use crate::state::object::ReplicableObject;
use crate::state::tree::{Backing, StateTree};
use hashbrown::HashSet;

/// Constructor/destructor hooks for objects announced by the peer. Both the
/// server and the client application implement this; the core routes
/// `NodeCreate*` / `NodeDelete` events through it.
pub trait RemoteFactory {
    /// Builds the application object for a peer-created `Complex` node. The
    /// creation blob selects the concrete subtype; `None` leaves a bare
    /// interior node with no bound object.
    fn create_remote_object(
        &mut self,
        parent_id: u32,
        id: u32,
        creation_blob: &[u8],
    ) -> Option<Box<dyn ReplicableObject>>;

    /// Notification that a peer-created object's subtree was deleted. The
    /// tree has already dropped the object itself.
    fn delete_remote_object(&mut self, _id: u32) {}
}

/// Applies a peer `NodeCreate` event. Duplicate creates are idempotent.
/// `include_in_snapshot` is true on the server (client inputs re-broadcast
/// to other peers) and false on the client (mirrors stay peer-owned).
pub fn handle_create_node(
    tree: &mut StateTree,
    factory: &mut dyn RemoteFactory,
    remote_objects: &mut HashSet<u32>,
    parent_id: u32,
    id: u32,
    node_type: NodeType,
    creation_code: u8,
    creation_blob: &[u8],
    include_in_snapshot: bool,
) -> bool {
    if id == 0 {
        return false;
    }

    if tree.find(id).is_some() {
        // Redelivered create from a resent snapshot.
        return true;
    }

    let blob = if creation_blob.is_empty() {
        None
    } else {
        Some(creation_blob)
    };

    if node_type.is_complex() {
        if !tree.create_node(
            parent_id,
            id,
            NodeType::Complex,
            Backing::None,
            creation_code,
            blob,
            include_in_snapshot,
        ) {
            return false;
        }

        if let Some(mut object) = factory.create_remote_object(parent_id, id, creation_blob) {
            object.set_node_id(id);
            object.set_remote(true);
            tree.adopt_object(id, object);
            remote_objects.insert(id);
        }

        return true;
    }

    // Leaf nodes bind into the parent's object.
    if parent_id == 0 {
        return false;
    }

    if creation_blob.is_empty() {
        // The creation code indexes the parent's member table. A parent
        // without a bound object still mirrors the value in tree-owned
        // storage.
        let member = match tree.object(parent_id) {
            Some(object) => object.members().get(creation_code as usize).copied(),
            None => {
                return tree.create_node(
                    parent_id,
                    id,
                    node_type,
                    Backing::owned_zeroed(node_type),
                    creation_code,
                    None,
                    include_in_snapshot,
                );
            }
        };

        match member {
            Some(member) if member.node_type == node_type => tree.create_node(
                parent_id,
                id,
                node_type,
                Backing::Object {
                    object_id: parent_id,
                    offset: member.offset,
                    size: member.size,
                },
                creation_code,
                None,
                include_in_snapshot,
            ),
            _ => false,
        }
    } else {
        // The parent object materializes storage from the blob.
        let member = match tree.object_mut(parent_id) {
            Some(object) => object.create_dynamic_child(creation_blob, node_type),
            None => return false,
        };

        match member {
            Some(member) => tree.create_node(
                parent_id,
                id,
                node_type,
                Backing::Object {
                    object_id: parent_id,
                    offset: member.offset,
                    size: member.size,
                },
                0,
                blob,
                include_in_snapshot,
            ),
            None => false,
        }
    }
}

/// Applies a peer `NodeDelete` event.
pub fn handle_delete_node(
    tree: &mut StateTree,
    factory: &mut dyn RemoteFactory,
    remote_objects: &mut HashSet<u32>,
    id: u32,
) -> bool {
    if remote_objects.remove(&id) {
        factory.delete_remote_object(id);
    }
    tree.delete_subtree(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::object::MemberDef;
    use byteorder::ByteOrder;

    struct MirrorObject {
        state: [u8; 12],
    }

    static MIRROR_MEMBERS: [MemberDef; 1] = [MemberDef {
        node_type: NodeType::Float3,
        offset: 0,
        size: 12,
    }];

    impl ReplicableObject for MirrorObject {
        fn members(&self) -> &[MemberDef] {
            &MIRROR_MEMBERS
        }

        fn read_member(&self, offset: usize, size: usize, out: &mut [u8]) {
            out[..size].copy_from_slice(&self.state[offset..offset + size]);
        }

        fn write_member(&mut self, offset: usize, size: usize, data: &[u8]) {
            self.state[offset..offset + size].copy_from_slice(&data[..size]);
        }
    }

    struct MirrorFactory {
        created: Vec<u32>,
        deleted: Vec<u32>,
    }

    impl MirrorFactory {
        fn new() -> MirrorFactory {
            MirrorFactory {
                created: Vec::new(),
                deleted: Vec::new(),
            }
        }
    }

    impl RemoteFactory for MirrorFactory {
        fn create_remote_object(
            &mut self,
            _parent_id: u32,
            id: u32,
            _creation_blob: &[u8],
        ) -> Option<Box<dyn ReplicableObject>> {
            self.created.push(id);
            Some(Box::new(MirrorObject { state: [0; 12] }))
        }

        fn delete_remote_object(&mut self, id: u32) {
            self.deleted.push(id);
        }
    }

    #[test]
    fn test_create_complex_and_member() {
        let mut tree = StateTree::new(true);
        let mut factory = MirrorFactory::new();
        let mut remotes = HashSet::new();

        assert!(handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            0,
            100,
            NodeType::Complex,
            0,
            &[1],
            false,
        ));
        assert!(handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            100,
            101,
            NodeType::Float3,
            0,
            &[],
            false,
        ));

        assert_eq!(factory.created, vec![100]);
        assert!(remotes.contains(&100));
        assert!(tree.find(101).is_some());
        assert!(tree.object(100).is_some());
    }

    #[test]
    fn test_duplicate_create_is_idempotent() {
        let mut tree = StateTree::new(true);
        let mut factory = MirrorFactory::new();
        let mut remotes = HashSet::new();

        for _ in 0..2 {
            assert!(handle_create_node(
                &mut tree,
                &mut factory,
                &mut remotes,
                0,
                100,
                NodeType::Complex,
                0,
                &[1],
                false,
            ));
        }

        assert_eq!(factory.created, vec![100]);
    }

    #[test]
    fn test_member_type_mismatch_rejected() {
        let mut tree = StateTree::new(true);
        let mut factory = MirrorFactory::new();
        let mut remotes = HashSet::new();

        handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            0,
            100,
            NodeType::Complex,
            0,
            &[1],
            false,
        );

        // Member 0 is Float3, not Float.
        assert!(!handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            100,
            101,
            NodeType::Float,
            0,
            &[],
            false,
        ));
    }

    #[test]
    fn test_leaf_at_root_rejected() {
        let mut tree = StateTree::new(true);
        let mut factory = MirrorFactory::new();
        let mut remotes = HashSet::new();

        assert!(!handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            0,
            101,
            NodeType::Float3,
            0,
            &[],
            false,
        ));
    }

    struct NoObjectFactory;

    impl RemoteFactory for NoObjectFactory {
        fn create_remote_object(
            &mut self,
            _parent_id: u32,
            _id: u32,
            _creation_blob: &[u8],
        ) -> Option<Box<dyn ReplicableObject>> {
            None
        }
    }

    #[test]
    fn test_leaf_without_parent_object_gets_owned_storage() {
        let mut tree = StateTree::new(true);
        let mut factory = NoObjectFactory;
        let mut remotes = HashSet::new();

        assert!(handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            0,
            1,
            NodeType::Complex,
            0,
            &[],
            false,
        ));
        assert!(handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            1,
            10,
            NodeType::Float,
            0,
            &[],
            false,
        ));

        // The value round-trips through tree-owned storage.
        let mut storage = [0u8; 4];
        byteorder::LittleEndian::write_f32(&mut storage, 3.5);
        tree.update_node_data(10, &storage, 0, &crate::predict::PredictionConstants::default());

        let bytes = tree.expanded_bytes(10).unwrap();
        assert_eq!(byteorder::LittleEndian::read_f32(&bytes), 3.5);
    }

    #[test]
    fn test_delete_notifies_factory() {
        let mut tree = StateTree::new(true);
        let mut factory = MirrorFactory::new();
        let mut remotes = HashSet::new();

        handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            0,
            100,
            NodeType::Complex,
            0,
            &[1],
            false,
        );
        handle_create_node(
            &mut tree,
            &mut factory,
            &mut remotes,
            100,
            101,
            NodeType::Float3,
            0,
            &[],
            false,
        );

        assert!(handle_delete_node(&mut tree, &mut factory, &mut remotes, 100));

        assert_eq!(factory.deleted, vec![100]);
        assert!(tree.find(100).is_none());
        assert!(tree.find(101).is_none());
        assert!(!remotes.contains(&100));
    }
}
