use crate::predict::{Filter, PredictionConstants};
use crate::state::node::{self, NodeType};
use byteorder::ByteOrder;
use crate::state::object::ReplicableObject;
use crate::state::snapshot::{SnapIdx, Snapshot};
use glam::{Quat, Vec3, Vec4};
use hashbrown::HashMap;
use quark::logfile::{Column, ColumnType, StructuredLogFile};
use quark::time::TICKS_PER_SECOND;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Where a node's expanded value lives.
pub enum Backing {
    /// No value (interior nodes).
    None,
    /// Tree-owned bytes in expanded layout.
    Owned(Vec<u8>),
    /// A member of a registered replicable object.
    Object {
        object_id: u32,
        offset: usize,
        size: usize,
    },
}

impl Backing {
    /// Tree-owned storage of the type's expanded size, zero-initialized.
    #[inline]
    pub fn owned_zeroed(node_type: NodeType) -> Backing {
        Backing::Owned(vec![0u8; node_type.expanded_size()])
    }
}

/// Creation metadata replayed to peers so they can reconstruct the matching
/// application object.
pub struct CreationData {
    pub code: u8,
    pub blob: Option<Vec<u8>>,
}

pub struct LinkNode {
    id: u32,
    node_type: NodeType,
    include_in_snapshot: bool,
    parent: u32,
    children: Vec<u32>,
    backing: Backing,
    filter: Option<Filter>,
    creation: CreationData,
}

impl LinkNode {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    #[inline]
    pub fn include_in_snapshot(&self) -> bool {
        self.include_in_snapshot
    }

    /// Parent node id; `None` at the root level.
    #[inline]
    pub fn parent_id(&self) -> Option<u32> {
        if self.parent == 0 {
            None
        } else {
            Some(self.parent)
        }
    }

    /// Child ids, ascending.
    #[inline]
    pub fn children(&self) -> &[u32] {
        &self.children
    }
}

/// The authoritative registry of replicable state. Nodes are addressed by
/// their 32-bit id (0 is reserved for "no parent"); child id lists are kept
/// ascending so snapshots inherit the ordering the diff depends on.
pub struct StateTree {
    nodes: HashMap<u32, LinkNode>,
    roots: Vec<u32>,
    objects: HashMap<u32, Box<dyn ReplicableObject>>,
    next_snapshot_index: u32,
    client_mode: bool,
    null_snapshot: Arc<Snapshot>,
    logging_node: Option<u32>,
    node_log: StructuredLogFile,
}

impl StateTree {
    /// In client mode, updates to locally authoritative nodes
    /// (`include_in_snapshot`) arriving from the peer are ignored.
    pub fn new(client_mode: bool) -> StateTree {
        StateTree {
            nodes: HashMap::new(),
            roots: Vec::new(),
            objects: HashMap::new(),
            next_snapshot_index: 1,
            client_mode,
            null_snapshot: Arc::new(Snapshot::new(0)),
            logging_node: None,
            node_log: StructuredLogFile::new(),
        }
    }

    /// The empty index-0 snapshot every send queue diffs against until the
    /// peer acknowledges something.
    #[inline]
    pub fn null_snapshot(&self) -> Arc<Snapshot> {
        self.null_snapshot.clone()
    }

    #[inline]
    pub fn set_snapshot_index(&mut self, index: u32) {
        self.next_snapshot_index = index;
    }

    #[inline]
    pub fn find(&self, id: u32) -> Option<&LinkNode> {
        self.nodes.get(&id)
    }

    #[inline]
    pub fn object(&self, id: u32) -> Option<&dyn ReplicableObject> {
        self.objects.get(&id).map(|b| &**b)
    }

    #[inline]
    pub fn object_mut(&mut self, id: u32) -> Option<&mut (dyn ReplicableObject + 'static)> {
        self.objects.get_mut(&id).map(|b| &mut **b)
    }

    /// Registers an object under an already created root node id.
    pub fn adopt_object(&mut self, id: u32, object: Box<dyn ReplicableObject>) {
        debug_assert!(self.nodes.contains_key(&id));
        self.objects.insert(id, object);
    }

    /// Creates a single node. Fails on id 0, duplicate ids, a missing
    /// non-zero parent, or a non-`Complex` create at the root level.
    pub fn create_node(
        &mut self,
        parent_id: u32,
        id: u32,
        node_type: NodeType,
        backing: Backing,
        creation_code: u8,
        creation_blob: Option<&[u8]>,
        include_in_snapshot: bool,
    ) -> bool {
        if id == 0 || self.nodes.contains_key(&id) {
            return false;
        }

        if parent_id == 0 {
            if !node_type.is_complex() {
                return false;
            }
        } else if !self.nodes.contains_key(&parent_id) {
            return false;
        }

        let node = LinkNode {
            id,
            node_type,
            include_in_snapshot,
            parent: parent_id,
            children: Vec::new(),
            backing,
            filter: Filter::for_node_type(node_type),
            creation: CreationData {
                code: creation_code,
                blob: creation_blob.filter(|b| !b.is_empty()).map(|b| b.to_vec()),
            },
        };

        self.nodes.insert(id, node);

        let list = if parent_id == 0 {
            &mut self.roots
        } else {
            &mut self.nodes.get_mut(&parent_id).expect("parent checked above").children
        };
        let pos = list.iter().position(|&c| c > id).unwrap_or_else(|| list.len());
        list.insert(pos, id);

        true
    }

    /// Registers an object as one `Complex` node plus one node per member,
    /// consuming a contiguous id range starting at `start_id`. Returns the
    /// next free id (`start_id` if the root create failed).
    pub fn create_node_group(
        &mut self,
        parent_id: u32,
        start_id: u32,
        mut object: Box<dyn ReplicableObject>,
        creation_blob: Option<&[u8]>,
        include_in_snapshot: bool,
    ) -> u32 {
        let mut next_id = start_id;
        let group_id = next_id;
        next_id += 1;

        if !self.create_node(
            parent_id,
            group_id,
            NodeType::Complex,
            Backing::None,
            0,
            creation_blob,
            include_in_snapshot,
        ) {
            return start_id;
        }

        object.set_node_id(group_id);
        let members: Vec<_> = object.members().to_vec();
        self.objects.insert(group_id, object);

        for (index, member) in members.iter().enumerate() {
            self.create_node(
                group_id,
                next_id,
                member.node_type,
                Backing::Object {
                    object_id: group_id,
                    offset: member.offset,
                    size: member.size,
                },
                index as u8,
                None,
                include_in_snapshot,
            );
            next_id += 1;
        }

        next_id
    }

    /// Deletes a node and its entire subtree, along with any objects rooted
    /// in it. Returns false for an unknown id.
    pub fn delete_subtree(&mut self, id: u32) -> bool {
        let parent = match self.nodes.get(&id) {
            Some(node) => node.parent,
            None => return false,
        };

        let list = if parent == 0 {
            &mut self.roots
        } else {
            match self.nodes.get_mut(&parent) {
                Some(parent_node) => &mut parent_node.children,
                None => &mut self.roots,
            }
        };
        list.retain(|&c| c != id);

        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                pending.extend_from_slice(&node.children);
                self.objects.remove(&current);

                if self.logging_node == Some(current) {
                    self.stop_node_logging();
                }
            }
        }

        true
    }

    /// Applies storage-form bytes received from the peer. Unknown ids are
    /// ignored (the peer may be ahead of us). Delta and predict types run
    /// their filter; everything else is a plain decode-and-store.
    pub fn update_node_data(
        &mut self,
        id: u32,
        storage: &[u8],
        now: i64,
        constants: &PredictionConstants,
    ) -> bool {
        let node = match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => return false,
        };

        if self.client_mode && node.include_in_snapshot {
            // The client owns this value authoritatively.
            return true;
        }

        let node_type = node.node_type;
        if node_type.is_complex() {
            return true;
        }

        let mut expanded = [0u8; node::STRING_SIZE];
        let expanded_len = node_type.expanded_size();

        if node_type == NodeType::Blob {
            let objects = &mut self.objects;
            store_expanded(objects, &mut node.backing, storage);
            return true;
        }

        if storage.len() < node_type.storage_size() {
            return false;
        }

        if let Some(filter) = node.filter.as_mut() {
            match node_type {
                NodeType::Float4AsHalf4Delta | NodeType::PredictQuaternion => {
                    let value = quat_from_wire(node::storage_to_vec4(node_type, storage));
                    filter.receive_quat(value, now, constants);
                    node::write_vec4(&mut expanded, Vec4::from(filter.raw_quat().unwrap_or(Quat::IDENTITY)));
                }
                _ => {
                    let value = node::storage_to_vec3(node_type, storage);
                    filter.receive_vec3(value, now, constants);
                    node::write_vec3(&mut expanded, filter.raw_vec3().unwrap_or(Vec3::ZERO));
                }
            }
        } else {
            node::decode(node_type, storage, &mut expanded[..expanded_len]);
        }

        let objects = &mut self.objects;
        store_expanded(objects, &mut node.backing, &expanded[..expanded_len]);

        if let Some(logging) = self.logging_node {
            if logging == id || self.nodes[&id].parent == logging {
                self.log_update(id, node_type, &expanded[..expanded_len], now);
            }
        }

        true
    }

    /// Current expanded bytes of a leaf node.
    pub fn expanded_bytes(&self, id: u32) -> Option<Vec<u8>> {
        let node = self.nodes.get(&id)?;
        if node.node_type.is_complex() {
            return None;
        }
        Some(load_expanded(&self.objects, node))
    }

    /// Overwrites a leaf's expanded bytes locally (authority-side write).
    pub fn write_value(&mut self, id: u32, expanded: &[u8]) -> bool {
        let node = match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => return false,
        };
        if node.node_type.is_complex() {
            return false;
        }
        store_expanded(&mut self.objects, &mut node.backing, expanded);
        true
    }

    /// Runs the node's filter at `now`; `None` for unfiltered nodes.
    pub fn sample_vec3(&mut self, id: u32, now: i64, constants: &PredictionConstants) -> Option<Vec3> {
        self.nodes
            .get_mut(&id)?
            .filter
            .as_mut()?
            .sample_vec3(now, constants)
    }

    pub fn sample_quat(&mut self, id: u32, now: i64, constants: &PredictionConstants) -> Option<Quat> {
        self.nodes
            .get_mut(&id)?
            .filter
            .as_mut()?
            .sample_quat(now, constants)
    }

    /// Takes an immutable copy of every `include_in_snapshot` subtree,
    /// encoding each leaf into its storage form.
    pub fn snapshot(&mut self) -> Arc<Snapshot> {
        let mut snapshot = Snapshot::new(self.next_snapshot_index);
        self.next_snapshot_index = self.next_snapshot_index.wrapping_add(1);

        let roots = self.roots.clone();
        for id in roots {
            self.snapshot_node(&mut snapshot, id, None);
        }

        Arc::new(snapshot)
    }

    fn snapshot_node(&self, snapshot: &mut Snapshot, id: u32, parent: Option<SnapIdx>) {
        let node = match self.nodes.get(&id) {
            Some(node) => node,
            None => return,
        };

        if !node.include_in_snapshot {
            return;
        }

        let idx = if node.node_type.is_complex() {
            snapshot.add_complex(parent, id)
        } else {
            let expanded = load_expanded(&self.objects, node);
            let storage = if node.node_type == NodeType::Blob {
                expanded
            } else {
                let mut storage = vec![0u8; node.node_type.storage_size()];
                node::encode(node.node_type, &expanded, &mut storage);
                storage
            };
            snapshot.add_leaf(parent, id, node.node_type, &storage)
        };

        snapshot.set_creation(idx, node.creation.code, node.creation.blob.as_deref());

        if node.node_type.is_complex() {
            for &child in &node.children {
                self.snapshot_node(snapshot, child, Some(idx));
            }
        }
    }

    // --- node value logging ------------------------------------------------

    /// Attaches a CSV log to the node (and its direct children); every
    /// applied update of a float3/float4 typed node is recorded.
    pub fn start_node_logging<P: AsRef<Path>>(&mut self, path: P, id: u32) -> io::Result<bool> {
        if !self.nodes.contains_key(&id) {
            return Ok(false);
        }

        static COLUMNS: [Column; 6] = [
            Column {
                name: "Timestamp",
                kind: ColumnType::UInt64,
            },
            Column {
                name: "NodeID",
                kind: ColumnType::UInt32,
            },
            Column {
                name: "Float0",
                kind: ColumnType::Float,
            },
            Column {
                name: "Float1",
                kind: ColumnType::Float,
            },
            Column {
                name: "Float2",
                kind: ColumnType::Float,
            },
            Column {
                name: "Float3",
                kind: ColumnType::Float,
            },
        ];

        self.node_log.open(path, &COLUMNS)?;

        // First line records the tick frequency for offline conversion.
        self.node_log.set_u64(0, &[TICKS_PER_SECOND as u64]);
        self.node_log.flush_line()?;

        self.logging_node = Some(id);
        Ok(true)
    }

    pub fn stop_node_logging(&mut self) {
        drop(self.node_log.close());
        self.logging_node = None;
    }

    fn log_update(&mut self, id: u32, node_type: NodeType, expanded: &[u8], now: i64) {
        if !self.node_log.is_open() {
            return;
        }

        let floats: usize = match node_type {
            NodeType::Float3
            | NodeType::Float3Delta
            | NodeType::Float3AsHalf4Delta
            | NodeType::Float3AsQwordDelta
            | NodeType::PredictFloat3 => 3,
            NodeType::Float4
            | NodeType::Float4AsByteN4
            | NodeType::Float4AsHalf4
            | NodeType::Float4AsHalf4Delta
            | NodeType::PredictQuaternion => 4,
            _ => return,
        };

        self.node_log.set_u64(0, &[now as u64]);
        self.node_log.set_u32(1, &[id]);

        let mut values = [0f32; 4];
        for (i, value) in values.iter_mut().enumerate().take(floats) {
            *value = byteorder::LittleEndian::read_f32(&expanded[i * 4..]);
        }
        self.node_log.set_f32(2, &values[..floats]);

        drop(self.node_log.flush_line());
    }
}

fn quat_from_wire(v: Vec4) -> Quat {
    if v.length_squared() < 1.0e-6 {
        Quat::IDENTITY
    } else {
        Quat::from_vec4(v).normalize()
    }
}

fn store_expanded(
    objects: &mut HashMap<u32, Box<dyn ReplicableObject>>,
    backing: &mut Backing,
    data: &[u8],
) {
    match backing {
        Backing::None => {}
        Backing::Owned(vec) => {
            if vec.len() != data.len() {
                vec.clear();
                vec.extend_from_slice(data);
            } else {
                vec.copy_from_slice(data);
            }
        }
        Backing::Object {
            object_id,
            offset,
            size,
        } => {
            if let Some(object) = objects.get_mut(object_id) {
                let size = (*size).min(data.len());
                object.write_member(*offset, size, &data[..size]);
            }
        }
    }
}

fn load_expanded(objects: &HashMap<u32, Box<dyn ReplicableObject>>, node: &LinkNode) -> Vec<u8> {
    match &node.backing {
        Backing::None => Vec::new(),
        Backing::Owned(vec) => vec.clone(),
        Backing::Object {
            object_id,
            offset,
            size,
        } => {
            let mut out = vec![0u8; *size];
            if let Some(object) = objects.get(object_id) {
                object.read_member(*offset, *size, &mut out);
            }
            out
        }
    }
}
