use crate::state::node::NodeType;
use crate::zone::{Zone, ZoneRange};
use std::sync::atomic::{AtomicBool, Ordering};

/// Index of a node within one snapshot's arena.
pub type SnapIdx = usize;

/// A value node frozen into a snapshot. Leaf data is already in storage
/// (wire) form; `Complex` nodes carry a child list sorted ascending by id.
pub struct SnapNode {
    id: u32,
    node_type: NodeType,
    data: ZoneRange,
    children: Vec<SnapIdx>,
    creation_code: u8,
    creation_blob: ZoneRange,
    previously_changed: AtomicBool,
}

impl SnapNode {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    #[inline]
    pub fn is_complex(&self) -> bool {
        self.node_type.is_complex()
    }

    #[inline]
    pub fn creation_code(&self) -> u8 {
        self.creation_code
    }

    #[inline]
    pub fn children(&self) -> &[SnapIdx] {
        &self.children
    }

    /// Sticky-change marker: set when a delta leaf was sent as changed, so
    /// the next unchanged diff re-sends it once more.
    #[inline]
    pub fn was_previously_changed(&self) -> bool {
        self.previously_changed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_previously_changed(&self) {
        self.previously_changed.store(true, Ordering::Relaxed);
    }
}

/// An immutable copy of the state tree's values at one tick. All node
/// metadata, storage bytes and cloned creation blobs live in the snapshot's
/// zone and are released together when the snapshot is dropped. Snapshots
/// are shared by `Arc`; each send queue retains them until acknowledged.
pub struct Snapshot {
    index: u32,
    nodes: Vec<SnapNode>,
    roots: Vec<SnapIdx>,
    zone: Zone,
}

impl Snapshot {
    pub fn new(index: u32) -> Snapshot {
        Snapshot {
            index,
            nodes: Vec::new(),
            roots: Vec::new(),
            zone: Zone::new(),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn node(&self, idx: SnapIdx) -> &SnapNode {
        &self.nodes[idx]
    }

    #[inline]
    pub fn roots(&self) -> &[SnapIdx] {
        &self.roots
    }

    /// Storage bytes of a leaf node.
    #[inline]
    pub fn storage(&self, node: &SnapNode) -> &[u8] {
        self.zone.get(node.data)
    }

    #[inline]
    pub fn creation_blob(&self, node: &SnapNode) -> &[u8] {
        self.zone.get(node.creation_blob)
    }

    /// Adds an interior node. `parent` of `None` attaches at the root level.
    pub fn add_complex(&mut self, parent: Option<SnapIdx>, id: u32) -> SnapIdx {
        self.add_node(parent, id, NodeType::Complex, &[])
    }

    /// Adds a leaf node holding the given storage-form bytes.
    pub fn add_leaf(
        &mut self,
        parent: Option<SnapIdx>,
        id: u32,
        node_type: NodeType,
        storage: &[u8],
    ) -> SnapIdx {
        debug_assert!(!node_type.is_complex());
        self.add_node(parent, id, node_type, storage)
    }

    pub fn set_creation(&mut self, idx: SnapIdx, code: u8, blob: Option<&[u8]>) {
        let range = match blob {
            Some(blob) if !blob.is_empty() => self.zone.write(blob),
            _ => ZoneRange::EMPTY,
        };
        let node = &mut self.nodes[idx];
        node.creation_code = code;
        node.creation_blob = range;
    }

    fn add_node(
        &mut self,
        parent: Option<SnapIdx>,
        id: u32,
        node_type: NodeType,
        storage: &[u8],
    ) -> SnapIdx {
        let data = if storage.is_empty() {
            ZoneRange::EMPTY
        } else {
            self.zone.write(storage)
        };

        let idx = self.nodes.len();
        self.nodes.push(SnapNode {
            id,
            node_type,
            data,
            children: Vec::new(),
            creation_code: 0,
            creation_blob: ZoneRange::EMPTY,
            previously_changed: AtomicBool::new(false),
        });

        match parent {
            Some(parent_idx) => {
                debug_assert!(self.nodes[parent_idx].is_complex());
                let mut children = std::mem::take(&mut self.nodes[parent_idx].children);
                Self::insert_sorted(&self.nodes, &mut children, idx);
                self.nodes[parent_idx].children = children;
            }
            None => {
                let mut roots = std::mem::take(&mut self.roots);
                Self::insert_sorted(&self.nodes, &mut roots, idx);
                self.roots = roots;
            }
        }

        idx
    }

    /// Child lists stay strictly ascending by id; the diff relies on this
    /// to run as an ordered merge.
    fn insert_sorted(nodes: &[SnapNode], list: &mut Vec<SnapIdx>, idx: SnapIdx) {
        let id = nodes[idx].id;
        let pos = list
            .iter()
            .position(|&existing| nodes[existing].id > id)
            .unwrap_or_else(|| list.len());

        debug_assert!(
            pos == 0 || nodes[list[pos - 1]].id < id,
            "duplicate child id {} in snapshot",
            id
        );

        list.insert(pos, idx);
    }

    /// Compares two leaves' storage bytes. Strings compare nul-terminated;
    /// blobs never compare equal.
    fn equal_data(&self, node: &SnapNode, other_snapshot: &Snapshot, other: &SnapNode) -> bool {
        debug_assert_eq!(node.node_type, other.node_type);

        let a = self.storage(node);
        let b = other_snapshot.storage(other);

        match node.node_type {
            NodeType::Blob => false,
            NodeType::String => {
                let end_a = a.iter().position(|&c| c == 0).unwrap_or_else(|| a.len());
                let end_b = b.iter().position(|&c| c == 0).unwrap_or_else(|| b.len());
                a[..end_a] == b[..end_b]
            }
            NodeType::WideString => {
                let nul = |buf: &[u8]| {
                    buf.chunks_exact(2)
                        .position(|unit| unit == [0, 0])
                        .map(|p| p * 2)
                        .unwrap_or_else(|| buf.len())
                };
                a[..nul(a)] == b[..nul(b)]
            }
            _ => a == b,
        }
    }

    /// Emits the structural difference between `self` (older) and `new` into
    /// the sink: one event per node pair, recursing through matched
    /// `Complex` pairs. Both snapshots' child lists are ascending by id, so
    /// this is an ordered merge.
    pub fn diff(&self, new: &Snapshot, sink: &mut dyn DiffSink) {
        debug_assert!(self.index != new.index);
        self.diff_lists(&self.roots, new, &new.roots, None, sink);
    }

    fn emit_created(&self, new: &Snapshot, idx: SnapIdx, parent: Option<SnapIdx>, sink: &mut dyn DiffSink) {
        let node = new.node(idx);
        sink.emit(DiffEvent::Created {
            snapshot: new,
            node,
            parent: parent.map(|p| new.node(p)),
        });

        if node.is_complex() {
            for &child in node.children() {
                self.emit_created(new, child, Some(idx), sink);
            }
        }
    }

    fn emit_deleted(&self, idx: SnapIdx, sink: &mut dyn DiffSink) {
        let node = self.node(idx);
        sink.emit(DiffEvent::Deleted { node });

        if node.is_complex() {
            for &child in node.children() {
                self.emit_deleted(child, sink);
            }
        }
    }

    fn diff_lists(
        &self,
        old_list: &[SnapIdx],
        new: &Snapshot,
        new_list: &[SnapIdx],
        new_parent: Option<SnapIdx>,
        sink: &mut dyn DiffSink,
    ) {
        let mut old_iter = old_list.iter().peekable();
        let mut new_iter = new_list.iter().peekable();

        loop {
            let old_idx = old_iter.peek().copied();
            let new_idx = new_iter.peek().copied();

            match (old_idx, new_idx) {
                (None, None) => break,
                (None, Some(&n)) => {
                    self.emit_created(new, n, new_parent, sink);
                    new_iter.next();
                }
                (Some(&o), None) => {
                    self.emit_deleted(o, sink);
                    old_iter.next();
                }
                (Some(&o), Some(&n)) => {
                    let old_node = self.node(o);
                    let new_node = new.node(n);

                    if old_node.id == new_node.id {
                        if old_node.is_complex() {
                            debug_assert!(new_node.is_complex());
                            sink.emit(DiffEvent::Same {
                                prev: old_node,
                                snapshot: new,
                                node: new_node,
                            });
                            self.diff_lists(&old_node.children, new, &new_node.children, Some(n), sink);
                        } else if self.equal_data(old_node, new, new_node) {
                            sink.emit(DiffEvent::Same {
                                prev: old_node,
                                snapshot: new,
                                node: new_node,
                            });
                        } else {
                            sink.emit(DiffEvent::Changed {
                                prev: old_node,
                                snapshot: new,
                                node: new_node,
                            });
                        }
                        old_iter.next();
                        new_iter.next();
                    } else if old_node.id < new_node.id {
                        // The id vanished from the newer snapshot.
                        self.emit_deleted(o, sink);
                        old_iter.next();
                    } else {
                        // The id appeared in the newer snapshot.
                        self.emit_created(new, n, new_parent, sink);
                        new_iter.next();
                    }
                }
            }
        }
    }
}

/// One structural difference between two snapshots.
pub enum DiffEvent<'a> {
    Created {
        snapshot: &'a Snapshot,
        node: &'a SnapNode,
        parent: Option<&'a SnapNode>,
    },
    Deleted {
        node: &'a SnapNode,
    },
    Changed {
        prev: &'a SnapNode,
        snapshot: &'a Snapshot,
        node: &'a SnapNode,
    },
    Same {
        prev: &'a SnapNode,
        snapshot: &'a Snapshot,
        node: &'a SnapNode,
    },
}

pub trait DiffSink {
    fn emit(&mut self, event: DiffEvent<'_>);
}
