use crate::net::wire::{PacketType, PACKET_TYPE_NAMES};
use quark::logfile::{Column, ColumnType, StructuredLogFile};
use std::io;
use std::path::Path;

static PACKET_LOG_COLUMNS: [Column; 7] = [
    Column {
        name: "SnapshotID",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "PacketIndex",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "MessageIndex",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "PacketType",
        kind: ColumnType::Enum(&PACKET_TYPE_NAMES),
    },
    Column {
        name: "NodeID",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "ParentNodeID",
        kind: ColumnType::UInt32,
    },
    Column {
        name: "Bytes",
        kind: ColumnType::UInt32,
    },
];

/// CSV trace of every mini-packet an encoder emits or a decoder walks.
/// Disabled until opened; all hooks are no-ops while closed.
pub struct PacketLog {
    file: StructuredLogFile,
    snapshot_index: u32,
    packet_index: u32,
    message_index: u32,
}

impl PacketLog {
    #[inline]
    pub fn new() -> PacketLog {
        PacketLog {
            file: StructuredLogFile::new(),
            snapshot_index: 0,
            packet_index: 0,
            message_index: 0,
        }
    }

    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        self.file.open(path, &PACKET_LOG_COLUMNS)
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.file.close()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    #[inline]
    pub fn set_snapshot_index(&mut self, index: u32) {
        self.snapshot_index = index;
    }

    #[inline]
    pub fn increment_packet_index(&mut self) {
        self.packet_index += 1;
    }

    #[inline]
    pub fn reset_indices(&mut self) {
        self.packet_index = 0;
        self.message_index = 0;
    }

    pub fn log_message(&mut self, ptype: PacketType, node_id: u32, parent_id: u32, bytes: u32) {
        if !self.file.is_open() {
            return;
        }

        self.file.set_u32(
            0,
            &[
                self.snapshot_index,
                self.packet_index,
                self.message_index,
                ptype as u32,
                node_id,
                parent_id,
                bytes,
            ],
        );
        drop(self.file.flush_line());
        self.message_index += 1;
    }
}
