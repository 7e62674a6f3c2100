// crates/quadra_core/src/consts.rs

use core::mem::size_of;

pub const MAGIC_SEG: &[u8; 4] = b"QDRS";
pub const VERSION: u16 = 1;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SegmentKind {
    Dict = 1,   // value pool dictionary (id <-> value)
    Quads = 2,  // quad index snapshot
    Sorted = 3, // materialized sorted relation
}

impl SegmentKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(SegmentKind::Dict),
            2 => Some(SegmentKind::Quads),
            3 => Some(SegmentKind::Sorted),
            _ => None,
        }
    }
}

pub const HDR_SIZE: usize = 48;

/// hash(8) + fingerprint(8) + off(8) + size(4) + pad(4)
pub const IDX_ENTRY_SIZE: usize = 32;
/// off(8) + size(4) + head_len(4) + head[ORDER_HEAD]
pub const ORDER_ENTRY_SIZE: usize = 16 + ORDER_HEAD;
/// Bytes of a record's order key kept inline in the order table.
pub const ORDER_HEAD: usize = 24;

/// Node identifiers are opaque signed 64-bit integers.
pub type NodeId = i64;

/// "No node".
pub const NONE: NodeId = 0;
/// First identifier handed out by a pool.
pub const MIN_NODE: NodeId = 1;

pub const POOL_JOURNAL: &str = "pool.journal";
pub const CONFIG_FILE: &str = "quadra.json";

const _: () = {
    assert!(size_of::<[u8; 4]>() == 4);
    assert!(ORDER_ENTRY_SIZE % 8 == 0);
};
