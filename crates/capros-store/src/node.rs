use serde::{Deserialize, Serialize};

use capros_types::{Lid, ObCount, Oid, NODE_SIZE};

use crate::error::{StoreError, StoreResult};
use crate::layout::{seal, verify_seal, SEAL_OFFSET};
use crate::page::PageBuf;

/// What kind of capability sits in a node slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[default]
    Void,
    Page,
    Node,
    Process,
    Resume,
}

impl KeyType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Void => 0,
            Self::Page => 1,
            Self::Node => 2,
            Self::Process => 3,
            Self::Resume => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Void),
            1 => Some(Self::Page),
            2 => Some(Self::Node),
            3 => Some(Self::Process),
            4 => Some(Self::Resume),
            _ => None,
        }
    }
}

/// One unprepared capability stored in a node slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySlot {
    pub key_type: KeyType,
    pub oid: Oid,
    pub count: ObCount,
}

impl KeySlot {
    pub const VOID: KeySlot = KeySlot {
        key_type: KeyType::Void,
        oid: Oid(0),
        count: 0,
    };

    pub fn new(key_type: KeyType, oid: Oid, count: ObCount) -> Self {
        Self {
            key_type,
            oid,
            count,
        }
    }

    pub fn is_void(&self) -> bool {
        self.key_type == KeyType::Void
    }
}

/// The slots of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    pub slots: [KeySlot; NODE_SIZE],
}

impl NodeData {
    pub fn empty() -> Self {
        Self {
            slots: [KeySlot::VOID; NODE_SIZE],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(KeySlot::is_void)
    }
}

impl Default for NodeData {
    fn default() -> Self {
        Self::empty()
    }
}

/// A node as stored in a node pot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskNode {
    pub oid: Oid,
    pub alloc_count: ObCount,
    pub call_count: ObCount,
    pub data: NodeData,
}

const KEY_SLOT_SIZE: usize = 16;
const DISK_NODE_SIZE: usize = 16 + NODE_SIZE * KEY_SLOT_SIZE;
const POT_HEADER_SIZE: usize = 4;

/// Nodes packed into one log frame.
pub const DISK_NODES_PER_PAGE: usize = (SEAL_OFFSET - POT_HEADER_SIZE) / DISK_NODE_SIZE;

impl DiskNode {
    fn encode_into(&self, page: &mut PageBuf, at: usize) {
        page.put_u64(at, self.oid.0);
        page.put_u32(at + 8, self.alloc_count);
        page.put_u32(at + 12, self.call_count);
        for (i, slot) in self.data.slots.iter().enumerate() {
            let s = at + 16 + i * KEY_SLOT_SIZE;
            page.put_u64(s, slot.oid.0);
            page.put_u32(s + 8, slot.count);
            page.as_bytes_mut()[s + 12] = slot.key_type.to_byte();
        }
    }

    fn decode_from(page: &PageBuf, at: usize) -> StoreResult<Self> {
        let mut data = NodeData::empty();
        for (i, slot) in data.slots.iter_mut().enumerate() {
            let s = at + 16 + i * KEY_SLOT_SIZE;
            let byte = page.as_bytes()[s + 12];
            let key_type = KeyType::from_byte(byte).ok_or_else(|| StoreError::Malformed {
                what: "node pot",
                reason: format!("unknown key type {byte} in slot {i}"),
            })?;
            *slot = KeySlot {
                key_type,
                oid: Oid(page.get_u64(s)),
                count: page.get_u32(s + 8),
            };
        }
        Ok(Self {
            oid: Oid(page.get_u64(at)),
            alloc_count: page.get_u32(at + 8),
            call_count: page.get_u32(at + 12),
            data,
        })
    }
}

/// A log frame holding up to [`DISK_NODES_PER_PAGE`] nodes.
///
/// A node's LID is the pot's LID with the node's position as index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePot {
    pub nodes: Vec<DiskNode>,
}

impl NodePot {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= DISK_NODES_PER_PAGE
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Append a node; returns its index within the pot.
    pub fn push(&mut self, node: DiskNode) -> StoreResult<u8> {
        if self.is_full() {
            return Err(StoreError::TooManyEntries {
                what: "node pot",
                count: self.nodes.len() + 1,
                max: DISK_NODES_PER_PAGE,
            });
        }
        self.nodes.push(node);
        Ok((self.nodes.len() - 1) as u8)
    }

    pub fn encode(&self) -> PageBuf {
        let mut page = PageBuf::zeroed();
        page.put_u32(0, self.nodes.len() as u32);
        for (i, node) in self.nodes.iter().enumerate() {
            node.encode_into(&mut page, POT_HEADER_SIZE + i * DISK_NODE_SIZE);
        }
        seal(&mut page);
        page
    }

    pub fn decode(page: &PageBuf, lid: Lid) -> StoreResult<Self> {
        verify_seal(page, "node pot", lid)?;
        let n = page.get_u32(0) as usize;
        if n > DISK_NODES_PER_PAGE {
            return Err(StoreError::TooManyEntries {
                what: "node pot",
                count: n,
                max: DISK_NODES_PER_PAGE,
            });
        }
        let nodes = (0..n)
            .map(|i| DiskNode::decode_from(page, POT_HEADER_SIZE + i * DISK_NODE_SIZE))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self { nodes })
    }

    /// Decode only the node at `index`.
    pub fn node_at(page: &PageBuf, lid: Lid) -> StoreResult<DiskNode> {
        verify_seal(page, "node pot", lid)?;
        let index = lid.index() as usize;
        let n = page.get_u32(0) as usize;
        if index >= n {
            return Err(StoreError::Malformed {
                what: "node pot",
                reason: format!("index {index} beyond {n} nodes"),
            });
        }
        DiskNode::decode_from(page, POT_HEADER_SIZE + index * DISK_NODE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capros_types::MAIN_LOG_START;

    fn node(oid: u64, fill: u32) -> DiskNode {
        let mut data = NodeData::empty();
        data.slots[0] = KeySlot::new(KeyType::Page, Oid(0x2000), fill);
        data.slots[31] = KeySlot::new(KeyType::Node, Oid(0x3001), fill + 1);
        DiskNode {
            oid: Oid(oid),
            alloc_count: fill,
            call_count: fill * 2,
            data,
        }
    }

    #[test]
    fn seven_nodes_fit_in_a_pot() {
        assert_eq!(DISK_NODES_PER_PAGE, 7);
    }

    #[test]
    fn pot_preserves_nodes() {
        let mut pot = NodePot::new();
        for i in 0..3 {
            assert_eq!(pot.push(node(0x1000 + i, i as u32 + 1)).unwrap(), i as u8);
        }
        let page = pot.encode();
        let decoded = NodePot::decode(&page, MAIN_LOG_START).unwrap();
        assert_eq!(decoded, pot);

        let second = NodePot::node_at(&page, MAIN_LOG_START.with_index(1)).unwrap();
        assert_eq!(second, node(0x1001, 2));
    }

    #[test]
    fn full_pot_rejects_push() {
        let mut pot = NodePot::new();
        for i in 0..DISK_NODES_PER_PAGE {
            pot.push(node(i as u64, 0)).unwrap();
        }
        assert!(pot.is_full());
        assert!(pot.push(node(99, 0)).is_err());
    }

    #[test]
    fn corrupted_pot_is_detected() {
        let mut pot = NodePot::new();
        pot.push(node(0x1000, 1)).unwrap();
        let mut page = pot.encode();
        page.as_bytes_mut()[20] ^= 0xff;
        assert!(matches!(
            NodePot::decode(&page, MAIN_LOG_START),
            Err(StoreError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn index_past_end_is_malformed() {
        let mut pot = NodePot::new();
        pot.push(node(0x1000, 1)).unwrap();
        let page = pot.encode();
        assert!(NodePot::node_at(&page, MAIN_LOG_START.with_index(2)).is_err());
    }
}
