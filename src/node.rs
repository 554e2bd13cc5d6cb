use crate::config::{PageId, NODE_HEADER_SIZE, PID_SIZE};
use crate::errors::{Error, Result};
use crate::value::compare_encoded;

const KIND_BRANCH: u8 = 0x00;
const KIND_LEAF: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Branch,
    Leaf,
}

// One (encoded key, encoded value) pair. Branch nodes carry real entries too;
// their children live in a separate array.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decoded tree-node page.
///
/// Page layout: kind byte, u16 entry count, entries as
/// `(u16 key len, key, u16 value len, value)`, and for branches
/// `count + 1` child page numbers (u32 each) after the entries block.
#[derive(Debug, Clone)]
pub struct Node {
    pub page_id: PageId,
    pub kind: NodeKind,
    pub entries: Vec<Entry>,
    // Empty for leaves, entries.len() + 1 for branches.
    pub children: Vec<PageId>,
}

impl Node {
    pub fn leaf(page_id: PageId) -> Node {
        Node {
            page_id,
            kind: NodeKind::Leaf,
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    // Position of `key`, or the child slot to descend into.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| compare_encoded(&entry.key, key))
    }

    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        debug_assert!(self.is_leaf() || self.children.len() == self.entries.len() + 1);
        let mut page = vec![0u8; page_size];
        page[0] = match self.kind {
            NodeKind::Branch => KIND_BRANCH,
            NodeKind::Leaf => KIND_LEAF,
        };
        page[1..3].copy_from_slice(&(self.entries.len() as u16).to_be_bytes());
        let mut pos = NODE_HEADER_SIZE;
        for entry in &self.entries {
            page[pos..pos + 2].copy_from_slice(&(entry.key.len() as u16).to_be_bytes());
            pos += 2;
            page[pos..pos + entry.key.len()].copy_from_slice(&entry.key);
            pos += entry.key.len();
            page[pos..pos + 2].copy_from_slice(&(entry.value.len() as u16).to_be_bytes());
            pos += 2;
            page[pos..pos + entry.value.len()].copy_from_slice(&entry.value);
            pos += entry.value.len();
        }
        for child in &self.children {
            page[pos..pos + PID_SIZE].copy_from_slice(&child.to_be_bytes());
            pos += PID_SIZE;
        }
        page
    }

    pub fn deserialize(page_id: PageId, page: &[u8]) -> Result<Node> {
        if page.len() < NODE_HEADER_SIZE {
            return Err(Error::InvalidEncoding);
        }
        let kind = match page[0] {
            KIND_BRANCH => NodeKind::Branch,
            KIND_LEAF => NodeKind::Leaf,
            _ => return Err(Error::InvalidEncoding),
        };
        let count = u16::from_be_bytes(page[1..3].try_into().unwrap()) as usize;
        let mut pos = NODE_HEADER_SIZE;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = read_chunk(page, &mut pos)?;
            let value = read_chunk(page, &mut pos)?;
            entries.push(Entry { key, value });
        }
        let mut children = Vec::new();
        if kind == NodeKind::Branch {
            children.reserve(count + 1);
            for _ in 0..count + 1 {
                let raw = page
                    .get(pos..pos + PID_SIZE)
                    .ok_or(Error::InvalidEncoding)?;
                children.push(PageId::from_be_bytes(raw.try_into().unwrap()));
                pos += PID_SIZE;
            }
        }
        Ok(Node {
            page_id,
            kind,
            entries,
            children,
        })
    }
}

fn read_chunk(page: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let raw = page.get(*pos..*pos + 2).ok_or(Error::InvalidEncoding)?;
    let len = u16::from_be_bytes(raw.try_into().unwrap()) as usize;
    *pos += 2;
    let chunk = page.get(*pos..*pos + len).ok_or(Error::InvalidEncoding)?;
    *pos += len;
    Ok(chunk.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn entry(key: i64, value: &str) -> Entry {
        Entry {
            key: Value::Int(key).encode(),
            value: Value::Text(value.to_string()).encode(),
        }
    }

    #[test]
    fn leaf_roundtrips() {
        let mut node = Node::leaf(5);
        node.entries = vec![entry(1, "one"), entry(2, "two")];
        let page = node.serialize(512);
        assert_eq!(page.len(), 512);
        let back = Node::deserialize(5, &page).unwrap();
        assert!(back.is_leaf());
        assert_eq!(back.entries, node.entries);
        assert!(back.children.is_empty());
    }

    #[test]
    fn branch_roundtrips_with_children() {
        let node = Node {
            page_id: 9,
            kind: NodeKind::Branch,
            entries: vec![entry(10, "ten"), entry(20, "twenty")],
            children: vec![2, 3, 4],
        };
        let back = Node::deserialize(9, &node.serialize(512)).unwrap();
        assert_eq!(back.kind, NodeKind::Branch);
        assert_eq!(back.entries, node.entries);
        assert_eq!(back.children, vec![2, 3, 4]);
    }

    #[test]
    fn search_finds_slots_and_hits() {
        let mut node = Node::leaf(1);
        node.entries = vec![entry(10, "a"), entry(20, "b"), entry(30, "c")];
        assert_eq!(node.search(&Value::Int(20).encode()), Ok(1));
        assert_eq!(node.search(&Value::Int(15).encode()), Err(1));
        assert_eq!(node.search(&Value::Int(35).encode()), Err(3));
    }

    #[test]
    fn rejects_garbage_pages() {
        assert!(Node::deserialize(1, &[KIND_LEAF, 0]).is_err());
        let mut page = vec![0u8; 64];
        page[0] = 0x7f;
        assert!(Node::deserialize(1, &page).is_err());
        // count points past the page end
        let mut page = vec![0u8; 64];
        page[0] = KIND_LEAF;
        page[1..3].copy_from_slice(&100u16.to_be_bytes());
        assert!(Node::deserialize(1, &page).is_err());
    }
}
