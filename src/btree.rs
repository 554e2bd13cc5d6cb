use log::trace;

use crate::config::{PageId, PID_SIZE};
use crate::errors::{Error, Result};
use crate::node::{Entry, Node, NodeKind};
use crate::store::Inner;
use crate::value::compare_encoded;

// Promoted median entry and the freshly allocated page to its right.
struct Split {
    key: Vec<u8>,
    value: Vec<u8>,
    right: PageId,
}

//
// Tree algorithms over encoded keys and values. Every page access goes
// through the cache; mutated nodes are written back with `put_node` so the
// dirty set is exactly what the next commit frames.
//
impl Inner {
    pub(crate) fn tree_get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let mut pid = self.pager.meta.root;
        loop {
            let node = self.fetch_node(pid)?;
            match node.search(key) {
                Ok(i) => return Ok(node.entries[i].value.clone()),
                Err(i) => {
                    if node.is_leaf() {
                        return Err(Error::NotFound);
                    }
                    pid = node.children[i];
                }
            }
        }
    }

    pub(crate) fn tree_insert(&mut self, key: &[u8], value: &[u8], override_: bool) -> Result<()> {
        let root = self.pager.meta.root;
        if let Some(split) = self.insert_rec(root, key, value, override_)? {
            // root split: the tree grows one level
            let new_root_pid = self.alloc_page()?;
            let new_root = Node {
                page_id: new_root_pid,
                kind: NodeKind::Branch,
                entries: vec![Entry {
                    key: split.key,
                    value: split.value,
                }],
                children: vec![root, split.right],
            };
            self.put_node(new_root)?;
            self.pager.meta.root = new_root_pid;
            self.pager.meta_dirty = true;
            trace!("root split, new root page {new_root_pid}");
        }
        Ok(())
    }

    pub(crate) fn tree_remove(&mut self, key: &[u8]) -> Result<()> {
        let root = self.pager.meta.root;
        self.remove_rec(root, key)?;
        let node = self.fetch_node(root)?;
        if !node.is_leaf() && node.entries.is_empty() {
            // a merge emptied the root: promote its single child
            let new_root = node.children[0];
            self.free_page(root)?;
            self.pager.meta.root = new_root;
            self.pager.meta_dirty = true;
            trace!("root collapsed into page {new_root}");
        }
        Ok(())
    }

    fn insert_rec(
        &mut self,
        pid: PageId,
        key: &[u8],
        value: &[u8],
        override_: bool,
    ) -> Result<Option<Split>> {
        let mut node = self.fetch_node(pid)?;
        match node.search(key) {
            Ok(i) => {
                if !override_ {
                    return Err(Error::DuplicateKey);
                }
                node.entries[i].value = value.to_vec();
                self.put_node(node)?;
                Ok(None)
            }
            Err(i) => {
                if node.is_leaf() {
                    node.entries.insert(
                        i,
                        Entry {
                            key: key.to_vec(),
                            value: value.to_vec(),
                        },
                    );
                    self.write_or_split(node)
                } else {
                    let child = node.children[i];
                    match self.insert_rec(child, key, value, override_)? {
                        None => Ok(None),
                        Some(split) => {
                            let mut node = self.fetch_node(pid)?;
                            node.entries.insert(
                                i,
                                Entry {
                                    key: split.key,
                                    value: split.value,
                                },
                            );
                            node.children.insert(i + 1, split.right);
                            self.write_or_split(node)
                        }
                    }
                }
            }
        }
    }

    // Write the node back, splitting around the median when it overflowed.
    fn write_or_split(&mut self, mut node: Node) -> Result<Option<Split>> {
        if node.entries.len() < self.order {
            self.put_node(node)?;
            return Ok(None);
        }
        debug_assert_eq!(node.entries.len(), self.order);
        let mid = self.order / 2;
        let right_entries = node.entries.split_off(mid + 1);
        let promoted = node.entries.pop().unwrap();
        let right_children = if node.is_leaf() {
            Vec::new()
        } else {
            node.children.split_off(mid + 1)
        };
        let right_pid = self.alloc_page()?;
        trace!("split page {} -> new right page {right_pid}", node.page_id);
        let right = Node {
            page_id: right_pid,
            kind: node.kind,
            entries: right_entries,
            children: right_children,
        };
        self.put_node(node)?;
        self.put_node(right)?;
        Ok(Some(Split {
            key: promoted.key,
            value: promoted.value,
            right: right_pid,
        }))
    }

    fn remove_rec(&mut self, pid: PageId, key: &[u8]) -> Result<()> {
        let mut node = self.fetch_node(pid)?;
        match node.search(key) {
            Ok(i) => {
                if node.is_leaf() {
                    node.entries.remove(i);
                    self.put_node(node)?;
                    Ok(())
                } else {
                    // fill the slot with the in-order successor, then delete
                    // the successor from the right subtree
                    let right_child = node.children[i + 1];
                    let successor = self.min_entry(right_child)?;
                    let successor_key = successor.key.clone();
                    node.entries[i] = successor;
                    self.put_node(node)?;
                    self.remove_rec(right_child, &successor_key)?;
                    let mut node = self.fetch_node(pid)?;
                    self.rebalance_child(&mut node, i + 1)
                }
            }
            Err(i) => {
                if node.is_leaf() {
                    return Err(Error::NotFound);
                }
                self.remove_rec(node.children[i], key)?;
                let mut node = self.fetch_node(pid)?;
                self.rebalance_child(&mut node, i)
            }
        }
    }

    // Leftmost entry of the subtree rooted at `pid`.
    fn min_entry(&mut self, mut pid: PageId) -> Result<Entry> {
        loop {
            let node = self.fetch_node(pid)?;
            if node.is_leaf() {
                debug_assert!(!node.entries.is_empty());
                return Ok(node.entries[0].clone());
            }
            pid = node.children[0];
        }
    }

    // Restore minimum occupancy of `parent.children[idx]` after a removal
    // below it: borrow from the left sibling first, then the right, else
    // merge through the separator and free the emptied page.
    fn rebalance_child(&mut self, parent: &mut Node, idx: usize) -> Result<()> {
        let child_pid = parent.children[idx];
        let mut child = self.fetch_node(child_pid)?;
        if child.entries.len() >= self.min_entries {
            return Ok(());
        }

        if idx > 0 {
            let left_pid = parent.children[idx - 1];
            let mut left = self.fetch_node(left_pid)?;
            if left.entries.len() > self.min_entries {
                trace!("borrow from left sibling {left_pid} into {child_pid}");
                let separator =
                    std::mem::replace(&mut parent.entries[idx - 1], left.entries.pop().unwrap());
                child.entries.insert(0, separator);
                if !child.is_leaf() {
                    child.children.insert(0, left.children.pop().unwrap());
                }
                self.put_node(left)?;
                self.put_node(child)?;
                self.put_node(parent.clone())?;
                return Ok(());
            }
        }
        if idx + 1 < parent.children.len() {
            let right_pid = parent.children[idx + 1];
            let mut right = self.fetch_node(right_pid)?;
            if right.entries.len() > self.min_entries {
                trace!("borrow from right sibling {right_pid} into {child_pid}");
                let separator =
                    std::mem::replace(&mut parent.entries[idx], right.entries.remove(0));
                child.entries.push(separator);
                if !child.is_leaf() {
                    child.children.push(right.children.remove(0));
                }
                self.put_node(right)?;
                self.put_node(child)?;
                self.put_node(parent.clone())?;
                return Ok(());
            }
        }

        if idx > 0 {
            // fold the child into its left sibling
            let left_pid = parent.children[idx - 1];
            trace!("merge page {child_pid} into {left_pid}");
            let mut left = self.fetch_node(left_pid)?;
            left.entries.push(parent.entries.remove(idx - 1));
            parent.children.remove(idx);
            left.entries.append(&mut child.entries);
            left.children.append(&mut child.children);
            self.put_node(left)?;
            self.put_node(parent.clone())?;
            self.free_page(child_pid)?;
        } else {
            // leftmost child: fold the right sibling into it
            let right_pid = parent.children[idx + 1];
            trace!("merge page {right_pid} into {child_pid}");
            let mut right = self.fetch_node(right_pid)?;
            child.entries.push(parent.entries.remove(idx));
            parent.children.remove(idx + 1);
            child.entries.append(&mut right.entries);
            child.children.append(&mut right.children);
            self.put_node(child)?;
            self.put_node(parent.clone())?;
            self.free_page(right_pid)?;
        }
        Ok(())
    }

    //
    // Page plumbing: cache in front, WAL image in the middle, main file last.
    //

    pub(crate) fn fetch_node(&mut self, pid: PageId) -> Result<Node> {
        if let Some(node) = self.cache.node(pid)? {
            return Ok(node);
        }
        let bytes = self.read_page_anywhere(pid)?;
        let node = Node::deserialize(pid, &bytes)?;
        self.cache.install_clean(pid, node.clone());
        self.spill_overflow()?;
        Ok(node)
    }

    fn put_node(&mut self, node: Node) -> Result<()> {
        self.cache.put_node(node.page_id, node);
        self.spill_overflow()
    }

    // The newest image of a page can live in the WAL between a commit and the
    // next checkpoint; the main file is only current after a checkpoint.
    pub(crate) fn read_page_anywhere(&mut self, pid: PageId) -> Result<Vec<u8>> {
        if let Some(wal) = &self.wal {
            if let Some(bytes) = wal.read_page(pid)? {
                return Ok(bytes);
            }
        }
        self.pager.read_page(pid)
    }

    // Keep the cache within its page limit. Dirty spills go through the WAL so
    // the image is recoverable; without a WAL the backing takes them directly.
    pub(crate) fn spill_overflow(&mut self) -> Result<()> {
        while let Some((pid, bytes)) = self.cache.evict_overflow() {
            trace!("cache full of dirty pages, spilling page {pid}");
            match &mut self.wal {
                Some(wal) => wal.append_frame(pid, &bytes)?,
                None => self.pager.write_page(pid, &bytes)?,
            }
        }
        Ok(())
    }

    // Pop the free list, or extend the file by bumping the high-water mark.
    pub(crate) fn alloc_page(&mut self) -> Result<PageId> {
        let head = self.pager.meta.free_head;
        if head != 0 {
            let bytes = match self.cache.raw_peek(head) {
                Some(bytes) => bytes,
                None => self.read_page_anywhere(head)?,
            };
            let next = PageId::from_be_bytes(bytes[..PID_SIZE].try_into().unwrap());
            self.cache.invalidate(head);
            self.pager.meta.free_head = next;
            self.pager.meta_dirty = true;
            Ok(head)
        } else {
            let pid = self.pager.meta.page_count;
            self.pager.meta.page_count += 1;
            self.pager.meta_dirty = true;
            Ok(pid)
        }
    }

    // Thread the page onto the free list. The link is written through the
    // cache so it is captured by the next commit's WAL group.
    pub(crate) fn free_page(&mut self, pid: PageId) -> Result<()> {
        let mut bytes = vec![0u8; self.pager.page_size];
        bytes[..PID_SIZE].copy_from_slice(&self.pager.meta.free_head.to_be_bytes());
        self.cache.put_raw(pid, bytes);
        self.pager.meta.free_head = pid;
        self.pager.meta_dirty = true;
        self.spill_overflow()
    }

    //
    // Diagnostic walk: checks ordering, uniform leaf depth, child counts and
    // minimum occupancy, and returns the number of entries in the tree.
    //
    pub(crate) fn tree_verify(&mut self) -> Result<u64> {
        let root = self.pager.meta.root;
        let mut depth = 1usize;
        let mut pid = root;
        loop {
            let node = self.fetch_node(pid)?;
            if node.is_leaf() {
                break;
            }
            pid = node.children[0];
            depth += 1;
        }
        let mut prev: Option<Vec<u8>> = None;
        self.verify_rec(root, 1, depth, &mut prev, true)
    }

    fn verify_rec(
        &mut self,
        pid: PageId,
        level: usize,
        depth: usize,
        prev: &mut Option<Vec<u8>>,
        is_root: bool,
    ) -> Result<u64> {
        let node = self.fetch_node(pid)?;
        let ok_shape = if node.is_leaf() {
            level == depth && node.children.is_empty()
        } else {
            level < depth && node.children.len() == node.entries.len() + 1
        };
        let ok_fill = node.entries.len() <= self.order - 1
            && (is_root || node.entries.len() >= self.min_entries)
            && (is_root || !node.entries.is_empty());
        if !ok_shape || !ok_fill {
            return Err(Error::InvalidEncoding);
        }
        let mut count = 0u64;
        if node.is_leaf() {
            for entry in &node.entries {
                self.verify_order(prev, &entry.key)?;
                count += 1;
            }
        } else {
            for i in 0..node.children.len() {
                count += self.verify_rec(node.children[i], level + 1, depth, prev, false)?;
                if i < node.entries.len() {
                    self.verify_order(prev, &node.entries[i].key)?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn verify_order(&self, prev: &mut Option<Vec<u8>>, key: &[u8]) -> Result<()> {
        if let Some(prev_key) = prev {
            if compare_encoded(prev_key, key) != std::cmp::Ordering::Less {
                return Err(Error::InvalidEncoding);
            }
        }
        *prev = Some(key.to_vec());
        Ok(())
    }
}
