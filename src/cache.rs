use lru::LruCache;

use crate::config::PageId;
use crate::errors::Result;
use crate::node::Node;

// A cached page is either a decoded tree node or a raw image (header-adjacent
// pages such as free-list links, or frames re-staged by checkpoint). Raw
// entries decode lazily on first node access.
enum CachedPage {
    Node(Node),
    Raw(Vec<u8>),
}

struct CacheEntry {
    page: CachedPage,
    dirty: bool,
}

impl CacheEntry {
    fn image(&self, page_size: usize) -> Vec<u8> {
        match &self.page {
            CachedPage::Node(node) => node.serialize(page_size),
            CachedPage::Raw(bytes) => bytes.clone(),
        }
    }
}

/// Bounded page cache. Strict LRU over clean entries; dirty entries are
/// pinned until the next commit. When every resident entry is dirty, the
/// least recently used one is handed back to the caller to be spilled through
/// the WAL before it is dropped.
pub struct PageCache {
    entries: LruCache<PageId, CacheEntry>,
    capacity: usize,
    page_size: usize,
}

impl PageCache {
    pub fn new(capacity: usize, page_size: usize) -> PageCache {
        PageCache {
            entries: LruCache::unbounded(),
            capacity,
            page_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // Hit: promote and hand out a copy, decoding a raw image in place.
    pub fn node(&mut self, pid: PageId) -> Result<Option<Node>> {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return Ok(None);
        };
        if let CachedPage::Raw(bytes) = &entry.page {
            entry.page = CachedPage::Node(Node::deserialize(pid, bytes)?);
        }
        match &entry.page {
            CachedPage::Node(node) => Ok(Some(node.clone())),
            CachedPage::Raw(_) => unreachable!(),
        }
    }

    // Raw image without touching recency; free-list pops are one-shot reads.
    pub fn raw_peek(&self, pid: PageId) -> Option<Vec<u8>> {
        self.entries.peek(&pid).map(|e| e.image(self.page_size))
    }

    pub fn install_clean(&mut self, pid: PageId, node: Node) {
        self.entries.put(
            pid,
            CacheEntry {
                page: CachedPage::Node(node),
                dirty: false,
            },
        );
    }

    pub fn put_node(&mut self, pid: PageId, node: Node) {
        self.entries.put(
            pid,
            CacheEntry {
                page: CachedPage::Node(node),
                dirty: true,
            },
        );
    }

    pub fn put_raw(&mut self, pid: PageId, bytes: Vec<u8>) {
        self.entries.put(
            pid,
            CacheEntry {
                page: CachedPage::Raw(bytes),
                dirty: true,
            },
        );
    }

    pub fn invalidate(&mut self, pid: PageId) {
        self.entries.pop(&pid);
    }

    pub fn contains_dirty(&self, pid: PageId) -> bool {
        self.entries.peek(&pid).map_or(false, |e| e.dirty)
    }

    // Dirty images in ascending page order. Flags are left set so a failed
    // commit keeps the dirty set intact; callers clear them on success.
    pub fn dirty_images(&self) -> Vec<(PageId, Vec<u8>)> {
        let mut pids: Vec<PageId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids.into_iter()
            .map(|pid| {
                let entry = self.entries.peek(&pid).unwrap();
                (pid, entry.image(self.page_size))
            })
            .collect()
    }

    pub fn mark_all_clean(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.dirty = false;
        }
    }

    // Evict clean LRU entries until within capacity. When only dirty entries
    // remain, pop the least recently used one and return its image for the
    // caller to spill; call again until `None`.
    pub fn evict_overflow(&mut self) -> Option<(PageId, Vec<u8>)> {
        while self.entries.len() > self.capacity {
            let clean_victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, e)| !e.dirty)
                .map(|(pid, _)| *pid);
            match clean_victim {
                Some(pid) => {
                    self.entries.pop(&pid);
                }
                None => {
                    let pid = *self.entries.iter().rev().next()?.0;
                    let entry = self.entries.pop(&pid)?;
                    return Some((pid, entry.image(self.page_size)));
                }
            }
        }
        None
    }
}
