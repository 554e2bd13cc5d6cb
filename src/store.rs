use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};

use crate::cache::PageCache;
use crate::config::{tree_order, StoreConfig, HEADER_PID};
use crate::errors::{Error, Result};
use crate::node::Node;
use crate::pager::Pager;
use crate::value::Value;
use crate::wal::Wal;

#[derive(PartialEq, Copy, Clone, Debug)]
enum State {
    Opened,
    Closed,
    Poisoned,
}

pub(crate) struct Inner {
    pub(crate) pager: Pager,
    pub(crate) cache: PageCache,
    pub(crate) wal: Option<Wal>,
    pub(crate) order: usize,
    pub(crate) min_entries: usize,
    auto_commit: bool,
    state: State,
}

/// A database handle: the pager, page cache, WAL and B-tree bound together.
///
/// Single writer, single reader: every operation runs under one mutex. A
/// second handle on the same file fails with [`Error::AlreadyOpen`]. Pager or
/// WAL failures poison the handle; from then on only [`Store::close`] works.
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Open or create a database at `path`. The WAL lives next to the main
    /// file under the `wal` extension and is recovered before any user
    /// operation. With `in_memory` set, `path` is ignored and both files are
    /// replaced by a buffer with no durability.
    pub fn open<P: AsRef<Path>>(path: P, conf: StoreConfig) -> Result<Store> {
        conf.validate()?;
        if tree_order(conf.page_size, conf.max_key_size, conf.max_value_size) < 3 {
            return Err(Error::ConfigTooTight);
        }
        let inner = if conf.in_memory {
            Inner::open_memory(&conf)?
        } else {
            Inner::open_file(path.as_ref(), &conf)?
        };
        Ok(Store {
            inner: Mutex::new(inner),
        })
    }

    /// Volatile store; same semantics as [`Store::open`] minus durability.
    pub fn in_memory(conf: StoreConfig) -> Result<Store> {
        Store::open(
            "",
            StoreConfig {
                in_memory: true,
                ..conf
            },
        )
    }

    /// Look up a key and decode its value.
    pub fn get(&self, key: &Value) -> Result<Value> {
        self.with(|inner| {
            let key = inner.encode_key(key)?;
            let value = inner.tree_get(&key)?;
            Value::decode(&value)
        })
    }

    /// Insert a key. An existing key fails with [`Error::DuplicateKey`]
    /// unless `override_` is set, in which case the value is replaced.
    pub fn insert(&self, key: &Value, value: &Value, override_: bool) -> Result<()> {
        self.with(|inner| {
            let key = inner.encode_key(key)?;
            let value = inner.encode_value(value)?;
            inner.tree_insert(&key, &value, override_)?;
            inner.autocommit()
        })
    }

    /// Remove a key. Absent keys fail with [`Error::NotFound`].
    pub fn remove(&self, key: &Value) -> Result<()> {
        self.with(|inner| {
            let key = inner.encode_key(key)?;
            inner.tree_remove(&key)?;
            inner.autocommit()
        })
    }

    /// Seal everything dirtied since the last commit into one durable WAL
    /// group. The main file is not touched until [`Store::checkpoint`].
    pub fn commit(&self) -> Result<()> {
        self.with(Inner::commit)
    }

    /// Apply committed WAL pages to the main file and truncate the log.
    pub fn checkpoint(&self) -> Result<()> {
        self.with(Inner::checkpoint)
    }

    /// Commit after every mutating operation (defaults to the config value).
    pub fn set_auto_commit(&self, on: bool) {
        self.inner.lock().unwrap().auto_commit = on;
    }

    /// Walk the whole tree checking its invariants; returns the entry count.
    pub fn verify(&self) -> Result<u64> {
        self.with(Inner::tree_verify)
    }

    /// Commit, checkpoint and mark the handle closed. Poisoned handles skip
    /// the flush: on-disk state stays at the last successful commit. Any
    /// later operation fails with [`Error::Poisoned`].
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Opened {
            inner.state = State::Closed;
            return Ok(());
        }
        let flushed = inner.commit().and_then(|_| inner.checkpoint());
        inner.state = State::Closed;
        flushed
    }

    /// Drop the handle without committing or checkpointing, as a crash
    /// would. Uncommitted changes are lost; the WAL is left for recovery.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        Ok(())
    }

    fn with<T>(&self, op: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Opened {
            return Err(Error::Poisoned);
        }
        let result = op(&mut inner);
        if let Err(err) = &result {
            if err.poisons() {
                inner.state = State::Poisoned;
            }
        }
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("close on drop failed: {err}");
        }
    }
}

impl Inner {
    fn open_file(path: &Path, conf: &StoreConfig) -> Result<Inner> {
        let mut pager = Pager::open(path, conf)?;
        let mut wal = Wal::open(&path.with_extension("wal"), pager.page_size)?;
        // recovery runs before the first user operation
        if wal.recover(&mut pager)? {
            pager.reload_meta()?;
        }
        Inner::finish_open(pager, Some(wal), conf)
    }

    fn open_memory(conf: &StoreConfig) -> Result<Inner> {
        Inner::finish_open(Pager::in_memory(conf), None, conf)
    }

    fn finish_open(pager: Pager, wal: Option<Wal>, conf: &StoreConfig) -> Result<Inner> {
        // size caps persisted in the header win over the passed config
        let order = tree_order(
            pager.page_size,
            pager.meta.max_key_size as usize,
            pager.meta.max_value_size as usize,
        );
        if order < 3 {
            return Err(Error::ConfigTooTight);
        }
        let mut inner = Inner {
            cache: PageCache::new(conf.cache_size, pager.page_size),
            pager,
            wal,
            order,
            min_entries: order.div_ceil(2) - 1,
            auto_commit: conf.auto_commit,
            state: State::Opened,
        };
        if inner.pager.meta.root == 0 {
            let root = inner.alloc_page()?;
            inner.put_root_leaf(root)?;
            info!("initialized empty tree, root page {root}");
        }
        Ok(inner)
    }

    fn put_root_leaf(&mut self, pid: u32) -> Result<()> {
        self.cache.put_node(pid, Node::leaf(pid));
        self.pager.meta.root = pid;
        self.pager.meta_dirty = true;
        self.spill_overflow()
    }

    fn encode_key(&self, key: &Value) -> Result<Vec<u8>> {
        let bytes = key.encode();
        let limit = self.pager.meta.max_key_size as usize;
        if bytes.len() > limit {
            return Err(Error::EncodingTooLarge {
                what: "key",
                size: bytes.len(),
                limit,
            });
        }
        Ok(bytes)
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        let bytes = value.encode();
        let limit = self.pager.meta.max_value_size as usize;
        if bytes.len() > limit {
            return Err(Error::EncodingTooLarge {
                what: "value",
                size: bytes.len(),
                limit,
            });
        }
        Ok(bytes)
    }

    fn autocommit(&mut self) -> Result<()> {
        if self.auto_commit {
            self.commit()
        } else {
            Ok(())
        }
    }

    // Header frame first (page 0 sorts before all), then the dirty set in
    // ascending page order, sealed by one commit record. Nothing touches the
    // main file here. Without a WAL the pages go straight to the backing.
    pub(crate) fn commit(&mut self) -> Result<()> {
        let dirty = self.cache.dirty_images();
        let header = if self.pager.meta_dirty {
            Some(self.pager.header_image())
        } else {
            None
        };
        match &mut self.wal {
            Some(wal) => {
                if dirty.is_empty() && header.is_none() && !wal.has_open_group() {
                    return Ok(());
                }
                if let Some(image) = &header {
                    wal.append_frame(HEADER_PID, image)?;
                }
                for (pid, image) in &dirty {
                    wal.append_frame(*pid, image)?;
                }
                wal.commit()?;
            }
            None => {
                if dirty.is_empty() && header.is_none() {
                    return Ok(());
                }
                if let Some(image) = &header {
                    self.pager.write_page(HEADER_PID, image)?;
                }
                for (pid, image) in &dirty {
                    self.pager.write_page(*pid, image)?;
                }
                self.pager.sync()?;
            }
        }
        self.cache.mark_all_clean();
        self.pager.meta_dirty = false;
        debug!("commit: {} dirty pages sealed", dirty.len());
        Ok(())
    }

    // Apply the latest committed image of every logged page to the main
    // file, sync it, then truncate the WAL. Frames of an open group are
    // re-staged as dirty cache entries so the in-progress batch survives.
    pub(crate) fn checkpoint(&mut self) -> Result<()> {
        let Some(wal) = self.wal.as_mut() else {
            return Ok(());
        };
        if wal.is_empty() {
            return Ok(());
        }
        let committed = wal.committed_images()?;
        for (pid, image) in &committed {
            self.pager.write_page(*pid, image)?;
        }
        self.pager.sync()?;
        let tail = wal.uncommitted_images()?;
        wal.reset()?;
        for (pid, image) in tail {
            if !self.cache.contains_dirty(pid) {
                self.cache.put_raw(pid, image);
            }
        }
        self.spill_overflow()?;
        debug!("checkpoint: {} pages applied", committed.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageId;
    use std::collections::HashSet;

    fn small_conf() -> StoreConfig {
        StoreConfig {
            page_size: 512,
            max_key_size: 16,
            max_value_size: 16,
            cache_size: 16,
            in_memory: true,
            ..StoreConfig::default()
        }
    }

    // Every page up to the high-water mark is the header, a tree page, or a
    // free page; no page is claimed twice.
    #[test]
    fn pages_are_fully_accounted_for() {
        let store = Store::in_memory(small_conf()).unwrap();
        for i in 0..500i64 {
            store.insert(&Value::Int(i), &Value::Int(i * i), false).unwrap();
        }
        for i in (0..500i64).step_by(3) {
            store.remove(&Value::Int(i)).unwrap();
        }
        store.commit().unwrap();

        let mut inner = store.inner.lock().unwrap();
        let mut tree_pages = HashSet::new();
        let mut stack = vec![inner.pager.meta.root];
        while let Some(pid) = stack.pop() {
            assert!(tree_pages.insert(pid), "page {pid} linked twice");
            let node = inner.fetch_node(pid).unwrap();
            stack.extend(node.children);
        }
        let mut free_pages = HashSet::new();
        let mut pid = inner.pager.meta.free_head;
        while pid != 0 {
            assert!(free_pages.insert(pid), "free page {pid} linked twice");
            let bytes = inner.read_page_anywhere(pid).unwrap();
            pid = PageId::from_be_bytes(bytes[..4].try_into().unwrap());
        }
        assert!(tree_pages.is_disjoint(&free_pages));
        for pid in 1..inner.pager.meta.page_count {
            assert!(
                tree_pages.contains(&pid) || free_pages.contains(&pid),
                "page {pid} leaked"
            );
        }
    }
}
