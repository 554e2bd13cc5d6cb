use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt as UnixFileExt;
use std::path::Path;

use fs2::FileExt;
use log::info;

use crate::config::{PageId, StoreConfig, HEADER_SIZE};
use crate::errors::{Error, Result};
use crate::meta::Meta;

// Byte-addressable backing. Both arms serve the same callers so the in-memory
// store shares every code path above the I/O boundary.
enum Backing {
    File(File),
    Memory(Vec<u8>),
}

/// Owns the main database file: page-granular reads and writes, the cached
/// header, and the durable barrier. The free list lives in the header plus
/// chained page bodies; pops and pushes are driven by the engine so they flow
/// through the cache and the WAL.
pub struct Pager {
    backing: Backing,
    pub page_size: usize,
    pub meta: Meta,
    pub meta_dirty: bool,
}

impl Pager {
    /// Open or create the main file. A fresh file gets a header built from
    /// `conf`; an existing one must match magic, version and page size.
    pub fn open(path: &Path, conf: &StoreConfig) -> Result<Pager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| Error::AlreadyOpen)?;
        if file.metadata()?.len() == 0 {
            let meta = fresh_meta(conf);
            file.write_all_at(&meta.page_image(), 0)?;
            file.sync_all()?;
            info!("created database {} (page size {})", path.display(), conf.page_size);
            return Ok(Pager {
                backing: Backing::File(file),
                page_size: conf.page_size,
                meta,
                meta_dirty: false,
            });
        }
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let meta = Meta::unpack(&buf)?;
        if meta.page_size as usize != conf.page_size {
            return Err(Error::IncompatibleFile("page size mismatch"));
        }
        if meta.page_count < 1 {
            return Err(Error::IncompatibleFile("empty page table"));
        }
        Ok(Pager {
            backing: Backing::File(file),
            page_size: conf.page_size,
            meta,
            meta_dirty: false,
        })
    }

    /// Volatile store backed by a growable buffer. `sync` is a no-op.
    pub fn in_memory(conf: &StoreConfig) -> Pager {
        let meta = fresh_meta(conf);
        Pager {
            backing: Backing::Memory(meta.page_image()),
            page_size: conf.page_size,
            meta,
            meta_dirty: false,
        }
    }

    pub fn read_page(&self, pid: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let offs = pid as u64 * self.page_size as u64;
        match &self.backing {
            Backing::File(file) => file.read_exact_at(&mut buf, offs)?,
            Backing::Memory(bytes) => {
                let start = (offs as usize).min(bytes.len());
                let end = (start + self.page_size).min(bytes.len());
                buf[..end - start].copy_from_slice(&bytes[start..end]);
            }
        }
        Ok(buf)
    }

    pub fn write_page(&mut self, pid: PageId, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), self.page_size);
        let offs = pid as u64 * self.page_size as u64;
        match &mut self.backing {
            Backing::File(file) => file.write_all_at(page, offs)?,
            Backing::Memory(bytes) => {
                let end = offs as usize + self.page_size;
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[offs as usize..end].copy_from_slice(page);
            }
        }
        Ok(())
    }

    // Durable barrier for the main file.
    pub fn sync(&self) -> Result<()> {
        if let Backing::File(file) = &self.backing {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn header_image(&self) -> Vec<u8> {
        self.meta.page_image()
    }

    // Re-read the header from the backing (after WAL replay rewrote page 0).
    pub fn reload_meta(&mut self) -> Result<()> {
        let page = self.read_page(0)?;
        self.meta = Meta::unpack(&page)?;
        self.meta_dirty = false;
        Ok(())
    }
}

fn fresh_meta(conf: &StoreConfig) -> Meta {
    Meta {
        page_size: conf.page_size as u32,
        max_key_size: conf.max_key_size as u32,
        max_value_size: conf.max_value_size as u32,
        root: 0,
        free_head: 0,
        page_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[test]
    fn creates_and_reopens_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let conf = StoreConfig::default();
        {
            let mut pager = Pager::open(&path, &conf).unwrap();
            pager.meta.root = 9;
            pager.meta.page_count = 4;
            let image = pager.header_image();
            pager.write_page(0, &image).unwrap();
            pager.sync().unwrap();
        }
        let pager = Pager::open(&path, &conf).unwrap();
        assert_eq!(pager.meta.root, 9);
        assert_eq!(pager.meta.page_count, 4);
    }

    #[test]
    fn page_size_mismatch_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let conf = StoreConfig::default();
        drop(Pager::open(&path, &conf).unwrap());
        let other = StoreConfig {
            page_size: 4096,
            ..conf
        };
        assert!(matches!(
            Pager::open(&path, &other),
            Err(Error::IncompatibleFile(_))
        ));
    }

    #[test]
    fn second_handle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let conf = StoreConfig::default();
        let _first = Pager::open(&path, &conf).unwrap();
        assert!(matches!(
            Pager::open(&path, &conf),
            Err(Error::AlreadyOpen)
        ));
    }

    #[test]
    fn memory_backing_grows_on_write() {
        let conf = StoreConfig {
            in_memory: true,
            ..StoreConfig::default()
        };
        let mut pager = Pager::in_memory(&conf);
        let page = vec![0xabu8; conf.page_size];
        pager.write_page(5, &page).unwrap();
        assert_eq!(pager.read_page(5).unwrap(), page);
        // unwritten pages read back zeroed
        assert!(pager.read_page(3).unwrap().iter().all(|b| *b == 0));
    }
}
