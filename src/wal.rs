use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt as UnixFileExt;
use std::path::{Path, PathBuf};

use crc32c::{crc32c, crc32c_append};
use fs2::FileExt;
use log::{debug, info, trace};

use crate::config::{PageId, COMMIT_SENTINEL, FRAME_HEADER_SIZE};
use crate::errors::{Error, Result};
use crate::pager::Pager;

/// Append-only log of committed page images.
///
/// Frame: page number (u32), payload length (u32, always the page size),
/// CRC32C of the payload, payload. A commit record seals the frames since the
/// previous record: sentinel page number `0xFFFF_FFFF`, zero length, CRC32C
/// over the sealed frames' CRC bytes.
///
/// The newest image of a page may exist only here between a commit and the
/// next checkpoint, so the log keeps an in-memory index of the latest payload
/// offset per page for read-back.
pub struct Wal {
    file: File,
    dir: Option<PathBuf>,
    page_size: usize,
    write_pos: u64,
    // payload offsets of every frame since the last reset, append order
    frames: Vec<(PageId, u64)>,
    // prefix of `frames` sealed by a commit record
    committed: usize,
    page_index: HashMap<PageId, u64>,
    group_crc: u32,
}

impl Wal {
    pub fn open(path: &Path, page_size: usize) -> Result<Wal> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| Error::AlreadyOpen)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(Wal {
            file,
            dir,
            page_size,
            write_pos: 0,
            frames: Vec::new(),
            committed: 0,
            page_index: HashMap::new(),
            group_crc: 0,
        })
    }

    // Append one frame to the open group. Not durable until `commit`.
    pub fn append_frame(&mut self, pid: PageId, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(payload.len(), self.page_size);
        debug_assert_ne!(pid, COMMIT_SENTINEL);
        let crc = crc32c(payload);
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&pid.to_be_bytes());
        header[4..8].copy_from_slice(&(self.page_size as u32).to_be_bytes());
        header[8..12].copy_from_slice(&crc.to_be_bytes());
        self.file.write_all_at(&header, self.write_pos)?;
        let payload_offs = self.write_pos + FRAME_HEADER_SIZE as u64;
        self.file.write_all_at(payload, payload_offs)?;
        trace!("wal frame: page {pid} at {payload_offs}");
        self.frames.push((pid, payload_offs));
        self.page_index.insert(pid, payload_offs);
        self.group_crc = crc32c_append(self.group_crc, &crc.to_be_bytes());
        self.write_pos = payload_offs + self.page_size as u64;
        Ok(())
    }

    pub fn has_open_group(&self) -> bool {
        self.frames.len() > self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    // Seal the open group with a commit record and make it durable.
    pub fn commit(&mut self) -> Result<()> {
        let mut record = [0u8; FRAME_HEADER_SIZE];
        record[0..4].copy_from_slice(&COMMIT_SENTINEL.to_be_bytes());
        record[8..12].copy_from_slice(&self.group_crc.to_be_bytes());
        self.file.write_all_at(&record, self.write_pos)?;
        self.write_pos += FRAME_HEADER_SIZE as u64;
        self.file.sync_all()?;
        debug!(
            "wal commit: {} frames sealed",
            self.frames.len() - self.committed
        );
        self.committed = self.frames.len();
        self.group_crc = 0;
        Ok(())
    }

    // Latest logged image of a page, committed or not.
    pub fn read_page(&self, pid: PageId) -> Result<Option<Vec<u8>>> {
        let Some(&offs) = self.page_index.get(&pid) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.page_size];
        self.file.read_exact_at(&mut buf, offs)?;
        Ok(Some(buf))
    }

    // Latest committed image per page, ascending page order.
    pub fn committed_images(&self) -> Result<Vec<(PageId, Vec<u8>)>> {
        self.latest_images(&self.frames[..self.committed])
    }

    // Latest image per page of the open (unsealed) group.
    pub fn uncommitted_images(&self) -> Result<Vec<(PageId, Vec<u8>)>> {
        self.latest_images(&self.frames[self.committed..])
    }

    fn latest_images(&self, frames: &[(PageId, u64)]) -> Result<Vec<(PageId, Vec<u8>)>> {
        let mut latest: HashMap<PageId, u64> = HashMap::new();
        for &(pid, offs) in frames {
            latest.insert(pid, offs);
        }
        let mut pids: Vec<PageId> = latest.keys().copied().collect();
        pids.sort_unstable();
        let mut images = Vec::with_capacity(pids.len());
        for pid in pids {
            let mut buf = vec![0u8; self.page_size];
            self.file.read_exact_at(&mut buf, latest[&pid])?;
            images.push((pid, buf));
        }
        Ok(images)
    }

    // Truncate the log and clear in-memory state; fsync the log and its
    // directory so the truncation itself is durable.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        if let Some(dir) = &self.dir {
            File::open(dir)?.sync_all()?;
        }
        self.write_pos = 0;
        self.frames.clear();
        self.committed = 0;
        self.page_index.clear();
        self.group_crc = 0;
        Ok(())
    }

    /// Replay sealed commit groups into the main file, then truncate.
    ///
    /// A torn trailing group (short read, malformed record, or a bad CRC
    /// after the last sealed record) is discarded; damage at or before the
    /// last sealed record is `CorruptWal`. Idempotent: rerunning after a
    /// crash mid-replay reapplies the same images.
    pub fn recover(&mut self, pager: &mut Pager) -> Result<bool> {
        let records = self.scan()?;
        let Some(last_sealed) = records
            .iter()
            .rposition(|r| matches!(r, Record::Commit { crc_ok: true }))
        else {
            // nothing sealed; drop whatever partial group is on disk
            self.reset()?;
            return Ok(false);
        };
        if records[..=last_sealed].iter().any(|r| !r.crc_ok()) {
            return Err(Error::CorruptWal);
        }
        let mut applied = 0usize;
        let mut buf = vec![0u8; self.page_size];
        for record in &records[..=last_sealed] {
            if let Record::Frame {
                pid, payload_offs, ..
            } = record
            {
                self.file.read_exact_at(&mut buf, *payload_offs)?;
                pager.write_page(*pid, &buf)?;
                applied += 1;
            }
        }
        // one durable barrier after all replays
        pager.sync()?;
        if applied > 0 {
            info!("wal recovery: replayed {applied} frames");
        }
        self.reset()?;
        Ok(applied > 0)
    }

    // Structural pass over the log. Stops at the first torn or malformed
    // record; CRC validity is recorded, not enforced.
    fn scan(&mut self) -> Result<Vec<Record>> {
        let len = self.file.metadata()?.len();
        let mut records = Vec::new();
        let mut group_crc = 0u32;
        let mut pos = 0u64;
        let mut payload = vec![0u8; self.page_size];
        while pos + FRAME_HEADER_SIZE as u64 <= len {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            self.file.read_exact_at(&mut header, pos)?;
            let pid = PageId::from_be_bytes(header[0..4].try_into().unwrap());
            let payload_len = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let crc = u32::from_be_bytes(header[8..12].try_into().unwrap());
            if pid == COMMIT_SENTINEL {
                if payload_len != 0 {
                    break; // malformed record, treat as torn tail
                }
                records.push(Record::Commit {
                    crc_ok: crc == group_crc,
                });
                group_crc = 0;
                pos += FRAME_HEADER_SIZE as u64;
                continue;
            }
            if payload_len as usize != self.page_size
                || pos + (FRAME_HEADER_SIZE + self.page_size) as u64 > len
            {
                break; // torn frame
            }
            let payload_offs = pos + FRAME_HEADER_SIZE as u64;
            self.file.read_exact_at(&mut payload, payload_offs)?;
            records.push(Record::Frame {
                pid,
                payload_offs,
                crc_ok: crc32c(&payload) == crc,
            });
            group_crc = crc32c_append(group_crc, &crc.to_be_bytes());
            pos += (FRAME_HEADER_SIZE + self.page_size) as u64;
        }
        Ok(records)
    }
}

enum Record {
    Frame {
        pid: PageId,
        payload_offs: u64,
        crc_ok: bool,
    },
    Commit {
        crc_ok: bool,
    },
}

impl Record {
    fn crc_ok(&self) -> bool {
        match self {
            Record::Frame { crc_ok, .. } | Record::Commit { crc_ok } => *crc_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::fs;

    const PAGE: usize = 512;

    fn conf() -> StoreConfig {
        StoreConfig {
            page_size: PAGE,
            max_key_size: 16,
            max_value_size: 16,
            ..StoreConfig::default()
        }
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE]
    }

    #[test]
    fn commit_then_recover_replays_into_the_main_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let wal_path = dir.path().join("t.wal");
        let mut pager = Pager::open(&db, &conf()).unwrap();
        {
            let mut wal = Wal::open(&wal_path, PAGE).unwrap();
            wal.append_frame(1, &page(0x11)).unwrap();
            wal.append_frame(2, &page(0x22)).unwrap();
            wal.commit().unwrap();
            assert_eq!(wal.read_page(2).unwrap().unwrap(), page(0x22));
        }
        let mut wal = Wal::open(&wal_path, PAGE).unwrap();
        assert!(wal.recover(&mut pager).unwrap());
        assert_eq!(pager.read_page(1).unwrap(), page(0x11));
        assert_eq!(pager.read_page(2).unwrap(), page(0x22));
        // truncated after replay; a second recovery is a no-op
        assert!(!wal.recover(&mut pager).unwrap());
    }

    #[test]
    fn torn_tail_group_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let wal_path = dir.path().join("t.wal");
        let mut pager = Pager::open(&db, &conf()).unwrap();
        {
            let mut wal = Wal::open(&wal_path, PAGE).unwrap();
            wal.append_frame(1, &page(0x11)).unwrap();
            wal.commit().unwrap();
            // an unsealed group, then a torn frame
            wal.append_frame(2, &page(0x22)).unwrap();
        }
        let len = fs::metadata(&wal_path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        file.set_len(len - 100).unwrap();
        drop(file);
        let mut wal = Wal::open(&wal_path, PAGE).unwrap();
        assert!(wal.recover(&mut pager).unwrap());
        assert_eq!(pager.read_page(1).unwrap(), page(0x11));
        // page 2 was never sealed, so the main file never saw it
        match pager.read_page(2) {
            Ok(bytes) => assert!(bytes.iter().all(|b| *b != 0x22)),
            Err(_) => {} // file never grew past page 1
        }
    }

    #[test]
    fn damage_inside_a_sealed_group_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let wal_path = dir.path().join("t.wal");
        let mut pager = Pager::open(&db, &conf()).unwrap();
        {
            let mut wal = Wal::open(&wal_path, PAGE).unwrap();
            wal.append_frame(1, &page(0x11)).unwrap();
            wal.commit().unwrap();
        }
        // flip a payload byte of the sealed frame
        let mut bytes = fs::read(&wal_path).unwrap();
        bytes[FRAME_HEADER_SIZE + 7] ^= 0xff;
        fs::write(&wal_path, &bytes).unwrap();
        let mut wal = Wal::open(&wal_path, PAGE).unwrap();
        assert!(matches!(wal.recover(&mut pager), Err(Error::CorruptWal)));
    }

    #[test]
    fn uncommitted_images_track_the_open_group() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("t.wal");
        let mut wal = Wal::open(&wal_path, PAGE).unwrap();
        wal.append_frame(3, &page(0x33)).unwrap();
        wal.commit().unwrap();
        wal.append_frame(4, &page(0x44)).unwrap();
        wal.append_frame(4, &page(0x55)).unwrap();
        let committed = wal.committed_images().unwrap();
        assert_eq!(committed, vec![(3, page(0x33))]);
        let open = wal.uncommitted_images().unwrap();
        assert_eq!(open, vec![(4, page(0x55))]);
        assert!(wal.has_open_group());
    }
}
