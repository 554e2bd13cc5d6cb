use crate::config::{PageId, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::errors::{Error, Result};

// In-memory copy of the page-0 header. All integer fields are big-endian u32
// on disk; the remainder of page 0 is reserved zero.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub page_size: u32,
    pub max_key_size: u32,
    pub max_value_size: u32,
    pub root: PageId,      // B-tree root page
    pub free_head: PageId, // head of the free-page chain, 0 when empty
    pub page_count: PageId, // allocation high-water mark, includes page 0
}

impl Meta {
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.max_key_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.max_value_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.root.to_be_bytes());
        buf[28..32].copy_from_slice(&self.free_head.to_be_bytes());
        buf[32..36].copy_from_slice(&self.page_count.to_be_bytes());
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Meta> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::IncompatibleFile("file shorter than the header"));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::IncompatibleFile("bad magic"));
        }
        let field = |at: usize| u32::from_be_bytes(buf[at..at + 4].try_into().unwrap());
        if field(8) != FORMAT_VERSION {
            return Err(Error::IncompatibleFile("unsupported format version"));
        }
        Ok(Meta {
            page_size: field(12),
            max_key_size: field(16),
            max_value_size: field(20),
            root: field(24),
            free_head: field(28),
            page_count: field(32),
        })
    }

    // Full page-0 image, for WAL frames and initial creation.
    pub fn page_image(&self) -> Vec<u8> {
        let mut page = vec![0u8; self.page_size as usize];
        page[..HEADER_SIZE].copy_from_slice(&self.pack());
        page
    }
}
