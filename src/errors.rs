use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    DuplicateKey,

    #[error("encoded {what} is {size} bytes, limit is {limit}")]
    EncodingTooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("invalid value encoding")]
    InvalidEncoding,

    #[error("incompatible database file: {0}")]
    IncompatibleFile(&'static str),

    #[error("page size cannot hold a tree node of three maximum-size entries")]
    ConfigTooTight,

    #[error("write-ahead log is corrupt")]
    CorruptWal,

    #[error("database file is already locked by another handle")]
    AlreadyOpen,

    #[error("handle is poisoned by an earlier failure")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    // Pager and WAL failures latch the handle; logical errors do not.
    pub(crate) fn poisons(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::InvalidEncoding | Error::CorruptWal
        )
    }
}
