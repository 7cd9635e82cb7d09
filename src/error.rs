use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZimError {
    #[error("Not a supported ZIM archive: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed archive structure: {0}")]
    Format(String),

    #[error("Cluster uses unsupported compression tag {0}")]
    UnsupportedCompression(u8),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Redirect chain contains a loop")]
    RedirectLoop,

    #[error("Redirect chain exceeds maximum depth of {0}")]
    RedirectTooDeep(u32),

    #[error("Operation requires the object to be bound to an archive")]
    BindRequired,

    #[error("An entry already exists for full URL '{0}'")]
    DuplicateEntry(String),

    #[error("Checksum trailer does not match archive contents")]
    ChecksumMismatch,

    #[error("Archive has already been closed")]
    ArchiveClosed,

    #[error("Archive was opened read-only")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ZimError>;
