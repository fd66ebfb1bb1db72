use thiserror::Error;

/// Every failure mode this crate can surface, from a single malformed record up to a
/// cleaner run refusing to touch a chain it cannot safely reason about.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error("read past end of data")]
    ReadBeyondEod,
    #[error("write past end of data")]
    WriteBeyondEod,
    #[error("unexpected end of data")]
    UnexpectedEod,
    #[error("write_at returned zero bytes written")]
    WriteZero,
    #[error("not found: {0}")]
    NotFound(String),

    #[error("file too small to hold a VHD footer")]
    FileTooSmall,
    #[error("invalid record cookie in {0}")]
    InvalidRecord(&'static str),
    #[error("checksum mismatch in {0}")]
    BadChecksum(&'static str),
    #[error("primary and backup footers differ")]
    FooterMismatch,
    #[error("unsupported VHD disk type {0}")]
    UnsupportedDiskType(u32),
    #[error("block index {0} out of range")]
    InvalidBlockIndex(usize),
    #[error("block {0} is not allocated")]
    BlockAbsent(u32),

    #[error("parent VHD is missing: {0}")]
    ParentMissing(String),
    #[error("two VHDs declare the same parent: {0}")]
    MultipleChildren(String),
    #[error("parent disk is not dynamic or differencing")]
    ParentNotDynamic,
    #[error("path is not absolute: {0}")]
    PathNeedsAbsolute(String),
    #[error("could not compute a relative path from {from} to {to}")]
    CannotGetRelativePath { from: String, to: String },
    #[error("expected a dynamic or differencing image")]
    NeedDynamicOrDiffImage,

    #[error("structural invariant violated: {0}")]
    AssertionFailure(&'static str),

    #[error("malformed sidecar or backup metadata at {0}: {1}")]
    InvalidMetadata(String, String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
