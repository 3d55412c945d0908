use thiserror::Error;

/// Errors surfaced by the page managers and the tree.
///
/// None of these are recovered internally. A failed insert leaves the tree at
/// the state of the last committed page write; a failed query returns what it
/// accumulated together with the error.
#[derive(Debug, Error)]
pub enum SlimError {
    /// The page manager cannot resolve the given page id: it was never
    /// allocated, or it was disposed and not yet reused.
    #[error("invalid page id {0}")]
    InvalidPageId(u32),

    /// A node-local slot argument was out of range.
    #[error("slot {slot} out of range (node has {occupation} entries)")]
    OutOfRange { slot: u32, occupation: u32 },

    /// The serialized object exceeds page capacity: after trying every
    /// promotion pair, no split produced two partitions that both fit in a
    /// page. The insert that produced it is aborted and no object is counted.
    #[error("no promotion pair yields two partitions that fit in a page")]
    SplitInfeasible,

    /// The backing store rejected a read or write.
    #[error("storage i/o failure")]
    IoFailure(#[from] std::io::Error),

    /// The file (or header page) does not carry the expected magic value.
    /// Also raised for a file written on a machine with different endianness.
    #[error("bad magic in {0} header")]
    InvalidHeader(&'static str),
}

pub type Result<T> = std::result::Result<T, SlimError>;
