use thiserror::Error;

/// Errors produced by the cell, BoC and dictionary codecs.
///
/// All failures are local and typed; nothing is retried internally and no
/// operation falls back to lenient parsing.
#[derive(Debug, Error)]
pub enum CellError {
    #[error("cell overflow: {0}")]
    CellOverflow(String),
    #[error("cell underflow: {0}")]
    CellUnderflow(String),
    #[error("range check failed: {0}")]
    RangeCheck(String),
    #[error("slice not fully consumed: {bits} bits and {refs} refs left")]
    NotEmpty { bits: usize, refs: usize },
    #[error("reference graph is not a DAG")]
    NotADag,
    #[error("malformed bag of cells: {0}")]
    BocFormat(String),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("malformed dictionary: {0}")]
    DictFormat(String),
    #[error("invalid address: {0}")]
    AddressFormat(String),
}

pub type Result<T> = std::result::Result<T, CellError>;
