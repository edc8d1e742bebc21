use thiserror::Error;

/// A crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors returned by this crate. `NotFound` is the only variant that
/// represents normal absence; everything else is a genuine failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The key does not exist, or has expired.
    #[error("key not found")]
    NotFound,
    /// A record header is not two ASCII decimals separated by one space.
    #[error("malformed record header: {0}")]
    MalformedHeader(String),
    /// A record frame is truncated or missing a newline terminator.
    #[error("malformed record frame: {0}")]
    MalformedFrame(String),
    /// The payload disagrees with the checksum in its header.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    /// A checksum-valid payload failed to parse as a record.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
    /// A record the index believes is valid failed integrity checks when
    /// read back. Fatal for the read, but the store remains open.
    #[error("data corruption at offset {offset}: {reason}")]
    DataCorruption { offset: u64, reason: String },
    /// The value cannot be serialized to JSON.
    #[error("value is not serializable: {0}")]
    NotSerializable(String),
    /// The caller passed an invalid argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
