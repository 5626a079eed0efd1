//! Crate-wide error types.
//!
//! Splits between a loosely-typed top-level `Error` used by glue code
//! (`lib.rs`) and tightly-typed per-module error enums (`thiserror`) used on
//! hot paths where callers need to match on the cause.

use thiserror::Error;

/// Error returned by most top-level functions.
///
/// Kept as a boxed trait object so callers that just want to propagate with
/// `?` don't need to know about every module's concrete error enum.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors arising while parsing or serializing the wire protocol.
///
/// Corresponds to spec.md's "ProtocolError" category (section 7.1): missing
/// or undersized frames, wrong magic/version, unexpected more-follows.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed while a frame was expected")]
    ConnectionClosed,

    #[error("header frame is only {0} bytes, at least 3 are required")]
    HeaderTooShort(usize),

    #[error("invalid magic byte (expecting 0x31): got 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("invalid protocol version (expecting 0x01): got 0x{0:02x}")]
    InvalidVersion(u8),

    #[error("expected another frame to follow, but more-follows bit was unset ({0})")]
    ExpectedMoreFrames(&'static str),

    #[error("found a key frame but no matching value frame")]
    UnpairedKeyValue,

    #[error("frame is {actual} bytes, expected exactly {expected} ({context})")]
    UnexpectedFrameSize {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("string frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the (abstract) storage engine.
///
/// Corresponds to spec.md's "EngineError" category. `NotFound` is
/// deliberately not an error at the request scope for Read/Exists — workers
/// translate it into an empty value or `false` before it ever becomes this
/// type.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("table {0} does not exist")]
    NoSuchTable(u32),

    #[error("storage engine failure: {0}")]
    Storage(String),

    #[error("I/O error opening/closing table: {0}")]
    Io(String),
}

/// Errors from the Table-Admin Server.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("admin channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from async job lifecycle management.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no job with APID {0}")]
    NoSuchJob(u64),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("job counter file error: {0}")]
    CounterFile(#[from] std::io::Error),
}
