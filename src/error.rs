use thiserror::Error;

/// Errors surfaced by the FTL core.
///
/// Recovery is narrow by design: only transient space pressure is handled
/// locally (by kicking the garbage collector); everything else propagates
/// to the caller. See the error handling section of the design notes for
/// the rationale behind each variant.
#[derive(Error, Debug)]
pub enum FtlError {
    #[error("no free physical page available")]
    OutOfSpace,

    #[error("pool {0} exhausted: no free blocks and GC made no progress")]
    Exhausted(u32),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("device I/O error: {0}")]
    DeviceIo(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("logical address {0} out of range")]
    AddressOutOfRange(u64),

    #[error("malformed hint: {0}")]
    MalformedHint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FtlError>;

/// Outcome returned to the host block interface for a submitted request.
///
/// Distinct from [`FtlError`]: a `Busy` response is an expected, retryable
/// condition (the host is expected to resubmit), not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Ok,
    Busy,
    Error,
}
