//! Error taxonomy for the replay and sort engines.
//!
//! One `thiserror` enum for the crate, with `#[from]` conversions for the
//! handful of upstream error types the core actually propagates, and
//! everything else wrapped with context at the call site.

use thiserror::Error;

/// Errors the core engine can surface. Binaries convert these to `anyhow`
/// at the boundary and map them to process exit codes.
#[derive(Debug, Error)]
pub enum Error {
    /// The `--pace` program string failed to parse, or was empty.
    #[error("bad pace program: {0}")]
    BadPace(String),

    /// A single input line failed to decode into a request record.
    #[error("bad input: {0}")]
    BadInput(String),

    /// A sort-mode input arrived with a timestamp earlier than the last
    /// emitted one, and the reorder buffer was not large enough to absorb
    /// it.
    #[error("out of order emission: {0}")]
    OutOfOrder(String),

    /// Internal invariant violation: the result queue closed before every
    /// enqueued request produced a result, or vice versa. Should be
    /// unreachable by construction; see `Dispatcher`.
    #[error("shutdown race: {0}")]
    ShutdownRace(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
