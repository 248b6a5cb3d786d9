use thiserror::Error;

/// Crate-wide error type.
///
/// `NotFound` deliberately has no variant here: a cache miss is normal
/// control flow (an `Option::None` or `false` return), not an error.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The supplied key was empty. Callers get a neutral result (`false`,
    /// `None`, or a no-op) rather than this error surfacing directly —
    /// it exists so internal helpers can short-circuit uniformly.
    #[error("key is empty or invalid")]
    KeyInvalid,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend data is corrupt: {0}")]
    BackendCorrupt(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("reentrant call into cache detected")]
    Reentrancy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
