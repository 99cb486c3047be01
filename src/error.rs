use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key size: {size} bytes (min: {min}, max: {max})")]
    InvalidKeySize { size: usize, min: usize, max: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupted shard: {0}")]
    Corrupted(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Shard is closed")]
    Closed,

    #[error("Thread panic: {0}")]
    ThreadPanic(String),
}

impl Error {
    /// Invariant violations. Continuing after one of these risks silent
    /// data corruption, so callers should stop using the shard.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupted(_) | Error::InvalidState(_))
    }

    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::InvalidKeySize { .. } => -2,
            Error::Config(_) => -3,
            Error::Corrupted(_) => -4,
            Error::InvalidState(_) => -5,
            Error::Closed => -6,
            Error::ThreadPanic(_) => -7,
        }
    }
}
