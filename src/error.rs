//! Implements the errors for the index operations.

use std::collections::TryReserveError;
use std::error::Error;
use std::fmt;
use std::io;

/// Failed to allocate a bucket region.
/// Returned from creation, from set and from delete (the latter two only when
/// a resize triggers); the index is left in a valid pre-call state.
#[derive(Debug)]
pub struct AllocError(TryReserveError);

impl Error for AllocError {}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bucket allocation failed: {}", self.0)
    }
}

impl From<TryReserveError> for AllocError {
    fn from(err: TryReserveError) -> Self {
        Self(err)
    }
}

/// Error on reading a persisted index.
#[derive(Debug)]
pub enum ReadIndexError {
    /// An underlying IO error while reading the file.
    IO(io::Error),
    /// The file does not start with the index magic.
    BadMagic,
    /// The key width recorded in the header is unsupported.
    BadKeySize(u8),
    /// The value width recorded in the header is unsupported.
    BadValueSize(u8),
    /// The file length does not match the header arithmetic.
    LengthMismatch {
        /// Length implied by the header fields.
        expected: u64,
        /// Length of the file as found.
        actual: u64,
    },
    /// Failed to allocate the bucket region for the file contents.
    Alloc(AllocError),
}

impl Error for ReadIndexError {}

impl fmt::Display for ReadIndexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::IO(e) => write!(f, "io: {}", e),
            Self::BadMagic => write!(f, "unknown magic in header"),
            Self::BadKeySize(size) => write!(f, "unsupported key size {}", size),
            Self::BadValueSize(size) => write!(f, "unsupported value size {}", size),
            Self::LengthMismatch { expected, actual } => write!(
                f,
                "incorrect file length (expected {}, got {})",
                expected, actual
            ),
            Self::Alloc(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for ReadIndexError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}

impl From<AllocError> for ReadIndexError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

/// Error on writing an index to a file.
#[derive(Debug)]
pub enum WriteIndexError {
    /// Failed to create or truncate the file.
    Create(io::Error),
    /// An underlying IO error while writing header or buckets.
    Write(io::Error),
}

impl Error for WriteIndexError {}

impl fmt::Display for WriteIndexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Create(e) => write!(f, "open for writing failed: {}", e),
            Self::Write(e) => write!(f, "write failed: {}", e),
        }
    }
}
