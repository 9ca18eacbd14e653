// vim: tw=80
//! Common type definitions used throughout raidgen

use thiserror::Error;

/// Indexes a block, either in the raid group's logical address space or in a
/// member drive's address space.
pub type LbaT = u64;

/// A count of blocks
pub type BlockCount = u64;

/// Indexes a member drive within its raid group.  Position 0 is the first
/// drive.
pub type Position = u16;

/// The widest raid group supported, in member drives
pub const MAX_WIDTH: usize = 16;

/// raidgen's error type.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// The raid geometry is inconsistent.  Only returned at configuration time.
    #[error("Invalid raid group configuration: {0}")]
    ConfigurationInvalid(&'static str),

    #[error("Unrecognized opcode")]
    UnrecognizedOpcode,

    /// Pages could not be allocated.  The operation may be retried later.
    #[error("Resources exhausted")]
    ResourceExhausted,

    /// An internal consistency check failed.  This is always a bug.
    #[error("Internal invariant violated")]
    InvariantViolation,

    /// The request requires a dead member and there is no way to reconstruct
    /// its data.
    #[error("Degraded access denied")]
    DegradedAccessDenied,

    /// The request was empty or extended beyond the raid group's capacity.
    #[error("Invalid request")]
    InvalidRequest,

    /// A member drive failed a request and the failure could not be masked.
    #[error("I/O error on member {0}")]
    MemberIo(Position),
}

impl Error {
    /// Should an operation that failed with this error be tried again later?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

// LCOV_EXCL_STOP
