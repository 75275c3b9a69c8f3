use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::BlockId;

/// The top-level result type for the cache.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up
/// in both the expected and unexpected operation of a `Cache`.
///
/// Contract violations (acquiring a block in a mode the transaction does
/// not allow, out-of-order tokens, out-of-range patches) are not represented
/// here. They panic.
#[derive(Debug)]
pub enum Error {
    /// A read or write error has happened when interacting with the
    /// serializer.
    Io(io::Error),
    /// Corruption has been detected, either in an encoded patch log or in
    /// the cache's own version bookkeeping.
    Corruption {
        /// The block the corruption was detected for.
        block_id: BlockId,
        /// What was wrong.
        detail: String,
    },
    /// A fixed-capacity resource (the block id space) ran out.
    AllocationFailed(String),
    /// The caller's `Interruptor` fired while it was waiting.
    Interrupted,
    /// The cache has begun shutting down and accepts no new transactions.
    ShuttingDown,
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An unexpected bug has happened.
    ReportableBug(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            Corruption { block_id, detail } => {
                Corruption { block_id: *block_id, detail: detail.clone() }
            }
            AllocationFailed(why) => AllocationFailed(why.clone()),
            Interrupted => Interrupted,
            ShuttingDown => ShuttingDown,
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (
                Corruption { block_id: l, detail: ld },
                Corruption { block_id: r, detail: rd },
            ) => l == r && ld == rd,
            (AllocationFailed(l), AllocationFailed(r)) => l == r,
            (Interrupted, Interrupted) => true,
            (ShuttingDown, ShuttingDown) => true,
            (Unsupported(l), Unsupported(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (Io(l), Io(r)) => l.kind() == r.kind(),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use self::Error::*;

        match error {
            Io(ioe) => ioe,
            other => {
                let kind = match other {
                    Interrupted => io::ErrorKind::Interrupted,
                    AllocationFailed(_) => io::ErrorKind::OutOfMemory,
                    Corruption { .. } => io::ErrorKind::InvalidData,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        if let Error::Io(ioe) = self { Some(ioe) } else { None }
    }
}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { block_id, ref detail } => {
                write!(f, "corruption detected for block {}: {}", block_id, detail)
            }
            AllocationFailed(ref why) => {
                write!(f, "allocation failed: {}", why)
            }
            Interrupted => write!(f, "interrupted while waiting"),
            ShuttingDown => write!(f, "the cache is shutting down"),
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
        }
    }
}
