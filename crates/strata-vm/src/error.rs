//! Virtual-memory error types.

use std::io;

/// Errors raised by a [`crate::VmProvider`] or a [`crate::Region`].
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The provider could not reserve address space.
    #[error("failed to reserve {size} bytes of address space: {source}")]
    Reserve {
        /// Requested reservation size in bytes.
        size: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The provider could not back reserved pages with memory.
    #[error("failed to commit {size} bytes: {source}")]
    Commit {
        /// Requested commit size in bytes.
        size: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A region was asked to commit past the end of its reservation.
    #[error("requested {requested} committed bytes but only {reserved} are reserved")]
    OutOfReservation {
        /// Bytes that had to be committed.
        requested: usize,
        /// Bytes reserved by the region.
        reserved: usize,
    },

    /// A size could not be rounded to whole pages without overflowing.
    #[error("size {0} overflows when rounded to whole pages")]
    SizeOverflow(usize),
}
