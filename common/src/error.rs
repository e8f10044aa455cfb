/// Failure of a transfer session or one of its backend operations.
///
/// A session records the first `Error` it sees and never overwrites it, so the
/// type is `Clone`: every waiter observes the same value and the network side
/// receives it exactly once when the session finishes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Registering an asynchronous read or write with the network side failed,
    /// or the network side completed one with an error.
    #[error("data channel error: {0}")]
    Transport(String),

    /// A bulk backend request failed. The message is already translated from
    /// the backend's own status and body.
    #[error("{0}")]
    Backend(String),

    /// The network side signalled end of data before the object was complete.
    #[error("Premature end of data transfer")]
    PrematureEnd,

    /// Data arrived out of the single sequential order the upload supports.
    #[error(
        "Out of order buffer offsets detected (needed offset {needed}, have {found}). Please disable parallel data channels."
    )]
    OutOfOrder { needed: u64, found: u64 },

    /// The backend described a job, chunk or object layout we cannot stream.
    #[error("unexpected chunk layout: {0}")]
    ChunkMismatch(String),

    /// A session could not get the buffers, runtime or worker it needs.
    #[error("{0}")]
    Resource(String),

    /// Chunk allocation was refused with a retry-later response.
    #[error("No space on device for incoming file.")]
    NoSpace,

    /// A nonzero resume offset was requested but no open job matches it.
    #[error("No job for restart. You must transfer the entire file.")]
    NoRestartJob,

    /// The request asks for something the transfer engine does not implement.
    #[error("{0} is not supported")]
    NotSupported(String),

    /// The pathname does not name an object inside a bucket.
    #[error("{0}")]
    InvalidPath(String),
}

impl Error {
    /// Whether this error originated from the bulk backend rather than from the
    /// session itself.
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}
