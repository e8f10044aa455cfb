//! Transfer parameters and the checks they must pass before a session starts.

use common::Error;

use crate::network::WriteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Retrieve,
    Store,
}

/// What the server asks a session to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Absolute `/bucket/object` path.
    pub pathname: String,
    /// Announced size of an upload, in bytes.
    pub alloc_size: u64,
    /// Delete the existing object before an upload.
    pub truncate: bool,
    pub partial_offset: u64,
    /// `None` when the whole file is requested.
    pub partial_length: Option<u64>,
    /// Restart ranges of the request.
    pub ranges: Vec<WriteRange>,
}

impl TransferRequest {
    /// A whole-file request for `pathname`.
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            pathname: pathname.into(),
            alloc_size: 0,
            truncate: false,
            partial_offset: 0,
            partial_length: None,
            ranges: vec![WriteRange::whole()],
        }
    }

    #[must_use]
    pub fn with_alloc_size(mut self, alloc_size: u64) -> Self {
        self.alloc_size = alloc_size;
        self
    }

    #[must_use]
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    #[must_use]
    pub fn with_ranges(mut self, ranges: Vec<WriteRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn is_partial(&self) -> bool {
        self.partial_offset != 0 || self.partial_length.is_some()
    }

    /// Rejects everything the engines cannot serve: partial transfers,
    /// downloads that do not start at zero, and uploads with more than one
    /// restart range or a bounded one.
    pub fn check(&self, direction: Direction) -> Result<(), Error> {
        match direction {
            Direction::Retrieve => {
                if self.is_partial() {
                    return Err(Error::NotSupported("Partial RETR".to_string()));
                }
                if self.ranges.as_slice() != [WriteRange::whole()] {
                    return Err(Error::NotSupported("Restarts".to_string()));
                }
            }
            Direction::Store => {
                if self.is_partial() {
                    return Err(Error::NotSupported("Partial STOR".to_string()));
                }
                match self.ranges.as_slice() {
                    [range] if range.is_open_ended() => {}
                    _ => return Err(Error::NotSupported("Restarts with ranges".to_string())),
                }
            }
        }
        Ok(())
    }
}
