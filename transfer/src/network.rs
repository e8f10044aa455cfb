//! Contract with the network transfer server.
//!
//! The server drives data in and out of a session through asynchronous,
//! block-oriented operations. A block is handed over by value when an
//! operation is registered and comes back inside its completion, which may run
//! on any thread, including the registering one before `register_*` returns.
//! Completion callbacks never block.

use common::Error;
use throttle::Block;

/// The part of the file the server wants to receive from a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRange {
    pub offset: u64,
    /// `None` asks for everything from `offset` to the end of the file.
    pub length: Option<u64>,
}

impl WriteRange {
    /// The whole file.
    pub fn whole() -> Self {
        Self {
            offset: 0,
            length: None,
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.length.is_none()
    }
}

/// Result of an asynchronous read: `length` bytes of the file starting at
/// `offset` were written to the front of `block`.
#[derive(Debug)]
pub struct ReadCompletion {
    pub result: Result<(), Error>,
    pub block: Block,
    pub length: usize,
    pub offset: u64,
    /// The client has no more data to send.
    pub eof: bool,
}

#[derive(Debug)]
pub struct WriteCompletion {
    pub result: Result<(), Error>,
    pub block: Block,
}

pub type ReadCallback = Box<dyn FnOnce(ReadCompletion) + Send>;
pub type WriteCallback = Box<dyn FnOnce(WriteCompletion) + Send>;

/// A registration the server refused. The block is returned untouched and the
/// callback will never run.
#[derive(Debug)]
pub struct Rejected {
    pub block: Block,
    pub error: Error,
}

pub trait DataChannel: Send + Sync {
    /// Announces that data is about to flow.
    fn begin_transfer(&self);

    fn block_size(&self) -> usize;

    /// Number of asynchronous block operations the server currently wants in
    /// flight at once.
    fn optimal_concurrency(&self) -> usize;

    /// Asks for the next incoming bytes to be read into `block`.
    fn register_read(&self, block: Block, on_complete: ReadCallback) -> Result<(), Rejected>;

    /// Sends the first `length` bytes of `block` as file data at `offset`.
    fn register_write(
        &self,
        block: Block,
        length: usize,
        offset: u64,
        on_complete: WriteCallback,
    ) -> Result<(), Rejected>;

    /// Next range of a download the server wants. A zero length means it
    /// wants nothing more.
    fn write_range(&self) -> WriteRange;

    /// Reports `length` bytes moved at `offset`.
    fn update_perf_markers(&self, offset: u64, length: u64);

    /// Reports `[offset, offset + length)` as durably stored, a point an
    /// upload can later restart from.
    fn update_restart_markers(&self, offset: u64, length: u64);

    /// Final result of the session. Called exactly once.
    fn finished_transfer(&self, result: Result<(), Error>);
}
