//! Bulk object-storage side of a transfer session
//!
//! The backend is reached through the synchronous [`BulkStorage`] trait. On top
//! of it, [`jobs`] implements the job and chunk lifecycle a session follows
//! (restart discovery, chunk allocation, in-order downloads) and [`stage`]
//! recalls archived objects. [`MemoryBackend`] keeps everything in memory and
//! backs the test suites of the whole workspace.
//!
//! Backend failures are reported as [`BackendError`] and converted into
//! [`common::Error`] in exactly one place, so the body of an HTTP error answer
//! becomes the message a client sees.

pub mod backend;
pub mod jobs;
pub mod memory;
pub mod stage;

pub use backend::{
    AvailableChunks, BackendError, BackendErrorKind, BulkJob, BulkObject, BulkStorage, Chunk,
    ChunkAllocation, ChunkOrdering, EntryKind, GetSink, JobKind, JobSummary, ObjectStat,
    PutSource,
};
pub use memory::{MemoryBackend, MemoryStats};
pub use stage::{Residency, stage_object};
