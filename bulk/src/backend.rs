//! Contract with the remote bulk object-storage backend.
//!
//! Every call is synchronous and may block for as long as the backend takes to
//! answer, so callers drive it from a dedicated worker thread. Data moves
//! through callbacks: the backend pulls upload bytes from a [`PutSource`] and
//! pushes download bytes into a [`GetSink`], one contiguous range per call.

use common::Error;

/// Upload callback: fill the slice with the next bytes of the object and return
/// how many were written. `Ok(0)` means no more data; an error aborts the
/// request.
pub type PutSource<'a> = dyn FnMut(&mut [u8]) -> Result<usize, Error> + 'a;

/// Download callback: consume the next contiguous range of the object. An
/// error aborts the request.
pub type GetSink<'a> = dyn FnMut(&[u8]) -> Result<(), Error> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The backend answered with an unexpected HTTP status.
    BadStatusCode,
    InvalidXml,
    RequestFailed,
    MissingArgs,
    TooManyRedirects,
    /// A data callback returned an error and the request was abandoned.
    CallbackAborted,
}

/// A failure as reported by the backend itself, before translation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} (status: {status_code:?}): {}", body.as_deref().unwrap_or("<no body>"))]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub status_code: Option<u16>,
    pub body: Option<String>,
}

impl BackendError {
    pub fn status(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::BadStatusCode,
            status_code: Some(status_code),
            body: Some(body.into()),
        }
    }

    pub fn new(kind: BackendErrorKind) -> Self {
        Self {
            kind,
            status_code: None,
            body: None,
        }
    }
}

impl From<BackendError> for Error {
    fn from(error: BackendError) -> Self {
        match (error.kind, error.body) {
            (BackendErrorKind::BadStatusCode, Some(body)) => Error::Backend(body),
            _ => Error::Backend("An unknown backend error has occurred".to_string()),
        }
    }
}

/// One object range inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkObject {
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

/// A contiguous part of a bulk job, moved by one streaming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub objects: Vec<BulkObject>,
}

impl Chunk {
    /// The object range carried by this chunk. The engine only streams one
    /// object per chunk.
    pub fn single_object(&self) -> Result<&BulkObject, Error> {
        match self.objects.as_slice() {
            [object] => Ok(object),
            objects => Err(Error::ChunkMismatch(format!(
                "chunk {} carries {} objects, expected exactly one",
                self.id,
                objects.len()
            ))),
        }
    }

    /// Lowest object offset in the chunk.
    pub fn offset(&self) -> Option<u64> {
        self.objects.iter().map(|object| object.offset).min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Put,
    Get,
}

/// Chunk ordering requested for a GET job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOrdering {
    InOrder,
    Any,
}

/// A backend-tracked transfer of one object, partitioned into chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkJob {
    pub id: String,
    pub bucket: String,
    pub kind: JobKind,
    pub chunks: Vec<Chunk>,
}

impl BulkJob {
    /// Chunks still to be transferred when resuming at `resume_offset`, in
    /// list order. Chunks starting below the resume point were completed by an
    /// earlier session.
    pub fn chunks_from(&self, resume_offset: u64) -> impl Iterator<Item = &Chunk> {
        self.chunks
            .iter()
            .filter(move |chunk| chunk.offset().is_none_or(|offset| offset >= resume_offset))
    }

    /// Whether any chunk of this job holds `object` starting at `offset`.
    pub fn has_object_at(&self, object: &str, offset: u64) -> bool {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.objects.iter())
            .any(|candidate| candidate.name == object && candidate.offset == offset)
    }
}

/// Entry of the open-jobs listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: String,
    pub bucket: String,
    pub kind: JobKind,
    pub completed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAllocation {
    /// Space was reserved; the chunk describes the range to upload.
    Allocated(Chunk),
    /// The backend has no room right now.
    RetryLater(std::time::Duration),
}

/// Chunks of a GET job whose data can be read right now.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvailableChunks {
    pub chunks: Vec<Chunk>,
    pub retry_after: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Bucket,
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub owner: String,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

pub trait BulkStorage: Send + Sync {
    /// Starts an upload job for `length` bytes of `object`.
    fn create_put_job(&self, bucket: &str, object: &str, length: u64)
    -> Result<BulkJob, BackendError>;

    /// Starts a download job for the byte range `[offset, offset + length)`.
    fn create_get_job(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        ordering: ChunkOrdering,
    ) -> Result<BulkJob, BackendError>;

    fn list_jobs(&self) -> Result<Vec<JobSummary>, BackendError>;

    fn get_job(&self, job_id: &str) -> Result<BulkJob, BackendError>;

    fn delete_job(&self, job_id: &str) -> Result<(), BackendError>;

    fn allocate_chunk(&self, chunk_id: &str) -> Result<ChunkAllocation, BackendError>;

    fn available_chunks(&self, job_id: &str) -> Result<AvailableChunks, BackendError>;

    /// Uploads `length` bytes at `offset`, pulling them from `source`.
    fn put_object_for_job(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        job_id: &str,
        source: &mut PutSource<'_>,
    ) -> Result<(), BackendError>;

    /// Downloads the chunk of `job_id` that starts at `offset`, pushing its
    /// bytes into `sink` in order.
    fn get_object_for_job(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        job_id: &str,
        sink: &mut GetSink<'_>,
    ) -> Result<(), BackendError>;

    fn delete_object(&self, bucket: &str, object: &str) -> Result<(), BackendError>;

    fn stat(&self, bucket: &str, object: &str) -> Result<ObjectStat, BackendError>;
}
