//! In-memory bulk storage backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::backend::{
    AvailableChunks, BackendError, BackendErrorKind, BulkJob, BulkObject, BulkStorage, Chunk,
    ChunkAllocation, ChunkOrdering, EntryKind, GetSink, JobKind, JobSummary, ObjectStat,
    PutSource,
};

/// Call counters, mostly useful to assert what a session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub jobs_created: usize,
    pub jobs_deleted: usize,
    pub allocations: usize,
    pub puts: usize,
    pub gets: usize,
}

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    modified: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
struct JobRecord {
    job: BulkJob,
    object: String,
    completed: BTreeSet<usize>,
    completed_bytes: u64,
    polls: u32,
}

impl JobRecord {
    fn is_open(&self) -> bool {
        match self.job.kind {
            JobKind::Put => self.completed.len() < self.job.chunks.len(),
            JobKind::Get => true,
        }
    }

    fn chunk_at(&self, object: &str, offset: u64) -> Option<usize> {
        self.job.chunks.iter().position(|chunk| {
            chunk
                .objects
                .iter()
                .any(|candidate| candidate.name == object && candidate.offset == offset)
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<(String, String), StoredObject>,
    jobs: BTreeMap<String, JobRecord>,
    next_job: u64,
    capacity: Option<u64>,
    reserved: u64,
    put_faults: HashMap<usize, BackendError>,
    archived: HashMap<(String, String), u32>,
    stats: MemoryStats,
}

/// Bulk backend that keeps objects and jobs in process memory.
///
/// Jobs are split into chunks of a fixed size and data callbacks are invoked
/// with at most `io_size` bytes at a time, so the chunk and callback
/// boundaries seen by a session do not have to line up with its block size.
/// A capacity limit, per-chunk upload faults and archived objects that only
/// become available after a number of polls can be configured for tests.
#[derive(Debug)]
pub struct MemoryBackend {
    chunk_size: u64,
    io_size: usize,
    owner: String,
    inner: Mutex<Inner>,
}

fn not_found(what: &str) -> BackendError {
    BackendError::status(404, format!("{what} not found"))
}

fn to_usize(value: u64) -> Result<usize, BackendError> {
    usize::try_from(value).map_err(|_| BackendError::status(400, "range too large"))
}

impl MemoryBackend {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            io_size: 64 * 1024,
            owner: "bpgrid".to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Sets the largest slice handed to data callbacks.
    #[must_use]
    pub fn with_io_size(mut self, io_size: usize) -> Self {
        self.io_size = io_size.max(1);
        self
    }

    pub fn insert_object(&self, bucket: &str, object: &str, data: Vec<u8>) {
        self.inner.lock().objects.insert(
            (bucket.to_string(), object.to_string()),
            StoredObject {
                data,
                modified: chrono::Utc::now(),
            },
        );
    }

    pub fn object(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .objects
            .get(&(bucket.to_string(), object.to_string()))
            .map(|stored| stored.data.clone())
    }

    /// Total bytes chunk allocations may reserve before they are refused.
    pub fn set_capacity(&self, bytes: u64) {
        self.inner.lock().capacity = Some(bytes);
    }

    /// Makes every upload into the job chunk at `index` fail with `error`
    /// before any data is pulled.
    pub fn fail_put_on_chunk(&self, index: usize, error: BackendError) {
        self.inner.lock().put_faults.insert(index, error);
    }

    /// Hides the object's chunks from the first `polls` available-chunk
    /// queries of each job.
    pub fn archive(&self, bucket: &str, object: &str, polls: u32) {
        self.inner
            .lock()
            .archived
            .insert((bucket.to_string(), object.to_string()), polls);
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats
    }

    fn split_chunks(&self, job_id: &str, object: &str, offset: u64, length: u64) -> Vec<Chunk> {
        let end = offset + length;
        let mut chunks = Vec::new();
        let mut start = offset;
        while start < end {
            let stop = (start + self.chunk_size).min(end);
            chunks.push(Chunk {
                id: format!("{job_id}-{}", chunks.len()),
                objects: vec![BulkObject {
                    name: object.to_string(),
                    offset: start,
                    length: stop - start,
                }],
            });
            start = stop;
        }
        chunks
    }

    fn add_job(
        &self,
        inner: &mut Inner,
        bucket: &str,
        object: &str,
        kind: JobKind,
        offset: u64,
        length: u64,
    ) -> BulkJob {
        inner.next_job += 1;
        let id = format!("job-{:04}", inner.next_job);
        let job = BulkJob {
            chunks: self.split_chunks(&id, object, offset, length),
            id: id.clone(),
            bucket: bucket.to_string(),
            kind,
        };
        inner.jobs.insert(
            id,
            JobRecord {
                job: job.clone(),
                object: object.to_string(),
                completed: BTreeSet::new(),
                completed_bytes: 0,
                polls: 0,
            },
        );
        inner.stats.jobs_created += 1;
        tracing::debug!("created {:?} job {} for /{}/{}", kind, job.id, bucket, object);
        job
    }
}

impl BulkStorage for MemoryBackend {
    fn create_put_job(
        &self,
        bucket: &str,
        object: &str,
        length: u64,
    ) -> Result<BulkJob, BackendError> {
        let mut inner = self.inner.lock();
        inner.objects.insert(
            (bucket.to_string(), object.to_string()),
            StoredObject {
                data: vec![0; to_usize(length)?],
                modified: chrono::Utc::now(),
            },
        );
        Ok(self.add_job(&mut inner, bucket, object, JobKind::Put, 0, length))
    }

    fn create_get_job(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        _ordering: ChunkOrdering,
    ) -> Result<BulkJob, BackendError> {
        let mut inner = self.inner.lock();
        let size = inner
            .objects
            .get(&(bucket.to_string(), object.to_string()))
            .ok_or_else(|| not_found("Object"))?
            .data
            .len() as u64;
        if offset.saturating_add(length) > size {
            return Err(BackendError::status(
                416,
                format!("range {offset}+{length} beyond object size {size}"),
            ));
        }
        Ok(self.add_job(&mut inner, bucket, object, JobKind::Get, offset, length))
    }

    fn list_jobs(&self) -> Result<Vec<JobSummary>, BackendError> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|record| record.is_open())
            .map(|record| JobSummary {
                id: record.job.id.clone(),
                bucket: record.job.bucket.clone(),
                kind: record.job.kind,
                completed_bytes: record.completed_bytes,
            })
            .collect())
    }

    fn get_job(&self, job_id: &str) -> Result<BulkJob, BackendError> {
        let inner = self.inner.lock();
        inner
            .jobs
            .get(job_id)
            .map(|record| record.job.clone())
            .ok_or_else(|| not_found("Job"))
    }

    fn delete_job(&self, job_id: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.jobs.remove(job_id).ok_or_else(|| not_found("Job"))?;
        inner.stats.jobs_deleted += 1;
        Ok(())
    }

    fn allocate_chunk(&self, chunk_id: &str) -> Result<ChunkAllocation, BackendError> {
        let mut inner = self.inner.lock();
        inner.stats.allocations += 1;
        let chunk = inner
            .jobs
            .values()
            .filter(|record| record.job.kind == JobKind::Put)
            .flat_map(|record| record.job.chunks.iter())
            .find(|chunk| chunk.id == chunk_id)
            .cloned()
            .ok_or_else(|| not_found("Chunk"))?;
        let length: u64 = chunk.objects.iter().map(|object| object.length).sum();
        if inner
            .capacity
            .is_some_and(|capacity| inner.reserved + length > capacity)
        {
            return Ok(ChunkAllocation::RetryLater(std::time::Duration::from_secs(60)));
        }
        inner.reserved += length;
        Ok(ChunkAllocation::Allocated(chunk))
    }

    fn available_chunks(&self, job_id: &str) -> Result<AvailableChunks, BackendError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let record = inner.jobs.get_mut(job_id).ok_or_else(|| not_found("Job"))?;
        record.polls = record.polls.saturating_add(1);
        let key = (record.job.bucket.clone(), record.object.clone());
        let polls = record.polls;
        if inner.archived.get(&key).is_some_and(|&hidden| polls <= hidden) {
            return Ok(AvailableChunks {
                chunks: Vec::new(),
                retry_after: Some(std::time::Duration::from_secs(1)),
            });
        }
        Ok(AvailableChunks {
            chunks: record.job.chunks.clone(),
            retry_after: None,
        })
    }

    fn put_object_for_job(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        job_id: &str,
        source: &mut PutSource<'_>,
    ) -> Result<(), BackendError> {
        let index = {
            let mut inner = self.inner.lock();
            inner.stats.puts += 1;
            let record = inner.jobs.get(job_id).ok_or_else(|| not_found("Job"))?;
            let index = record
                .chunk_at(object, offset)
                .ok_or_else(|| BackendError::status(400, format!("no chunk at offset {offset}")))?;
            if let Some(error) = inner.put_faults.get(&index) {
                return Err(error.clone());
            }
            index
        };
        // the source may block; the lock is not held while it runs
        let mut data = vec![0u8; to_usize(length)?];
        let mut filled = 0;
        while filled < data.len() {
            let end = (filled + self.io_size).min(data.len());
            let pulled = source(&mut data[filled..end]).map_err(|error| {
                tracing::debug!("upload aborted by source: {error}");
                BackendError::new(BackendErrorKind::CallbackAborted)
            })?;
            if pulled == 0 {
                return Err(BackendError::status(
                    400,
                    format!("incomplete upload: {filled} of {length} bytes"),
                ));
            }
            filled += pulled;
        }
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let stored = inner
            .objects
            .get_mut(&(bucket.to_string(), object.to_string()))
            .ok_or_else(|| not_found("Object"))?;
        let start = to_usize(offset)?;
        if stored.data.len() < start + data.len() {
            stored.data.resize(start + data.len(), 0);
        }
        stored.data[start..start + data.len()].copy_from_slice(&data);
        stored.modified = chrono::Utc::now();
        let record = inner.jobs.get_mut(job_id).ok_or_else(|| not_found("Job"))?;
        if record.completed.insert(index) {
            record.completed_bytes += length;
        }
        Ok(())
    }

    fn get_object_for_job(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        job_id: &str,
        sink: &mut GetSink<'_>,
    ) -> Result<(), BackendError> {
        let data = {
            let mut inner = self.inner.lock();
            inner.stats.gets += 1;
            let record = inner.jobs.get(job_id).ok_or_else(|| not_found("Job"))?;
            let index = record
                .chunk_at(object, offset)
                .ok_or_else(|| BackendError::status(400, format!("no chunk at offset {offset}")))?;
            let length: u64 = record.job.chunks[index]
                .objects
                .iter()
                .filter(|candidate| candidate.name == object)
                .map(|candidate| candidate.length)
                .sum();
            let stored = inner
                .objects
                .get(&(bucket.to_string(), object.to_string()))
                .ok_or_else(|| not_found("Object"))?;
            let start = to_usize(offset)?;
            let end = start + to_usize(length)?;
            stored
                .data
                .get(start..end)
                .ok_or_else(|| BackendError::status(416, "chunk beyond object end"))?
                .to_vec()
        };
        for piece in data.chunks(self.io_size) {
            sink(piece).map_err(|error| {
                tracing::debug!("download aborted by sink: {error}");
                BackendError::new(BackendErrorKind::CallbackAborted)
            })?;
        }
        Ok(())
    }

    fn delete_object(&self, bucket: &str, object: &str) -> Result<(), BackendError> {
        self.inner
            .lock()
            .objects
            .remove(&(bucket.to_string(), object.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("Object"))
    }

    fn stat(&self, bucket: &str, object: &str) -> Result<ObjectStat, BackendError> {
        let inner = self.inner.lock();
        if let Some(stored) = inner.objects.get(&(bucket.to_string(), object.to_string())) {
            return Ok(ObjectStat {
                name: object.to_string(),
                kind: EntryKind::File,
                size: stored.data.len() as u64,
                owner: self.owner.clone(),
                modified: Some(stored.modified),
            });
        }
        let prefix = format!("{object}/");
        let is_directory = inner
            .objects
            .keys()
            .any(|(b, name)| b == bucket && name.starts_with(&prefix));
        if is_directory {
            return Ok(ObjectStat {
                name: object.to_string(),
                kind: EntryKind::Directory,
                size: 0,
                owner: self.owner.clone(),
                modified: None,
            });
        }
        Err(not_found("Object"))
    }
}
