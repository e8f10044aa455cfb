//! Bulk job and chunk lifecycle.
//!
//! Uploads go through [`resolve_or_create_put_job`], which reuses an open job
//! when a session restarts at a chunk boundary, and [`allocate_chunk`] before
//! each chunk is streamed. Downloads create an in-order GET job per requested
//! range, or wait for chunks to become available when data has to be staged
//! from the archive first.

use tracing::instrument;

use crate::backend::{BulkJob, BulkStorage, Chunk, ChunkAllocation, ChunkOrdering, JobKind};
use common::Error;

/// Finds an open upload job for `object` whose completed byte count equals
/// `offset` and which holds a chunk of the object starting exactly there.
#[instrument(skip(backend))]
pub fn find_restart_job(
    backend: &dyn BulkStorage,
    bucket: &str,
    object: &str,
    offset: u64,
) -> Result<Option<BulkJob>, Error> {
    let jobs = backend.list_jobs()?;
    for summary in jobs.iter().filter(|job| {
        job.kind == JobKind::Put && job.bucket == bucket && job.completed_bytes == offset
    }) {
        let job = backend.get_job(&summary.id)?;
        if job.has_object_at(object, offset) {
            tracing::debug!("job {} matches restart at offset {}", job.id, offset);
            return Ok(Some(job));
        }
    }
    Ok(None)
}

/// Returns the job an upload of `length` bytes resuming at `resume_offset`
/// should use: a matching open job if there is one, otherwise a new job. A
/// nonzero resume offset without a matching job fails with
/// `Error::NoRestartJob`.
#[instrument(skip(backend))]
pub fn resolve_or_create_put_job(
    backend: &dyn BulkStorage,
    bucket: &str,
    object: &str,
    resume_offset: u64,
    length: u64,
) -> Result<BulkJob, Error> {
    if let Some(job) = find_restart_job(backend, bucket, object, resume_offset)? {
        tracing::info!("resuming job {} at offset {}", job.id, resume_offset);
        return Ok(job);
    }
    if resume_offset != 0 {
        return Err(Error::NoRestartJob);
    }
    let job = backend.create_put_job(bucket, object, length)?;
    tracing::debug!("created job {} with {} chunks", job.id, job.chunks.len());
    Ok(job)
}

/// Reserves space for `chunk`. A retry-later answer is fatal for the session.
#[instrument(skip(backend, chunk), fields(chunk = %chunk.id))]
pub fn allocate_chunk(backend: &dyn BulkStorage, chunk: &Chunk) -> Result<Chunk, Error> {
    match backend.allocate_chunk(&chunk.id)? {
        ChunkAllocation::Allocated(allocated) => Ok(allocated),
        ChunkAllocation::RetryLater(after) => {
            tracing::warn!(
                "chunk {} refused, backend asks to retry after {:?}",
                chunk.id,
                after
            );
            Err(Error::NoSpace)
        }
    }
}

/// Creates a download job whose chunks are delivered in object order.
#[instrument(skip(backend))]
pub fn create_get_job(
    backend: &dyn BulkStorage,
    bucket: &str,
    object: &str,
    offset: u64,
    length: u64,
) -> Result<BulkJob, Error> {
    let job = backend.create_get_job(bucket, object, offset, length, ChunkOrdering::InOrder)?;
    tracing::debug!("created job {} with {} chunks", job.id, job.chunks.len());
    Ok(job)
}

/// Polls the job's available chunks every `poll` until they cover
/// `[offset, offset + length)` or `timeout` has passed. Returns whether the
/// range became available.
#[instrument(skip(backend))]
pub fn wait_for_available(
    backend: &dyn BulkStorage,
    job_id: &str,
    offset: u64,
    length: u64,
    timeout: std::time::Duration,
    poll: std::time::Duration,
) -> Result<bool, Error> {
    let start = std::time::Instant::now();
    loop {
        let available = backend.available_chunks(job_id)?;
        if covers(&available.chunks, offset, length) {
            return Ok(true);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            tracing::debug!("range still not available after {:?}", elapsed);
            return Ok(false);
        }
        std::thread::sleep(poll.min(timeout - elapsed));
    }
}

/// Whether the object ranges in `chunks` cover `[offset, offset + length)`
/// without a gap.
pub fn covers(chunks: &[Chunk], offset: u64, length: u64) -> bool {
    let end = offset.saturating_add(length);
    let mut ranges: Vec<(u64, u64)> = chunks
        .iter()
        .flat_map(|chunk| chunk.objects.iter())
        .map(|object| (object.offset, object.offset.saturating_add(object.length)))
        .collect();
    ranges.sort_unstable();
    let mut covered = offset;
    for (start, stop) in ranges {
        if covered >= end {
            break;
        }
        if start > covered {
            return false;
        }
        covered = covered.max(stop);
    }
    covered >= end
}
