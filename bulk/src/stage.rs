//! Residency checks for objects that may only live on the archive tier.

use tracing::instrument;

use crate::backend::{BulkStorage, ChunkOrdering, EntryKind};
use crate::jobs;
use common::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// The object's bytes can be read right away.
    Resident,
    /// The backend is still bringing the object back from the archive.
    Archived,
}

/// Asks the backend to stage `object` and waits up to `timeout` for all of its
/// chunks to become available. Anything that is not a regular object is
/// reported resident.
#[instrument(skip(backend))]
pub fn stage_object(
    backend: &dyn BulkStorage,
    bucket: &str,
    object: &str,
    timeout: std::time::Duration,
    poll: std::time::Duration,
) -> Result<Residency, Error> {
    let stat = backend.stat(bucket, object)?;
    if stat.kind != EntryKind::File {
        return Ok(Residency::Resident);
    }
    let job = backend.create_get_job(bucket, object, 0, stat.size, ChunkOrdering::Any)?;
    let available = jobs::wait_for_available(backend, &job.id, 0, stat.size, timeout, poll);
    // the staging job only exists to trigger the recall
    let deleted = backend.delete_job(&job.id);
    let residency = if available? {
        Residency::Resident
    } else {
        Residency::Archived
    };
    deleted?;
    tracing::info!("/{}/{} is {:?}", bucket, object, residency);
    Ok(residency)
}
