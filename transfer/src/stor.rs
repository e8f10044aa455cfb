//! Upload engine: network to bulk storage.
//!
//! The worker keeps up to the throttle limit of asynchronous reads
//! outstanding against the network side. Completed reads land in a ready set
//! keyed by file offset. The backend pulls each allocated chunk through a
//! synchronous callback that is served strictly from the ready block starting
//! at the next needed offset, so bytes reach storage in contiguous ascending
//! order whatever order the reads complete in.
//!
//! Only one sequential stream is supported. Data that lands behind the needed
//! offset, or a ready set that can no longer grow while the needed block is
//! missing, fails the session with [`Error::OutOfOrder`] instead of being
//! reassembled.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::instrument;

use bulk::{BulkStorage, jobs};
use common::Error;
use throttle::{Block, BufferPool, ConcurrencyThrottle};

use crate::network::{DataChannel, ReadCompletion, Rejected};
use crate::session::{Monitor, Outcome, Tuning};

#[derive(Debug)]
struct ReadyBlock {
    block: Block,
    /// Consumed prefix of the block.
    start: usize,
    remaining: usize,
}

#[derive(Debug)]
struct State {
    pool: BufferPool,
    throttle: ConcurrencyThrottle,
    outcome: Outcome,
    /// File offset of the next byte the backend needs.
    offset: u64,
    ready: BTreeMap<u64, ReadyBlock>,
    in_flight: usize,
    eof: bool,
}

impl State {
    /// Copies contiguous ready data starting at the needed offset into
    /// `buffer`, advancing the offset. Emptied blocks go back to the pool.
    ///
    /// Ready data that starts behind the needed offset, or that a partially
    /// consumed block overlaps, is out of order.
    fn copy_out(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut copied = 0;
        while copied < buffer.len() {
            let needed = self.offset;
            if let Some(found) = self.lowest_ready().filter(|&found| found < needed) {
                return Err(Error::OutOfOrder { needed, found });
            }
            let Some(mut ready) = self.ready.remove(&needed) else {
                break;
            };
            let count = ready.remaining.min(buffer.len() - copied);
            buffer[copied..copied + count]
                .copy_from_slice(&ready.block.as_slice()[ready.start..ready.start + count]);
            copied += count;
            self.offset += count as u64;
            ready.start += count;
            ready.remaining -= count;
            if ready.remaining == 0 {
                self.pool.release(ready.block);
                continue;
            }
            match self.ready.entry(self.offset) {
                Entry::Vacant(slot) => {
                    slot.insert(ready);
                }
                Entry::Occupied(clash) => {
                    let found = clash.key() - ready.start as u64;
                    let needed = *clash.key();
                    self.pool.release(ready.block);
                    return Err(Error::OutOfOrder { needed, found });
                }
            }
        }
        Ok(copied)
    }

    fn lowest_ready(&self) -> Option<u64> {
        self.ready.keys().next().copied()
    }
}

fn on_read(session: &Monitor<State>, completion: ReadCompletion) {
    let ReadCompletion {
        result,
        block,
        length,
        offset,
        eof,
    } = completion;
    session.update(|state| {
        state.in_flight -= 1;
        state.eof |= eof;
        if let Err(error) = result {
            tracing::warn!("read into block {} failed: {}", block.id(), error);
            state.eof = true;
            state.outcome.fail(error);
            state.pool.release(block);
            return;
        }
        let length = length.min(block.capacity());
        if length == 0 {
            state.pool.release(block);
            return;
        }
        tracing::trace!("block {} ready: {} bytes at {}", block.id(), length, offset);
        let needed = state.offset;
        if offset < needed {
            state.pool.release(block);
            state.outcome.fail(Error::OutOfOrder {
                needed,
                found: offset,
            });
            return;
        }
        match state.ready.entry(offset) {
            Entry::Vacant(slot) => {
                slot.insert(ReadyBlock {
                    block,
                    start: 0,
                    remaining: length,
                });
            }
            Entry::Occupied(_) => {
                state.pool.release(block);
                state.outcome.fail(Error::OutOfOrder {
                    needed,
                    found: offset,
                });
            }
        }
    });
}

pub(crate) struct Store {
    backend: Arc<dyn BulkStorage>,
    channel: Arc<dyn DataChannel>,
    bucket: String,
    object: String,
    length: u64,
    truncate: bool,
    session: Arc<Monitor<State>>,
}

impl Store {
    pub(crate) fn new(
        backend: Arc<dyn BulkStorage>,
        channel: Arc<dyn DataChannel>,
        bucket: String,
        object: String,
        length: u64,
        truncate: bool,
        tuning: Tuning,
    ) -> Self {
        let state = State {
            pool: BufferPool::new(tuning.block_size),
            throttle: ConcurrencyThrottle::new(tuning.recheck_interval),
            outcome: Outcome::default(),
            offset: 0,
            ready: BTreeMap::new(),
            in_flight: 0,
            eof: false,
        };
        Self {
            backend,
            channel,
            bucket,
            object,
            length,
            truncate,
            session: Arc::new(Monitor::new(state)),
        }
    }

    /// Uploads every remaining chunk and waits for all reads to complete.
    #[instrument(skip(self), fields(bucket = %self.bucket, object = %self.object))]
    pub(crate) fn run(self) -> Result<(), Error> {
        let streamed = self.stream();
        let mut state = self.session.lock();
        if let Err(error) = streamed {
            state.outcome.fail(error);
        }
        while state.in_flight > 0 {
            self.session.wait(&mut state);
        }
        let leftover = std::mem::take(&mut state.ready);
        if !leftover.is_empty() {
            tracing::debug!("discarding {} unconsumed blocks", leftover.len());
        }
        for ready in leftover.into_values() {
            state.pool.release(ready.block);
        }
        state.outcome.succeed();
        tracing::debug!(
            "drained {} blocks, stored up to offset {}",
            state.pool.allocated(),
            state.offset
        );
        state.outcome.check()
    }

    fn stream(&self) -> Result<(), Error> {
        let backend = self.backend.as_ref();
        if self.truncate {
            self.truncate_object();
        }
        let range = self.channel.write_range();
        if range.length == Some(0) {
            tracing::debug!("nothing to receive");
            return Ok(());
        }
        let resume = range.offset;
        let job =
            jobs::resolve_or_create_put_job(backend, &self.bucket, &self.object, resume, self.length)?;
        self.session.lock().offset = resume;
        self.channel.begin_transfer();
        for chunk in job.chunks_from(resume) {
            let chunk = jobs::allocate_chunk(backend, chunk)?;
            let target = chunk.single_object()?;
            tracing::debug!(
                "chunk {}: {} bytes at offset {}",
                chunk.id,
                target.length,
                target.offset
            );
            self.session.lock().offset = target.offset;
            backend.put_object_for_job(
                &job.bucket,
                &target.name,
                target.offset,
                target.length,
                &job.id,
                &mut |buffer: &mut [u8]| self.fill(buffer),
            )?;
            self.channel
                .update_restart_markers(target.offset, target.length);
            common::get_progress().chunks_stored.inc();
        }
        Ok(())
    }

    /// Deletes the existing object. A missing object is not an error.
    fn truncate_object(&self) {
        match self.backend.delete_object(&self.bucket, &self.object) {
            Ok(()) => tracing::debug!("truncated existing object"),
            Err(error) => tracing::debug!("nothing truncated: {}", error),
        }
    }

    /// Backend callback: fills `buffer` with the bytes at the needed offset.
    fn fill(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut state = self.session.lock();
        match self.fill_locked(&mut state, buffer) {
            Ok(copied) => {
                let offset = state.offset - copied as u64;
                drop(state);
                self.channel.update_perf_markers(offset, copied as u64);
                common::get_progress().bytes_stored.add(copied as u64);
                Ok(copied)
            }
            Err(error) => {
                state.outcome.fail(error.clone());
                Err(error)
            }
        }
    }

    fn fill_locked(
        &self,
        state: &mut MutexGuard<'_, State>,
        buffer: &mut [u8],
    ) -> Result<usize, Error> {
        loop {
            state.outcome.check()?;
            let copied = state.copy_out(buffer)?;
            if copied > 0 || buffer.is_empty() {
                return Ok(copied);
            }
            let needed = state.offset;
            if state.eof {
                if state.in_flight > 0 {
                    self.session.wait(state);
                    continue;
                }
                return Err(match state.lowest_ready() {
                    Some(found) => Error::OutOfOrder { needed, found },
                    None => Error::PrematureEnd,
                });
            }
            if self.launch_reads(state)? > 0 {
                continue;
            }
            if state.in_flight == 0 {
                // every block sits in the ready set and none of them is next
                return Err(match state.lowest_ready() {
                    Some(found) => Error::OutOfOrder { needed, found },
                    None => Error::Resource("no transfer buffer available".to_string()),
                });
            }
            self.session.wait(state);
        }
    }

    /// Registers reads until the throttle limit is reached or the pool is
    /// exhausted. Returns how many were registered.
    ///
    /// A read may complete before its registration returns. The loop stops
    /// once end of data or a failure is recorded and never registers more
    /// than `limit` reads per call.
    fn launch_reads(&self, state: &mut MutexGuard<'_, State>) -> Result<usize, Error> {
        let limit = state
            .throttle
            .check(|| self.channel.optimal_concurrency());
        let mut launched = 0;
        while launched < limit
            && state.in_flight < limit
            && !state.eof
            && state.outcome.error().is_none()
        {
            let Some(block) = state.pool.acquire_or_allocate(limit)? else {
                break;
            };
            state.in_flight += 1;
            let session = Arc::clone(&self.session);
            let registered = MutexGuard::unlocked(state, || {
                self.channel.register_read(
                    block,
                    Box::new(move |completion| on_read(&session, completion)),
                )
            });
            if let Err(Rejected { block, error }) = registered {
                state.in_flight -= 1;
                state.pool.release(block);
                return Err(error);
            }
            launched += 1;
        }
        if launched > 0 {
            tracing::trace!("{} reads in flight (limit {})", state.in_flight, limit);
        }
        Ok(launched)
    }
}
