//! Download engine: bulk storage to network.
//!
//! The worker pulls each chunk of an in-order GET job through the backend's
//! synchronous callback. Every callback invocation is cut into block-sized
//! pieces, each copied into a pooled block and handed to the network side as
//! an asynchronous write. The worker only waits when the pool is exhausted;
//! write completions return blocks and wake it.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::instrument;

use bulk::{BulkStorage, jobs};
use common::Error;
use throttle::{BufferPool, ConcurrencyThrottle};

use crate::network::{DataChannel, Rejected, WriteCompletion};
use crate::session::{Monitor, Outcome, Tuning};

#[derive(Debug)]
struct State {
    pool: BufferPool,
    throttle: ConcurrencyThrottle,
    outcome: Outcome,
    /// File offset of the next byte handed to the network side.
    offset: u64,
}

pub(crate) struct Retrieve {
    backend: Arc<dyn BulkStorage>,
    channel: Arc<dyn DataChannel>,
    bucket: String,
    object: String,
    session: Arc<Monitor<State>>,
}

fn on_write(session: &Monitor<State>, completion: WriteCompletion) {
    let WriteCompletion { result, block } = completion;
    session.update(|state| {
        if let Err(error) = result {
            tracing::warn!("write of block {} failed: {}", block.id(), error);
            state.outcome.fail(error);
        }
        state.pool.release(block);
    });
}

impl Retrieve {
    pub(crate) fn new(
        backend: Arc<dyn BulkStorage>,
        channel: Arc<dyn DataChannel>,
        bucket: String,
        object: String,
        tuning: Tuning,
    ) -> Self {
        let state = State {
            pool: BufferPool::new(tuning.block_size),
            throttle: ConcurrencyThrottle::new(tuning.recheck_interval),
            outcome: Outcome::default(),
            offset: 0,
        };
        Self {
            backend,
            channel,
            bucket,
            object,
            session: Arc::new(Monitor::new(state)),
        }
    }

    /// Streams every requested range and waits for all writes to complete.
    #[instrument(skip(self), fields(bucket = %self.bucket, object = %self.object))]
    pub(crate) fn run(self) -> Result<(), Error> {
        self.channel.begin_transfer();
        let streamed = self.stream_ranges();
        let mut state = self.session.lock();
        if let Err(error) = streamed {
            state.outcome.fail(error);
        }
        while !state.pool.is_idle() {
            self.session.wait(&mut state);
        }
        state.outcome.succeed();
        tracing::debug!(
            "drained {} blocks, sent up to offset {}",
            state.pool.allocated(),
            state.offset
        );
        state.outcome.check()
    }

    fn stream_ranges(&self) -> Result<(), Error> {
        loop {
            let range = self.channel.write_range();
            let length = match range.length {
                Some(0) => return Ok(()),
                Some(length) => length,
                None => self
                    .backend
                    .stat(&self.bucket, &self.object)?
                    .size
                    .saturating_sub(range.offset),
            };
            tracing::debug!("serving {} bytes at offset {}", length, range.offset);
            if length > 0 {
                self.stream_range(range.offset, length)?;
            }
            if range.is_open_ended() {
                return Ok(());
            }
        }
    }

    fn stream_range(&self, offset: u64, length: u64) -> Result<(), Error> {
        let backend = self.backend.as_ref();
        let job = jobs::create_get_job(backend, &self.bucket, &self.object, offset, length)?;
        for chunk in job.chunks_from(offset) {
            let target = chunk.single_object()?;
            tracing::debug!(
                "chunk {}: {} bytes at offset {}",
                chunk.id,
                target.length,
                target.offset
            );
            self.session.lock().offset = target.offset;
            backend.get_object_for_job(
                &job.bucket,
                &target.name,
                target.offset,
                &job.id,
                &mut |data: &[u8]| self.deliver(data),
            )?;
            common::get_progress().chunks_retrieved.inc();
        }
        Ok(())
    }

    /// Backend callback: queues `data` for the network side block by block.
    fn deliver(&self, data: &[u8]) -> Result<(), Error> {
        let mut state = self.session.lock();
        let block_size = state.pool.block_size();
        for piece in data.chunks(block_size) {
            let limit = state
                .throttle
                .check(|| self.channel.optimal_concurrency());
            let mut block = loop {
                state.outcome.check()?;
                if state.pool.loaned() < limit {
                    match state.pool.acquire_or_allocate(limit) {
                        Ok(Some(block)) => break block,
                        Ok(None) => {}
                        Err(error) => {
                            state.outcome.fail(error.clone());
                            return Err(error);
                        }
                    }
                }
                self.session.wait(&mut state);
            };
            let length = piece.len();
            block.as_mut_slice()[..length].copy_from_slice(piece);
            let offset = state.offset;
            state.offset += length as u64;
            tracing::trace!("writing block {}: {} bytes at {}", block.id(), length, offset);
            let session = Arc::clone(&self.session);
            let registered = MutexGuard::unlocked(&mut state, || -> Result<(), Rejected> {
                self.channel.register_write(
                    block,
                    length,
                    offset,
                    Box::new(move |completion| on_write(&session, completion)),
                )?;
                self.channel.update_perf_markers(offset, length as u64);
                Ok(())
            });
            if let Err(Rejected { block, error }) = registered {
                state.pool.release(block);
                state.outcome.fail(error.clone());
                return Err(error);
            }
            common::get_progress().bytes_retrieved.add(length as u64);
        }
        Ok(())
    }
}
