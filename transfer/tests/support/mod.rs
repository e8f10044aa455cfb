//! Scripted network side for driving transfer sessions in tests.
//!
//! Registered reads and writes are queued and completed in batches by a
//! driver thread, like a server delivering completions from its own event
//! loop. Within a batch, data completions can be shuffled with a seeded
//! generator to imitate parallel data channels. In inline mode every
//! operation completes inside its own registration instead.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use common::Error;
use throttle::Block;
use transfer::{
    DataChannel, ReadCallback, ReadCompletion, Rejected, WriteCallback, WriteCompletion,
    WriteRange,
};

pub const BLOCK_SIZE: usize = 4096;

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 251) as u8).collect()
}

enum Pending {
    Read(Block, ReadCallback),
    Write {
        block: Block,
        length: usize,
        offset: u64,
        on_complete: WriteCallback,
    },
}

#[derive(Default)]
struct Ops {
    pending: Vec<Pending>,
    reads_in_flight: usize,
    writes_in_flight: usize,
    max_reads_in_flight: usize,
    max_writes_in_flight: usize,
    block_ids: HashSet<usize>,
    writes_seen: usize,
    read_registrations: usize,
    write_registrations: usize,
    /// Operations of the same kind in flight right after each registration.
    history: Vec<usize>,
}

#[derive(Default)]
struct Incoming {
    data: Vec<u8>,
    /// File offset of `data[0]`.
    base: u64,
    cursor: usize,
    served: usize,
    /// Explicit `(offset, length)` deliveries; replaces sequential reads.
    script: Option<VecDeque<(u64, usize)>>,
}

#[derive(Default)]
struct Outgoing {
    data: Vec<u8>,
    /// Offsets in the order writes were registered.
    offsets: Vec<u64>,
}

#[derive(Default)]
struct Markers {
    perf_bytes: u64,
    restart: Vec<(u64, u64)>,
    began: usize,
}

pub struct MockChannel {
    block_size: usize,
    concurrency: AtomicUsize,
    fail_writes_from: Option<usize>,
    fail_reads_from: Option<usize>,
    reject_reads_from: Option<usize>,
    reject_writes_from: Option<usize>,
    inline: bool,
    concurrency_change: Option<(usize, usize)>,
    ranges: Mutex<VecDeque<WriteRange>>,
    ops: Mutex<Ops>,
    incoming: Mutex<Incoming>,
    outgoing: Mutex<Outgoing>,
    markers: Mutex<Markers>,
    finished: Mutex<Vec<Result<(), Error>>>,
    finished_changed: Condvar,
}

/// Builder for [`MockChannel`].
pub struct MockBuilder {
    block_size: usize,
    concurrency: usize,
    shuffle: Option<u64>,
    fail_writes_from: Option<usize>,
    fail_reads_from: Option<usize>,
    reject_reads_from: Option<usize>,
    reject_writes_from: Option<usize>,
    inline: bool,
    concurrency_change: Option<(usize, usize)>,
    ranges: VecDeque<WriteRange>,
    incoming: Incoming,
}

impl MockBuilder {
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Shuffle the completions of every batch with a generator seeded by
    /// `seed`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }

    /// Data the client sends, starting at file offset `base`.
    pub fn incoming(mut self, data: Vec<u8>, base: u64) -> Self {
        self.incoming.data = data;
        self.incoming.base = base;
        self
    }

    /// Deliver exactly these `(offset, length)` pieces of the incoming data,
    /// then end of file.
    pub fn script(mut self, deliveries: Vec<(u64, usize)>) -> Self {
        self.incoming.script = Some(deliveries.into());
        self
    }

    /// Ranges returned by successive `write_range` calls before the final
    /// empty one.
    pub fn ranges(mut self, ranges: Vec<WriteRange>) -> Self {
        self.ranges = ranges.into();
        self
    }

    /// Fail the `index`-th write (counting from zero) and every later one.
    pub fn fail_writes_from(mut self, index: usize) -> Self {
        self.fail_writes_from = Some(index);
        self
    }

    /// Complete the `index`-th read (counting from zero) and every later one
    /// with an error.
    pub fn fail_reads_from(mut self, index: usize) -> Self {
        self.fail_reads_from = Some(index);
        self
    }

    /// Refuse to register the `index`-th read and every later one.
    pub fn reject_reads_from(mut self, index: usize) -> Self {
        self.reject_reads_from = Some(index);
        self
    }

    /// Refuse to register the `index`-th write and every later one.
    pub fn reject_writes_from(mut self, index: usize) -> Self {
        self.reject_writes_from = Some(index);
        self
    }

    /// Complete every operation before its registration returns.
    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    /// Recommend `concurrency` from the `registrations`-th registration on.
    pub fn concurrency_after(mut self, registrations: usize, concurrency: usize) -> Self {
        self.concurrency_change = Some((registrations, concurrency));
        self
    }

    pub fn build(self) -> Arc<MockChannel> {
        let channel = Arc::new(MockChannel {
            block_size: self.block_size,
            concurrency: AtomicUsize::new(self.concurrency),
            fail_writes_from: self.fail_writes_from,
            fail_reads_from: self.fail_reads_from,
            reject_reads_from: self.reject_reads_from,
            reject_writes_from: self.reject_writes_from,
            inline: self.inline,
            concurrency_change: self.concurrency_change,
            ranges: Mutex::new(self.ranges),
            ops: Mutex::new(Ops::default()),
            incoming: Mutex::new(self.incoming),
            outgoing: Mutex::new(Outgoing::default()),
            markers: Mutex::new(Markers::default()),
            finished: Mutex::new(Vec::new()),
            finished_changed: Condvar::new(),
        });
        let weak = Arc::downgrade(&channel);
        let rng = self.shuffle.map(StdRng::seed_from_u64);
        std::thread::spawn(move || drive(weak, rng));
        channel
    }
}

fn drive(channel: Weak<MockChannel>, mut rng: Option<StdRng>) {
    loop {
        std::thread::sleep(Duration::from_micros(200));
        let Some(channel) = channel.upgrade() else {
            return;
        };
        channel.complete_batch(rng.as_mut());
    }
}

type Completion<'a> = Box<dyn FnOnce() + 'a>;

impl MockChannel {
    pub fn builder() -> MockBuilder {
        MockBuilder {
            block_size: BLOCK_SIZE,
            concurrency: 4,
            shuffle: None,
            fail_writes_from: None,
            fail_reads_from: None,
            reject_reads_from: None,
            reject_writes_from: None,
            inline: false,
            concurrency_change: None,
            ranges: VecDeque::from([WriteRange::whole()]),
            incoming: Incoming::default(),
        }
    }

    fn complete_batch(&self, rng: Option<&mut StdRng>) {
        let pending = std::mem::take(&mut self.ops.lock().pending);
        if pending.is_empty() {
            return;
        }
        let mut data: Vec<Completion<'_>> = Vec::new();
        let mut eof: Vec<Completion<'_>> = Vec::new();
        for op in pending {
            match op {
                Pending::Read(block, on_complete) => {
                    let (completion, at_eof) = self.serve_read(block);
                    let run: Completion<'_> = Box::new(move || {
                        self.ops.lock().reads_in_flight -= 1;
                        on_complete(completion);
                    });
                    if at_eof {
                        eof.push(run);
                    } else {
                        data.push(run);
                    }
                }
                Pending::Write {
                    block,
                    length,
                    offset,
                    on_complete,
                } => {
                    let completion = self.serve_write(block, length, offset);
                    data.push(Box::new(move || {
                        self.ops.lock().writes_in_flight -= 1;
                        on_complete(completion);
                    }));
                }
            }
        }
        if let Some(rng) = rng {
            data.shuffle(rng);
        }
        for run in data.into_iter().chain(eof) {
            run();
        }
    }

    fn serve_read(&self, mut block: Block) -> (ReadCompletion, bool) {
        let mut incoming = self.incoming.lock();
        let base = incoming.base;
        let index = incoming.served;
        incoming.served += 1;
        if self.fail_reads_from.is_some_and(|from| index >= from) {
            let offset = base + incoming.cursor as u64;
            let completion = ReadCompletion {
                result: Err(Error::Transport("connection reset by peer".to_string())),
                block,
                length: 0,
                offset,
                eof: false,
            };
            return (completion, false);
        }
        let piece = match incoming.script.as_mut() {
            Some(script) => script.pop_front(),
            None => {
                let start = incoming.cursor;
                let length = block.capacity().min(incoming.data.len() - start);
                incoming.cursor += length;
                (length > 0).then_some((base + start as u64, length))
            }
        };
        match piece {
            Some((offset, length)) => {
                let start = (offset - base) as usize;
                block.as_mut_slice()[..length].copy_from_slice(&incoming.data[start..start + length]);
                let completion = ReadCompletion {
                    result: Ok(()),
                    block,
                    length,
                    offset,
                    eof: false,
                };
                (completion, false)
            }
            None => {
                let offset = base + incoming.data.len() as u64;
                let completion = ReadCompletion {
                    result: Ok(()),
                    block,
                    length: 0,
                    offset,
                    eof: true,
                };
                (completion, true)
            }
        }
    }

    fn serve_write(&self, block: Block, length: usize, offset: u64) -> WriteCompletion {
        let index = {
            let mut ops = self.ops.lock();
            let index = ops.writes_seen;
            ops.writes_seen += 1;
            index
        };
        if self.fail_writes_from.is_some_and(|from| index >= from) {
            return WriteCompletion {
                result: Err(Error::Transport("connection reset by peer".to_string())),
                block,
            };
        }
        let mut outgoing = self.outgoing.lock();
        let start = offset as usize;
        if outgoing.data.len() < start + length {
            outgoing.data.resize(start + length, 0);
        }
        outgoing.data[start..start + length].copy_from_slice(&block.as_slice()[..length]);
        WriteCompletion {
            result: Ok(()),
            block,
        }
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        self.concurrency.store(concurrency, Ordering::SeqCst);
    }

    /// Counts a registration and applies a scheduled concurrency change.
    fn registered(&self, ops: &mut Ops, in_flight: usize) {
        ops.history.push(in_flight);
        let registrations = ops.read_registrations + ops.write_registrations;
        if let Some((_, concurrency)) = self
            .concurrency_change
            .filter(|&(after, _)| after == registrations)
        {
            self.set_concurrency(concurrency);
        }
    }

    /// Blocks until `finished_transfer` was called and returns its result.
    pub fn wait_finished(&self) -> Result<(), Error> {
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        let mut finished = self.finished.lock();
        while finished.is_empty() {
            let timed_out = self
                .finished_changed
                .wait_until(&mut finished, deadline)
                .timed_out();
            assert!(!timed_out, "transfer did not finish");
        }
        finished[0].clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Bytes the session wrote to the client, assembled by offset.
    pub fn written(&self) -> Vec<u8> {
        self.outgoing.lock().data.clone()
    }

    pub fn write_offsets(&self) -> Vec<u64> {
        self.outgoing.lock().offsets.clone()
    }

    pub fn max_reads_in_flight(&self) -> usize {
        self.ops.lock().max_reads_in_flight
    }

    pub fn max_writes_in_flight(&self) -> usize {
        self.ops.lock().max_writes_in_flight
    }

    /// Reads (or writes) in flight right after each registration, in order.
    pub fn in_flight_history(&self) -> Vec<usize> {
        self.ops.lock().history.clone()
    }

    /// Number of distinct blocks the session ever handed over.
    pub fn distinct_blocks(&self) -> usize {
        self.ops.lock().block_ids.len()
    }

    pub fn restart_markers(&self) -> Vec<(u64, u64)> {
        self.markers.lock().restart.clone()
    }

    pub fn perf_bytes(&self) -> u64 {
        self.markers.lock().perf_bytes
    }

    pub fn began(&self) -> usize {
        self.markers.lock().began
    }
}

impl DataChannel for MockChannel {
    fn begin_transfer(&self) {
        self.markers.lock().began += 1;
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn optimal_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    fn register_read(&self, block: Block, on_complete: ReadCallback) -> Result<(), Rejected> {
        let mut ops = self.ops.lock();
        if self
            .reject_reads_from
            .is_some_and(|from| ops.read_registrations >= from)
        {
            return Err(Rejected {
                block,
                error: Error::Transport("data channel closed".to_string()),
            });
        }
        ops.read_registrations += 1;
        ops.reads_in_flight += 1;
        ops.max_reads_in_flight = ops.max_reads_in_flight.max(ops.reads_in_flight);
        ops.block_ids.insert(block.id());
        let in_flight = ops.reads_in_flight;
        self.registered(&mut ops, in_flight);
        if !self.inline {
            ops.pending.push(Pending::Read(block, on_complete));
            return Ok(());
        }
        drop(ops);
        let (completion, _) = self.serve_read(block);
        self.ops.lock().reads_in_flight -= 1;
        on_complete(completion);
        Ok(())
    }

    fn register_write(
        &self,
        block: Block,
        length: usize,
        offset: u64,
        on_complete: WriteCallback,
    ) -> Result<(), Rejected> {
        let mut ops = self.ops.lock();
        if self
            .reject_writes_from
            .is_some_and(|from| ops.write_registrations >= from)
        {
            return Err(Rejected {
                block,
                error: Error::Transport("data channel closed".to_string()),
            });
        }
        ops.write_registrations += 1;
        ops.writes_in_flight += 1;
        ops.max_writes_in_flight = ops.max_writes_in_flight.max(ops.writes_in_flight);
        ops.block_ids.insert(block.id());
        let in_flight = ops.writes_in_flight;
        self.registered(&mut ops, in_flight);
        drop(ops);
        self.outgoing.lock().offsets.push(offset);
        if !self.inline {
            self.ops.lock().pending.push(Pending::Write {
                block,
                length,
                offset,
                on_complete,
            });
            return Ok(());
        }
        let completion = self.serve_write(block, length, offset);
        self.ops.lock().writes_in_flight -= 1;
        on_complete(completion);
        Ok(())
    }

    fn write_range(&self) -> WriteRange {
        self.ranges.lock().pop_front().unwrap_or(WriteRange {
            offset: 0,
            length: Some(0),
        })
    }

    fn update_perf_markers(&self, _offset: u64, length: u64) {
        self.markers.lock().perf_bytes += length;
    }

    fn update_restart_markers(&self, offset: u64, length: u64) {
        self.markers.lock().restart.push((offset, length));
    }

    fn finished_transfer(&self, result: Result<(), Error>) {
        self.finished.lock().push(result);
        self.finished_changed.notify_all();
    }
}
