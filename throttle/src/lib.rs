//! Buffer pooling and concurrency throttling for transfer sessions
//!
//! Every transfer session moves data through fixed-size blocks that are loaned
//! to the network side for the duration of one asynchronous read or write.
//! This crate provides the two pieces that bound that traffic:
//!
//! 1. **[`BufferPool`]** - recycles [`Block`]s between a free set and whatever
//!    the caller currently has on loan, growing lazily up to a limit
//! 2. **[`ConcurrencyThrottle`]** - tracks the network side's recommended number
//!    of simultaneous block operations and hands out that limit
//!
//! # Usage
//!
//! ```rust
//! use throttle::{BufferPool, ConcurrencyThrottle};
//!
//! # fn main() -> Result<(), common::Error> {
//! let mut pool = BufferPool::new(64 * 1024);
//! let mut throttle = ConcurrencyThrottle::new(100);
//!
//! // the closure is consulted on the first check and every 100th after that
//! let limit = throttle.check(|| 4);
//! while let Some(block) = pool.acquire_or_allocate(limit)? {
//!     // hand the block to an asynchronous operation ...
//!     # drop(block);
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Limits
//!
//! The limit caps both how many blocks a pool will ever allocate and how many
//! asynchronous requests a session keeps outstanding. A recommendation that
//! drops below the current pool size stops further growth but never frees
//! blocks already allocated.
//!
//! # Thread Safety
//!
//! Neither type locks internally. A session keeps both inside the state it
//! guards with its own mutex, so every check and every acquisition happens
//! under that lock.

mod pool;

pub use pool::{Block, BufferPool};

/// Number of throttle checks between two concurrency queries unless configured
/// otherwise.
pub const DEFAULT_RECHECK_INTERVAL: u32 = 100;

#[derive(Debug)]
pub struct ConcurrencyThrottle {
    interval: u32,
    checks: u32,
    optimal: usize,
}

impl ConcurrencyThrottle {
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
            checks: 0,
            optimal: 1,
        }
    }

    /// Returns the current limit, asking `recommend` for a fresh value on the
    /// first call and then once every `interval` calls.
    ///
    /// A recommendation of zero is treated as one so a session can always make
    /// progress.
    pub fn check(&mut self, recommend: impl FnOnce() -> usize) -> usize {
        if self.checks == 0 {
            let optimal = recommend().max(1);
            if optimal != self.optimal {
                tracing::debug!(
                    "optimal concurrency changed: {} -> {}",
                    self.optimal,
                    optimal
                );
            }
            self.optimal = optimal;
        }
        self.checks += 1;
        if self.checks >= self.interval {
            self.checks = 0;
        }
        self.optimal
    }

    /// The limit as of the last check.
    pub fn limit(&self) -> usize {
        self.optimal
    }
}

impl Default for ConcurrencyThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_RECHECK_INTERVAL)
    }
}
