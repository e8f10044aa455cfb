use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct TlsCounter {
    // each thread only ever bumps its own slot, readers sum them up
    count: thread_local::ThreadLocal<AtomicU64>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        self.count
            .get_or(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .fold(0, |x, y| x + y.load(Ordering::Relaxed))
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide transfer statistics.
#[derive(Debug)]
pub struct Progress {
    pub sessions: ProgressCounter,
    pub sessions_failed: TlsCounter,
    pub bytes_stored: TlsCounter,
    pub bytes_retrieved: TlsCounter,
    pub chunks_stored: TlsCounter,
    pub chunks_retrieved: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            sessions: Default::default(),
            sessions_failed: Default::default(),
            bytes_stored: Default::default(),
            bytes_retrieved: Default::default(),
            chunks_stored: Default::default(),
            chunks_retrieved: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let sessions = self.sessions.get();
        let secs = self.get_duration().as_secs_f64().max(f64::EPSILON);
        let stored = self.bytes_stored.get();
        let retrieved = self.bytes_retrieved.get();
        write!(
            f,
            "sessions: {} active, {} finished, {} failed\n\
            stored:    {:>10} in {} chunks ({}/s)\n\
            retrieved: {:>10} in {} chunks ({}/s)",
            sessions.started - sessions.finished,
            sessions.finished,
            self.sessions_failed.get(),
            bytesize::ByteSize(stored),
            self.chunks_stored.get(),
            bytesize::ByteSize((stored as f64 / secs) as u64),
            bytesize::ByteSize(retrieved),
            self.chunks_retrieved.get(),
            bytesize::ByteSize((retrieved as f64 / secs) as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn guard_counts_sessions() -> Result<()> {
        let progress = Progress::new();
        {
            let _guard = progress.sessions.guard();
            assert_eq!(progress.sessions.get().started, 1);
            assert_eq!(progress.sessions.get().finished, 0);
        }
        assert_eq!(progress.sessions.get().finished, 1);
        Ok(())
    }

    #[test]
    fn summary_mentions_bytes() -> Result<()> {
        let progress = Progress::new();
        progress.bytes_stored.add(4096);
        progress.chunks_stored.inc();
        let summary = progress.to_string();
        assert!(summary.contains("1 chunks"));
        assert!(summary.starts_with("sessions: 0 active"));
        Ok(())
    }
}
