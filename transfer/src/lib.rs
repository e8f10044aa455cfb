//! Streaming engine between a network transfer server and bulk object storage
//!
//! A download ([`retrieve`]) pulls chunks of an object from a [`BulkStorage`]
//! backend and pipelines them to the server as asynchronous block writes. An
//! upload ([`store`]) keeps asynchronous block reads outstanding against the
//! server and feeds the received bytes, in file order, to the backend's
//! synchronous upload callback.
//!
//! # Sessions
//!
//! Each call starts one session. The request is checked and the pathname split
//! right away; a rejected request is reported through
//! [`DataChannel::finished_transfer`] before the call returns. Otherwise the
//! session runs on a blocking worker of the current tokio runtime, since every
//! backend call blocks. Completion callbacks from the server update the
//! session under its lock and wake the worker.
//!
//! The result is reported exactly once, through `finished_transfer`, after all
//! blocks loaned to the server have come back. The first error recorded by a
//! session wins.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     backend: Arc<dyn bulk::BulkStorage>,
//! #     channel: Arc<dyn transfer::DataChannel>,
//! # ) -> Result<(), common::Error> {
//! let config = common::config::TransferConfig::default();
//! let request = transfer::TransferRequest::new("/bucket/path/to/object");
//! let task = transfer::retrieve(backend, channel, &request, &config);
//! task.join().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::instrument;

use bulk::{BulkStorage, Residency};
use common::Error;
use common::config::TransferConfig;

pub mod network;
pub mod request;
mod retr;
pub mod session;
mod stor;

pub use network::{
    DataChannel, ReadCallback, ReadCompletion, Rejected, WriteCallback, WriteCompletion,
    WriteRange,
};
pub use request::{Direction, TransferRequest};

/// Handle on a launched session.
///
/// Dropping it detaches the worker; the session still runs to completion.
#[derive(Debug)]
pub struct TransferTask {
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl TransferTask {
    fn rejected() -> Self {
        Self { worker: None }
    }

    /// Whether a worker was started. Rejected requests never start one.
    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Waits for the worker to finish tearing the session down.
    pub async fn join(self) -> Result<(), Error> {
        match self.worker {
            Some(worker) => worker
                .await
                .map_err(|error| Error::Resource(format!("transfer worker failed: {error}"))),
            None => Ok(()),
        }
    }
}

fn tuning(channel: &dyn DataChannel, config: &TransferConfig) -> Result<session::Tuning, Error> {
    let block_size = config.block_size.unwrap_or_else(|| channel.block_size());
    if block_size == 0 {
        return Err(Error::Resource("block size must be positive".to_string()));
    }
    Ok(session::Tuning {
        block_size,
        recheck_interval: config.concurrency_recheck_interval,
    })
}

fn reject(channel: &dyn DataChannel, error: Error) -> TransferTask {
    tracing::error!("transfer rejected: {}", error);
    channel.finished_transfer(Err(error));
    TransferTask::rejected()
}

fn launch<F>(channel: Arc<dyn DataChannel>, session: F) -> TransferTask
where
    F: FnOnce() -> Result<(), Error> + Send + 'static,
{
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(error) => {
            return reject(
                channel.as_ref(),
                Error::Resource(format!("no runtime to run the transfer on: {error}")),
            );
        }
    };
    let span = tracing::Span::current();
    let worker = runtime.spawn_blocking(move || {
        let _entered = span.enter();
        let progress = common::get_progress();
        let _session = progress.sessions.guard();
        let result = session();
        match &result {
            Ok(()) => tracing::info!("transfer finished"),
            Err(error) => {
                progress.sessions_failed.inc();
                tracing::error!("transfer failed: {}", error);
            }
        }
        channel.finished_transfer(result);
    });
    TransferTask {
        worker: Some(worker),
    }
}

/// Sends the object named by the request to the server.
#[instrument(skip_all, fields(path = %request.pathname))]
pub fn retrieve(
    backend: Arc<dyn BulkStorage>,
    channel: Arc<dyn DataChannel>,
    request: &TransferRequest,
    config: &TransferConfig,
) -> TransferTask {
    let prepared = request.check(Direction::Retrieve).and_then(|()| {
        let (bucket, object) = common::path::split(&request.pathname)?
            .require_object("Can only retrieve objects from within buckets")?;
        Ok((bucket, object, tuning(channel.as_ref(), config)?))
    });
    let (bucket, object, tuning) = match prepared {
        Ok(prepared) => prepared,
        Err(error) => return reject(channel.as_ref(), error),
    };
    tracing::info!("retrieving /{}/{}", bucket, object);
    let engine = retr::Retrieve::new(backend, Arc::clone(&channel), bucket, object, tuning);
    launch(channel, move || engine.run())
}

/// Stores the data the server receives as the object named by the request.
///
/// The upload resumes at the offset of the server's write range, which must
/// match the completed bytes of an open upload job for the same object.
#[instrument(skip_all, fields(path = %request.pathname))]
pub fn store(
    backend: Arc<dyn BulkStorage>,
    channel: Arc<dyn DataChannel>,
    request: &TransferRequest,
    config: &TransferConfig,
) -> TransferTask {
    let prepared = request.check(Direction::Store).and_then(|()| {
        let (bucket, object) = common::path::split(&request.pathname)?
            .require_object("Can not store objects outside of a bucket")?;
        Ok((bucket, object, tuning(channel.as_ref(), config)?))
    });
    let (bucket, object, tuning) = match prepared {
        Ok(prepared) => prepared,
        Err(error) => return reject(channel.as_ref(), error),
    };
    tracing::info!(
        "storing /{}/{} ({} bytes)",
        bucket,
        object,
        request.alloc_size
    );
    let engine = stor::Store::new(
        backend,
        Arc::clone(&channel),
        bucket,
        object,
        request.alloc_size,
        request.truncate,
        tuning,
    );
    launch(channel, move || engine.run())
}

/// Asks the backend to recall the object named by `pathname` from the archive
/// tier and waits up to `timeout` for it, polling at the configured
/// `stage_poll_interval`.
#[instrument(skip(backend, config))]
pub fn stage(
    backend: &dyn BulkStorage,
    pathname: &str,
    timeout: std::time::Duration,
    config: &TransferConfig,
) -> Result<Residency, Error> {
    let (bucket, object) = common::path::split(pathname)?
        .require_object("Can only retrieve objects from within buckets")?;
    bulk::stage_object(
        backend,
        &bucket,
        &object,
        timeout,
        config.stage_poll_interval,
    )
}
