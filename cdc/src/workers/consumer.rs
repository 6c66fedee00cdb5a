use config::shared::ReplicationConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, error, info};

use crate::bail;
use crate::cdc_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::consume::start_consume_loop;
use crate::replication::stream::ReplicationStreamOpener;
use crate::sink::Sink;

/// Handle for waiting on a running [`ConsumerWorker`].
#[derive(Debug)]
pub struct ConsumerWorkerHandle {
    handle: Option<JoinHandle<CdcResult<()>>>,
}

impl ConsumerWorkerHandle {
    /// Waits for the consumer worker to complete.
    ///
    /// A panic of the worker is returned as [`ErrorKind::ConsumerWorkerPanic`].
    pub async fn wait(mut self) -> CdcResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        join_result(handle.await)
    }

    /// Waits up to `timeout` for the consumer worker to complete, then aborts it.
    ///
    /// Returns [`ErrorKind::ShutdownTimeout`] if the worker had to be aborted.
    pub async fn wait_with_timeout(mut self, timeout: Duration) -> CdcResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        wait_or_abort(handle, timeout).await
    }

    /// Waits for the consumer worker to complete on its own, or for up to `timeout` once
    /// shutdown is requested on `shutdown_rx`.
    ///
    /// A worker that stops early, for example because it failed or panicked, is reported right
    /// away. A closed shutdown channel counts as a shutdown request.
    pub async fn wait_with_shutdown_timeout(
        mut self,
        mut shutdown_rx: ShutdownRx,
        timeout: Duration,
    ) -> CdcResult<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        tokio::select! {
            result = &mut handle => return join_result(result),
            _ = shutdown_rx.changed() => {}
        }

        info!("shutdown requested, waiting for consumer worker to stop");

        wait_or_abort(handle, timeout).await
    }
}

fn join_result(result: Result<CdcResult<()>, JoinError>) -> CdcResult<()> {
    result.map_err(|err| {
        if err.is_cancelled() {
            cdc_error!(
                ErrorKind::ConsumerWorkerCancelled,
                "Consumer worker was cancelled",
                err
            )
        } else {
            cdc_error!(ErrorKind::ConsumerWorkerPanic, "Consumer worker panicked", err)
        }
    })?
}

async fn wait_or_abort(mut handle: JoinHandle<CdcResult<()>>, timeout: Duration) -> CdcResult<()> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(result) => join_result(result),
        Err(_) => {
            handle.abort();

            error!(
                "consumer worker did not stop within {:?}, forcing shutdown",
                timeout
            );

            bail!(
                ErrorKind::ShutdownTimeout,
                "Consumer worker did not stop in time",
                format!("The consumer worker was aborted after waiting {timeout:?}")
            );
        }
    }
}

/// Worker running the consume loop on its own task.
#[derive(Debug)]
pub struct ConsumerWorker<O, S> {
    opener: O,
    sink: S,
    config: Arc<ReplicationConfig>,
    shutdown_rx: ShutdownRx,
}

impl<O, S> ConsumerWorker<O, S> {
    pub fn new(opener: O, sink: S, config: Arc<ReplicationConfig>, shutdown_rx: ShutdownRx) -> Self {
        Self {
            opener,
            sink,
            config,
            shutdown_rx,
        }
    }
}

impl<O, S> ConsumerWorker<O, S>
where
    O: ReplicationStreamOpener + 'static,
    S: Sink + Send + Sync + 'static,
{
    /// Spawns the consume loop and returns a handle to wait for it.
    pub fn start(self) -> ConsumerWorkerHandle {
        info!("starting consumer worker");

        let consumer_worker_span = tracing::info_span!(
            "consumer_worker",
            slot_name = %self.config.slot_name,
            schema_name = %self.config.schema_name,
            table_name = %self.config.table_name
        );
        let consumer_worker = async move {
            start_consume_loop(self.opener, self.sink, self.config, self.shutdown_rx).await?;

            info!("consumer worker completed successfully");

            Ok(())
        }
        .instrument(consumer_worker_span.or_current());

        let handle = tokio::spawn(consumer_worker);

        ConsumerWorkerHandle {
            handle: Some(handle),
        }
    }
}
