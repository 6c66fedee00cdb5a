use config::shared::ReplicationConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::CdcResult;
use crate::replication::stream::ReplicationStreamOpener;
use crate::sink::Sink;
use crate::workers::consumer::{ConsumerWorker, ConsumerWorkerHandle};

/// Time the consumer gets to stop on its own after shutdown was requested.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum PipelineState<O, S> {
    NotStarted { opener: O, sink: S },
    Started { consumer_worker: ConsumerWorkerHandle },
    Finished,
}

/// Consumes inserts of one table from a replication slot and publishes them to a sink.
#[derive(Debug)]
pub struct Pipeline<O, S> {
    config: Arc<ReplicationConfig>,
    state: PipelineState<O, S>,
    shutdown_tx: ShutdownTx,
    // Kept so a shutdown requested before `start` still reaches the worker.
    shutdown_rx: ShutdownRx,
    shutdown_timeout: Duration,
}

impl<O, S> Pipeline<O, S>
where
    O: ReplicationStreamOpener + 'static,
    S: Sink + Send + Sync + 'static,
{
    pub fn new(opener: O, sink: S, config: Arc<ReplicationConfig>) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Self {
            config,
            state: PipelineState::NotStarted { opener, sink },
            shutdown_tx,
            shutdown_rx,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    /// Overrides how long [`Pipeline::shutdown_and_wait`] waits before aborting the consumer.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Returns a transmitter that can request shutdown from elsewhere, for example a signal
    /// handler.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Starts the consumer worker. Calling it again has no effect.
    pub fn start(&mut self) {
        let (opener, sink) = match std::mem::replace(&mut self.state, PipelineState::Finished) {
            PipelineState::NotStarted { opener, sink } => (opener, sink),
            state => {
                info!("pipeline was already started");
                self.state = state;

                return;
            }
        };

        info!(
            slot_name = %self.config.slot_name,
            schema_name = %self.config.schema_name,
            table_name = %self.config.table_name,
            sink = S::name(),
            "starting pipeline"
        );

        let consumer_worker = ConsumerWorker::new(
            opener,
            sink,
            self.config.clone(),
            self.shutdown_rx.clone(),
        )
        .start();

        self.state = PipelineState::Started { consumer_worker };
    }

    /// Waits for the consumer worker to stop, without a time limit.
    pub async fn wait(self) -> CdcResult<()> {
        let PipelineState::Started { consumer_worker } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        info!("waiting for consumer worker to complete");

        consumer_worker.wait().await
    }

    /// Waits for the consumer worker to stop, bounding the wait by the shutdown timeout once a
    /// shutdown is requested through [`Pipeline::shutdown_tx`].
    ///
    /// A worker that stops on its own, for example because a sink panicked, is reported right away
    /// instead of waiting for a shutdown that would never come.
    pub async fn wait_with_shutdown_timeout(self) -> CdcResult<()> {
        let PipelineState::Started { consumer_worker } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        info!("waiting for consumer worker to complete");

        consumer_worker
            .wait_with_shutdown_timeout(self.shutdown_rx.clone(), self.shutdown_timeout)
            .await
    }

    /// Requests the consumer worker to stop after its current step.
    pub fn shutdown(&self) {
        info!("trying to shut down the pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
            return;
        }

        info!("shut down signal successfully sent to the consumer worker");
    }

    /// Requests shutdown and waits up to the shutdown timeout for the consumer to stop.
    ///
    /// If the consumer is still running after the timeout, it is aborted and
    /// [`crate::error::ErrorKind::ShutdownTimeout`] is returned.
    pub async fn shutdown_and_wait(self) -> CdcResult<()> {
        self.shutdown();

        let PipelineState::Started { consumer_worker } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        consumer_worker
            .wait_with_timeout(self.shutdown_timeout)
            .await
    }
}
