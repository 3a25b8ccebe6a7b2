//! The tap engine: N sources fanned into one message stream.
//!
//! ```text
//! TapConfiguration #0 ──▶ TapSource ──┐
//! TapConfiguration #1 ──▶ TapSource ──┼──▶ merge channel ──▶ handler
//! TapConfiguration #2 ──▶ TapSource ──┘
//!                            │
//!                            └──(permanent failure)──▶ failure channel
//! ```
//!
//! Every source runs in its own task under one cancellation token. The
//! merge channel is bounded; a source that finds it full waits up to the
//! send timeout and then drops the message (see [`TapEngineBuilder::send_timeout`]).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use amqptap_types::{TapConfiguration, TapMessage};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::broker::BrokerConnector;
use crate::error::{Result, SourceFailure, TapError};
use crate::policy::ReconnectPolicy;
use crate::source::{SourceSettings, TapSource};
use crate::stats::TapStats;
use crate::tls::TlsConfig;

const DEFAULT_BUFFER: usize = 1024;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a set of taps against brokers reachable through `C`.
pub struct TapEngine<C: BrokerConnector> {
    connector: Arc<C>,
    settings: SourceSettings,
    buffer: usize,
    shutdown_timeout: Duration,
}

impl<C: BrokerConnector> fmt::Debug for TapEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapEngine")
            .field("settings", &self.settings)
            .field("buffer", &self.buffer)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl<C: BrokerConnector> TapEngine<C> {
    /// Engine with default settings.
    pub fn new(connector: C) -> Self {
        Self::builder(connector).build()
    }

    /// Create a builder for configuring the engine.
    pub fn builder(connector: C) -> TapEngineBuilder<C> {
        TapEngineBuilder::new(connector)
    }

    /// Validate `configs` and the TLS material, then spawn one source per
    /// entry.
    ///
    /// Nothing is spawned if any configuration is invalid, the TLS material
    /// is malformed or the list is empty. The sources run until `cancel` fires, until
    /// [`TapHandle::shutdown`] is called, or until they fail for good. Must be
    /// called from within a tokio runtime.
    pub fn start(
        &self,
        configs: Vec<TapConfiguration>,
        cancel: CancellationToken,
    ) -> Result<TapHandle> {
        if configs.is_empty() {
            return Err(TapError::Configuration("no tap configurations given".into()));
        }
        for (index, config) in configs.iter().enumerate() {
            config
                .validate()
                .map_err(|e| TapError::Configuration(format!("tap #{index}: {e}")))?;
        }
        self.settings.tls.validate()?;

        let cancel = cancel.child_token();
        let (message_tx, messages) = mpsc::channel(self.buffer);
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let stats = Arc::new(TapStats::default());
        let mut tasks = JoinSet::new();
        let source_count = configs.len();

        for (index, config) in configs.into_iter().enumerate() {
            let uri = config.redacted_uri();
            let source_stats = stats.register_source(index, &uri);
            debug!(source = index, uri = %uri, config = %config, "spawning tap source");

            let source = TapSource::new(
                index,
                config,
                self.connector.clone(),
                message_tx.clone(),
                self.settings.clone(),
                source_stats,
            );
            let failure_tx = failure_tx.clone();
            let token = cancel.clone();
            tasks.spawn(async move {
                if let Err(error) = source.run(token).await {
                    let _ = failure_tx.send(SourceFailure { index, uri, error });
                }
            });
        }

        info!(sources = source_count, "tap engine started");

        Ok(TapHandle {
            messages,
            failures,
            stats,
            tasks,
            source_count,
            shutdown_timeout: self.shutdown_timeout,
            _guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    /// Run taps and hand every message to `handler` until cancelled.
    ///
    /// Handler errors are logged and the message is discarded. Returns
    /// `Ok(())` once `cancel` fires and every source has stopped, and
    /// [`TapError::AllSourcesFailed`] when every source failed permanently.
    /// Messages still buffered at cancellation are not handed out.
    ///
    /// Sources that fail while others keep running are only logged here.
    /// Use [`start`](Self::start) and [`TapHandle::failures`] to observe
    /// them as values.
    pub async fn run<F, E>(
        &self,
        configs: Vec<TapConfiguration>,
        cancel: CancellationToken,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(TapMessage) -> std::result::Result<(), E>,
        E: fmt::Display,
    {
        let mut handle = self.start(configs, cancel)?;
        let token = handle.cancellation_token();
        let mut failed = Vec::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                Some(failure) = handle.failures.recv() => {
                    warn!(failure = %failure, "tap source stopped");
                    failed.push(failure);
                    if failed.len() == handle.source_count {
                        break Err(TapError::AllSourcesFailed(std::mem::take(&mut failed)));
                    }
                }
                message = handle.messages.recv() => match message {
                    Some(message) => {
                        if let Err(err) = handler(message) {
                            warn!(error = %err, "message handler failed");
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        let source_count = handle.source_count;
        for failure in handle.shutdown().await {
            warn!(failure = %failure, "tap source stopped");
            failed.push(failure);
        }
        if outcome.is_ok() && !failed.is_empty() {
            warn!(
                failed = failed.len(),
                sources = source_count,
                "tap run cancelled with failed sources"
            );
        }
        outcome
    }
}

/// Builder for configuring a [`TapEngine`].
#[derive(Debug)]
pub struct TapEngineBuilder<C> {
    connector: C,
    policy: Option<ReconnectPolicy>,
    tls: Option<TlsConfig>,
    buffer: Option<usize>,
    send_timeout: Option<Duration>,
    close_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
}

impl<C: BrokerConnector> TapEngineBuilder<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            policy: None,
            tls: None,
            buffer: None,
            send_timeout: None,
            close_timeout: None,
            shutdown_timeout: None,
        }
    }

    /// Set the reconnect policy shared by all sources.
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the TLS material applied to every `amqps://` connection.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Capacity of the merge channel.
    ///
    /// Defaults to 1024. A capacity of 0 is raised to 1.
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.buffer = Some(capacity.max(1));
        self
    }

    /// How long a source waits on a full merge channel before dropping the
    /// message. Defaults to 5 seconds.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Upper bound for closing one broker connection. Defaults to 2 seconds.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    /// How long shutdown waits for sources before aborting them.
    ///
    /// Defaults to 5 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Build the engine.
    pub fn build(self) -> TapEngine<C> {
        let defaults = SourceSettings::default();
        TapEngine {
            connector: Arc::new(self.connector),
            settings: SourceSettings {
                tls: self.tls.map(Arc::new).unwrap_or(defaults.tls),
                policy: self.policy.unwrap_or(defaults.policy),
                send_timeout: self.send_timeout.unwrap_or(defaults.send_timeout),
                close_timeout: self.close_timeout.unwrap_or(defaults.close_timeout),
            },
            buffer: self.buffer.unwrap_or(DEFAULT_BUFFER),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }
}

/// Handle to a running set of taps.
///
/// Dropping the handle stops the sources without cancelling the caller's
/// token. Use [`shutdown`](Self::shutdown) to also wait for them.
#[derive(Debug)]
pub struct TapHandle {
    messages: mpsc::Receiver<TapMessage>,
    failures: mpsc::UnboundedReceiver<SourceFailure>,
    stats: Arc<TapStats>,
    tasks: JoinSet<()>,
    source_count: usize,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl TapHandle {
    /// Receive the next message from any source.
    ///
    /// Returns `None` once every source has stopped and the buffer is empty.
    pub async fn recv(&mut self) -> Option<TapMessage> {
        self.messages.recv().await
    }

    /// The merged message receiver.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<TapMessage> {
        &mut self.messages
    }

    /// Receiver of permanent source failures, one entry per failed source.
    pub fn failures(&mut self) -> &mut mpsc::UnboundedReceiver<SourceFailure> {
        &mut self.failures
    }

    /// Live counters of every source.
    pub fn stats(&self) -> &Arc<TapStats> {
        &self.stats
    }

    /// Number of configured sources.
    pub fn source_count(&self) -> usize {
        self.source_count
    }

    /// Token that stops this run. Child of the token given to `start`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask every source to stop without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop every source and wait for them to finish.
    ///
    /// Returns the failures not yet taken from [`failures`](Self::failures).
    pub async fn shutdown(mut self) -> Vec<SourceFailure> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for every source to finish.
    ///
    /// Sources run until cancelled or failed; once the token fires they get
    /// the shutdown timeout to close their connections and are aborted
    /// after that. Returns the failures not yet taken from
    /// [`failures`](Self::failures).
    pub async fn join(&mut self) -> Vec<SourceFailure> {
        loop {
            tokio::select! {
                next = self.tasks.join_next() => match next {
                    Some(result) => log_join(result),
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }

        let tasks = &mut self.tasks;
        let graceful = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join(result);
            }
        })
        .await;

        if graceful.is_err() {
            warn!(
                remaining = self.tasks.len(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "aborting tap sources that did not stop in time"
            );
            self.tasks.shutdown().await;
        }

        let mut failures = Vec::new();
        while let Ok(failure) = self.failures.try_recv() {
            failures.push(failure);
        }
        failures
    }
}

fn log_join(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = %err, "tap source panicked");
        }
    }
}
