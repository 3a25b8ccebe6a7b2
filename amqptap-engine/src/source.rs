//! One tap source: a broker session that keeps itself alive.
//!
//! A [`TapSource`] owns the connection for a single [`TapConfiguration`]. It
//! normalizes deliveries into [`TapMessage`]s, forwards them on the shared
//! merge channel, and reconnects according to its [`ReconnectPolicy`] when
//! the session is lost. Only one session per source exists at any time.

use std::sync::Arc;
use std::time::Duration;

use amqptap_types::{TapConfiguration, TapMessage};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{close_quietly, establish, BrokerConnector, DeliveryStream};
use crate::error::{Result, TapError};
use crate::policy::ReconnectPolicy;
use crate::session::{SessionState, TapSession};
use crate::stats::SourceStats;
use crate::tls::TlsConfig;

/// Settings shared by every source of an engine.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub tls: Arc<TlsConfig>,
    pub policy: ReconnectPolicy,
    /// How long a send may wait on a full merge channel before the message
    /// is dropped.
    pub send_timeout: Duration,
    /// Upper bound for closing a broker connection.
    pub close_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            tls: Arc::new(TlsConfig::default()),
            policy: ReconnectPolicy::default(),
            send_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// How a consume phase ended.
enum ConsumeEnd {
    /// Cancelled, or nobody reads the merge channel anymore.
    Stopped,
    /// The session broke and may be re-established.
    Lost(TapError),
}

/// What happened to a message handed to the merge channel.
enum Forwarded {
    Sent,
    Dropped,
    Stopped,
}

/// A self-healing tap on one broker.
pub struct TapSource<C: BrokerConnector> {
    index: usize,
    config: TapConfiguration,
    source_uri: String,
    connector: Arc<C>,
    sender: mpsc::Sender<TapMessage>,
    settings: SourceSettings,
    stats: Arc<SourceStats>,
}

impl<C: BrokerConnector> std::fmt::Debug for TapSource<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapSource")
            .field("index", &self.index)
            .field("uri", &self.source_uri)
            .field("bindings", &self.config.bindings())
            .finish_non_exhaustive()
    }
}

impl<C: BrokerConnector> TapSource<C> {
    pub fn new(
        index: usize,
        config: TapConfiguration,
        connector: Arc<C>,
        sender: mpsc::Sender<TapMessage>,
        settings: SourceSettings,
        stats: Arc<SourceStats>,
    ) -> Self {
        let source_uri = config.redacted_uri();
        Self {
            index,
            config,
            source_uri,
            connector,
            sender,
            settings,
            stats,
        }
    }

    /// Run until cancelled or until the source fails for good.
    ///
    /// Returns `Ok(())` on cancellation. Returns the error when setup fails
    /// permanently or the reconnect policy gives up. Either way the session
    /// ends `Closed` with its connection closed.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut session = TapSession::new();
        let result = self.drive(&mut session, &cancel).await;

        session.close();
        self.stats.set_state(SessionState::Closed);
        match &result {
            Ok(()) => debug!(source = self.index, uri = %self.source_uri, "tap stopped"),
            Err(err) => error!(
                source = self.index,
                uri = %self.source_uri,
                error = %err,
                "tap failed permanently"
            ),
        }
        result
    }

    async fn drive(&self, session: &mut TapSession, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.enter(session, SessionState::Connecting);

            let attempt = establish(
                self.connector.as_ref(),
                &self.config,
                &self.settings.tls,
                cancel,
                self.settings.close_timeout,
            )
            .await;

            let error = match attempt {
                Ok(None) => return Ok(()),
                Ok(Some(broker)) if cancel.is_cancelled() => {
                    close_quietly(&broker.connection, self.settings.close_timeout).await;
                    return Ok(());
                }
                Ok(Some(mut broker)) => {
                    self.enter(session, SessionState::Consuming);
                    info!(
                        source = self.index,
                        uri = %self.source_uri,
                        queue = %broker.queue,
                        bindings = self.config.bindings().len(),
                        "tap consuming"
                    );

                    let end = self.consume(&mut broker.deliveries, cancel).await;
                    close_quietly(&broker.connection, self.settings.close_timeout).await;
                    match end {
                        ConsumeEnd::Stopped => return Ok(()),
                        ConsumeEnd::Lost(err) => err,
                    }
                }
                Err(err) => err,
            };

            if !self.settings.policy.should_retry(&error) {
                return Err(error);
            }

            let retry = session.record_failure();
            if !self.settings.policy.allows(retry) {
                warn!(
                    source = self.index,
                    uri = %self.source_uri,
                    retry,
                    "reconnect attempts exhausted"
                );
                return Err(error);
            }

            self.enter(session, SessionState::Reconnecting);
            let delay = self.settings.policy.next_delay(retry);
            warn!(
                source = self.index,
                uri = %self.source_uri,
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "tap lost, reconnecting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            SourceStats::incr(&self.stats.reconnects);
        }
    }

    fn enter(&self, session: &mut TapSession, next: SessionState) {
        if session.transition(next) {
            self.stats.set_state(next);
        }
    }

    async fn consume(
        &self,
        deliveries: &mut DeliveryStream,
        cancel: &CancellationToken,
    ) -> ConsumeEnd {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ConsumeEnd::Stopped,
                item = deliveries.next() => item,
            };

            let raw = match item {
                None => return ConsumeEnd::Lost(TapError::Channel("delivery stream ended".into())),
                Some(Err(TapError::DeliveryDecode(reason))) => {
                    SourceStats::incr(&self.stats.received);
                    self.decode_failed(&reason);
                    continue;
                }
                Some(Err(err)) => return ConsumeEnd::Lost(err),
                Some(Ok(raw)) => raw,
            };

            SourceStats::incr(&self.stats.received);
            let message = match raw.into_message(&self.source_uri) {
                Ok(message) => message,
                Err(err) => {
                    self.decode_failed(&err.to_string());
                    continue;
                }
            };

            match self.forward(message, cancel).await {
                Forwarded::Sent | Forwarded::Dropped => {}
                Forwarded::Stopped => return ConsumeEnd::Stopped,
            }
        }
    }

    fn decode_failed(&self, reason: &str) {
        SourceStats::incr(&self.stats.decode_errors);
        warn!(source = self.index, uri = %self.source_uri, reason, "dropping malformed delivery");
    }

    async fn forward(&self, message: TapMessage, cancel: &CancellationToken) -> Forwarded {
        let send = self.sender.send_timeout(message, self.settings.send_timeout);
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Forwarded::Stopped,
            sent = send => sent,
        };

        match sent {
            Ok(()) => {
                SourceStats::incr(&self.stats.forwarded);
                Forwarded::Sent
            }
            Err(SendTimeoutError::Timeout(message)) => {
                SourceStats::incr(&self.stats.dropped);
                warn!(
                    source = self.index,
                    exchange = message.exchange(),
                    routing_key = message.routing_key(),
                    "merge channel full, dropping message"
                );
                Forwarded::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(source = self.index, "merge channel closed");
                Forwarded::Stopped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::broker::RawDelivery;
    use crate::fake::FakeBroker;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        broker: FakeBroker,
        rx: mpsc::Receiver<TapMessage>,
        stats: Arc<SourceStats>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn spawn(
        broker: &FakeBroker,
        config: TapConfiguration,
        settings: SourceSettings,
        buffer: usize,
    ) -> Harness {
        let (tx, rx) = mpsc::channel(buffer);
        let stats = Arc::new(SourceStats::default());
        let cancel = CancellationToken::new();
        let connector = Arc::new(broker.clone());
        let source = TapSource::new(0, config, connector, tx, settings, stats.clone());
        let task = tokio::spawn(source.run(cancel.clone()));
        Harness {
            broker: broker.clone(),
            rx,
            stats,
            cancel,
            task,
        }
    }

    fn fast() -> SourceSettings {
        SourceSettings {
            policy: ReconnectPolicy::fixed(Duration::from_millis(10)),
            close_timeout: Duration::from_millis(100),
            ..SourceSettings::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn forwards_matching_messages_with_provenance() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        let config = TapConfiguration::new("amqp://broker-a").bind("orders", "order.*");
        let mut h = spawn(&broker, config, fast(), 16);

        h.broker.wait_for_consumers("amqp://broker-a", 1).await;
        h.broker.publish("orders", "invoice.created", "ignored");
        h.broker.publish("orders", "order.created", "X");

        let msg = tokio::time::timeout(WAIT, h.rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.source_uri(), "amqp://broker-a");
        assert_eq!(msg.exchange(), "orders");
        assert_eq!(msg.routing_key(), "order.created");
        assert_eq!(msg.body(), b"X");

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn reconnects_after_disconnect() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        let config = TapConfiguration::new("amqp://broker-a").bind("orders", "#");
        let mut h = spawn(&broker, config, fast(), 16);

        h.broker.wait_for_consumers("amqp://broker-a", 1).await;
        assert_eq!(h.broker.disconnect("amqp://broker-a"), 1);

        h.broker.wait_for_consumers("amqp://broker-a", 1).await;
        h.broker.publish("orders", "order.created", "after");
        let msg = tokio::time::timeout(WAIT, h.rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.body(), b"after");
        assert_eq!(h.broker.dial_count("amqp://broker-a"), 2);
        assert_eq!(h.stats.reconnects.load(Ordering::Relaxed), 1);

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn malformed_delivery_is_skipped() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        let config = TapConfiguration::new("amqp://broker-a").bind("orders", "#");
        let mut h = spawn(&broker, config, fast(), 16);

        h.broker.wait_for_consumers("amqp://broker-a", 1).await;
        h.broker.inject("amqp://broker-a", Err(TapError::DeliveryDecode("bad frame".into())));
        h.broker.inject(
            "amqp://broker-a",
            Ok(RawDelivery {
                exchange: String::new(),
                routing_key: "k".into(),
                envelope: Default::default(),
                body: vec![],
            }),
        );
        h.broker.publish("orders", "order.created", "good");

        let msg = tokio::time::timeout(WAIT, h.rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.body(), b"good");
        assert_eq!(h.stats.decode_errors.load(Ordering::Relaxed), 2);
        assert_eq!(h.stats.received.load(Ordering::Relaxed), 3);
        assert_eq!(h.broker.dial_count("amqp://broker-a"), 1);

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn missing_exchange_is_permanent() {
        let broker = FakeBroker::new();
        let config = TapConfiguration::new("amqp://broker-a").bind("missing", "#");
        let h = spawn(&broker, config, fast(), 16);

        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(TapError::Bind { .. })));
        assert_eq!(broker.dial_count("amqp://broker-a"), 1);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(h.stats.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let broker = FakeBroker::new();
        broker.fail_dials("amqp://down", TapError::Connection("refused".into()));
        let settings = SourceSettings {
            policy: ReconnectPolicy::testing(),
            ..fast()
        };
        let h = spawn(&broker, TapConfiguration::new("amqp://down"), settings, 16);

        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(TapError::Connection(_))));
        // First attempt plus three retries.
        assert_eq!(broker.dial_count("amqp://down"), 4);
    }

    #[tokio::test]
    async fn recovers_from_transient_dial_failures() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        broker.fail_next_dials("amqp://flaky", 2, TapError::Connection("refused".into()));
        let config = TapConfiguration::new("amqp://flaky").bind("orders", "#");
        let h = spawn(&broker, config, fast(), 16);

        broker.wait_for_consumers("amqp://flaky", 1).await;
        assert_eq!(broker.dial_count("amqp://flaky"), 3);
        assert_eq!(h.stats.state(), SessionState::Consuming);

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn full_channel_drops_newest() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        let config = TapConfiguration::new("amqp://broker-a").bind("orders", "#");
        let settings = SourceSettings {
            send_timeout: Duration::from_millis(20),
            ..fast()
        };
        let mut h = spawn(&broker, config, settings, 1);

        h.broker.wait_for_consumers("amqp://broker-a", 1).await;
        for body in ["first", "second", "third"] {
            h.broker.publish("orders", "k", body);
        }

        let stats = h.stats.clone();
        eventually(|| stats.dropped.load(Ordering::Relaxed) == 2).await;
        assert_eq!(h.stats.forwarded.load(Ordering::Relaxed), 1);

        let msg = h.rx.recv().await.unwrap();
        assert_eq!(msg.body(), b"first");

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_while_dial_hangs() {
        let broker = FakeBroker::new();
        broker.hang_dials("amqp://slow");
        let h = spawn(&broker, TapConfiguration::new("amqp://slow"), fast(), 16);

        eventually(|| broker.dial_count("amqp://slow") == 1).await;
        h.cancel.cancel();
        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancel_during_backoff() {
        let broker = FakeBroker::new();
        broker.fail_dials("amqp://down", TapError::Connection("refused".into()));
        let settings = SourceSettings {
            policy: ReconnectPolicy::fixed(Duration::from_secs(3600)),
            ..fast()
        };
        let h = spawn(&broker, TapConfiguration::new("amqp://down"), settings, 16);

        let stats = h.stats.clone();
        eventually(|| stats.state() == SessionState::Reconnecting).await;
        h.cancel.cancel();
        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(broker.dial_count("amqp://down"), 1);
    }
}
