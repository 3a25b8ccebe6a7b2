//! Broker capability traits and session setup.
//!
//! The engine never talks to a wire protocol directly. A connector provides
//! three small capabilities (dial, open a channel, declare/bind/consume a
//! queue) and [`establish`] strings them together into a ready tap session.
//!
//! ```text
//! BrokerConnector::dial ──▶ BrokerConnection::open_channel ──▶ BrokerChannel
//!                                                                 │
//!                    declare_tap_queue ◀──────────────────────────┤
//!                    bind (per ExchangeBinding) ◀─────────────────┤
//!                    consume ──▶ DeliveryStream ◀─────────────────┘
//! ```
//!
//! Connectors make no retry decisions. Every failure is returned as a typed
//! [`TapError`] and the tap source decides what to do with it.

use std::time::Duration;

use amqptap_types::{Envelope, ExchangeBinding, TapConfiguration, TapMessage};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TapError};
use crate::tls::TlsConfig;

/// A delivery as handed over by a connector, before provenance is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

impl RawDelivery {
    /// Attach the source URI and stamp the receive time.
    pub fn into_message(self, source_uri: &str) -> Result<TapMessage> {
        Ok(TapMessage::new(
            source_uri,
            self.exchange,
            self.routing_key,
            self.envelope,
            self.body,
        )?)
    }
}

/// Stream of deliveries from a tap queue.
///
/// The stream ends (or yields an error) when the channel or connection goes
/// away. A [`TapError::DeliveryDecode`] item affects only that delivery.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Opens connections to brokers.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Connect and complete the protocol handshake.
    async fn dial(&self, uri: &str, tls: &TlsConfig) -> Result<Self::Connection>;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a protocol channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Close the connection. The broker drops the tap queue with it.
    async fn close(&self) -> Result<()>;
}

/// A protocol channel able to create and consume a tap queue.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare an exclusive, auto-delete queue with a server generated name.
    async fn declare_tap_queue(&self) -> Result<String>;

    /// Bind the queue to an exchange.
    async fn bind(&self, queue: &str, binding: &ExchangeBinding) -> Result<()>;

    /// Start consuming the queue without acknowledgements.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}

/// Channel type of a connector.
pub type ChannelOf<C> = <<C as BrokerConnector>::Connection as BrokerConnection>::Channel;

/// A fully set up tap: connected, bound and consuming.
///
/// The connection and channel are owned here so they stay alive for as long
/// as the delivery stream is read.
pub struct BrokerSession<C: BrokerConnector> {
    pub connection: C::Connection,
    pub channel: ChannelOf<C>,
    pub queue: String,
    pub deliveries: DeliveryStream,
}

impl<C: BrokerConnector> std::fmt::Debug for BrokerSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Connect to the broker of `config` and bind one tap queue to all of its
/// exchanges.
///
/// Returns `Ok(None)` when `cancel` fires before setup completes; any
/// connection opened so far is closed first. When a step after dialing
/// fails, the half-built connection is closed before the error is returned.
pub async fn establish<C: BrokerConnector>(
    connector: &C,
    config: &TapConfiguration,
    tls: &TlsConfig,
    cancel: &CancellationToken,
    close_timeout: Duration,
) -> Result<Option<BrokerSession<C>>> {
    let connection = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        result = connector.dial(config.uri(), tls) => result?,
    };

    let setup = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = setup_queue::<C>(&connection, config) => Some(result),
    };

    match setup {
        Some(Ok((channel, queue, deliveries))) => Ok(Some(BrokerSession {
            connection,
            channel,
            queue,
            deliveries,
        })),
        Some(Err(err)) => {
            close_quietly(&connection, close_timeout).await;
            Err(err)
        }
        None => {
            close_quietly(&connection, close_timeout).await;
            Ok(None)
        }
    }
}

async fn setup_queue<C: BrokerConnector>(
    connection: &C::Connection,
    config: &TapConfiguration,
) -> Result<(ChannelOf<C>, String, DeliveryStream)> {
    let channel = connection.open_channel().await?;
    let queue = channel.declare_tap_queue().await?;

    for binding in config.bindings() {
        debug!(queue = %queue, binding = %binding, "binding tap queue");
        channel.bind(&queue, binding).await?;
    }

    let deliveries = channel.consume(&queue).await?;
    Ok((channel, queue, deliveries))
}

/// Close a connection, ignoring errors and giving up after `timeout`.
///
/// A connection that does not close in time is abandoned; the broker reaps
/// it once heartbeats stop.
pub async fn close_quietly<T: BrokerConnection>(connection: &T, timeout: Duration) {
    match tokio::time::timeout(timeout, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "ignoring error while closing broker connection"),
        Err(_) => warn!(
            timeout_ms = timeout.as_millis() as u64,
            "broker connection did not close in time, abandoning it"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBroker;

    const CLOSE: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn establish_declares_one_queue_with_all_bindings() {
        let broker = FakeBroker::new().with_exchanges(["orders", "billing"]);
        let config = TapConfiguration::new("amqp://broker-a")
            .bind("orders", "order.*")
            .bind("billing", "#");

        let cancel = CancellationToken::new();
        let session = establish(&broker, &config, &TlsConfig::default(), &cancel, CLOSE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.dial_count("amqp://broker-a"), 1);
        assert_eq!(broker.bindings_of(&session.queue).len(), 2);
    }

    #[tokio::test]
    async fn establish_closes_connection_when_bind_fails() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        let config = TapConfiguration::new("amqp://broker-a")
            .bind("orders", "#")
            .bind("missing", "#");

        let cancel = CancellationToken::new();
        let err = establish(&broker, &config, &TlsConfig::default(), &cancel, CLOSE)
            .await
            .unwrap_err();

        assert!(matches!(err, TapError::Bind { ref exchange, .. } if exchange == "missing"));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn establish_returns_none_when_cancelled_while_dialing() {
        let broker = FakeBroker::new();
        broker.hang_dials("amqp://slow");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let config = TapConfiguration::new("amqp://slow");
        let session = establish(&broker, &config, &TlsConfig::default(), &cancel, CLOSE)
            .await
            .unwrap();

        assert!(session.is_none());
    }

    #[tokio::test]
    async fn establish_never_returns_a_session_once_cancelled() {
        let broker = FakeBroker::new().with_exchanges(["orders"]);
        let config = TapConfiguration::new("amqp://broker-a").bind("orders", "#");
        let cancel = CancellationToken::new();
        cancel.cancel();

        for _ in 0..200 {
            let session = establish(&broker, &config, &TlsConfig::default(), &cancel, CLOSE)
                .await
                .unwrap();
            assert!(session.is_none());
        }
        assert_eq!(broker.dial_count("amqp://broker-a"), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[test]
    fn raw_delivery_without_exchange_is_a_decode_error() {
        let raw = RawDelivery {
            exchange: String::new(),
            routing_key: "k".into(),
            envelope: Envelope::default(),
            body: vec![],
        };
        assert!(matches!(
            raw.into_message("amqp://a"),
            Err(TapError::DeliveryDecode(_))
        ));
    }
}
