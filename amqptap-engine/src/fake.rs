//! In-memory broker for tests.
//!
//! [`FakeBroker`] implements the connector traits without any network. It
//! routes published messages to bound tap queues using topic matching, and
//! lets a test script failures: refused dials, dials that never finish,
//! dropped connections and malformed deliveries.
//!
//! Available to other crates with the `test-util` feature.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use amqptap_types::{Envelope, ExchangeBinding};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream, RawDelivery};
use crate::error::{Result, TapError};
use crate::tls::TlsConfig;

type DeliverySender = mpsc::UnboundedSender<Result<RawDelivery>>;

#[derive(Debug)]
struct FakeQueue {
    connection: u64,
    bindings: Vec<ExchangeBinding>,
    consumer: Option<DeliverySender>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: BTreeSet<String>,
    connections: BTreeMap<u64, String>,
    queues: BTreeMap<String, FakeQueue>,
    dials: BTreeMap<String, usize>,
    scripted_failures: BTreeMap<String, VecDeque<TapError>>,
    permanent_failures: BTreeMap<String, TapError>,
    hanging: BTreeSet<String>,
    next_id: u64,
    next_tag: u64,
}

impl BrokerState {
    fn drop_connection(&mut self, id: u64) -> bool {
        let existed = self.connections.remove(&id).is_some();
        self.queues.retain(|_, queue| queue.connection != id);
        existed
    }
}

/// A scriptable in-memory broker.
///
/// Clones share the same state, so a test keeps one handle while the engine
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    consumers_changed: Arc<Notify>,
}

impl FakeBroker {
    /// Create a broker with no exchanges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare exchanges (builder style).
    pub fn with_exchanges<I, S>(self, exchanges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.state.lock();
            state.exchanges.extend(exchanges.into_iter().map(Into::into));
        }
        self
    }

    /// Declare one exchange.
    pub fn declare_exchange(&self, exchange: impl Into<String>) {
        self.state.lock().exchanges.insert(exchange.into());
    }

    /// Publish a message with an empty envelope.
    ///
    /// Returns the number of tap queues the message was routed to.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> usize {
        self.publish_with(exchange, routing_key, Envelope::default(), body)
    }

    /// Publish a message with an explicit envelope.
    pub fn publish_with(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        body: impl Into<Vec<u8>>,
    ) -> usize {
        let body = body.into();
        let mut state = self.state.lock();
        if !state.exchanges.contains(exchange) {
            return 0;
        }

        let mut routed = 0;
        let mut tag = state.next_tag;
        for queue in state.queues.values() {
            let matches = queue
                .bindings
                .iter()
                .any(|b| b.exchange() == exchange && topic_matches(b.binding_key(), routing_key));
            let Some(consumer) = queue.consumer.as_ref().filter(|_| matches) else {
                continue;
            };

            tag += 1;
            let delivery = RawDelivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                envelope: Envelope {
                    delivery_tag: tag,
                    ..envelope.clone()
                },
                body: body.clone(),
            };
            if consumer.send(Ok(delivery)).is_ok() {
                routed += 1;
            }
        }
        state.next_tag = tag;
        routed
    }

    /// Push an arbitrary item to every consumer connected to `uri`.
    ///
    /// Used to simulate malformed deliveries or stream errors.
    pub fn inject(&self, uri: &str, item: Result<RawDelivery>) -> usize {
        let state = self.state.lock();
        let mut sent = 0;
        for queue in state.queues.values() {
            if state.connections.get(&queue.connection).map(String::as_str) != Some(uri) {
                continue;
            }
            if let Some(consumer) = &queue.consumer {
                if consumer.send(item.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Drop every connection to `uri`, ending their delivery streams.
    ///
    /// Returns the number of connections dropped.
    pub fn disconnect(&self, uri: &str) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, u)| u.as_str() == uri)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.drop_connection(*id);
        }
        drop(state);
        self.consumers_changed.notify_waiters();
        ids.len()
    }

    /// Make the next `count` dials to `uri` fail with `error`.
    pub fn fail_next_dials(&self, uri: &str, count: usize, error: TapError) {
        let mut state = self.state.lock();
        let queue = state.scripted_failures.entry(uri.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(count));
    }

    /// Make every dial to `uri` fail with `error`.
    pub fn fail_dials(&self, uri: &str, error: TapError) {
        self.state
            .lock()
            .permanent_failures
            .insert(uri.to_string(), error);
    }

    /// Make every dial to `uri` hang until the caller gives up.
    pub fn hang_dials(&self, uri: &str) {
        self.state.lock().hanging.insert(uri.to_string());
    }

    /// Number of dial attempts made to `uri`, failed ones included.
    pub fn dial_count(&self, uri: &str) -> usize {
        self.state.lock().dials.get(uri).copied().unwrap_or(0)
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of tap queues currently declared.
    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Bindings of a queue, empty if the queue does not exist.
    pub fn bindings_of(&self, queue: &str) -> Vec<ExchangeBinding> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    /// Number of live consumers on connections to `uri`.
    pub fn consumer_count(&self, uri: &str) -> usize {
        let state = self.state.lock();
        state
            .queues
            .values()
            .filter(|q| q.consumer.is_some())
            .filter(|q| state.connections.get(&q.connection).map(String::as_str) == Some(uri))
            .count()
    }

    /// Wait until at least `count` consumers are attached on `uri`.
    pub async fn wait_for_consumers(&self, uri: &str, count: usize) {
        loop {
            let notified = self.consumers_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.consumer_count(uri) >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    type Connection = FakeConnection;

    async fn dial(&self, uri: &str, _tls: &TlsConfig) -> Result<FakeConnection> {
        let hang = {
            let mut state = self.state.lock();
            *state.dials.entry(uri.to_string()).or_default() += 1;

            if let Some(error) = state
                .scripted_failures
                .get_mut(uri)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            if let Some(error) = state.permanent_failures.get(uri) {
                return Err(error.clone());
            }
            state.hanging.contains(uri)
        };

        if hang {
            futures_util::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(id, uri.to_string());
        Ok(FakeConnection {
            broker: self.clone(),
            id,
        })
    }
}

/// Connection handed out by [`FakeBroker`].
#[derive(Debug)]
pub struct FakeConnection {
    broker: FakeBroker,
    id: u64,
}

impl FakeConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.broker.state.lock().connections.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TapError::Channel("connection closed".into()))
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn open_channel(&self) -> Result<FakeChannel> {
        self.ensure_open()?;
        Ok(FakeChannel {
            broker: self.broker.clone(),
            connection: self.id,
        })
    }

    async fn close(&self) -> Result<()> {
        self.broker.state.lock().drop_connection(self.id);
        self.broker.consumers_changed.notify_waiters();
        Ok(())
    }
}

/// Channel handed out by [`FakeConnection`].
#[derive(Debug)]
pub struct FakeChannel {
    broker: FakeBroker,
    connection: u64,
}

impl FakeChannel {
    fn with_live_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains_key(&self.connection) {
            return Err(TapError::Channel("connection closed".into()));
        }
        f(&mut state)
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_tap_queue(&self) -> Result<String> {
        self.with_live_state(|state| {
            state.next_id += 1;
            let name = format!("amq.gen-{}", state.next_id);
            state.queues.insert(
                name.clone(),
                FakeQueue {
                    connection: self.connection,
                    bindings: Vec::new(),
                    consumer: None,
                },
            );
            Ok(name)
        })
    }

    async fn bind(&self, queue: &str, binding: &ExchangeBinding) -> Result<()> {
        self.with_live_state(|state| {
            if !state.exchanges.contains(binding.exchange()) {
                return Err(TapError::bind(
                    binding,
                    format!("NOT_FOUND - no exchange '{}'", binding.exchange()),
                ));
            }
            let queue = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TapError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
            queue.bindings.push(binding.clone());
            Ok(())
        })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let rx = self.with_live_state(|state| {
            let queue = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TapError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
            let (tx, rx) = mpsc::unbounded_channel();
            queue.consumer = Some(tx);
            Ok(rx)
        })?;
        self.broker.consumers_changed.notify_waiters();
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Topic exchange matching: `*` matches one word, `#` zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, tail)) if word == "*" || word == first => match_words(rest, tail),
            _ => false,
        },
    }
}
