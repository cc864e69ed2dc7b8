// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A deterministic broker implementing the capabilities of [`crate::broker`] in
//! process. It routes published messages through declared exchanges and bindings
//! into queues, hands queues out to competing consumers, and keeps counters of
//! every connect and close so reconnect behavior can be asserted exactly.
//!
//! Faults are injected explicitly: failing the next publishes or dials, or dropping
//! every live connection as a broker-side disconnect would. Deliveries a channel
//! received but never settled go back to their queue, flagged as redelivered, when
//! that channel is closed or dropped.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, ConnectionPair, Delivery, DeliveryStream, DialOptions,
        Dialer, WireMessage,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Delivery>>>;

struct QueueState {
    def: QueueDefinition,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: SharedReceiver,
}

/// An enqueued message not settled yet. `owner` is the pair that received it.
struct Pending {
    queue: String,
    message: WireMessage,
    owner: Option<u64>,
}

#[derive(Default)]
struct State {
    exchanges: BTreeMap<String, ExchangeDefinition>,
    queues: BTreeMap<String, QueueState>,
    declared_queues: Vec<String>,
    bindings: Vec<QueueBinding>,
    published: Vec<WireMessage>,
    unacked: HashMap<u64, Pending>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    prefetch: Vec<u16>,
    confirm_selects: u32,
    connections: Vec<(u64, CancellationToken)>,
}

#[derive(Default)]
struct Inner {
    connect_count: AtomicU32,
    close_count: AtomicU32,
    publish_failures: AtomicU32,
    dial_failures: AtomicU32,
    next_tag: AtomicU64,
    next_pair: AtomicU64,
    state: Mutex<State>,
}

/// Cheap to clone; every clone shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates an empty broker with no exchanges, queues or connections.
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// A [`Dialer`] opening pairs on this broker, subject to `fail_next_dials`.
    ///
    /// # Returns
    /// The broker itself behind the dialer capability
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(self.clone())
    }

    /// Opens a connection/channel pair without going through fault injection.
    pub fn open_pair(&self) -> ConnectionPair {
        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_pair.fetch_add(1, Ordering::SeqCst) + 1;

        let token = CancellationToken::new();
        self.state().connections.push((id, token.clone()));

        let channel_token = token.child_token();
        (
            Arc::new(MemoryConnection {
                broker: self.clone(),
                id,
                token,
            }),
            Arc::new(MemoryChannel {
                broker: self.clone(),
                id,
                token: channel_token,
            }),
        )
    }

    /// Number of connection/channel pairs opened.
    pub fn connect_count(&self) -> u32 {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    /// Number of `close` calls, connections and channels alike.
    pub fn close_count(&self) -> u32 {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// The next `n` publishes fail with a channel error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.publish_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` dials fail with a connection error.
    pub fn fail_next_dials(&self, n: u32) {
        self.inner.dial_failures.store(n, Ordering::SeqCst);
    }

    /// Drops every live connection, as a broker-side disconnect would. Nothing is
    /// counted as closed by the client; unsettled deliveries are requeued.
    pub fn drop_connections(&self) {
        let connections = std::mem::take(&mut self.state().connections);
        for (_, token) in &connections {
            token.cancel();
        }

        let mut state = self.state();
        for (id, _) in connections {
            if let Err(err) = self.requeue_owned(&mut state, id) {
                warn!(error = err.to_string(), "failed to requeue deliveries");
            }
        }
    }

    /// Pushes a message straight into a declared queue.
    pub fn deliver(&self, queue: &str, message: WireMessage) -> Result<(), AmqpError> {
        let mut state = self.state();
        self.enqueue(&mut state, queue, message, false)
    }

    /// Names passed to every queue declaration, in order.
    pub fn declared_queues(&self) -> Vec<String> {
        self.state().declared_queues.clone()
    }

    /// Returns the latest definition declared for a queue.
    ///
    /// # Parameters
    /// * `name` - The queue name
    ///
    /// # Returns
    /// The definition, or `None` if the queue was never declared
    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state().queues.get(name).map(|q| q.def.clone())
    }

    /// Same as [`MemoryBroker::queue`] for exchanges.
    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.state().exchanges.get(name).cloned()
    }

    /// Distinct bindings, in declaration order.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state().bindings.clone()
    }

    /// The last message accepted by a publish, routed or not.
    pub fn last_published(&self) -> Option<WireMessage> {
        self.state().published.last().cloned()
    }

    pub fn published_count(&self) -> usize {
        self.state().published.len()
    }

    /// Deliveries enqueued and not settled yet, received or not.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Delivery tags acked so far, in order.
    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    /// Delivery tags nacked so far with their requeue flag.
    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.state().nacked.clone()
    }

    /// Prefetch count of every `qos` call, in order.
    pub fn prefetch_counts(&self) -> Vec<u16> {
        self.state().prefetch.clone()
    }

    /// Number of channels put in confirm mode.
    pub fn confirm_selects(&self) -> u32 {
        self.state().confirm_selects
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueue(
        &self,
        state: &mut State,
        queue: &str,
        message: WireMessage,
        redelivered: bool,
    ) -> Result<(), AmqpError> {
        let Some(target) = state.queues.get(queue) else {
            return Err(AmqpError::ChannelError(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        };

        let delivery_tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: queue.to_owned(),
            redelivered,
            message: message.clone(),
        };

        target
            .tx
            .send(delivery)
            .map_err(|_| AmqpError::ChannelError(format!("queue '{queue}' is gone")))?;
        state.unacked.insert(
            delivery_tag,
            Pending {
                queue: queue.to_owned(),
                message,
                owner: None,
            },
        );

        Ok(())
    }

    /// Records that pair `owner` received `delivery`. When the pair is already
    /// gone the delivery is requeued instead and `false` is returned.
    fn claim(&self, delivery: &Delivery, owner: u64, auto_ack: bool, token: &CancellationToken) -> bool {
        let mut state = self.state();
        let tag = delivery.delivery_tag;

        if token.is_cancelled() {
            if let Some(pending) = state.unacked.remove(&tag) {
                if let Err(err) = self.enqueue(&mut state, &pending.queue, pending.message, true) {
                    warn!(error = err.to_string(), "failed to requeue delivery");
                }
            }
            return false;
        }

        if auto_ack {
            state.unacked.remove(&tag);
        } else if let Some(pending) = state.unacked.get_mut(&tag) {
            pending.owner = Some(owner);
        }

        true
    }

    /// Puts every delivery held by pair `owner` back on its queue.
    fn requeue_owned(&self, state: &mut State, owner: u64) -> Result<(), AmqpError> {
        let mut tags = state
            .unacked
            .iter()
            .filter(|(_, pending)| pending.owner == Some(owner))
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        tags.sort_unstable();

        for tag in tags {
            if let Some(pending) = state.unacked.remove(&tag) {
                self.enqueue(state, &pending.queue, pending.message, true)?;
            }
        }

        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str, message: &WireMessage) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.published.push(message.clone());

        if exchange.is_empty() {
            return self.enqueue(&mut state, routing_key, message.clone(), false);
        }

        let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind.clone()) else {
            return Err(AmqpError::ChannelError(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        };

        let mut targets = state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue_name.clone())
            .collect::<Vec<_>>();
        targets.sort();
        targets.dedup();

        for queue in targets {
            self.enqueue(&mut state, &queue, message.clone(), false)?;
        }

        Ok(())
    }

    fn settle(&self, delivery_tag: u64, requeue: Option<bool>) -> Result<(), AmqpError> {
        let mut state = self.state();
        let pending = state.unacked.remove(&delivery_tag);

        match requeue {
            None => state.acked.push(delivery_tag),
            Some(requeue) => {
                state.nacked.push((delivery_tag, requeue));

                if let Some(Pending { queue, message, .. }) = pending {
                    let dead_letter = state.queues.get(&queue).and_then(|q| q.def.dlq_name.clone());
                    if requeue {
                        self.enqueue(&mut state, &queue, message, true)?;
                    } else if let Some(dlq) = dead_letter {
                        self.enqueue(&mut state, &dlq, message, false)?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Dialer for MemoryBroker {
    async fn dial(&self, _opts: &DialOptions) -> Result<ConnectionPair, AmqpError> {
        let failed = self
            .inner
            .dial_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failed {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(self.open_pair())
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    token: CancellationToken,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        let mut state = self.broker.state();
        self.broker.requeue_owned(&mut state, self.id)
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    token: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.token.is_cancelled() {
            return Err(AmqpError::ChannelError("channel/connection is not open".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker
            .state()
            .exchanges
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.declared_queues.push(def.name.clone());

        match state.queues.get_mut(&def.name) {
            Some(existing) => existing.def = def.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        tx,
                        rx: Arc::new(AsyncMutex::new(rx)),
                    },
                );
            }
        }

        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state().prefetch.push(prefetch_count);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state().confirm_selects += 1;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &WireMessage,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let failed = self
            .broker
            .inner
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AmqpError::ChannelError("channel/connection is not open".to_owned()));
        }

        self.broker.route(exchange, routing_key, msg)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let rx = match self.broker.state().queues.get(queue) {
            Some(q) => q.rx.clone(),
            None => {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
        };

        let (broker, owner) = (self.broker.clone(), self.id);
        let stream = futures_util::stream::unfold(
            (rx, self.token.clone()),
            move |(rx, token)| {
                let broker = broker.clone();
                async move {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        delivery = async { rx.lock().await.recv().await } => delivery,
                    };
                    let delivery = next?;

                    broker
                        .claim(&delivery, owner, auto_ack, &token)
                        .then_some((Ok(delivery), (rx, token)))
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.settle(delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.settle(delivery_tag, Some(requeue))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        let mut state = self.broker.state();
        self.broker.requeue_owned(&mut state, self.id)
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = key.split('.').collect::<Vec<_>>();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((first, rest)) if *first == "#" => {
            (0..=key.len()).any(|skip| words_match(rest, &key[skip..]))
        }
        Some((first, rest)) => match key.split_first() {
            Some((word, remaining)) if *first == "*" || first == word => {
                words_match(rest, remaining)
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn body(data: &str) -> WireMessage {
        WireMessage {
            body: data.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn should_match_topic_patterns() {
        assert!(topic_matches("orders", "orders"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("keya", "keyb"));
    }

    #[tokio::test]
    async fn should_route_through_topic_bindings() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();

        channel
            .declare_exchange(&ExchangeDefinition::new("orders").durable())
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("q"))
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new("q").exchange("orders").routing_key("orders.*"))
            .await
            .unwrap();

        let mut stream = channel.consume("q", "tag", false).await.unwrap();

        let msg = WireMessage {
            body: b"created".to_vec(),
            ..Default::default()
        };
        channel.publish("orders", "orders.created", &msg).await.unwrap();
        channel.publish("orders", "invoices.created", &msg).await.unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.message.body, b"created".to_vec());

        let nothing = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn should_fail_publish_to_unknown_exchange() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();

        let err = channel
            .publish("missing", "key", &WireMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ChannelError(_)));
    }

    #[tokio::test]
    async fn should_end_streams_when_connections_drop() {
        let broker = MemoryBroker::new();
        let (connection, channel) = broker.open_pair();
        channel
            .declare_queue(&QueueDefinition::new("q"))
            .await
            .unwrap();
        let mut stream = channel.consume("q", "tag", false).await.unwrap();

        broker.drop_connections();

        assert!(stream.next().await.is_none());
        assert!(!connection.is_open());
        assert!(channel.ack(1).await.is_err());
        assert_eq!(broker.close_count(), 0);
    }

    #[tokio::test]
    async fn should_requeue_unsettled_deliveries_when_channel_goes_away() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();
        channel
            .declare_queue(&QueueDefinition::new("q"))
            .await
            .unwrap();
        broker.deliver("q", body("in flight")).unwrap();

        let mut stream = channel.consume("q", "tag", false).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);

        channel.close().await.unwrap();

        let (_, channel) = broker.open_pair();
        let mut stream = channel.consume("q", "tag", false).await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.message.body, b"in flight".to_vec());

        broker.drop_connections();

        let (_, channel) = broker.open_pair();
        let mut stream = channel.consume("q", "tag", false).await.unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert!(third.redelivered);

        channel.ack(third.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acked(), vec![third.delivery_tag]);
    }

    #[tokio::test]
    async fn should_settle_auto_ack_deliveries_on_receipt() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();
        channel
            .declare_queue(&QueueDefinition::new("q"))
            .await
            .unwrap();
        broker.deliver("q", body("fire and forget")).unwrap();

        let mut stream = channel.consume("q", "tag", true).await.unwrap();
        stream.next().await.unwrap().unwrap();

        assert_eq!(broker.unacked_count(), 0);
        channel.close().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn should_dead_letter_rejected_messages() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();
        let def = QueueDefinition::new("q").with_dlq();
        channel.declare_queue(&def.dlq().unwrap()).await.unwrap();
        channel.declare_queue(&def).await.unwrap();

        broker.deliver("q", WireMessage::default()).unwrap();
        let mut stream = channel.consume("q", "tag", false).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        let mut dlq = channel.consume("q-dlq", "tag", false).await.unwrap();
        assert!(dlq.next().await.unwrap().is_ok());
        assert_eq!(broker.nacked(), vec![(delivery.delivery_tag, false)]);
    }
}
