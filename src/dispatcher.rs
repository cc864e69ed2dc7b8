// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs one consume loop per subscription. The loop moves through
//! `Declaring -> Consuming -> Reconnecting -> Consuming -> ... -> Closed`:
//!
//! - *Declaring*: exchange, queue and bindings are declared on the current channel,
//!   QoS is applied and a consumer is started.
//! - *Consuming*: deliveries are handed to [`crate::consumer`], one task per
//!   delivery in parallel mode or one at a time in single mode.
//! - *Reconnecting*: the delivery stream ended while the component is still open;
//!   the connection is replaced and the loop goes back to declaring.
//! - *Closed*: the component was closed or the reconnect failed. In-flight handlers
//!   are awaited before the loop task returns.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    connection::ConnectionManager,
    consumer::{consume, ConsumerHandler},
    errors::AmqpError,
    metadata::ConcurrencyMode,
    topology::{Subscription, Topology},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Declaring,
    Consuming,
    Reconnecting,
    Closed,
}

/// A subscription together with its handler.
#[derive(Clone)]
pub struct RabbitMQDispatcherDefinition {
    pub(crate) subscription: Subscription,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) properties_to_metadata: bool,
    pub(crate) shutdown: CancellationToken,
}

/// A started consumer: current channel, the generation it belongs to, and its
/// delivery stream.
struct Consumer {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    stream: DeliveryStream,
}

pub struct RabbitMQDispatcher {
    conn: Arc<ConnectionManager>,
    topology: Arc<Topology>,
    def: Arc<RabbitMQDispatcherDefinition>,
    state: watch::Sender<ConsumerState>,
}

/// Handle on a running consume loop.
pub struct SubscriptionHandle {
    topic: String,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the last state reported by the consume loop.
    ///
    /// # Returns
    /// The current [`ConsumerState`]; `Closed` once the loop has returned
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Waits until the loop reports `state`. Returns early if the loop task is
    /// gone without ever reporting it.
    ///
    /// # Parameters
    /// * `state` - The state to wait for
    pub async fn wait_for(&mut self, state: ConsumerState) {
        if let Err(err) = self.state.wait_for(|s| *s == state).await {
            debug!(
                error = err.to_string(),
                topic = self.topic.as_str(),
                ?state,
                "consume loop gone before reaching state"
            );
        }
    }

    /// Waits for the loop task to return.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            error!(error = err.to_string(), topic = self.topic.as_str(), "consume loop panicked");
        }
    }
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher for one subscription. Nothing is declared until
    /// [`RabbitMQDispatcher::start`].
    ///
    /// # Parameters
    /// * `conn` - Connection manager shared with the rest of the component
    /// * `topology` - Exchange declaration set shared with the publisher
    /// * `def` - The subscription and its handler
    pub fn new(
        conn: Arc<ConnectionManager>,
        topology: Arc<Topology>,
        def: RabbitMQDispatcherDefinition,
    ) -> RabbitMQDispatcher {
        let (state, _) = watch::channel(ConsumerState::Declaring);
        RabbitMQDispatcher {
            conn,
            topology,
            def: Arc::new(def),
            state,
        }
    }

    /// Declares the subscription topology, starts consuming and spawns the consume
    /// loop. Declaration failures on a broken link get one reconnect-and-retry;
    /// anything else is returned and no loop is started.
    pub async fn start(self) -> Result<SubscriptionHandle, AmqpError> {
        let consumer = match self.prepare().await {
            Ok(consumer) => consumer,
            Err((generation, err)) if err.is_recoverable() => {
                warn!(
                    error = err.to_string(),
                    topic = self.def.subscription.topic.as_str(),
                    "subscribe failed, reconnecting"
                );
                self.conn.reconnect(generation).await?;
                self.prepare().await.map_err(|(_, err)| err)?
            }
            Err((_, err)) => return Err(err),
        };

        let topic = self.def.subscription.topic.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(consumer));

        Ok(SubscriptionHandle { topic, state, task })
    }

    async fn prepare(&self) -> Result<Consumer, (u64, AmqpError)> {
        self.state.send_replace(ConsumerState::Declaring);

        let sub = &self.def.subscription;
        let session = self.conn.session().await;
        let generation = session.generation();
        let with_gen = |err| (generation, err);

        let channel = session.channel().map_err(with_gen)?.clone();

        self.topology
            .ensure_exchange(channel.as_ref(), generation, &sub.topic)
            .await
            .map_err(with_gen)?;
        self.topology
            .ensure_queue(channel.as_ref(), sub)
            .await
            .map_err(with_gen)?;
        channel.qos(sub.prefetch_count).await.map_err(with_gen)?;

        let consumer_tag = format!("{}-{}", sub.queue.name, Uuid::new_v4());
        let stream = channel
            .consume(&sub.queue.name, &consumer_tag, sub.auto_ack)
            .await
            .map_err(with_gen)?;

        info!(
            topic = sub.topic.as_str(),
            queue = sub.queue.name.as_str(),
            consumer_tag = consumer_tag.as_str(),
            generation,
            "consumer started"
        );

        Ok(Consumer {
            generation,
            channel,
            stream,
        })
    }

    async fn run(self, mut consumer: Consumer) {
        let sub = &self.def.subscription;
        let shutdown = self.def.shutdown.clone();
        let tracer = global::tracer("amqp consumer");
        let mut tasks = JoinSet::new();

        loop {
            self.state.send_replace(ConsumerState::Consuming);

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => match sub.concurrency_mode {
                    ConcurrencyMode::Single => {
                        if let Err(err) =
                            consume(&tracer, delivery, consumer.channel.clone(), &self.def).await
                        {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    ConcurrencyMode::Parallel => {
                        let channel = consumer.channel.clone();
                        let def = self.def.clone();
                        tasks.spawn(async move {
                            let tracer = global::tracer("amqp consumer");
                            if let Err(err) = consume(&tracer, delivery, channel, &def).await {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        });
                        while tasks.try_join_next().is_some() {}
                    }
                },

                Some(Err(err)) => {
                    warn!(error = err.to_string(), topic = sub.topic.as_str(), "errors consume msg");
                }

                None => {
                    if self.conn.is_closed() {
                        debug!(topic = sub.topic.as_str(), "delivery stream closed on shutdown");
                        break;
                    }

                    self.state.send_replace(ConsumerState::Reconnecting);
                    warn!(
                        topic = sub.topic.as_str(),
                        generation = consumer.generation,
                        "delivery stream closed, reconnecting"
                    );

                    match self.resume(consumer.generation).await {
                        Ok(resumed) => consumer = resumed,
                        Err(AmqpError::ClosedError) => break,
                        Err(err) => {
                            error!(
                                error = err.to_string(),
                                topic = sub.topic.as_str(),
                                "unable to resume consuming, subscription terminated"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.state.send_replace(ConsumerState::Closed);
        while tasks.join_next().await.is_some() {}
        debug!(topic = sub.topic.as_str(), "consume loop finished");
    }

    async fn resume(&self, observed: u64) -> Result<Consumer, AmqpError> {
        self.conn.reconnect(observed).await?;
        self.prepare().await.map_err(|(_, err)| err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::WireMessage,
        consumer::handler_fn,
        exchange::ExchangeKind,
        memory::MemoryBroker,
        message::NewMessage,
        metadata::{PubSubMetadata, SubscribeMetadata},
    };
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    async fn setup(
        broker: &MemoryBroker,
        pairs: &[(&str, &str)],
    ) -> (Arc<ConnectionManager>, Arc<Topology>, Subscription) {
        let mut props = HashMap::from([
            ("hostname".to_owned(), "anyhost".to_owned()),
            ("consumerID".to_owned(), "c".to_owned()),
            ("reconnectWaitSeconds".to_owned(), "0".to_owned()),
        ]);
        for (k, v) in pairs {
            props.insert(k.to_string(), v.to_string());
        }
        let component = PubSubMetadata::from_properties(&props).unwrap();

        let conn = Arc::new(ConnectionManager::new(broker.dialer(), &component));
        conn.open().await.unwrap();

        let sub = Subscription::new("t", &component, &SubscribeMetadata::default()).unwrap();
        (conn, Arc::new(Topology::new(ExchangeKind::Topic)), sub)
    }

    fn definition(
        conn: &ConnectionManager,
        sub: Subscription,
        tx: mpsc::UnboundedSender<NewMessage>,
    ) -> RabbitMQDispatcherDefinition {
        RabbitMQDispatcherDefinition {
            subscription: sub,
            handler: handler_fn(move |_, msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                    Ok(())
                }
            }),
            properties_to_metadata: false,
            shutdown: conn.shutdown_token(),
        }
    }

    fn body(data: &str) -> WireMessage {
        WireMessage {
            body: data.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn should_declare_and_consume() {
        let broker = MemoryBroker::new();
        let (conn, topology, sub) = setup(&broker, &[("prefetchCount", "5")]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handle = RabbitMQDispatcher::new(conn.clone(), topology, definition(&conn, sub, tx))
            .start()
            .await
            .unwrap();
        handle.wait_for(ConsumerState::Consuming).await;

        broker.deliver("c-t", body("one")).unwrap();

        assert_eq!(rx.recv().await.unwrap().data, b"one".to_vec());
        assert_eq!(broker.prefetch_counts(), vec![5]);
        assert_eq!(handle.topic(), "t");
    }

    #[tokio::test]
    async fn should_resume_after_connection_loss() {
        let broker = MemoryBroker::new();
        let (conn, topology, sub) = setup(&broker, &[]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = RabbitMQDispatcher::new(conn.clone(), topology, definition(&conn, sub, tx))
            .start()
            .await
            .unwrap();

        broker.drop_connections();

        let mut resumed = false;
        for _ in 0..100 {
            if conn.session().await.generation() == 2 && handle.state() == ConsumerState::Consuming {
                resumed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(resumed);
        assert_eq!(broker.connect_count(), 2);

        broker.deliver("c-t", body("after")).unwrap();
        assert_eq!(rx.recv().await.unwrap().data, b"after".to_vec());
    }

    #[tokio::test]
    async fn should_stop_when_component_closes() {
        let broker = MemoryBroker::new();
        let (conn, topology, sub) = setup(&broker, &[]).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = RabbitMQDispatcher::new(conn.clone(), topology, definition(&conn, sub, tx))
            .start()
            .await
            .unwrap();

        conn.close().await.unwrap();
        handle.join().await;

        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn should_terminate_when_reconnect_fails() {
        let broker = MemoryBroker::new();
        let (conn, topology, sub) = setup(&broker, &[]).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut handle =
            RabbitMQDispatcher::new(conn.clone(), topology, definition(&conn, sub, tx))
                .start()
                .await
                .unwrap();

        broker.fail_next_dials(3);
        broker.drop_connections();

        handle.wait_for(ConsumerState::Closed).await;
        assert_eq!(conn.reconnect_attempts(), 3);
        handle.join().await;
    }
}
