// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Pub/Sub Component
//!
//! [`RabbitMQPubSub`] ties the pieces together: `init` parses the component
//! metadata and dials once, `publish` and `subscribe` share the same connection
//! manager for the lifetime of the component, and `close` shuts everything down
//! and waits for the consume loops to finish.

use crate::{
    broker::Dialer,
    channel::LapinDialer,
    connection::ConnectionManager,
    consumer::ConsumerHandler,
    dispatcher::{ConsumerState, RabbitMQDispatcher, RabbitMQDispatcherDefinition, SubscriptionHandle},
    errors::AmqpError,
    message::{PublishRequest, SubscribeRequest},
    metadata::{PubSubMetadata, SubscribeMetadata},
    publisher::RabbitMQPublisher,
    topology::{Subscription, Topology},
};
use opentelemetry::Context;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct RabbitMQPubSub {
    metadata: Arc<PubSubMetadata>,
    conn: Arc<ConnectionManager>,
    topology: Arc<Topology>,
    publisher: RabbitMQPublisher,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl RabbitMQPubSub {
    /// Parses `props` and connects to the broker.
    ///
    /// # Parameters
    /// * `props` - Component metadata as string key/value pairs
    ///
    /// # Returns
    /// A connected component, or a configuration or connection error
    pub async fn init(props: &HashMap<String, String>) -> Result<RabbitMQPubSub, AmqpError> {
        RabbitMQPubSub::init_with_dialer(props, LapinDialer::new()).await
    }

    /// Same as [`RabbitMQPubSub::init`] with a custom dialer.
    pub async fn init_with_dialer(
        props: &HashMap<String, String>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<RabbitMQPubSub, AmqpError> {
        let metadata = Arc::new(PubSubMetadata::from_properties(props)?);

        let conn = Arc::new(ConnectionManager::new(dialer, &metadata));
        conn.open().await?;

        let topology = Arc::new(Topology::new(metadata.exchange_kind.clone()));
        let publisher = RabbitMQPublisher::new(conn.clone(), topology.clone(), metadata.clone());

        info!(
            concurrency_mode = ?metadata.concurrency_mode,
            exchange_kind = metadata.exchange_kind.as_str(),
            "rabbitmq pubsub initialized"
        );

        Ok(RabbitMQPubSub {
            metadata,
            conn,
            topology,
            publisher,
            subscriptions: Mutex::new(vec![]),
        })
    }

    /// The parsed component metadata.
    pub fn metadata(&self) -> &PubSubMetadata {
        &self.metadata
    }

    /// Publishes `req.data` to the exchange named after `req.topic`.
    ///
    /// A broken link is replaced once and the publish retried once.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `req` - Topic, payload and publish metadata
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message, a `PublishingError` otherwise
    pub async fn publish(&self, ctx: &Context, req: &PublishRequest) -> Result<(), AmqpError> {
        self.publisher.publish(ctx, req).await
    }

    /// Validates the request, declares its topology and starts a consume loop
    /// delivering to `handler`.
    ///
    /// # Parameters
    /// * `req` - Topic and subscribe metadata
    /// * `handler` - Called once per delivery; an error nacks the message
    ///
    /// # Returns
    /// `Ok(())` once the consumer is started, `ClosedError` after `close`
    pub async fn subscribe(
        &self,
        req: &SubscribeRequest,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if self.conn.is_closed() {
            return Err(AmqpError::ClosedError);
        }

        let meta = SubscribeMetadata::from_properties(&req.metadata)?;
        let subscription = Subscription::new(&req.topic, &self.metadata, &meta)?;

        debug!(
            topic = req.topic.as_str(),
            queue = subscription.queue.name.as_str(),
            "subscribing"
        );

        let def = RabbitMQDispatcherDefinition {
            subscription,
            handler,
            properties_to_metadata: self.metadata.publish_message_properties_to_metadata,
            shutdown: self.conn.shutdown_token(),
        };

        let handle = RabbitMQDispatcher::new(self.conn.clone(), self.topology.clone(), def)
            .start()
            .await?;

        self.subscriptions.lock().await.push(handle);
        Ok(())
    }

    /// Closes the connection, disables reconnects and waits for every consume loop.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close().await?;

        let handles = std::mem::take(&mut *self.subscriptions.lock().await);
        for handle in handles {
            handle.join().await;
        }

        Ok(())
    }

    /// Whether `topic`'s exchange is declared on the current connection.
    pub async fn is_exchange_declared(&self, topic: &str) -> bool {
        let generation = self.conn.session().await.generation();
        self.topology.is_declared(topic, generation)
    }

    /// Whether the current connection is open.
    pub async fn is_connected(&self) -> bool {
        self.conn.is_connected().await
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.conn.reconnect_attempts()
    }

    /// Topic and state of every subscription started so far.
    pub async fn subscription_states(&self) -> Vec<(String, ConsumerState)> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|h| (h.topic().to_owned(), h.state()))
            .collect()
    }
}
