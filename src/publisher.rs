// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to the exchange backing a topic. A publish that
//! fails on a broken channel or connection triggers one reconnect and is retried
//! exactly once on the new channel; any further failure is returned to the caller.
//!
//! The caller's OpenTelemetry context is propagated in the message headers.

use crate::{
    broker::WireMessage,
    connection::ConnectionManager,
    errors::AmqpError,
    message::{self, PublishRequest},
    metadata::{PubSubMetadata, PublishMetadata},
    otel,
    topology::Topology,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct RabbitMQPublisher {
    conn: Arc<ConnectionManager>,
    topology: Arc<Topology>,
    metadata: Arc<PubSubMetadata>,
}

impl RabbitMQPublisher {
    pub fn new(
        conn: Arc<ConnectionManager>,
        topology: Arc<Topology>,
        metadata: Arc<PubSubMetadata>,
    ) -> RabbitMQPublisher {
        RabbitMQPublisher {
            conn,
            topology,
            metadata,
        }
    }

    /// Publishes `req` to the exchange named after its topic.
    ///
    /// Invalid publish metadata is a configuration error and is never retried.
    /// Broker failures come back as [`AmqpError::PublishingError`].
    pub async fn publish(&self, ctx: &Context, req: &PublishRequest) -> Result<(), AmqpError> {
        let meta = PublishMetadata::from_properties(&req.metadata)?;

        let mut msg = message::to_wire(&req.data, &meta, &self.metadata);
        otel::inject(ctx, &mut msg.properties.headers);

        let routing_key = meta.routing_key.as_deref().unwrap_or(&req.topic);

        let generation = match self.try_publish(&req.topic, routing_key, &msg).await {
            Ok(()) => return Ok(()),
            Err((generation, err)) if err.is_recoverable() => {
                warn!(
                    error = err.to_string(),
                    topic = req.topic.as_str(),
                    "publish failed, reconnecting"
                );
                generation
            }
            Err((_, err)) => return Err(publishing_error(&req.topic, err)),
        };

        if let Err(err) = self.conn.reconnect(generation).await {
            error!(
                error = err.to_string(),
                topic = req.topic.as_str(),
                "reconnect failed, giving up publish"
            );
            return Err(publishing_error(&req.topic, err));
        }

        self.try_publish(&req.topic, routing_key, &msg)
            .await
            .map_err(|(_, err)| {
                error!(
                    error = err.to_string(),
                    topic = req.topic.as_str(),
                    "publish failed after reconnect"
                );
                publishing_error(&req.topic, err)
            })
    }

    /// One publish attempt on the current channel. Failures carry the generation
    /// they happened on.
    async fn try_publish(
        &self,
        topic: &str,
        routing_key: &str,
        msg: &WireMessage,
    ) -> Result<(), (u64, AmqpError)> {
        let session = self.conn.session().await;
        let generation = session.generation();
        let channel = session.channel().map_err(|err| (generation, err))?;

        self.topology
            .ensure_exchange(channel.as_ref(), generation, topic)
            .await
            .map_err(|err| (generation, err))?;

        channel
            .publish(topic, routing_key, msg)
            .await
            .map_err(|err| (generation, err))?;

        debug!(topic, routing_key, generation, "message published");
        Ok(())
    }
}

fn publishing_error(topic: &str, err: AmqpError) -> AmqpError {
    AmqpError::PublishingError(topic.to_owned(), Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, memory::MemoryBroker};
    use std::collections::HashMap;

    async fn publisher(broker: &MemoryBroker) -> (RabbitMQPublisher, Arc<ConnectionManager>) {
        let props = HashMap::from([
            ("hostname".to_owned(), "anyhost".to_owned()),
            ("reconnectWaitSeconds".to_owned(), "0".to_owned()),
        ]);
        let metadata = Arc::new(PubSubMetadata::from_properties(&props).unwrap());
        let conn = Arc::new(ConnectionManager::new(broker.dialer(), &metadata));
        conn.open().await.unwrap();

        let publisher = RabbitMQPublisher::new(
            conn.clone(),
            Arc::new(Topology::new(ExchangeKind::Topic)),
            metadata,
        );
        (publisher, conn)
    }

    #[tokio::test]
    async fn should_publish_to_topic_exchange() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher(&broker).await;

        publisher
            .publish(&Context::new(), &PublishRequest::new("orders", b"hello"))
            .await
            .unwrap();

        assert!(broker.exchange("orders").is_some());
        assert_eq!(broker.last_published().unwrap().body, b"hello".to_vec());
    }

    #[tokio::test]
    async fn should_reconnect_and_retry_once() {
        let broker = MemoryBroker::new();
        let (publisher, conn) = publisher(&broker).await;
        broker.fail_next_publishes(1);

        publisher
            .publish(&Context::new(), &PublishRequest::new("orders", b"hello"))
            .await
            .unwrap();

        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.close_count(), 2);
        assert_eq!(conn.session().await.generation(), 2);
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn should_surface_error_when_retry_fails() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher(&broker).await;
        broker.fail_next_publishes(2);

        let err = publisher
            .publish(&Context::new(), &PublishRequest::new("orders", b"hello"))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::PublishingError(ref topic, _) if topic == "orders"));
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn should_reject_invalid_publish_metadata() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher(&broker).await;

        let req = PublishRequest::new("orders", b"hello").with_metadata("priority", "high");
        let err = publisher.publish(&Context::new(), &req).await.unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
        assert_eq!(broker.connect_count(), 1);
    }
}
