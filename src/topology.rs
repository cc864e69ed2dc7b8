// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module keeps broker-side topology in step with what the component needs:
//! one exchange per topic, and for every subscription its queue, the optional DLQ
//! and the bindings between them.
//!
//! Exchange declarations are cached per connection generation. A topic counts as
//! declared only under the generation it was declared on, so after a reconnect the
//! exchange is declared again before anything else touches it.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    metadata::{ConcurrencyMode, PubSubMetadata, SubscribeMetadata},
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error};

/// Everything derived from a subscribe request and the component settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub queue: QueueDefinition,
    pub routing_keys: Vec<String>,
    pub concurrency_mode: ConcurrencyMode,
    pub auto_ack: bool,
    pub requeue_in_failure: bool,
    pub prefetch_count: u16,
}

impl Subscription {
    /// Validates the request and derives the queue.
    ///
    /// The queue name is the explicit `queueName` when given, otherwise
    /// `<consumerID>-<topic>`. Having neither is a configuration error.
    pub fn new(
        topic: &str,
        component: &PubSubMetadata,
        meta: &SubscribeMetadata,
    ) -> Result<Subscription, AmqpError> {
        let name = match (&meta.queue_name, &component.consumer_id) {
            (Some(queue), _) => queue.clone(),
            (None, Some(consumer_id)) => format!("{consumer_id}-{topic}"),
            (None, None) => {
                return Err(AmqpError::ConfigurationError(
                    "consumerID is required for subscriptions that don't specify a queue name"
                        .to_owned(),
                ))
            }
        };

        let mut queue = QueueDefinition::new(&name);
        if component.durable {
            queue = queue.durable();
        }
        if component.delete_when_unused {
            queue = queue.delete();
        }
        queue = queue.queue_type(meta.queue_type);

        if let Some(max) = meta.max_priority {
            queue = queue.max_priority(max);
        }
        if meta.single_active_consumer {
            queue = queue.single_active_consumer();
        }
        if let Some(max) = component.max_len {
            queue = queue.max_length(max);
        }
        if let Some(max) = component.max_len_bytes {
            queue = queue.max_length_bytes(max);
        }
        if component.enable_dead_letter {
            queue = queue.with_dlq();
        }

        Ok(Subscription {
            topic: topic.to_owned(),
            queue,
            routing_keys: meta.routing_keys.clone(),
            concurrency_mode: component.concurrency_mode,
            auto_ack: component.auto_ack,
            requeue_in_failure: component.requeue_in_failure,
            prefetch_count: component.prefetch_count,
        })
    }

    /// Routing keys to bind with; the topic itself when none were given.
    pub fn binding_keys(&self) -> Vec<&str> {
        if self.routing_keys.is_empty() {
            return vec![self.topic.as_str()];
        }
        self.routing_keys.iter().map(String::as_str).collect()
    }
}

/// Session-scoped Exchange Declaration Set plus the declare operations.
pub struct Topology {
    exchange_kind: ExchangeKind,
    declared: Mutex<HashMap<String, u64>>,
}

impl Topology {
    pub fn new(exchange_kind: ExchangeKind) -> Topology {
        Topology {
            exchange_kind,
            declared: Mutex::new(HashMap::default()),
        }
    }

    /// Declares the durable exchange backing `topic` unless it was already declared
    /// on connection `generation`.
    pub async fn ensure_exchange(
        &self,
        channel: &dyn BrokerChannel,
        generation: u64,
        topic: &str,
    ) -> Result<(), AmqpError> {
        if self.is_declared(topic, generation) {
            return Ok(());
        }

        let def = ExchangeDefinition::new(topic)
            .kind(self.exchange_kind.clone())
            .durable();

        debug!(
            exchange = topic,
            kind = def.kind.as_str(),
            generation,
            "declaring exchange"
        );

        if let Err(err) = channel.declare_exchange(&def).await {
            error!(error = err.to_string(), exchange = topic, "failure to declare exchange");
            return Err(err);
        }

        self.declared().insert(topic.to_owned(), generation);
        Ok(())
    }

    pub fn is_declared(&self, topic: &str, generation: u64) -> bool {
        self.declared().get(topic) == Some(&generation)
    }

    /// Declares the DLQ (if any), the queue, and binds it to the topic exchange once
    /// per binding key. The exchange must already exist.
    pub async fn ensure_queue(
        &self,
        channel: &dyn BrokerChannel,
        sub: &Subscription,
    ) -> Result<(), AmqpError> {
        if let Some(dlq) = sub.queue.dlq() {
            debug!(queue = dlq.name.as_str(), "declaring dlq");
            channel.declare_queue(&dlq).await?;
        }

        debug!(
            queue = sub.queue.name.as_str(),
            queue_type = sub.queue.queue_type.as_str(),
            durable = sub.queue.durable,
            "declaring queue"
        );
        channel.declare_queue(&sub.queue).await?;

        for key in sub.binding_keys() {
            debug!(
                queue = sub.queue.name.as_str(),
                exchange = sub.topic.as_str(),
                routing_key = key,
                "binding queue"
            );

            let binding = QueueBinding::new(&sub.queue.name)
                .exchange(&sub.topic)
                .routing_key(key);

            channel.bind_queue(&binding).await?;
        }

        Ok(())
    }

    fn declared(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        match self.declared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryBroker, queue::QueueType};
    use std::collections::HashMap;

    fn component(pairs: &[(&str, &str)]) -> PubSubMetadata {
        let mut props = HashMap::from([("hostname".to_owned(), "anyhost".to_owned())]);
        for (k, v) in pairs {
            props.insert(k.to_string(), v.to_string());
        }
        PubSubMetadata::from_properties(&props).unwrap()
    }

    #[test]
    fn should_require_consumer_id_without_queue_name() {
        let err = Subscription::new("mytopic", &component(&[]), &SubscribeMetadata::default())
            .unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(ref msg) if msg.contains("consumerID")));
    }

    #[test]
    fn should_prefer_explicit_queue_name() {
        let meta = SubscribeMetadata {
            queue_name: Some("myqueue".to_owned()),
            ..Default::default()
        };

        let sub = Subscription::new("mytopic", &component(&[("consumerID", "consumer")]), &meta)
            .unwrap();
        assert_eq!(sub.queue.name, "myqueue");

        let sub = Subscription::new(
            "mytopic",
            &component(&[("consumerID", "consumer")]),
            &SubscribeMetadata::default(),
        )
        .unwrap();
        assert_eq!(sub.queue.name, "consumer-mytopic");
        assert_eq!(sub.binding_keys(), vec!["mytopic"]);
    }

    #[test]
    fn should_derive_queue_from_settings() {
        let meta = SubscribeMetadata {
            queue_type: QueueType::Quorum,
            max_priority: Some(5),
            ..Default::default()
        };

        let sub = Subscription::new(
            "t",
            &component(&[
                ("consumerID", "c"),
                ("enableDeadLetter", "true"),
                ("maxLen", "10"),
            ]),
            &meta,
        )
        .unwrap();

        assert!(sub.queue.durable);
        assert!(!sub.queue.delete);
        assert_eq!(sub.queue.max_priority, Some(5));
        assert_eq!(sub.queue.max_length, Some(10));
        assert_eq!(sub.queue.dlq_name.as_deref(), Some("c-t-dlq"));
    }

    #[tokio::test]
    async fn should_declare_exchange_once_per_generation() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();
        let topology = Topology::new(ExchangeKind::Topic);

        topology.ensure_exchange(channel.as_ref(), 1, "orders").await.unwrap();
        assert!(topology.is_declared("orders", 1));
        assert!(!topology.is_declared("orders", 2));

        let def = broker.exchange("orders").unwrap();
        assert!(def.durable);
        assert_eq!(def.kind, ExchangeKind::Topic);
    }

    #[tokio::test]
    async fn should_not_cache_failed_declarations() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();
        channel.close().await.unwrap();
        let topology = Topology::new(ExchangeKind::Topic);

        assert!(topology
            .ensure_exchange(channel.as_ref(), 1, "orders")
            .await
            .is_err());
        assert!(!topology.is_declared("orders", 1));
    }

    #[tokio::test]
    async fn should_bind_every_routing_key() {
        let broker = MemoryBroker::new();
        let (_, channel) = broker.open_pair();
        let topology = Topology::new(ExchangeKind::Topic);

        let meta = SubscribeMetadata {
            routing_keys: vec!["keya".to_owned(), "keyb".to_owned()],
            ..Default::default()
        };
        let sub = Subscription::new("mytopic", &component(&[("consumerID", "c")]), &meta).unwrap();

        topology.ensure_exchange(channel.as_ref(), 1, "mytopic").await.unwrap();
        topology.ensure_queue(channel.as_ref(), &sub).await.unwrap();

        let keys = broker
            .bindings()
            .into_iter()
            .map(|b| b.routing_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["keya".to_owned(), "keyb".to_owned()]);
        assert_eq!(broker.declared_queues(), vec!["c-mytopic".to_owned()]);
    }
}
