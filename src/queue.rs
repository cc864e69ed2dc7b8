// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! A queue definition carries everything needed to derive its declaration
//! arguments: queue type, priority ceiling, single active consumer, length limits
//! and the optional Dead Letter Queue (DLQ).

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Constant for the argument used to select the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the argument used to enable priorities up to a ceiling
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the argument used to enable single active consumer
pub const AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER: &str = "x-single-active-consumer";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// The RabbitMQ queue implementations a subscription can ask for.
///
/// Classic is the legacy default; quorum queues are replicated and always durable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    Classic,
    Quorum,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single queue declaration argument, independent of any client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArgument {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
    pub delete: bool,
    pub queue_type: QueueType,
    pub max_priority: Option<u8>,
    pub single_active_consumer: bool,
    pub max_length: Option<i64>,
    pub max_length_bytes: Option<i64>,
    pub dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is a classic, non-durable queue.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Sets the queue type.
    ///
    /// Quorum queues are replicated: they are forced durable and are never
    /// auto-deleted.
    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        if queue_type == QueueType::Quorum {
            self.durable = true;
            self.delete = false;
        }
        self
    }

    /// Turns the queue into a priority queue with the given ceiling.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Only one consumer at a time receives messages from the queue.
    pub fn single_active_consumer(mut self) -> Self {
        self.single_active_consumer = true;
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i64) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// Rejected messages are routed through the default exchange into a queue named
    /// after the main queue with a "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Definition of the DLQ attached to this queue, if any.
    ///
    /// The DLQ shares durability and type with the main queue and carries no
    /// arguments of its own.
    pub fn dlq(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|name| QueueDefinition {
            name: name.clone(),
            durable: self.durable,
            delete: self.delete,
            queue_type: self.queue_type,
            ..Default::default()
        })
    }

    /// Derives the `queue.declare` arguments.
    pub fn arguments(&self) -> BTreeMap<String, QueueArgument> {
        let mut args = BTreeMap::new();

        if self.queue_type == QueueType::Quorum {
            args.insert(
                AMQP_HEADERS_QUEUE_TYPE.to_owned(),
                QueueArgument::Str(self.queue_type.to_string()),
            );
        }

        if let Some(max) = self.max_priority {
            args.insert(
                AMQP_HEADERS_MAX_PRIORITY.to_owned(),
                QueueArgument::Int(i64::from(max)),
            );
        }

        if self.single_active_consumer {
            args.insert(
                AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER.to_owned(),
                QueueArgument::Bool(true),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), QueueArgument::Int(max));
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                QueueArgument::Int(max),
            );
        }

        if let Some(dlq) = &self.dlq_name {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                QueueArgument::Str(String::new()),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                QueueArgument::Str(dlq.clone()),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_reject_unknown_queue_type() {
        let kind: QueueType = serde_json::from_str("\"quorum\"").unwrap();
        assert_eq!(kind, QueueType::Quorum);
        assert!(serde_json::from_str::<QueueType>("\"invalid\"").is_err());
    }

    #[test]
    fn should_force_quorum_queues_durable() {
        let def = QueueDefinition::new("q").delete().queue_type(QueueType::Quorum);

        assert!(def.durable);
        assert!(!def.delete);
        assert_eq!(
            def.arguments().get(AMQP_HEADERS_QUEUE_TYPE),
            Some(&QueueArgument::Str("quorum".to_owned()))
        );
    }

    #[test]
    fn should_leave_classic_queue_without_arguments() {
        let def = QueueDefinition::new("q").durable();
        assert!(def.arguments().is_empty());
    }

    #[test]
    fn should_derive_priority_and_single_active_consumer_arguments() {
        let args = QueueDefinition::new("q")
            .max_priority(5)
            .single_active_consumer()
            .max_length(100)
            .arguments();

        assert_eq!(
            args.get(AMQP_HEADERS_MAX_PRIORITY),
            Some(&QueueArgument::Int(5))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER),
            Some(&QueueArgument::Bool(true))
        );
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH), Some(&QueueArgument::Int(100)));
    }

    #[test]
    fn should_route_dead_letters_to_the_dlq() {
        let def = QueueDefinition::new("orders").durable().with_dlq();
        let args = def.arguments();

        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&QueueArgument::Str("orders-dlq".to_owned()))
        );

        let dlq = def.dlq().unwrap();
        assert_eq!(dlq.name, "orders-dlq");
        assert!(dlq.durable);
        assert!(dlq.arguments().is_empty());
    }
}
