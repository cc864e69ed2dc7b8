// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capabilities
//!
//! This module defines the contracts every other part of the crate talks to the broker
//! through: a `BrokerConnection`, a `BrokerChannel` multiplexed over it, and a `Dialer`
//! producing fresh connection/channel pairs. None of these types mention a concrete
//! client library, so the lapin-backed implementation in [`crate::channel`] and the
//! in-memory broker in [`crate::memory`] are interchangeable.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Wire-level message properties.
///
/// Headers are exposed as strings; the broker implementations are responsible for
/// converting the native AMQP field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub kind: Option<String>,
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message as it travels on the wire: body plus properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message delivered to a consumer.
///
/// The delivery tag is only meaningful on the channel that produced the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: WireMessage,
}

/// Stream of deliveries for one consumer. The stream ends (or yields an error) when
/// the channel or the connection under it is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A freshly dialed connection together with the channel opened on it.
pub type ConnectionPair = (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>);

/// Options used for every dial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialOptions {
    pub uri: String,
    pub connection_name: Option<String>,
    pub heartbeat: Duration,
    pub sasl_external: bool,
    pub ca_cert: Option<String>,
}

/// Transport-level session with the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Health check: whether the connection is still usable.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Multiplexed session over a connection, used for every AMQP method.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes a message; resolves once the broker confirmed it when the channel
    /// is in confirm mode.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &WireMessage,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Produces a new connection/channel pair on every call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, opts: &DialOptions) -> Result<ConnectionPair, AmqpError>;
}
