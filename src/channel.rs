// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of lapin connections and channels and adapts them
//! to the broker capabilities of [`crate::broker`]. Dialing honours the connection
//! name, heartbeat, SASL EXTERNAL and a custom CA chain for TLS.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, ConnectionPair, Delivery, DeliveryStream, DialOptions,
        Dialer, MessageProperties, WireMessage,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueArgument, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    publisher_confirm::Confirmation,
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Creates a new AMQP connection and a channel on it.
///
/// # Parameters
/// * `opts` - URI and dial options (connection name, heartbeat, SASL, TLS)
///
/// # Returns
/// The connection and channel on success, or a connection/channel error on failure.
pub async fn new_amqp_channel(opts: &DialOptions) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let mut options = ConnectionProperties::default();
    if let Some(name) = &opts.connection_name {
        options = options.with_connection_name(LongString::from(name.clone()));
    }

    let uri = dial_uri(opts);

    let connected = match &opts.ca_cert {
        Some(pem) => {
            let tls = OwnedTLSConfig {
                identity: None,
                cert_chain: Some(pem.clone()),
            };
            Connection::connect_with_config(&uri, options, tls).await
        }
        None => Connection::connect(&uri, options).await,
    };

    let conn = match connected {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// Appends the heartbeat and SASL mechanism to the URI query, unless the URI
/// already sets them.
fn dial_uri(opts: &DialOptions) -> String {
    let mut params = vec![];

    if !opts.heartbeat.is_zero() && !opts.uri.contains("heartbeat=") {
        params.push(format!("heartbeat={}", opts.heartbeat.as_secs()));
    }

    if opts.sasl_external && !opts.uri.contains("auth_mechanism=") {
        params.push("auth_mechanism=external".to_owned());
    }

    if params.is_empty() {
        return opts.uri.clone();
    }

    let separator = if opts.uri.contains('?') { '&' } else { '?' };
    format!("{}{}{}", opts.uri, separator, params.join("&"))
}

/// Dials RabbitMQ with lapin.
#[derive(Debug, Default)]
pub struct LapinDialer;

impl LapinDialer {
    pub fn new() -> Arc<LapinDialer> {
        Arc::new(LapinDialer)
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, opts: &DialOptions) -> Result<ConnectionPair, AmqpError> {
        let (conn, channel) = new_amqp_channel(opts).await?;

        Ok((
            Arc::new(LapinConnection { conn }),
            Arc::new(LapinChannel { channel }),
        ))
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            debug!(error = err.to_string(), "error closing connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: def.delete,
                    nowait: false,
                },
                field_table(def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &WireMessage,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                basic_properties(&msg.properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::ChannelError(err.to_string())
            })?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!(exchange = exchange, "message was nacked by the broker");
                Err(AmqpError::ChannelError("publish nacked by the broker".to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting publisher confirm");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    redelivered: delivery.redelivered,
                    message: WireMessage {
                        body: delivery.data,
                        properties: message_properties(&delivery.properties),
                    },
                }),
                Err(err) => Err(AmqpError::ChannelError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            debug!(error = err.to_string(), "error closing channel");
            AmqpError::ChannelError(err.to_string())
        })
    }
}

fn field_table(args: BTreeMap<String, QueueArgument>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in args {
        let value = match value {
            QueueArgument::Str(v) => AMQPValue::LongString(LongString::from(v)),
            QueueArgument::Int(v) => AMQPValue::LongLongInt(v),
            QueueArgument::Bool(v) => AMQPValue::Boolean(v),
        };
        table.insert(ShortString::from(key), value);
    }

    FieldTable::from(table)
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if let Some(v) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.kind {
        properties = properties.with_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = props.delivery_mode {
        properties = properties.with_delivery_mode(v);
    }
    if let Some(v) = props.priority {
        properties = properties.with_priority(v);
    }
    if let Some(v) = &props.expiration {
        properties = properties.with_expiration(ShortString::from(v.clone()));
    }

    if !props.headers.is_empty() {
        let headers = props
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();
        properties = properties.with_headers(FieldTable::from(headers));
    }

    properties
}

fn message_properties(props: &AMQPProperties) -> MessageProperties {
    let short = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_owned());

    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .map(|(k, v)| (k.as_str().to_owned(), amqp_value_to_string(v)))
            .collect(),
        None => BTreeMap::new(),
    };

    MessageProperties {
        message_id: short(props.message_id()),
        correlation_id: short(props.correlation_id()),
        kind: short(props.kind()),
        content_type: short(props.content_type()),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        expiration: short(props.expiration()),
        headers,
    }
}

fn amqp_value_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::Boolean(v) => v.to_string(),
        AMQPValue::ShortShortInt(v) => v.to_string(),
        AMQPValue::ShortShortUInt(v) => v.to_string(),
        AMQPValue::ShortInt(v) => v.to_string(),
        AMQPValue::ShortUInt(v) => v.to_string(),
        AMQPValue::LongInt(v) => v.to_string(),
        AMQPValue::LongUInt(v) => v.to_string(),
        AMQPValue::LongLongInt(v) => v.to_string(),
        AMQPValue::Float(v) => v.to_string(),
        AMQPValue::Double(v) => v.to_string(),
        AMQPValue::Timestamp(v) => v.to_string(),
        AMQPValue::ShortString(v) => v.as_str().to_owned(),
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn should_add_heartbeat_and_sasl_to_uri() {
        let opts = DialOptions {
            uri: "amqps://rabbit:5671/vhost".to_owned(),
            heartbeat: Duration::from_secs(10),
            sasl_external: true,
            ..Default::default()
        };

        assert_eq!(
            dial_uri(&opts),
            "amqps://rabbit:5671/vhost?heartbeat=10&auth_mechanism=external"
        );
    }

    #[test]
    fn should_keep_uri_query_untouched_when_already_set() {
        let opts = DialOptions {
            uri: "amqp://rabbit?heartbeat=30".to_owned(),
            heartbeat: Duration::from_secs(10),
            ..Default::default()
        };

        assert_eq!(dial_uri(&opts), "amqp://rabbit?heartbeat=30");
    }

    #[test]
    fn should_convert_field_values_to_strings() {
        assert_eq!(amqp_value_to_string(&AMQPValue::Boolean(true)), "true");
        assert_eq!(amqp_value_to_string(&AMQPValue::LongInt(42)), "42");
        assert_eq!(
            amqp_value_to_string(&AMQPValue::LongString(LongString::from("value"))),
            "value"
        );
    }
}
