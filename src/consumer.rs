// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module processes a single delivery: it maps the wire message into a
//! [`NewMessage`], runs the subscription handler under a consumer trace span and
//! settles the delivery according to the handler result.
//!
//! Handler errors never leave this module; they only decide between ack and nack.

use crate::{
    broker::{BrokerChannel, Delivery},
    dispatcher::RabbitMQDispatcherDefinition,
    errors::AmqpError,
    message::{self, NewMessage},
    otel,
};
use async_trait::async_trait;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, future::Future, marker::PhantomData, sync::Arc};
use tracing::{debug, error, warn};

/// Application callback invoked for every delivered message.
///
/// The context carries the trace context of the message and the component's
/// shutdown token (see [`otel::cancellation`]).
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &NewMessage) -> Result<(), AmqpError>;
}

/// Adapts an async closure into a [`ConsumerHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F, Fut>
where
    F: Fn(Context, NewMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn exec(&self, ctx: &Context, msg: &NewMessage) -> Result<(), AmqpError> {
        (self.f)(ctx.clone(), msg.clone()).await
    }
}

/// Wraps an async closure as a shared handler.
///
/// # Parameters
/// * `f` - Called with the message context and an owned copy of the message
///
/// # Returns
/// A handler ready to pass to `subscribe`
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Context, NewMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

/// Runs the handler for `delivery` and acks or nacks it on `channel`.
///
/// Under auto-ack the delivery is already settled and the handler result is only
/// recorded on the span.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    channel: Arc<dyn BrokerChannel>,
    def: &RabbitMQDispatcherDefinition,
) -> Result<(), AmqpError> {
    let sub = &def.subscription;

    let (ctx, mut span) = otel::new_span(
        &delivery.message.properties.headers,
        tracer,
        &sub.topic,
        def.shutdown.clone(),
    );

    debug!(
        topic = sub.topic.as_str(),
        queue = sub.queue.name.as_str(),
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "received message"
    );

    let metadata = message::to_metadata(&delivery, def.properties_to_metadata);
    let tag = delivery.delivery_tag;
    let msg = NewMessage {
        topic: sub.topic.clone(),
        data: delivery.message.body,
        metadata,
    };

    let result = def.handler.exec(&ctx, &msg).await;

    if sub.auto_ack {
        match result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                warn!(error = err.to_string(), "handler failed on auto-ack subscription");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        return Ok(());
    }

    match result {
        Ok(()) => {
            if let Err(err) = channel.ack(tag).await {
                error!(error = err.to_string(), delivery_tag = tag, "error to ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(AmqpError::AckMessageError);
            }

            debug!(delivery_tag = tag, "message successfully processed");
            span.set_status(Status::Ok);
            Ok(())
        }

        Err(err) => {
            warn!(
                error = err.to_string(),
                delivery_tag = tag,
                requeue = sub.requeue_in_failure,
                "error handling msg, nacking"
            );
            span.record_error(&err);

            if let Err(nack_err) = channel.nack(tag, sub.requeue_in_failure).await {
                error!(error = nack_err.to_string(), delivery_tag = tag, "error to nack msg");
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                return Err(AmqpError::NackMessageError);
            }

            span.set_status(Status::Error {
                description: Cow::from("message nacked"),
            });
            Ok(())
        }
    }
}
