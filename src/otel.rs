// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module propagates trace context through message headers. Publishing injects
//! the caller's context; every delivery gets a consumer span started from the
//! extracted context.
//!
//! The context handed to handlers also carries the component's shutdown token, see
//! [`cancellation`].

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tokio_util::sync::CancellationToken;

/// Adapter injecting and extracting OpenTelemetry context into string headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `headers` with the global propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Extracts the remote context from `headers` and starts a consumer span under it.
///
/// The returned context carries `shutdown`.
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
    shutdown: CancellationToken,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx.with_value(shutdown), span)
}

/// The shutdown token of the component that delivered the message. Cancelled once
/// the component is closed.
pub fn cancellation(ctx: &Context) -> Option<&CancellationToken> {
    ctx.get::<CancellationToken>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_lowercase_injected_keys() {
        let mut headers = BTreeMap::new();
        RabbitMQTracePropagator::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        let propagator = RabbitMQTracePropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn should_carry_shutdown_token_in_context() {
        let token = CancellationToken::new();
        let tracer = global::tracer("test");

        let (ctx, _span) = new_span(&BTreeMap::new(), &tracer, "topic", token.clone());
        token.cancel();

        assert!(cancellation(&ctx).is_some_and(|t| t.is_cancelled()));
    }
}
