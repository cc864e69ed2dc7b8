// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod publisher;

pub mod broker;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod metadata;
pub mod otel;
pub mod pubsub;
pub mod queue;
pub mod topology;

pub use consumer::{handler_fn, ConsumerHandler};
pub use pubsub::RabbitMQPubSub;
