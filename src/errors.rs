// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Pub/Sub Component
//!
//! This module provides the error taxonomy for every operation of the component.
//! Configuration problems are reported before any broker interaction, broker link
//! failures (connection and channel) feed the reconnect path, and handler failures
//! stay confined to the ack/nack decision of a single delivery.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ pub/sub operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid or missing component, subscribe or publish metadata
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The channel (or the connection under it) is not usable anymore
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Any reconnect attempted after the component was closed
    #[error("component is closed")]
    ClosedError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message to the given topic, after the single retry
    #[error("failure to publish to `{0}`: {1}")]
    PublishingError(String, Box<AmqpError>),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error returned by an application message handler
    #[error("handler failure: {0}")]
    HandlerError(String),
}

impl AmqpError {
    /// Whether the error can be cured by replacing the connection and channel.
    ///
    /// Validation errors, shutdown and handler failures never enter the
    /// reconnect path.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AmqpError::ConfigurationError(_) | AmqpError::ClosedError | AmqpError::HandlerError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_recoverable_errors() {
        assert!(AmqpError::ChannelError("closed".to_owned()).is_recoverable());
        assert!(AmqpError::ConnectionError("refused".to_owned()).is_recoverable());
        assert!(AmqpError::DeclareQueueError("q".to_owned()).is_recoverable());
        assert!(!AmqpError::ClosedError.is_recoverable());
        assert!(!AmqpError::ConfigurationError("x".to_owned()).is_recoverable());
        assert!(!AmqpError::HandlerError("x".to_owned()).is_recoverable());
    }

    #[test]
    fn should_render_publishing_error_with_cause() {
        let err = AmqpError::PublishingError("orders".to_owned(), Box::new(AmqpError::ClosedError));
        assert_eq!(err.to_string(), "failure to publish to `orders`: component is closed");
    }
}
