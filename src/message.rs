// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Messages
//!
//! Request and message types exchanged with the application, and the mapping
//! between them and [`WireMessage`] properties.

use crate::{
    broker::{Delivery, MessageProperties, WireMessage},
    metadata::{PubSubMetadata, PublishMetadata},
};
use std::collections::HashMap;

/// Prefix of the metadata keys built from wire properties and headers.
pub const METADATA_PREFIX: &str = "metadata.";

/// A message to publish on `topic`. `metadata` holds the per-message options
/// (`messageID`, `ttlInSeconds`, `routingKey`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

impl PublishRequest {
    pub fn new(topic: &str, data: &[u8]) -> PublishRequest {
        PublishRequest {
            topic: topic.to_owned(),
            data: data.to_vec(),
            metadata: HashMap::default(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// A subscription to `topic` with its per-subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: String,
    pub metadata: HashMap<String, String>,
}

impl SubscribeRequest {
    pub fn new(topic: &str) -> SubscribeRequest {
        SubscribeRequest {
            topic: topic.to_owned(),
            metadata: HashMap::default(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// A delivered message handed to the application handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Builds the wire message for a publish. Unrecognized metadata keys were already
/// dropped while parsing `meta`.
pub(crate) fn to_wire(data: &[u8], meta: &PublishMetadata, component: &PubSubMetadata) -> WireMessage {
    let ttl = meta.ttl_in_seconds.or(component.ttl_in_seconds);

    WireMessage {
        body: data.to_vec(),
        properties: MessageProperties {
            message_id: meta.message_id.clone(),
            correlation_id: meta.correlation_id.clone(),
            kind: meta.kind.clone(),
            content_type: meta.content_type.clone(),
            delivery_mode: (component.delivery_mode > 0).then_some(component.delivery_mode),
            priority: meta.priority,
            expiration: ttl.map(|secs| secs.saturating_mul(1000).to_string()),
            headers: Default::default(),
        },
    }
}

/// Exposes the delivery properties and headers as `metadata.<name>` entries when
/// `enabled`; an empty map otherwise.
pub(crate) fn to_metadata(delivery: &Delivery, enabled: bool) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if !enabled {
        return metadata;
    }

    let props = &delivery.message.properties;
    let mut put = |name: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            metadata.insert(format!("{METADATA_PREFIX}{name}"), value);
        }
    };

    put("messageid", props.message_id.clone());
    put("correlationid", props.correlation_id.clone());
    put("type", props.kind.clone());
    put("contenttype", props.content_type.clone());
    put("priority", props.priority.map(|p| p.to_string()));
    put("deliverymode", props.delivery_mode.map(|m| m.to_string()));
    put("expiration", props.expiration.clone());

    for (key, value) in &props.headers {
        put(key.as_str(), Some(value.clone()));
    }

    metadata
}
