// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! Traits the resilience layer uses to talk to a broker. The crate ships a
//! `lapin` implementation in [`crate::channel`]; the registry, publisher and
//! supervisors only ever see these traits.

use crate::{
    configs::RabbitMQConfigs, errors::TransportError, exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, sync::Arc};

/// Header carrying the per-message delay for delayed exchanges
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of deliveries produced by a consumer registration.
///
/// An `Err` item, or the end of the stream, means the consumer is gone.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        cfg: &RabbitMQConfigs,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError>;
}

/// An open broker connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel opened on an [`AmqpConnection`].
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    /// Declares a queue. A passive declaration of a missing queue fails with
    /// [`TransportError::NotFound`] and leaves the channel closed.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), TransportError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub persistent: bool,
    pub delay_ms: u64,
    pub content_type: String,
    pub message_id: Option<String>,
    /// String headers, used for trace context propagation
    pub headers: HashMap<String, String>,
}

impl Envelope {
    /// Creates a persistent JSON envelope without delay.
    pub fn new(body: Vec<u8>) -> Envelope {
        Envelope {
            body,
            persistent: true,
            delay_ms: 0,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: None,
            headers: HashMap::default(),
        }
    }

    /// Delays delivery when published to a delayed exchange.
    pub fn delay_secs(mut self, secs: u64) -> Self {
        self.delay_ms = secs.saturating_mul(1000);
        self
    }

    pub fn message_id(mut self, id: String) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    /// String valued headers; other header types are dropped
    pub headers: HashMap<String, String>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            data,
            headers: HashMap::default(),
        }
    }
}
