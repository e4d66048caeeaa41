// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the transport seam over `lapin`. It establishes
//! connections to the RabbitMQ server, creates channels on them, and maps
//! `lapin` types and errors to the crate's own.

use crate::{
    configs::RabbitMQConfigs,
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MESSAGE_TTL,
    },
    transport::{
        AmqpChannel, AmqpConnection, Delivery, DeliveryStream, Envelope, Transport,
        AMQP_HEADERS_DELAY,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Transport backed by `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    /// Opens a connection using the URI rendered from `cfg`.
    ///
    /// The attempt is bounded by `cfg.connection_timeout()` so a publisher
    /// facing an unreachable broker fails within one attempt.
    async fn connect(
        &self,
        cfg: &RabbitMQConfigs,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app_name.clone()));

        let conn = match tokio::time::timeout(
            cfg.connection_timeout(),
            Connection::connect(&cfg.uri(), options),
        )
        .await
        {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(TransportError::Unreachable(err.to_string()))
            }
            Err(_) => {
                error!(host = cfg.host.as_str(), "connect attempt timed out");
                Err(TransportError::Timeout(format!("{}:{}", cfg.host, cfg.port)))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_error(err))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(map_error)
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        let mut params = BTreeMap::new();
        for (key, value) in def.params() {
            params.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }

        self.channel
            .exchange_declare(
                def.name(),
                lapin::ExchangeKind::from(def.exchange_kind()),
                ExchangeDeclareOptions {
                    passive: def.is_passive(),
                    durable: def.is_durable(),
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(params),
            )
            .await
            .map_err(map_error)
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        let mut queue_args = BTreeMap::new();

        if let Some(exchange) = def.dead_letter_exchange() {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange)),
            );
        }

        if let Some(key) = def.dead_letter_routing_key() {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key)),
            );
        }

        if let Some(ttl) = def.message_ttl() {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(LongLongInt::from(ttl)),
            );
        }

        self.channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: def.is_passive(),
                    durable: def.is_durable(),
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(map_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in &envelope.headers {
            headers.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        if envelope.delay_ms > 0 {
            headers.insert(
                ShortString::from(AMQP_HEADERS_DELAY),
                AMQPValue::LongLongInt(envelope.delay_ms.min(i64::MAX as u64) as LongLongInt),
            );
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.as_str()))
            .with_delivery_mode(if envelope.persistent {
                DELIVERY_MODE_PERSISTENT
            } else {
                DELIVERY_MODE_TRANSIENT
            })
            .with_headers(FieldTable::from(headers));
        if let Some(id) = &envelope.message_id {
            properties = properties.with_message_id(ShortString::from(id.as_str()));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(map_error)?
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                map_error(err)
            })?;

        Ok(consumer
            .map(|result| result.map(into_delivery).map_err(map_error))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(map_error)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(map_error)
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(map_error)
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let mut headers = HashMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                if let Ok(value) = std::str::from_utf8(value.as_bytes()) {
                    headers.insert(key.to_string(), value.to_owned());
                }
            }
        }
    }

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        data: delivery.data,
        headers,
    }
}

/// Maps `lapin` errors onto the transport error family.
fn map_error(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                TransportError::NotFound(err.to_string())
            }
            AMQPErrorKind::Soft(_) => TransportError::ChannelClosed(err.to_string()),
            AMQPErrorKind::Hard(_) => TransportError::ConnectionClosed(err.to_string()),
        },
        lapin::Error::InvalidChannelState(_) => TransportError::ChannelClosed(err.to_string()),
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            TransportError::ConnectionClosed(err.to_string())
        }
        _ => TransportError::Protocol(err.to_string()),
    }
}
