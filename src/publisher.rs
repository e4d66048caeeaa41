// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes JSON messages to the business exchange of a queue.
//! Publishing never retries: the resource is acquired with a fail-fast policy
//! and any failure is reported through the error hook and answered with
//! `false`, leaving the decision to retry to the caller.

use crate::{
    errors::AmqpError,
    handler::ErrorHook,
    otel,
    queue::QueueConfig,
    registry::{Registry, Resource},
    transport::Envelope,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes to the exchange of one [`QueueConfig`].
pub struct RabbitMQPublisher {
    registry: Arc<Registry>,
    queue: Arc<QueueConfig>,
    hook: Arc<dyn ErrorHook>,
}

impl RabbitMQPublisher {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<QueueConfig>,
        hook: Arc<dyn ErrorHook>,
    ) -> RabbitMQPublisher {
        RabbitMQPublisher {
            registry,
            queue,
            hook,
        }
    }

    /// Publishes `msg` as a persistent JSON message.
    ///
    /// `delay_secs > 0` sets the `x-delay` header in milliseconds; only a
    /// delayed-message exchange honours it. The routing key is the queue name.
    ///
    /// # Returns
    /// `true` once the broker accepted the message, `false` on any failure
    pub async fn publish<T>(&self, msg: &T, delay_secs: u64) -> bool
    where
        T: Serialize + ?Sized,
    {
        let body = match serde_json::to_vec(msg) {
            Ok(body) => body,
            Err(err) => {
                let err = AmqpError::SerializePayloadError(err.to_string());
                error!(error = err.to_string(), "error to serialize the message");
                self.hook.error(&err);
                return false;
            }
        };

        let policy = self.registry.configs().retry_policy().fail_fast();
        let resource = Resource::Primary(&self.queue);
        let channel = match self
            .registry
            .acquire(resource, &policy, self.hook.as_ref())
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "publisher has no channel");
                // failed attempts were already reported by the registry
                if matches!(err, AmqpError::ConnectInProgress(_)) {
                    self.hook.error(&err);
                }
                return false;
            }
        };

        let envelope = Envelope::new(body)
            .delay_secs(delay_secs)
            .message_id(Uuid::new_v4().to_string())
            .headers(otel::inject_current());
        let exchange = self.queue.exchange_name();
        let routing_key = self.queue.routing_key();

        match channel
            .basic_publish(&exchange, &routing_key, &envelope)
            .await
        {
            Ok(()) => {
                debug!(
                    exchange = exchange.as_str(),
                    routing_key = routing_key.as_str(),
                    "message published"
                );
                true
            }
            Err(err) => {
                let err = AmqpError::PublishingError(err.to_string());
                error!(error = err.to_string(), "error publishing message");
                self.registry.teardown(&resource.key()).await;
                self.hook.error(&err);
                false
            }
        }
    }
}
