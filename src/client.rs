// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! Entry point of the crate: binds a [`Registry`], a [`QueueConfig`] and an
//! [`ErrorHook`] together and hands out the publisher and consumers of the
//! queue.
//!
//! ```no_run
//! use rabbitmq_resilience::{
//!     client::RabbitMQClient, configs::RabbitMQConfigs, queue::QueueConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RabbitMQClient::new(
//!     RabbitMQConfigs::from_env()?,
//!     QueueConfig::new("orders").with_dlx(),
//! );
//! client.publish(&serde_json::json!({ "id": 42 }), 0).await;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::LapinTransport,
    configs::RabbitMQConfigs,
    dead_letter::DeadLetterWorker,
    dispatcher::RabbitMQDispatcher,
    handler::{DeadLetterHandler, ErrorHook, LogErrorHook, MessageHandler},
    publisher::RabbitMQPublisher,
    queue::QueueConfig,
    registry::Registry,
    transport::Transport,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct RabbitMQClient {
    registry: Arc<Registry>,
    queue: Arc<QueueConfig>,
    hook: Arc<dyn ErrorHook>,
    shutdown: CancellationToken,
}

impl RabbitMQClient {
    /// Client over `lapin`, with its own registry.
    pub fn new(configs: RabbitMQConfigs, queue: QueueConfig) -> RabbitMQClient {
        RabbitMQClient::with_transport(Arc::new(LapinTransport), configs, queue)
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        configs: RabbitMQConfigs,
        queue: QueueConfig,
    ) -> RabbitMQClient {
        RabbitMQClient::with_registry(Arc::new(Registry::new(transport, Arc::new(configs))), queue)
    }

    /// Client sharing `registry` with other clients. Each queue still gets its
    /// own connection.
    pub fn with_registry(registry: Arc<Registry>, queue: QueueConfig) -> RabbitMQClient {
        RabbitMQClient {
            registry,
            queue: Arc::new(queue),
            hook: Arc::new(LogErrorHook),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the default hook, which only logs.
    pub fn error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Token that stops every consumer created by this client.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    /// See [`RabbitMQPublisher::publish`].
    pub async fn publish<T>(&self, msg: &T, delay_secs: u64) -> bool
    where
        T: Serialize + ?Sized,
    {
        RabbitMQPublisher::new(self.registry.clone(), self.queue.clone(), self.hook.clone())
            .publish(msg, delay_secs)
            .await
    }

    /// Supervised consumer of the queue; run it with
    /// [`RabbitMQDispatcher::consume`].
    pub fn consumer(&self, handler: Arc<dyn MessageHandler>) -> RabbitMQDispatcher {
        RabbitMQDispatcher::new(
            self.registry.clone(),
            self.queue.clone(),
            handler,
            self.hook.clone(),
            self.shutdown.clone(),
        )
    }

    /// Runs the dead-letter loop in the calling task, for hosts that isolate
    /// it themselves (`isolate_dead_letter = false`).
    ///
    /// # Returns
    /// The number of settled dead letters once `max_count` is reached or the
    /// shutdown token is cancelled
    pub async fn consume_dead_letter(
        &self,
        handler: Option<Arc<dyn DeadLetterHandler>>,
        max_count: u64,
    ) -> u64 {
        DeadLetterWorker::new(
            self.registry.clone(),
            self.queue.clone(),
            handler,
            self.hook.clone(),
        )
        .run(&self.shutdown, max_count)
        .await
    }

    pub fn is_live(&self) -> bool {
        self.registry.is_live(&self.queue.resource_key())
    }

    /// Stops the consumers and closes every resource of the registry.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.registry.close_all().await;
        info!(queue = self.queue.queue_name(), "rabbitmq client closed");
    }
}
