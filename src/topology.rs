// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares exchanges, queues, and the bindings between them.
//! Declarations follow a declare-or-verify pattern: a passive declaration is
//! tried first and only a missing resource is declared for real, so a queue
//! owned by another process with slightly different arguments is used as is
//! instead of failing the whole setup.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over the transport seam
//! - Header constants: Constants for RabbitMQ queue arguments

use crate::{
    errors::{AmqpError, TransportError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueConfig, QueueDefinition},
    transport::{AmqpChannel, AmqpConnection},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology through `channel`.
    ///
    /// A failed passive declaration closes the channel on the broker side, so
    /// the channel to keep using is returned.
    async fn install(
        &self,
        conn: &dyn AmqpConnection,
        channel: Arc<dyn AmqpChannel>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Exchanges, queues and bindings to declare, in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Business exchange, business queue (with dead-letter arguments when
    /// enabled) and the binding keyed by the queue name.
    pub fn business(cfg: &QueueConfig) -> AmqpTopology {
        let exchange = cfg.exchange_name();
        let queue = cfg.queue_name();

        AmqpTopology::new()
            .exchange(
                ExchangeDefinition::new(&exchange)
                    .kind(&cfg.exchange_kind)
                    .durable(cfg.durable),
            )
            .queue(cfg.queue_definition())
            .queue_binding(
                QueueBinding::new(&queue)
                    .exchange(&exchange)
                    .routing_key(&cfg.routing_key()),
            )
    }

    /// Dead-letter exchange, queue and binding.
    pub fn dead_letter(cfg: &QueueConfig) -> AmqpTopology {
        let exchange = cfg.dlx_exchange_name();
        let queue = cfg.dlx_queue_name();

        AmqpTopology::new()
            .exchange(ExchangeDefinition::new(&exchange).durable(true))
            .queue(cfg.dlx_queue_definition())
            .queue_binding(
                QueueBinding::new(&queue)
                    .exchange(&exchange)
                    .routing_key(&cfg.dlx_routing_key()),
            )
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(
        &self,
        conn: &dyn AmqpConnection,
        channel: Arc<dyn AmqpChannel>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = self.install_exchange(conn, channel).await?;
        let channel = self.install_queue(conn, channel).await?;
        self.binding_queues(channel.as_ref()).await?;
        Ok(channel)
    }
}

impl AmqpTopology {
    async fn install_exchange(
        &self,
        conn: &dyn AmqpConnection,
        mut channel: Arc<dyn AmqpChannel>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        for exch in &self.exchanges {
            match channel.exchange_declare(&exch.clone().passive()).await {
                Ok(()) => {
                    debug!("exchange: {} already exists", exch.name);
                    continue;
                }
                Err(TransportError::NotFound(_)) => {
                    debug!("creating exchange: {}", exch.name);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name.as_str(),
                        "error to verify the exchange"
                    );
                    return Err(AmqpError::DeclareExchangeError(exch.name.clone()));
                }
            }

            channel = reopen(conn, channel).await?;

            if let Err(err) = channel.exchange_declare(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                return Err(AmqpError::DeclareExchangeError(exch.name.clone()));
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(channel)
    }

    async fn install_queue(
        &self,
        conn: &dyn AmqpConnection,
        mut channel: Arc<dyn AmqpChannel>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        for def in &self.queues {
            match channel.queue_declare(&def.clone().passive()).await {
                Ok(()) => {
                    debug!("queue: {} already exists", def.name);
                    continue;
                }
                Err(TransportError::NotFound(_)) => {
                    debug!("creating queue: {}", def.name);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = def.name.as_str(),
                        "error to verify the queue"
                    );
                    return Err(AmqpError::DeclareQueueError(def.name.clone()));
                }
            }

            channel = reopen(conn, channel).await?;

            if let Err(err) = channel.queue_declare(def).await {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                return Err(AmqpError::DeclareQueueError(def.name.clone()));
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(channel)
    }

    async fn binding_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = channel.queue_bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ));
            }
        }

        Ok(())
    }
}

/// Replaces a channel the broker closed after a failed passive declaration.
async fn reopen(
    conn: &dyn AmqpConnection,
    old: Arc<dyn AmqpChannel>,
) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
    if old.is_open() {
        if let Err(err) = old.close().await {
            warn!(error = err.to_string(), "failure to close the verify channel");
        }
    }

    conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "error to create the channel");
        AmqpError::ChannelError(err.to_string())
    })
}
