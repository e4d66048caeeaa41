// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod backoff;
pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;
pub mod transport;

pub use client::RabbitMQClient;
pub use configs::RabbitMQConfigs;
pub use errors::AmqpError;
pub use handler::{AckDecision, DeadLetterHandler, ErrorHook, MessageHandler, Params};
pub use queue::QueueConfig;
