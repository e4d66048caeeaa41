// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Contract
//!
//! Traits implemented by the application and invoked by the supervisors.
//! `MessageHandler` is required to build a consumer, `DeadLetterHandler` is
//! optional, and every reported failure goes through an `ErrorHook`.

use crate::errors::AmqpError;
use async_trait::async_trait;
use tracing::error;

/// Decoded message body handed to handlers.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Error a handler returns for a message it could not process.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business outcome of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Permanently consumed
    Ack,
    /// Transient failure, requeue for redelivery
    Nack,
    /// Not for this consumer right now, requeue so another consumer can try
    Reject,
}

/// Business logic for the primary queue.
///
/// A returned `Err` (or a panic) is a defect for this message: it is rejected
/// without requeue, since redelivering it to the same code would fail again.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, params: Params) -> Result<AckDecision, HandlerError>;
}

/// Business logic for the dead-letter queue.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn dlx_handle(&self, params: Params) -> Result<AckDecision, HandlerError>;
}

/// Observability hook called for every reported failure.
///
/// Implementations must not panic; the supervisors never retry based on it.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorHook: Send + Sync {
    fn error(&self, err: &AmqpError);
}

impl<F> ErrorHook for F
where
    F: Fn(&AmqpError) + Send + Sync,
{
    fn error(&self, err: &AmqpError) {
        self(err)
    }
}

/// Default hook: logs the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorHook;

impl ErrorHook for LogErrorHook {
    fn error(&self, err: &AmqpError) {
        error!(error = err.to_string(), kind = ?err.kind(), "rabbitmq client failure");
    }
}
