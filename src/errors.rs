// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error types used across the crate. `TransportError`
//! is what the transport seam reports, `AmqpError` is what the registry,
//! publisher and supervisors report through the error hook, and `ErrorKind`
//! groups `AmqpError` variants into the families that drive retry decisions.

use thiserror::Error;

/// Errors reported by a transport implementation.
///
/// Every variant belongs to the transport's transient-error family: the
/// supervisors react to them by tearing the resource down and reconnecting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection
    #[error("failure to connect `{0}`")]
    Unreachable(String),

    /// The connection was closed by the peer or the network
    #[error("connection closed `{0}`")]
    ConnectionClosed(String),

    /// The channel was closed, usually by the server on a protocol violation
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// A passive declaration did not find the resource
    #[error("resource not found `{0}`")]
    NotFound(String),

    /// Any other protocol level failure
    #[error("protocol failure `{0}`")]
    Protocol(String),

    /// The operation did not complete in time
    #[error("timed out `{0}`")]
    Timeout(String),
}

/// Families of failures, used to decide between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport unreachable, auth or topology setup failure
    ConnectFailure,
    /// Connection or channel lost during active use
    TransientBroker,
    /// The business handler failed for one message
    HandlerDefect,
    /// The message body could not be decoded or encoded
    Encoding,
    /// Local defects that retrying cannot fix
    Internal,
}

/// Represents errors that can occur while running the client.
///
/// Each variant provides context about the operation that failed. Variants
/// carry rendered messages so the type stays comparable in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Another caller is connecting the same resource and did not finish in time
    #[error("connection to `{0}` is still being established")]
    ConnectInProgress(String),

    /// Connect attempts for a resource were exhausted
    #[error("failure to connect after {attempts} retries `{reason}`")]
    RetriesExhausted { attempts: u32, reason: String },

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

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

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// The business handler returned an error
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// The business handler panicked
    #[error("handler panicked `{0}`")]
    HandlerPanicked(String),

    /// Dead-lettering is enabled but no dead-letter handler was registered
    #[error("no dead-letter handler registered, message on `{0}` auto-acknowledged")]
    MissingDeadLetterHandler(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(String),

    /// The connection or channel was lost while consuming
    #[error("connection lost `{0}`")]
    ConnectionLost(String),

    /// The dead-letter worker task stopped
    #[error("dead-letter worker exited `{0}`")]
    DeadLetterWorkerExited(String),
}

impl AmqpError {
    /// Classifies the error into its failure family.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ConnectionError(_)
            | AmqpError::ConnectInProgress(_)
            | AmqpError::RetriesExhausted { .. }
            | AmqpError::ChannelError(_)
            | AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingExchangeToQueueError(_, _) => ErrorKind::ConnectFailure,

            AmqpError::QoSDeclarationError(_)
            | AmqpError::BindingConsumerError(_)
            | AmqpError::PublishingError(_)
            | AmqpError::AckMessageError(_)
            | AmqpError::NackMessageError(_)
            | AmqpError::RejectMessageError(_)
            | AmqpError::ConnectionLost(_) => ErrorKind::TransientBroker,

            AmqpError::HandlerError(_)
            | AmqpError::HandlerPanicked(_)
            | AmqpError::MissingDeadLetterHandler(_) => ErrorKind::HandlerDefect,

            AmqpError::SerializePayloadError(_) | AmqpError::ParsePayloadError(_) => {
                ErrorKind::Encoding
            }

            AmqpError::DeadLetterWorkerExited(_) => ErrorKind::Internal,
        }
    }

    /// Whether a supervision loop should tear down and retry after this error.
    ///
    /// Exhausted connect retries are final: the consumer stops instead of
    /// looping on a broker it was told to give up on.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AmqpError::RetriesExhausted { .. } => false,
            other => matches!(
                other.kind(),
                ErrorKind::ConnectFailure | ErrorKind::TransientBroker
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_losses_are_recoverable() {
        let lost = TransportError::ConnectionClosed("peer".into());
        let err = AmqpError::ConnectionLost(lost.to_string());
        assert_eq!(err.kind(), ErrorKind::TransientBroker);
        assert!(err.is_recoverable());
        assert!(AmqpError::NackMessageError("406".into()).is_recoverable());
    }

    #[test]
    fn exhausted_retries_are_final() {
        let err = AmqpError::RetriesExhausted {
            attempts: 5,
            reason: "refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn handler_defects_never_drive_retries() {
        assert!(!AmqpError::HandlerPanicked("boom".into()).is_recoverable());
        assert!(!AmqpError::ParsePayloadError("eof".into()).is_recoverable());
        assert!(!AmqpError::DeadLetterWorkerExited("orders_dlx".into()).is_recoverable());
    }
}
