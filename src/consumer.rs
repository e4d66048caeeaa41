// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module handles a single delivery: it decodes the body, invokes the
//! business handler, maps the outcome to an acknowledgment action and applies
//! it on the channel the delivery came from. Failures of the business code are
//! reported and settled here; only transport failures propagate, so the
//! supervisors can reconnect.

use crate::{
    errors::AmqpError,
    handler::{AckDecision, DeadLetterHandler, ErrorHook, HandlerError, MessageHandler, Params},
    otel,
    transport::{AmqpChannel, Delivery},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, future::Future, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Protocol action applied to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

impl AckAction {
    /// Applies the action for `delivery_tag` on `channel`.
    pub async fn apply(
        self,
        channel: &dyn AmqpChannel,
        delivery_tag: u64,
    ) -> Result<(), AmqpError> {
        let result = match self {
            AckAction::Ack => channel.basic_ack(delivery_tag).await,
            AckAction::Nack { requeue } => channel.basic_nack(delivery_tag, requeue).await,
            AckAction::Reject { requeue } => channel.basic_reject(delivery_tag, requeue).await,
        };

        result.map_err(|err| {
            error!(error = err.to_string(), action = ?self, "error whiling settle msg");
            match self {
                AckAction::Ack => AmqpError::AckMessageError(err.to_string()),
                AckAction::Nack { .. } => AmqpError::NackMessageError(err.to_string()),
                AckAction::Reject { .. } => AmqpError::RejectMessageError(err.to_string()),
            }
        })
    }
}

/// Handler a delivery is routed to.
#[derive(Clone, Copy)]
pub(crate) enum Route<'h> {
    Primary(&'h dyn MessageHandler),
    DeadLetter(Option<&'h dyn DeadLetterHandler>),
}

/// Primary queue mapping.
///
/// `Nack` and `Reject` both requeue; handler defects drop the message.
pub fn primary_action(outcome: &Result<AckDecision, AmqpError>) -> AckAction {
    match outcome {
        Ok(AckDecision::Ack) => AckAction::Ack,
        Ok(AckDecision::Nack) => AckAction::Nack { requeue: true },
        Ok(AckDecision::Reject) => AckAction::Reject { requeue: true },
        Err(_) => AckAction::Reject { requeue: false },
    }
}

/// Dead-letter queue mapping.
///
/// Decisions map like the primary queue. A failing dead-letter handler nacks
/// without requeue: the message is not redelivered and the loop keeps going.
pub fn dead_letter_action(outcome: &Result<AckDecision, AmqpError>) -> AckAction {
    match outcome {
        Err(_) => AckAction::Nack { requeue: false },
        ok => primary_action(ok),
    }
}

/// Decodes a message body as a JSON object.
pub fn decode(data: &[u8]) -> Result<Params, AmqpError> {
    serde_json::from_slice::<Params>(data)
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}

/// Runs a handler future, turning errors and panics into `AmqpError`s.
pub(crate) async fn invoke<F>(fut: F) -> Result<AckDecision, AmqpError>
where
    F: Future<Output = Result<AckDecision, HandlerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(decision)) => Ok(decision),
        Ok(Err(err)) => Err(AmqpError::HandlerError(err.to_string())),
        Err(panic) => Err(AmqpError::HandlerPanicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Consumes and settles one delivery.
///
/// 1. Opens a consumer span from the propagated trace context
/// 2. Decodes the body; undecodable messages are rejected without requeue
/// 3. Invokes the routed handler
/// 4. Maps the outcome to an `AckAction` and applies it
///
/// Handler and decoding failures are reported through `hook` and do not fail
/// the call. An `Err` means the action could not be applied on the channel.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    channel: &dyn AmqpChannel,
    route: Route<'_>,
    queue: &str,
    hook: &dyn ErrorHook,
) -> Result<AckAction, AmqpError> {
    let (_ctx, mut span) = otel::new_span(&delivery.headers, tracer, queue);

    debug!(
        "received: {} - exchange: {}",
        delivery.delivery_tag, delivery.exchange,
    );

    let outcome = match decode(&delivery.data) {
        Err(err) => Err(err),
        Ok(params) => match route {
            Route::Primary(handler) => invoke(handler.handle(params)).await,
            Route::DeadLetter(Some(handler)) => invoke(handler.dlx_handle(params)).await,
            Route::DeadLetter(None) => {
                let err = AmqpError::MissingDeadLetterHandler(queue.to_owned());
                warn!("{}", err);
                hook.error(&err);
                return settle(AckAction::Ack, delivery, channel, &mut span).await;
            }
        },
    };

    let action = match route {
        Route::Primary(_) => primary_action(&outcome),
        Route::DeadLetter(_) => dead_letter_action(&outcome),
    };

    match &outcome {
        Ok(decision) => debug!(queue, decision = ?decision, "message processed"),
        Err(err) => {
            error!(error = err.to_string(), queue, "removing message from queue");
            span.record_error(err);
            span.set_status(Status::error(err.to_string()));
            hook.error(err);
        }
    }

    settle(action, delivery, channel, &mut span).await
}

async fn settle<S: Span>(
    action: AckAction,
    delivery: &Delivery,
    channel: &dyn AmqpChannel,
    span: &mut S,
) -> Result<AckAction, AmqpError> {
    match action.apply(channel, delivery.delivery_tag).await {
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::error("error to settle msg"));
            Err(err)
        }
        Ok(()) => {
            if action == AckAction::Ack {
                span.set_status(Status::Ok);
            }
            Ok(action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::RabbitMQConfigs,
        testing::{json_body, FakeBroker, RecordingHook, ScriptedHandler},
        transport::{AmqpChannel, Transport},
    };
    use futures_util::StreamExt;
    use opentelemetry::global;
    use std::sync::Arc;

    #[test]
    fn primary_mapping() {
        assert_eq!(primary_action(&Ok(AckDecision::Ack)), AckAction::Ack);
        assert_eq!(
            primary_action(&Ok(AckDecision::Nack)),
            AckAction::Nack { requeue: true }
        );
        assert_eq!(
            primary_action(&Ok(AckDecision::Reject)),
            AckAction::Reject { requeue: true }
        );
        assert_eq!(
            primary_action(&Err(AmqpError::HandlerPanicked("boom".into()))),
            AckAction::Reject { requeue: false }
        );
    }

    #[test]
    fn dead_letter_mapping() {
        assert_eq!(dead_letter_action(&Ok(AckDecision::Ack)), AckAction::Ack);
        assert_eq!(
            dead_letter_action(&Ok(AckDecision::Reject)),
            AckAction::Reject { requeue: true }
        );
        assert_eq!(
            dead_letter_action(&Err(AmqpError::HandlerError("boom".into()))),
            AckAction::Nack { requeue: false }
        );
    }

    #[test]
    fn decode_requires_json_object() {
        assert!(decode(br#"{"id":1}"#).is_ok());
        assert!(matches!(
            decode(b"[1,2]"),
            Err(AmqpError::ParsePayloadError(_))
        ));
        assert!(matches!(decode(b"\xff"), Err(AmqpError::ParsePayloadError(_))));
    }

    #[tokio::test]
    async fn invoke_catches_panics() {
        let outcome = invoke(async {
            if true {
                panic!("handler exploded");
            }
            Ok(AckDecision::Ack)
        })
        .await;
        assert_eq!(
            outcome,
            Err(AmqpError::HandlerPanicked("handler exploded".into()))
        );

        let outcome = invoke(async { Err::<AckDecision, HandlerError>("bad input".into()) }).await;
        assert_eq!(outcome, Err(AmqpError::HandlerError("bad input".into())));
    }

    async fn channel_with(broker: &FakeBroker, bodies: &[Vec<u8>]) -> Arc<dyn AmqpChannel> {
        broker.add_queue("orders");
        for body in bodies {
            broker.push_raw("orders", body.clone());
        }
        let conn = broker.connect(&RabbitMQConfigs::default()).await.unwrap();
        conn.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn settles_each_outcome_on_the_channel() {
        let broker = FakeBroker::new();
        let bodies = vec![
            json_body("ack"),
            json_body("nack"),
            json_body("reject"),
            json_body("fail"),
            json_body("panic"),
            b"not json".to_vec(),
        ];
        let channel = channel_with(&broker, &bodies).await;
        let mut stream = channel.basic_consume("orders", "orders").await.unwrap();
        let handler = ScriptedHandler::default();
        let hook = RecordingHook::default();
        let tracer = global::tracer("test");

        let mut actions = vec![];
        for _ in 0..bodies.len() {
            let delivery = stream.next().await.unwrap().unwrap();
            actions.push(
                consume(
                    &tracer,
                    &delivery,
                    channel.as_ref(),
                    Route::Primary(&handler),
                    "orders",
                    &hook,
                )
                .await
                .unwrap(),
            );
        }

        assert_eq!(
            actions,
            vec![
                AckAction::Ack,
                AckAction::Nack { requeue: true },
                AckAction::Reject { requeue: true },
                AckAction::Reject { requeue: false },
                AckAction::Reject { requeue: false },
                AckAction::Reject { requeue: false },
            ]
        );
        assert_eq!(
            broker.acks().iter().map(|r| r.action).collect::<Vec<_>>(),
            actions
        );

        let reported = hook.errors();
        assert_eq!(reported.len(), 3);
        assert!(matches!(reported[0], AmqpError::HandlerError(_)));
        assert!(matches!(reported[1], AmqpError::HandlerPanicked(_)));
        assert!(matches!(reported[2], AmqpError::ParsePayloadError(_)));
    }

    #[tokio::test]
    async fn missing_dead_letter_handler_auto_acks() {
        let broker = FakeBroker::new();
        let channel = channel_with(&broker, &[json_body("nack")]).await;
        let mut stream = channel.basic_consume("orders", "orders").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        let hook = RecordingHook::default();

        let action = consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            Route::DeadLetter(None),
            "orders",
            &hook,
        )
        .await
        .unwrap();

        assert_eq!(action, AckAction::Ack);
        assert_eq!(
            hook.errors(),
            vec![AmqpError::MissingDeadLetterHandler("orders".into())]
        );
    }

    #[tokio::test]
    async fn settle_failure_propagates() {
        let broker = FakeBroker::new();
        let channel = channel_with(&broker, &[json_body("ack")]).await;
        let mut stream = channel.basic_consume("orders", "orders").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.drop_connections();

        let err = consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            Route::Primary(&ScriptedHandler::default()),
            "orders",
            &RecordingHook::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AmqpError::AckMessageError(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn unknown_delivery_tag_fails_the_reject() {
        let broker = FakeBroker::new();
        let channel = channel_with(&broker, &[]).await;

        let err = AckAction::Reject { requeue: false }
            .apply(channel.as_ref(), 99)
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::RejectMessageError(_)));
        assert!(!channel.is_open());
    }
}
