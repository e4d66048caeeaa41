// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs the supervised receive loop of a queue. The dispatcher
//! acquires the queue's resource, consumes one message at a time (prefetch 1),
//! hands each one to the [`MessageHandler`] and settles it according to the
//! handler's decision.
//!
//! Losing the connection is not an error for the caller: the loop reports it,
//! tears the resource down, backs off and starts over. Only a non-recoverable
//! failure (connect retries exhausted) ends [`RabbitMQDispatcher::consume`]
//! with an error.
//!
//! When dead-lettering is enabled and isolated, the dispatcher also owns the
//! [`DeadLetterSupervisor`] of the queue and restarts its worker whenever it
//! finds it stopped.

use crate::{
    backoff::sleep_or_cancel,
    consumer::{self, Route},
    dead_letter::{DeadLetterSupervisor, DeadLetterWorker},
    errors::AmqpError,
    handler::{DeadLetterHandler, ErrorHook, MessageHandler},
    queue::QueueConfig,
    registry::{Registry, Resource},
    transport::AmqpChannel,
};
use futures_util::StreamExt;
use opentelemetry::global::{self, BoxedTracer};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervised consumer of one queue.
pub struct RabbitMQDispatcher {
    registry: Arc<Registry>,
    queue: Arc<QueueConfig>,
    handler: Arc<dyn MessageHandler>,
    dead_letter_handler: Option<Arc<dyn DeadLetterHandler>>,
    hook: Arc<dyn ErrorHook>,
    shutdown: CancellationToken,
    dead_letter_restarts: Arc<AtomicU32>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher that stops when `shutdown` is cancelled.
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<QueueConfig>,
        handler: Arc<dyn MessageHandler>,
        hook: Arc<dyn ErrorHook>,
        shutdown: CancellationToken,
    ) -> RabbitMQDispatcher {
        RabbitMQDispatcher {
            registry,
            queue,
            handler,
            dead_letter_handler: None,
            hook,
            shutdown,
            dead_letter_restarts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Handler of the isolated dead-letter worker. Without one, dead letters
    /// are acknowledged and reported.
    pub fn with_dead_letter_handler(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letter_handler = Some(handler);
        self
    }

    /// How many times the dead-letter worker was restarted.
    pub fn dead_letter_restarts(&self) -> u32 {
        self.dead_letter_restarts.load(Ordering::Acquire)
    }

    fn dead_letter_supervisor(&self) -> Option<DeadLetterSupervisor> {
        if !self.queue.enable_dlx || !self.registry.configs().isolate_dead_letter {
            return None;
        }

        let worker = DeadLetterWorker::new(
            self.registry.clone(),
            self.queue.clone(),
            self.dead_letter_handler.clone(),
            self.hook.clone(),
        );
        Some(DeadLetterSupervisor::new(
            Arc::new(worker),
            &self.shutdown,
            self.dead_letter_restarts.clone(),
            self.hook.clone(),
        ))
    }

    /// Consumes the queue.
    ///
    /// `max_count == 0` consumes until the shutdown token is cancelled;
    /// otherwise the call returns once exactly `max_count` messages were
    /// acknowledged, negatively acknowledged or rejected.
    ///
    /// On return the dead-letter worker is stopped (aborted after
    /// `shutdown_grace`) and the queue's resource is released.
    ///
    /// # Returns
    /// The number of settled messages, or the error that stopped the loop
    pub async fn consume(&self, max_count: u64) -> Result<u64, AmqpError> {
        let configs = self.registry.configs();
        let policy = configs.retry_policy();
        let resource = Resource::Primary(&self.queue);
        let key = resource.key();
        let tracer = global::tracer("amqp consumer");

        let mut dead_letter = self.dead_letter_supervisor();
        if let Some(supervisor) = dead_letter.as_mut() {
            supervisor.start();
        }

        let mut processed = 0u64;
        let mut failures = 0u32;

        let outcome = loop {
            if let Some(supervisor) = dead_letter.as_mut() {
                supervisor.check();
            }

            let acquired = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(processed),
                acquired = self.registry.acquire(resource, &policy, self.hook.as_ref()) => acquired,
            };

            let err = match acquired {
                Ok(channel) => {
                    match self
                        .session(
                            &tracer,
                            channel,
                            max_count,
                            &mut processed,
                            &mut failures,
                            dead_letter.as_mut(),
                        )
                        .await
                    {
                        Ok(()) => break Ok(processed),
                        Err(err) => {
                            self.hook.error(&err);
                            err
                        }
                    }
                }
                Err(err) if err.is_recoverable() && policy.retries_enabled() => err,
                Err(err) => {
                    error!(error = err.to_string(), "consumer stopped");
                    if matches!(err, AmqpError::RetriesExhausted { .. }) {
                        self.hook.error(&err);
                    }
                    break Err(err);
                }
            };

            if !err.is_recoverable() {
                error!(error = err.to_string(), "consumer stopped");
                break Err(err);
            }

            self.registry.teardown(&key).await;
            failures = failures.saturating_add(1);
            let delay = policy.backoff(failures);
            warn!(
                error = err.to_string(),
                resource = %key,
                delay_ms = delay.as_millis() as u64,
                "consumer restarting"
            );

            if !sleep_or_cancel(&self.shutdown, delay).await {
                break Ok(processed);
            }
        };

        if let Some(supervisor) = dead_letter {
            supervisor.shutdown(configs.shutdown_grace()).await;
        }
        self.registry.release(&key).await;
        info!(resource = %key, processed, "consumer finished");

        outcome
    }

    async fn session(
        &self,
        tracer: &BoxedTracer,
        channel: Arc<dyn AmqpChannel>,
        max_count: u64,
        processed: &mut u64,
        failures: &mut u32,
        mut dead_letter: Option<&mut DeadLetterSupervisor>,
    ) -> Result<(), AmqpError> {
        let queue = self.queue.queue_name();

        channel.basic_qos(1).await.map_err(|err| {
            error!(error = err.to_string(), "failure to configure qos");
            AmqpError::QoSDeclarationError(err.to_string())
        })?;

        let mut deliveries = channel
            .basic_consume(&queue, &queue)
            .await
            .map_err(|err| AmqpError::BindingConsumerError(err.to_string()))?;
        *failures = 0;
        debug!(queue, "consuming");

        let mut monitor = tokio::time::interval(self.registry.configs().monitor_interval());
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if max_count > 0 && *processed >= max_count {
                return Ok(());
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = monitor.tick() => {
                    if let Some(supervisor) = dead_letter.as_deref_mut() {
                        supervisor.check();
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        consumer::consume(
                            tracer,
                            &delivery,
                            channel.as_ref(),
                            Route::Primary(self.handler.as_ref()),
                            &queue,
                            self.hook.as_ref(),
                        )
                        .await?;
                        *processed += 1;

                        if let Some(supervisor) = dead_letter.as_deref_mut() {
                            supervisor.check();
                        }
                    }
                    Some(Err(err)) => return Err(AmqpError::ConnectionLost(err.to_string())),
                    None => return Err(AmqpError::ConnectionLost(format!("{queue} consumer ended"))),
                },
            }
        }
    }
}
