// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Worker
//!
//! Consumes the dead-letter queue of a [`QueueConfig`] on its own resource,
//! so a slow or crashing dead-letter path never holds the primary channel.
//!
//! [`DeadLetterWorker::run`] is the receive loop. It can run inline, when the
//! host does its own isolation, or inside a tokio task owned by a
//! [`DeadLetterSupervisor`], which the primary consumer polls to restart a
//! worker that stopped.

use crate::{
    backoff::sleep_or_cancel,
    consumer::{self, Route},
    errors::AmqpError,
    handler::{DeadLetterHandler, ErrorHook},
    queue::QueueConfig,
    registry::{Registry, Resource},
    transport::AmqpChannel,
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::global::{self, BoxedTracer};
use std::{
    any::Any,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receive loop bound to the dead-letter queue.
pub struct DeadLetterWorker {
    registry: Arc<Registry>,
    queue: Arc<QueueConfig>,
    handler: Option<Arc<dyn DeadLetterHandler>>,
    hook: Arc<dyn ErrorHook>,
}

impl DeadLetterWorker {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<QueueConfig>,
        handler: Option<Arc<dyn DeadLetterHandler>>,
        hook: Arc<dyn ErrorHook>,
    ) -> DeadLetterWorker {
        DeadLetterWorker {
            registry,
            queue,
            handler,
            hook,
        }
    }

    pub fn queue_name(&self) -> String {
        self.queue.dlx_queue_name()
    }

    /// Closes the worker's connection and forgets the resource.
    pub async fn release(&self) {
        self.registry.release(&self.queue.dlx_resource_key()).await;
    }

    /// Consumes the dead-letter queue until `token` is cancelled or, when
    /// `max_count > 0`, until that many messages were settled.
    ///
    /// Failures never end the loop: they are reported, the resource is torn
    /// down and the loop waits `dead_letter_retry_delay` times the number of
    /// consecutive failures (capped by the retry policy) before going again.
    ///
    /// # Returns
    /// The number of settled messages
    pub async fn run(&self, token: &CancellationToken, max_count: u64) -> u64 {
        let configs = self.registry.configs();
        let policy = configs.retry_policy();
        let retry_delay = configs.dead_letter_retry_delay();
        let resource = Resource::DeadLetter(&self.queue);
        let key = resource.key();
        let tracer = global::tracer("amqp dead letter consumer");

        let mut processed = 0u64;
        let mut failures = 0u32;

        info!(queue = self.queue_name(), "dead-letter worker started");

        loop {
            let acquired = tokio::select! {
                _ = token.cancelled() => break,
                acquired = self.registry.acquire(resource, &policy, self.hook.as_ref()) => acquired,
            };

            let err = match acquired {
                Ok(channel) => {
                    match self
                        .session(&tracer, channel, token, max_count, &mut processed, &mut failures)
                        .await
                    {
                        Ok(()) => break,
                        Err(err) => {
                            self.hook.error(&err);
                            err
                        }
                    }
                }
                Err(err) => {
                    if matches!(err, AmqpError::RetriesExhausted { .. }) {
                        self.hook.error(&err);
                    }
                    err
                }
            };

            self.registry.teardown(&key).await;
            failures = failures.saturating_add(1);
            let delay = retry_delay
                .saturating_mul(failures)
                .min(policy.cap_duration().max(retry_delay));
            warn!(
                error = err.to_string(),
                queue = self.queue_name(),
                delay_ms = delay.as_millis() as u64,
                "dead-letter worker retrying"
            );

            if !sleep_or_cancel(token, delay).await {
                break;
            }
        }

        self.release().await;
        info!(queue = self.queue_name(), processed, "dead-letter worker stopped");
        processed
    }

    async fn session(
        &self,
        tracer: &BoxedTracer,
        channel: Arc<dyn AmqpChannel>,
        token: &CancellationToken,
        max_count: u64,
        processed: &mut u64,
        failures: &mut u32,
    ) -> Result<(), AmqpError> {
        let queue = self.queue_name();

        channel.basic_qos(1).await.map_err(|err| {
            error!(error = err.to_string(), "failure to configure qos");
            AmqpError::QoSDeclarationError(err.to_string())
        })?;

        let mut deliveries = channel
            .basic_consume(&queue, &format!("{queue}_consumer"))
            .await
            .map_err(|err| AmqpError::BindingConsumerError(err.to_string()))?;
        *failures = 0;
        debug!(queue, "consuming dead letters");

        loop {
            if max_count > 0 && *processed >= max_count {
                return Ok(());
            }

            let next = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    consumer::consume(
                        tracer,
                        &delivery,
                        channel.as_ref(),
                        Route::DeadLetter(self.handler.as_deref()),
                        &queue,
                        self.hook.as_ref(),
                    )
                    .await?;
                    *processed += 1;
                }
                Some(Err(err)) => return Err(AmqpError::ConnectionLost(err.to_string())),
                None => return Err(AmqpError::ConnectionLost(format!("{queue} consumer ended"))),
            }
        }
    }
}

/// Runs a [`DeadLetterWorker`] in its own task and restarts it when it stops.
pub struct DeadLetterSupervisor {
    worker: Arc<DeadLetterWorker>,
    token: CancellationToken,
    handle: Option<JoinHandle<u64>>,
    restarts: Arc<AtomicU32>,
    hook: Arc<dyn ErrorHook>,
}

impl DeadLetterSupervisor {
    /// The worker stops when `parent` is cancelled or on [`Self::shutdown`].
    pub fn new(
        worker: Arc<DeadLetterWorker>,
        parent: &CancellationToken,
        restarts: Arc<AtomicU32>,
        hook: Arc<dyn ErrorHook>,
    ) -> DeadLetterSupervisor {
        DeadLetterSupervisor {
            worker,
            token: parent.child_token(),
            handle: None,
            restarts,
            hook,
        }
    }

    /// Spawns the worker task unless one is running.
    pub fn start(&mut self) {
        if self.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let worker = self.worker.clone();
        let token = self.token.clone();
        self.handle = Some(tokio::spawn(async move { worker.run(&token, 0).await }));
    }

    /// Restarts a finished worker. Returns `true` when it did.
    pub fn check(&mut self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }

        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if !handle.is_finished() {
            return false;
        }

        let reason = match handle.now_or_never() {
            Some(Err(err)) if err.is_panic() => panic_reason(err.into_panic()),
            Some(Err(err)) => err.to_string(),
            Some(Ok(processed)) => format!("stopped after {processed} messages"),
            None => "stopped".to_owned(),
        };

        let err = AmqpError::DeadLetterWorkerExited(format!(
            "{}: {reason}",
            self.worker.queue_name()
        ));
        error!(error = err.to_string(), "restarting dead-letter worker");
        self.hook.error(&err);

        self.restarts.fetch_add(1, Ordering::AcqRel);
        self.handle = None;
        self.start();
        true
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Signals the worker and waits at most `grace` before aborting it.
    ///
    /// The dead-letter resource is released either way, so an aborted worker
    /// does not leave its connection or unsettled delivery behind.
    pub async fn shutdown(mut self, grace: Duration) {
        self.token.cancel();

        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    queue = self.worker.queue_name(),
                    "dead-letter worker did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        self.worker.release().await;
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_owned()
    }
}
