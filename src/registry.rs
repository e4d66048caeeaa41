// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Registry
//!
//! The registry owns every connection and channel the client opens, one pair
//! per [`ResourceKey`]. Publishers and consumers borrow a channel for a single
//! operation or session through [`Registry::acquire`], which also drives the
//! reconnection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |
//!                     +-> Disconnected -> (backoff) -> Connecting
//!                     +-> Failed
//! ```
//!
//! Only one caller per key may be `Connecting`. The others wait, bounded by
//! `connect_wait`, for the in-flight attempt and take its result.

use crate::{
    backoff::RetryPolicy,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    handler::ErrorHook,
    queue::{QueueConfig, ResourceKey},
    topology::{AmqpTopology, Topology},
    transport::{AmqpChannel, AmqpConnection, Transport},
};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Observable lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// The broker resource a caller wants a channel for.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// Business exchange and queue, plus the dead-letter topology when
    /// dead-lettering is enabled.
    Primary(&'a QueueConfig),
    /// Dead-letter exchange and queue only.
    DeadLetter(&'a QueueConfig),
}

impl Resource<'_> {
    /// Key the resource is registered under.
    pub fn key(&self) -> ResourceKey {
        match self {
            Resource::Primary(queue) => queue.resource_key(),
            Resource::DeadLetter(queue) => queue.dlx_resource_key(),
        }
    }

    fn topology(&self) -> AmqpTopology {
        match self {
            Resource::Primary(queue) => AmqpTopology::business(queue),
            Resource::DeadLetter(queue) => AmqpTopology::dead_letter(queue),
        }
    }

    fn auxiliary_topology(&self) -> Option<AmqpTopology> {
        match self {
            Resource::Primary(queue) if queue.enable_dlx => Some(AmqpTopology::dead_letter(queue)),
            _ => None,
        }
    }
}

struct ResourceEntry {
    connection: Arc<dyn AmqpConnection>,
    channel: Arc<dyn AmqpChannel>,
}

impl ResourceEntry {
    fn is_live(&self) -> bool {
        self.connection.is_connected() && self.channel.is_open()
    }

    async fn close(self) {
        if self.channel.is_open() {
            if let Err(err) = self.channel.close().await {
                warn!(error = err.to_string(), "failure to close the channel");
            }
        }
        if self.connection.is_connected() {
            if let Err(err) = self.connection.close().await {
                warn!(error = err.to_string(), "failure to close the connection");
            }
        }
    }
}

#[derive(Default)]
struct SlotInner {
    entry: Option<ResourceEntry>,
    state: ConnectionState,
}

#[derive(Default)]
struct ResourceSlot {
    connecting: AtomicBool,
    retries: AtomicU32,
    settled: Notify,
    inner: RwLock<SlotInner>,
}

impl ResourceSlot {
    fn live_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .entry
            .as_ref()
            .filter(|entry| entry.is_live())
            .map(|entry| entry.channel.clone())
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    fn state(&self) -> ConnectionState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    fn store(&self, entry: ResourceEntry) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entry = Some(entry);
        inner.state = ConnectionState::Connected;
    }

    fn take(&self) -> Option<ResourceEntry> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry
            .take()
    }
}

/// Clears the connecting flag and wakes the waiters, whatever way the
/// connecting caller leaves.
struct ConnectingGuard<'a> {
    slot: &'a ResourceSlot,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.slot.connecting.store(false, Ordering::Release);
        self.slot.settled.notify_waiters();
    }
}

/// Owner of all connections and channels, keyed by [`ResourceKey`].
pub struct Registry {
    transport: Arc<dyn Transport>,
    configs: Arc<RabbitMQConfigs>,
    slots: RwLock<HashMap<ResourceKey, Arc<ResourceSlot>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<ResourceKey> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("Registry").field("resources", &keys).finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    ///
    /// # Parameters
    /// * `transport` - Opens the broker connections
    /// * `configs` - Connection settings and retry tuning shared by every resource
    pub fn new(transport: Arc<dyn Transport>, configs: Arc<RabbitMQConfigs>) -> Registry {
        Registry {
            transport,
            configs,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Settings the registry connects with.
    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.configs
    }

    fn slot(&self, key: &ResourceKey) -> Arc<ResourceSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return slot.clone();
        }

        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, key: &ResourceKey) -> Option<Arc<ResourceSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns a live channel for `resource`, connecting if needed.
    ///
    /// A live resource is returned as is. Otherwise the caller that wins the
    /// connecting flag makes one attempt: it connects and installs the
    /// topology. The others wait for its outcome. A failed attempt is
    /// reported through `hook`, and under a retrying `policy` the caller
    /// releases the flag, backs off and competes for it again, so the
    /// resource stays `Disconnected` while nobody is connecting.
    ///
    /// # Errors
    /// - the attempt's own error when `policy` disables retries
    /// - `RetriesExhausted` once `policy.max_retry_connect()` retries failed
    /// - `ConnectInProgress` when another caller's attempt did not produce a
    ///   live channel within the wait bound: `connect_wait`, and no longer
    ///   than `connection_timeout` for a fail-fast `policy`
    ///
    /// # Parameters
    /// * `resource` - Which resource to connect and which topology to install
    /// * `policy` - Retry budget and backoff of this caller
    /// * `hook` - Receives every failed attempt
    pub async fn acquire(
        &self,
        resource: Resource<'_>,
        policy: &RetryPolicy,
        hook: &dyn ErrorHook,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let key = resource.key();
        let slot = self.slot(&key);
        let mut retrying = false;

        loop {
            if let Some(channel) = slot.live_channel() {
                return Ok(channel);
            }

            if slot
                .connecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                match self.wait_in_flight(&key, &slot, policy).await {
                    // a retrying caller keeps competing until its own attempts run out
                    Err(AmqpError::ConnectInProgress(_)) if retrying => continue,
                    outcome => return outcome,
                }
            }
            let guard = ConnectingGuard { slot: &slot };

            // another caller may have finished between the liveness check and the flag
            if let Some(channel) = slot.live_channel() {
                return Ok(channel);
            }

            if let Some(stale) = slot.take() {
                stale.close().await;
            }
            slot.set_state(ConnectionState::Connecting);
            debug!(resource = %key, "connecting");

            let err = match self.connect_once(&resource).await {
                Ok(entry) => {
                    let channel = entry.channel.clone();
                    slot.store(entry);
                    slot.retries.store(0, Ordering::Release);
                    info!(resource = %key, "resource connected");
                    return Ok(channel);
                }
                Err(err) => err,
            };

            error!(error = err.to_string(), resource = %key, "connect attempt failed");
            hook.error(&err);

            if !policy.retries_enabled() {
                slot.set_state(ConnectionState::Failed);
                return Err(err);
            }

            let retries = slot.retries.load(Ordering::Acquire);
            if retries >= policy.max_retry_connect() {
                slot.set_state(ConnectionState::Failed);
                return Err(AmqpError::RetriesExhausted {
                    attempts: retries + 1,
                    reason: err.to_string(),
                });
            }

            let attempt = slot.retries.fetch_add(1, Ordering::AcqRel) + 1;
            slot.set_state(ConnectionState::Disconnected);
            drop(guard);

            let delay = policy.backoff(attempt);
            warn!(
                resource = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying connection"
            );
            tokio::time::sleep(delay).await;
            retrying = true;
        }
    }

    async fn wait_in_flight(
        &self,
        key: &ResourceKey,
        slot: &ResourceSlot,
        policy: &RetryPolicy,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let notified = slot.settled.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let wait = if policy.retries_enabled() {
            self.configs.connect_wait()
        } else {
            self.configs.connect_wait().min(self.configs.connection_timeout())
        };

        if slot.connecting.load(Ordering::Acquire) {
            debug!(resource = %key, "waiting for the in-flight connect");
            if tokio::time::timeout(wait, notified).await.is_err() {
                warn!(resource = %key, "in-flight connect still running");
            }
        }

        slot.live_channel()
            .ok_or_else(|| AmqpError::ConnectInProgress(key.to_string()))
    }

    async fn connect_once(&self, resource: &Resource<'_>) -> Result<ResourceEntry, AmqpError> {
        let connection = self
            .transport
            .connect(&self.configs)
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;

        match self.install(connection.as_ref(), resource).await {
            Ok(channel) => Ok(ResourceEntry {
                connection,
                channel,
            }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(
                        error = close_err.to_string(),
                        "failure to close the connection"
                    );
                }
                Err(err)
            }
        }
    }

    async fn install(
        &self,
        connection: &dyn AmqpConnection,
        resource: &Resource<'_>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;
        let channel = resource.topology().install(connection, channel).await?;

        if let Some(topology) = resource.auxiliary_topology() {
            let aux = connection
                .create_channel()
                .await
                .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

            let installed = topology.install(connection, aux.clone()).await;
            let used = match &installed {
                Ok(used) => used.clone(),
                Err(_) => aux,
            };
            if used.is_open() {
                if let Err(err) = used.close().await {
                    warn!(error = err.to_string(), "failure to close the auxiliary channel");
                }
            }
            installed?;
        }

        Ok(channel)
    }

    /// Closes the resource's handles and marks it disconnected. The retry
    /// counter is kept.
    pub async fn teardown(&self, key: &ResourceKey) {
        let Some(slot) = self.existing(key) else {
            return;
        };

        let entry = slot.take();
        slot.set_state(ConnectionState::Disconnected);
        if let Some(entry) = entry {
            debug!(resource = %key, "tearing down");
            entry.close().await;
        }
    }

    /// Tears the resource down and forgets it.
    pub async fn release(&self, key: &ResourceKey) {
        self.teardown(key).await;
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Releases every resource, closing all connections the registry owns.
    pub async fn close_all(&self) {
        let keys: Vec<ResourceKey> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        for key in keys {
            self.release(&key).await;
        }
    }

    /// Connection connected and channel open.
    pub fn is_live(&self, key: &ResourceKey) -> bool {
        self.existing(key)
            .map(|slot| slot.live_channel().is_some())
            .unwrap_or(false)
    }

    /// Lifecycle state of a resource; `Disconnected` for unknown keys.
    pub fn state(&self, key: &ResourceKey) -> ConnectionState {
        self.existing(key)
            .map(|slot| slot.state())
            .unwrap_or_default()
    }

    /// Consecutive failed connect attempts since the last success.
    ///
    /// # Returns
    /// The retry counter, `0` for unknown keys
    pub fn retry_count(&self, key: &ResourceKey) -> u32 {
        self.existing(key)
            .map(|slot| slot.retries.load(Ordering::Acquire))
            .unwrap_or_default()
    }
}
