// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the queue side of the topology: queue definitions,
//! queue bindings, and `QueueConfig`, the per-consumer description from which
//! the business and dead-letter topologies are derived.

use crate::exchange::ExchangeKind;
use serde::Deserialize;

/// Suffix appended to business names to derive dead-letter names
pub const DLX_SUFFIX: &str = "_dlx";
/// TTL applied to business messages when dead-lettering is enabled and no
/// explicit value was configured
pub const DEFAULT_MESSAGE_TTL_MS: u32 = 30_000;

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Supports message TTL and dead-letter routing, the two arguments the
/// client sets on the queues it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the declaration passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Messages that exceed this TTL are removed from the queue, or routed to
    /// the dead-letter exchange when one is configured.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the declaration only checks that the queue exists.
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// Whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Message TTL in milliseconds, sent as `x-message-ttl`.
    pub fn message_ttl(&self) -> Option<u32> {
        self.ttl
    }

    /// Exchange sent as `x-dead-letter-exchange`.
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// Routing key sent as `x-dead-letter-routing-key`.
    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Queue side of the binding.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Exchange side of the binding.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Routing key of the binding.
    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// Identity of a logical broker resource: one connection and one channel
/// are owned per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub exchange: String,
    pub queue: String,
}

impl ResourceKey {
    /// Creates the key of the resource serving `queue` behind `exchange`.
    pub fn new(exchange: &str, queue: &str) -> ResourceKey {
        ResourceKey {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.queue)
    }
}

/// Per-consumer queue configuration.
///
/// Unset exchange and queue names fall back to `type_name`, the identifier of
/// the consumer type. Unset dead-letter names derive from the business names
/// with the `_dlx` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub type_name: String,
    pub exchange_name: Option<String>,
    pub queue_name: Option<String>,
    pub exchange_kind: ExchangeKind,
    pub durable: bool,
    pub enable_dlx: bool,
    pub dlx_exchange_name: Option<String>,
    pub dlx_queue_name: Option<String>,
    pub dlx_routing_key: Option<String>,
    pub dlx_message_ttl_ms: Option<u32>,
    pub message_ttl_ms: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            type_name: String::new(),
            exchange_name: None,
            queue_name: None,
            exchange_kind: ExchangeKind::Direct,
            durable: true,
            enable_dlx: false,
            dlx_exchange_name: None,
            dlx_queue_name: None,
            dlx_routing_key: None,
            dlx_message_ttl_ms: None,
            message_ttl_ms: None,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration whose names default to `type_name`.
    pub fn new(type_name: &str) -> QueueConfig {
        QueueConfig {
            type_name: type_name.to_owned(),
            ..Default::default()
        }
    }

    /// Creates a configuration whose names default to the path of `T`.
    pub fn for_type<T: ?Sized>() -> QueueConfig {
        QueueConfig::new(std::any::type_name::<T>())
    }

    /// Overrides the business exchange name.
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange_name = Some(name.to_owned());
        self
    }

    /// Overrides the business queue name.
    pub fn queue(mut self, name: &str) -> Self {
        self.queue_name = Some(name.to_owned());
        self
    }

    /// Sets the business exchange type. Use [`ExchangeKind::XMessageDelayed`]
    /// for delayed publishing.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the business queue TTL, in milliseconds.
    pub fn message_ttl(mut self, ttl_ms: u32) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    /// Enables the dead-letter topology and its worker.
    pub fn with_dlx(mut self) -> Self {
        self.enable_dlx = true;
        self
    }

    /// Overrides the dead-letter exchange name.
    pub fn dlx_exchange(mut self, name: &str) -> Self {
        self.dlx_exchange_name = Some(name.to_owned());
        self
    }

    /// Overrides the dead-letter queue name.
    pub fn dlx_queue(mut self, name: &str) -> Self {
        self.dlx_queue_name = Some(name.to_owned());
        self
    }

    /// Overrides the dead-letter routing key.
    pub fn dlx_routing(mut self, key: &str) -> Self {
        self.dlx_routing_key = Some(key.to_owned());
        self
    }

    /// Sets a TTL on the dead-letter queue, in milliseconds.
    pub fn dlx_message_ttl(mut self, ttl_ms: u32) -> Self {
        self.dlx_message_ttl_ms = Some(ttl_ms);
        self
    }

    /// Business exchange name.
    ///
    /// # Returns
    /// The configured name, or `type_name` when unset or empty
    pub fn exchange_name(&self) -> String {
        non_empty(&self.exchange_name).unwrap_or_else(|| self.type_name.clone())
    }

    /// Business queue name.
    ///
    /// # Returns
    /// The configured name, or `type_name` when unset or empty
    pub fn queue_name(&self) -> String {
        non_empty(&self.queue_name).unwrap_or_else(|| self.type_name.clone())
    }

    /// Routing key used to publish and bind business messages.
    pub fn routing_key(&self) -> String {
        self.queue_name()
    }

    /// Dead-letter exchange name.
    ///
    /// # Returns
    /// The configured name, or the business exchange name with the `_dlx`
    /// suffix
    pub fn dlx_exchange_name(&self) -> String {
        non_empty(&self.dlx_exchange_name)
            .unwrap_or_else(|| format!("{}{}", self.exchange_name(), DLX_SUFFIX))
    }

    /// Dead-letter queue name, defaulting to the business queue name with the
    /// `_dlx` suffix.
    pub fn dlx_queue_name(&self) -> String {
        non_empty(&self.dlx_queue_name)
            .unwrap_or_else(|| format!("{}{}", self.queue_name(), DLX_SUFFIX))
    }

    /// Routing key dead letters are published and bound with.
    pub fn dlx_routing_key(&self) -> String {
        non_empty(&self.dlx_routing_key)
            .unwrap_or_else(|| format!("{}{}", self.queue_name(), DLX_SUFFIX))
    }

    /// TTL set on the business queue, if any.
    pub fn effective_message_ttl(&self) -> Option<u32> {
        match self.message_ttl_ms {
            Some(ttl) => Some(ttl),
            None if self.enable_dlx => Some(DEFAULT_MESSAGE_TTL_MS),
            None => None,
        }
    }

    /// Key of the primary resource, shared by the publisher and the consumer.
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.exchange_name(), &self.queue_name())
    }

    /// Key of the dead-letter worker's own connection.
    pub fn dlx_resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.dlx_exchange_name(), &self.dlx_queue_name())
    }

    /// Business queue definition, including dead-letter arguments when enabled.
    pub fn queue_definition(&self) -> QueueDefinition {
        let mut def = QueueDefinition::new(&self.queue_name()).durable(self.durable);
        if let Some(ttl) = self.effective_message_ttl() {
            def = def.ttl(ttl);
        }
        if self.enable_dlx {
            def = def.dead_letter(&self.dlx_exchange_name(), &self.dlx_routing_key());
        }
        def
    }

    pub fn dlx_queue_definition(&self) -> QueueDefinition {
        let mut def = QueueDefinition::new(&self.dlx_queue_name()).durable(true);
        if let Some(ttl) = self.dlx_message_ttl_ms.filter(|ttl| *ttl > 0) {
            def = def.ttl(ttl);
        }
        def
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OrderConsumer;

    #[test]
    fn names_fall_back_to_type_identifier() {
        let cfg = QueueConfig::for_type::<OrderConsumer>();
        assert!(cfg.exchange_name().ends_with("OrderConsumer"));
        assert_eq!(cfg.exchange_name(), cfg.queue_name());
        assert_eq!(cfg.routing_key(), cfg.queue_name());
    }

    #[test]
    fn empty_names_are_treated_as_unset() {
        let cfg = QueueConfig::new("orders").exchange("").queue("orders.q");
        assert_eq!(cfg.exchange_name(), "orders");
        assert_eq!(cfg.queue_name(), "orders.q");
    }

    #[test]
    fn dead_letter_names_derive_from_business_names() {
        let cfg = QueueConfig::new("orders").exchange("shop").with_dlx();
        assert_eq!(cfg.dlx_exchange_name(), "shop_dlx");
        assert_eq!(cfg.dlx_queue_name(), "orders_dlx");
        assert_eq!(cfg.dlx_routing_key(), "orders_dlx");
        assert_eq!(cfg.dlx_resource_key(), ResourceKey::new("shop_dlx", "orders_dlx"));
    }

    #[test]
    fn dead_letter_arguments_only_when_enabled() {
        let plain = QueueConfig::new("orders").queue_definition();
        assert_eq!(plain.dead_letter_exchange(), None);
        assert_eq!(plain.message_ttl(), None);
        assert!(plain.is_durable());

        let dlx = QueueConfig::new("orders").with_dlx().queue_definition();
        assert_eq!(dlx.dead_letter_exchange(), Some("orders_dlx"));
        assert_eq!(dlx.dead_letter_routing_key(), Some("orders_dlx"));
        assert_eq!(dlx.message_ttl(), Some(DEFAULT_MESSAGE_TTL_MS));

        let custom = QueueConfig::new("orders").with_dlx().message_ttl(500);
        assert_eq!(custom.queue_definition().message_ttl(), Some(500));
    }

    #[test]
    fn dlx_queue_ttl_is_optional() {
        let cfg = QueueConfig::new("orders").with_dlx();
        assert_eq!(cfg.dlx_queue_definition().message_ttl(), None);
        let cfg = cfg.dlx_message_ttl(60_000);
        assert_eq!(cfg.dlx_queue_definition().message_ttl(), Some(60_000));
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: QueueConfig =
            serde_json::from_str(r#"{"type_name":"orders","enable_dlx":true}"#).unwrap();
        assert!(cfg.durable);
        assert!(cfg.enable_dlx);
        assert_eq!(cfg.exchange_kind, ExchangeKind::Direct);
    }
}
