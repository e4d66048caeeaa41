// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges the client declares. The business exchange
//! kind comes from `QueueConfig`; dead-letter exchanges are always durable
//! direct exchanges.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the argument used to specify the routing of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Exchange type registered by the delayed message plugin
pub const DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Direct routing with per-message delay (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl ExchangeKind {
    /// Name of the exchange type as sent to the broker.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => DELAYED_EXCHANGE_KIND,
        }
    }

    /// Whether publishing with an `x-delay` header has any effect.
    pub fn supports_delay(&self) -> bool {
        matches!(self, ExchangeKind::XMessageDelayed)
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(DELAYED_EXCHANGE_KIND.to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built with chained setters. `passive` turns the declaration into an
/// existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) params: BTreeMap<String, String>,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            passive: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    ///
    /// Delayed exchanges get the `x-delayed-type` argument so the plugin
    /// routes like a direct exchange.
    pub fn kind(mut self, kind: &ExchangeKind) -> Self {
        self.kind = kind.clone();
        if kind.supports_delay() {
            self.params.insert(
                AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
                ExchangeKind::Direct.as_str().to_owned(),
            );
        } else {
            self.params.remove(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE);
        }
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the declaration passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Name of the exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the declaration only checks that the exchange exists.
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// Whether the exchange survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Type of the exchange.
    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// Declaration arguments, such as `x-delayed-type`.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}
