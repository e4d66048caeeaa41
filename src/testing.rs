// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.

use crate::{
    configs::RabbitMQConfigs,
    consumer::AckAction,
    errors::{AmqpError, TransportError},
    exchange::ExchangeDefinition,
    handler::{AckDecision, DeadLetterHandler, ErrorHook, HandlerError, MessageHandler, Params},
    queue::{QueueBinding, QueueDefinition},
    transport::{AmqpChannel, AmqpConnection, Delivery, DeliveryStream, Envelope, Transport},
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckRecord {
    pub queue: String,
    pub body: Vec<u8>,
    pub action: AckAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: u32,
    refuse_connects: u32,
    refuse_all: bool,
    connect_delay: Duration,
    fail_binds: bool,
    fail_publishes: u32,
    consume_panics: HashMap<String, u32>,
    consumes: HashMap<String, u32>,
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    declarations: Vec<String>,
    bindings: HashSet<(String, String, String)>,
    published: Vec<Published>,
    acks: Vec<AckRecord>,
    connections: Vec<Arc<ConnState>>,
}

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Shared,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_queue(&self, name: &str) {
        self.with(|s| {
            s.queues.entry(name.to_owned()).or_default();
        });
    }

    pub fn push_raw(&self, queue: &str, body: Vec<u8>) {
        self.with(|s| s.queues.entry(queue.to_owned()).or_default().push_back(body));
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.with(|s| s.queues.get(queue).map(VecDeque::len).unwrap_or_default())
    }

    pub fn declarations(&self) -> Vec<String> {
        self.with(|s| s.declarations.clone())
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, key: &str) -> bool {
        self.with(|s| {
            s.bindings
                .contains(&(queue.to_owned(), exchange.to_owned(), key.to_owned()))
        })
    }

    pub fn connect_attempts(&self) -> u32 {
        self.with(|s| s.connect_attempts)
    }

    pub fn consume_count(&self, queue: &str) -> u32 {
        self.with(|s| s.consumes.get(queue).copied().unwrap_or_default())
    }

    pub fn open_connections(&self) -> usize {
        self.with(|s| s.connections.iter().filter(|c| c.is_open()).count())
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.with(|s| s.acks.clone())
    }

    pub fn acks_on(&self, queue: &str) -> Vec<AckRecord> {
        self.acks().into_iter().filter(|r| r.queue == queue).collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.with(|s| s.published.clone())
    }

    pub fn refuse_connects(&self, count: u32) {
        self.with(|s| s.refuse_connects = count);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.with(|s| s.refuse_all = refuse);
    }

    pub fn connect_delay(&self, delay: Duration) {
        self.with(|s| s.connect_delay = delay);
    }

    pub fn fail_binds(&self, fail: bool) {
        self.with(|s| s.fail_binds = fail);
    }

    pub fn fail_publishes(&self, count: u32) {
        self.with(|s| s.fail_publishes = count);
    }

    pub fn panic_on_consume(&self, queue: &str, count: u32) {
        self.with(|s| {
            s.consume_panics.insert(queue.to_owned(), count);
        });
    }

    /// Simulates a broker restart: every open connection is closed.
    pub fn drop_connections(&self) {
        self.with(|s| {
            for conn in &s.connections {
                conn.open.store(false, Ordering::SeqCst);
            }
        });
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn connect(
        &self,
        _cfg: &RabbitMQConfigs,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        let delay = self.with(|s| {
            s.connect_attempts += 1;
            s.connect_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.with(|s| {
            if s.refuse_all {
                return Err(TransportError::Unreachable("connection refused".into()));
            }
            if s.refuse_connects > 0 {
                s.refuse_connects -= 1;
                return Err(TransportError::Unreachable("connection refused".into()));
            }

            let conn = Arc::new(ConnState {
                open: AtomicBool::new(true),
            });
            s.connections.push(conn.clone());

            Ok(Arc::new(FakeConnection {
                broker: self.state.clone(),
                conn,
            }) as Arc<dyn AmqpConnection>)
        })
    }
}

pub(crate) struct ConnState {
    open: AtomicBool,
}

impl ConnState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeConnection {
    broker: Shared,
    conn: Arc<ConnState>,
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        if !self.conn.is_open() {
            return Err(TransportError::ConnectionClosed("fake connection closed".into()));
        }

        Ok(Arc::new(FakeChannel {
            state: Arc::new(ChannelState {
                broker: self.broker.clone(),
                conn: self.conn.clone(),
                open: AtomicBool::new(true),
                next_tag: AtomicU64::new(0),
                inflight: Mutex::new(HashMap::new()),
            }),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.conn.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct ChannelState {
    broker: Shared,
    conn: Arc<ConnState>,
    open: AtomicBool,
    next_tag: AtomicU64,
    inflight: Mutex<HashMap<u64, (String, Vec<u8>)>>,
}

impl ChannelState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.conn.is_open()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed("fake channel closed".into()))
        }
    }

    fn settle(&self, tag: u64, action: AckAction) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Some((queue, body)) = self.inflight.lock().unwrap().remove(&tag) else {
            self.open.store(false, Ordering::SeqCst);
            return Err(TransportError::ChannelClosed(format!("unknown delivery tag {tag}")));
        };

        let requeue = matches!(
            action,
            AckAction::Nack { requeue: true } | AckAction::Reject { requeue: true }
        );

        let mut broker = self.broker.lock().unwrap();
        if requeue {
            broker
                .queues
                .entry(queue.clone())
                .or_default()
                .push_back(body.clone());
        }
        broker.acks.push(AckRecord { queue, body, action });
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    state: Arc<ChannelState>,
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        let mut broker = self.state.broker.lock().unwrap();
        if def.is_passive() {
            if broker.exchanges.contains(def.name()) {
                return Ok(());
            }
            self.state.open.store(false, Ordering::SeqCst);
            return Err(TransportError::NotFound(def.name().to_owned()));
        }

        broker.exchanges.insert(def.name().to_owned());
        broker.declarations.push(format!("exchange:{}", def.name()));
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        let mut broker = self.state.broker.lock().unwrap();
        if def.is_passive() {
            if broker.queues.contains_key(def.name()) {
                return Ok(());
            }
            self.state.open.store(false, Ordering::SeqCst);
            return Err(TransportError::NotFound(def.name().to_owned()));
        }

        broker.queues.entry(def.name().to_owned()).or_default();
        broker.declarations.push(format!("queue:{}", def.name()));
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        let mut broker = self.state.broker.lock().unwrap();
        if broker.fail_binds {
            return Err(TransportError::Protocol("bind refused".into()));
        }
        broker.bindings.insert((
            binding.queue_name().to_owned(),
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
        ));
        Ok(())
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), TransportError> {
        self.state.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        let mut broker = self.state.broker.lock().unwrap();
        if broker.fail_publishes > 0 {
            broker.fail_publishes -= 1;
            self.state.open.store(false, Ordering::SeqCst);
            return Err(TransportError::ChannelClosed("publish refused".into()));
        }

        let targets: Vec<String> = broker
            .bindings
            .iter()
            .filter(|(_, ex, key)| ex == exchange && key == routing_key)
            .map(|(queue, _, _)| queue.clone())
            .collect();
        for queue in targets {
            broker
                .queues
                .entry(queue)
                .or_default()
                .push_back(envelope.body.clone());
        }

        broker.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            envelope: envelope.clone(),
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        self.state.ensure_open()?;
        let crash = self.state.broker.lock().unwrap().with_consume(queue);
        if crash {
            panic!("simulated crash while consuming {queue}");
        }

        let seed = (self.state.clone(), queue.to_owned(), false);
        let deliveries = stream::unfold(seed, |(state, queue, closed)| async move {
            if closed {
                return None;
            }
            loop {
                if !state.is_open() {
                    let err = TransportError::ConnectionClosed("fake connection closed".into());
                    return Some((Err(err), (state, queue, true)));
                }

                let next = state
                    .broker
                    .lock()
                    .unwrap()
                    .queues
                    .get_mut(&queue)
                    .and_then(VecDeque::pop_front);

                if let Some(body) = next {
                    let tag = state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    state
                        .inflight
                        .lock()
                        .unwrap()
                        .insert(tag, (queue.clone(), body.clone()));
                    let mut delivery = Delivery::new(tag, body);
                    delivery.routing_key = queue.clone();
                    return Some((Ok(delivery), (state, queue, false)));
                }

                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.state.settle(delivery_tag, AckAction::Ack)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.state.settle(delivery_tag, AckAction::Nack { requeue })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.state.settle(delivery_tag, AckAction::Reject { requeue })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl BrokerState {
    /// Counts a consume registration; true when it should crash.
    fn with_consume(&mut self, queue: &str) -> bool {
        *self.consumes.entry(queue.to_owned()).or_default() += 1;
        match self.consume_panics.get_mut(queue) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Settings with millisecond backoffs so loops spin quickly under test.
pub(crate) fn fast_configs() -> RabbitMQConfigs {
    RabbitMQConfigs {
        max_retry_connect: 3,
        connect_wait_ms: 500,
        backoff_step_ms: 1,
        backoff_jitter_ms: 0,
        backoff_cap_ms: 5,
        monitor_interval_ms: 5,
        dead_letter_retry_delay_ms: 1,
        shutdown_grace_ms: 100,
        ..Default::default()
    }
}

/// JSON body understood by [`ScriptedHandler`].
pub(crate) fn json_body(outcome: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "outcome": outcome })).unwrap()
}

/// Handler whose decision is read from the `outcome` field of the message.
#[derive(Default)]
pub(crate) struct ScriptedHandler {
    pub seen: Mutex<Vec<Params>>,
}

impl ScriptedHandler {
    fn decide(&self, params: Params) -> Result<AckDecision, HandlerError> {
        let outcome = params
            .get("outcome")
            .and_then(|v| v.as_str())
            .unwrap_or("ack")
            .to_owned();
        self.seen.lock().unwrap().push(params);

        match outcome.as_str() {
            "nack" => Ok(AckDecision::Nack),
            "reject" => Ok(AckDecision::Reject),
            "fail" => Err("scripted failure".into()),
            "panic" => panic!("scripted panic"),
            _ => Ok(AckDecision::Ack),
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, params: Params) -> Result<AckDecision, HandlerError> {
        self.decide(params)
    }
}

#[async_trait]
impl DeadLetterHandler for ScriptedHandler {
    async fn dlx_handle(&self, params: Params) -> Result<AckDecision, HandlerError> {
        self.decide(params)
    }
}

/// Hook that keeps every reported error.
#[derive(Default)]
pub(crate) struct RecordingHook {
    errors: Mutex<Vec<AmqpError>>,
}

impl RecordingHook {
    pub fn errors(&self) -> Vec<AmqpError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorHook for RecordingHook {
    fn error(&self, err: &AmqpError) {
        self.errors.lock().unwrap().push(err.clone());
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub(crate) async fn eventually<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}
