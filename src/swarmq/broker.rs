//! Supervised AMQP connection and channel management.
//!
//! [`BrokerClient`] owns exactly one connection and one channel at a time and
//! exposes the primitives the orchestration layer is built on: idempotent
//! topology assertion, confirmed publishing, and consumption with explicit
//! per-delivery settlement.
//!
//! # Architecture
//!
//! ```text
//! BrokerClient
//!   ├─ supervisor task        reconnect loop w/ exponential backoff
//!   │     └─ on reconnect: replay topology, re-register consumers
//!   ├─ consumer pump per subscription (delivery → handler + completion)
//!   └─ publish path           basic_publish + publisher-confirm + timeout
//! ```
//!
//! # Connection lifecycle
//!
//! `disconnected → connecting → connected → (closing | reconnecting)`
//!
//! On connection loss the supervisor re-dials with delays of
//! `min(reconnect_base_ms × 2^(n-1), reconnect_cap_ms)`. Before the state
//! flips back to `connected`, every recorded topology assertion is re-run and
//! every active consumer is re-registered, so the engine above never observes
//! a half-restored session. After `reconnect_max_attempts` consecutive
//! failures the client parks in `disconnected` and the failure is fatal.
//!
//! While not connected, publishes fail immediately — nothing is queued inside
//! the client; the caller decides whether to buffer or drop.
//!
//! # Settlement
//!
//! Each delivery hands the consumer a [`DeliveryCompletion`]. Its three
//! methods take `self` by value, so at most one of ack / nack-requeue /
//! reject can ever run for a delivery; dropping a completion without settling
//! is logged and leaves redelivery to the broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, Notify};
use uuid::Uuid;

use crate::swarmq::config::SwarmConfig;
use crate::swarmq::error::SwarmError;
use crate::swarmq::event::{SwarmEvent, SwarmEventHandler};
use crate::swarmq::stats::StatsRegistry;

/// Connection supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
        }
    }
}

/// Header values carried in publish options and deliveries.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl HeaderValue {
    fn to_amqp(&self) -> AMQPValue {
        match self {
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Str(v) => AMQPValue::LongString(v.clone().into()),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        }
    }

    fn from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
        match value {
            AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
            AMQPValue::LongString(v) => Some(HeaderValue::Str(
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Delivery mode 2: survive a broker restart on durable queues.
    pub persistent: bool,
    /// AMQP per-message priority, 0..=10 on the priority queues.
    pub priority: Option<u8>,
    /// Per-message TTL.
    pub expiration_ms: Option<u64>,
    /// Application headers; the engine uses these for retry metadata.
    pub headers: BTreeMap<String, HeaderValue>,
    pub message_id: Option<String>,
    /// Unix seconds for the AMQP basic timestamp property.
    pub timestamp: Option<u64>,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        PublishOptions {
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_expiration_ms(mut self, ms: u64) -> Self {
        self.expiration_ms = Some(ms);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, unix_seconds: u64) -> Self {
        self.timestamp = Some(unix_seconds);
        self
    }

    fn to_amqp(&self) -> BasicProperties {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if self.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(ms) = self.expiration_ms {
            properties = properties.with_expiration(ms.to_string().into());
        }
        if !self.headers.is_empty() {
            let mut table = FieldTable::default();
            for (key, value) in &self.headers {
                table.insert(key.as_str().into(), value.to_amqp());
            }
            properties = properties.with_headers(table);
        }
        if let Some(id) = &self.message_id {
            properties = properties.with_message_id(id.as_str().into());
        }
        if let Some(ts) = self.timestamp {
            properties = properties.with_timestamp(ts);
        }
        properties
    }
}

/// Arguments for a durable task queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQueueOptions {
    pub message_ttl_ms: Option<u64>,
    pub max_length: Option<u32>,
    pub max_priority: Option<u8>,
    pub dead_letter: Option<DeadLetterTarget>,
}

/// Where rejected messages are routed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// What a consumer reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueSource {
    /// An existing named queue.
    Named(String),
    /// A broker-named exclusive auto-delete queue, re-created on every
    /// (re)registration and bound to the given `(exchange, routing key)`
    /// pairs.
    Exclusive { bindings: Vec<(String, String)> },
}

/// A delivery as seen by handler code.
#[derive(Debug)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<String, HeaderValue>,
    pub message_id: Option<String>,
}

/// Per-delivery settlement. Exactly one of the three by-value methods should
/// run; the type makes more than one impossible and a `Drop` without any is
/// logged (the broker will redeliver once the channel closes).
pub struct DeliveryCompletion {
    acker: Option<Acker>,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl DeliveryCompletion {
    fn new(acker: Acker, in_flight: Arc<AtomicUsize>, drained: Arc<Notify>) -> Self {
        Self {
            acker: Some(acker),
            in_flight,
            drained,
        }
    }

    fn settle(&mut self) -> Option<Acker> {
        let acker = self.acker.take();
        if acker.is_some() && self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        acker
    }

    /// Positive acknowledgment: the delivery is done.
    pub async fn ack(mut self) -> Result<(), SwarmError> {
        match self.settle() {
            Some(acker) => acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(SwarmError::from),
            None => Ok(()),
        }
    }

    /// Return the delivery to its queue for redelivery.
    pub async fn nack_requeue(mut self) -> Result<(), SwarmError> {
        match self.settle() {
            Some(acker) => acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
                .map_err(SwarmError::from),
            None => Ok(()),
        }
    }

    /// Reject without requeue; a configured dead-letter exchange receives it.
    pub async fn reject_no_requeue(mut self) -> Result<(), SwarmError> {
        match self.settle() {
            Some(acker) => acker
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map_err(SwarmError::from),
            None => Ok(()),
        }
    }
}

impl Drop for DeliveryCompletion {
    fn drop(&mut self) {
        if self.settle().is_some() {
            log::warn!("delivery dropped without settlement; broker will redeliver");
        }
    }
}

/// Consumer-side seam: one call per delivery, with its completion.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage, completion: DeliveryCompletion);
}

/// Handle for cancelling a registered consumer.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    tag: String,
}

impl ConsumerHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[derive(Clone)]
struct ConsumerEntry {
    source: QueueSource,
    handler: Arc<dyn DeliveryHandler>,
    active: Arc<AtomicBool>,
}

/// Recorded topology assertions, replayed after every reconnect.
#[derive(Debug, Clone, PartialEq)]
enum TopologyOp {
    Queue {
        name: String,
        durable: bool,
        auto_delete: bool,
        opts: TaskQueueOptions,
    },
    Exchange {
        name: String,
        kind: ExchangeFlavor,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeFlavor {
    Fanout,
    Topic,
    Direct,
}

impl ExchangeFlavor {
    fn to_kind(self) -> ExchangeKind {
        match self {
            ExchangeFlavor::Fanout => ExchangeKind::Fanout,
            ExchangeFlavor::Topic => ExchangeKind::Topic,
            ExchangeFlavor::Direct => ExchangeKind::Direct,
        }
    }
}

/// Delay before the attempt following the `n`-th consecutive failure.
pub fn backoff_delay_ms(base_ms: u64, cap_ms: u64, failed_attempts: u32) -> u64 {
    let exponent = failed_attempts.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << exponent).min(cap_ms)
}

/// One supervised AMQP session.
pub struct BrokerClient {
    config: SwarmConfig,
    state_tx: watch::Sender<ConnectionState>,
    connection: TokioMutex<Option<Connection>>,
    channel: StdRwLock<Option<Channel>>,
    topology: StdMutex<Vec<TopologyOp>>,
    consumers: TokioMutex<HashMap<String, ConsumerEntry>>,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    loss_tx: mpsc::UnboundedSender<()>,
    events: Option<Arc<dyn SwarmEventHandler>>,
    stats: Arc<StatsRegistry>,
    closing: AtomicBool,
}

impl BrokerClient {
    /// Dial the broker, open the channel, apply prefetch and confirm mode,
    /// and start the reconnect supervisor. The initial dial honors the same
    /// backoff budget as reconnects and fails only once it is exhausted.
    pub async fn connect(
        config: SwarmConfig,
        stats: Arc<StatsRegistry>,
    ) -> Result<Arc<Self>, SwarmError> {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connecting);
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let events = config.event_handler.clone();
        let client = Arc::new(Self {
            config,
            state_tx,
            connection: TokioMutex::new(None),
            channel: StdRwLock::new(None),
            topology: StdMutex::new(Vec::new()),
            consumers: TokioMutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            loss_tx,
            events,
            stats,
            closing: AtomicBool::new(false),
        });

        client.establish().await?;
        tokio::spawn(Self::supervise(client.clone(), loss_rx));
        Ok(client)
    }

    /// Current supervisor state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to supervisor state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Unacknowledged deliveries currently inside handlers.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous == next {
            return;
        }
        log::info!(
            "broker connection: {} -> {}",
            previous.as_str(),
            next.as_str()
        );
        if let Some(handler) = &self.events {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .on_event(&SwarmEvent::ConnectionStateChanged {
                        previous,
                        current: next,
                    })
                    .await;
            });
        }
    }

    /// Dial with backoff until connected or the attempt budget is spent.
    async fn establish(&self) -> Result<(), SwarmError> {
        let max_attempts = self.config.reconnect_max_attempts;
        let mut failures = 0u32;
        loop {
            match self.try_connect().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    if failures >= max_attempts {
                        return Err(SwarmError::Connect(format!(
                            "gave up after {} attempts: {}",
                            failures, err
                        )));
                    }
                    let delay = backoff_delay_ms(
                        self.config.reconnect_base_ms,
                        self.config.reconnect_cap_ms,
                        failures,
                    );
                    log::warn!(
                        "broker connect attempt {} failed ({}); retrying in {}ms",
                        failures,
                        err,
                        delay
                    );
                    if let Some(handler) = &self.events {
                        handler
                            .on_event(&SwarmEvent::ReconnectAttempt {
                                attempt: failures + 1,
                                delay_ms: delay,
                            })
                            .await;
                    }
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// One dial: connection + channel + QoS + confirms, then topology replay
    /// and consumer re-registration.
    async fn try_connect(&self) -> Result<(), SwarmError> {
        let url = self.config.broker_url_with_heartbeat();
        let connection = Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(SwarmError::from)?;

        let loss = self.loss_tx.clone();
        connection.on_error(move |err| {
            log::warn!("broker connection error: {}", err);
            let _ = loss.send(());
        });

        let channel = connection.create_channel().await.map_err(SwarmError::from)?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(SwarmError::from)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(SwarmError::from)?;

        {
            let mut slot = self.channel.write().expect("channel lock poisoned");
            *slot = Some(channel.clone());
        }
        {
            let mut slot = self.connection.lock().await;
            *slot = Some(connection);
        }

        self.replay_topology(&channel).await?;
        self.restart_consumers().await?;
        Ok(())
    }

    /// Reconnect loop: runs until close or budget exhaustion.
    async fn supervise(client: Arc<BrokerClient>, mut loss_rx: mpsc::UnboundedReceiver<()>) {
        while loss_rx.recv().await.is_some() {
            if client.closing.load(Ordering::SeqCst) {
                break;
            }
            client.set_state(ConnectionState::Reconnecting);
            StatsRegistry::incr(&client.stats.reconnects);
            match client.establish().await {
                Ok(()) => {
                    log::info!("broker reconnected; topology re-asserted");
                }
                Err(err) => {
                    log::error!("broker reconnection exhausted: {}", err);
                    client.set_state(ConnectionState::Disconnected);
                    break;
                }
            }
            // Collapse loss signals that piled up while reconnecting.
            while loss_rx.try_recv().is_ok() {}
        }
        log::debug!("connection supervisor ended");
    }

    fn current_channel(&self) -> Result<Channel, SwarmError> {
        self.channel
            .read()
            .expect("channel lock poisoned")
            .clone()
            .ok_or_else(|| SwarmError::Connect("no open channel".into()))
    }

    /// The stored channel if it is still usable; a channel-level error (the
    /// connection itself surviving) gets a lighter-weight re-open on the
    /// same connection instead of a full reconnect.
    async fn usable_channel(&self) -> Result<Channel, SwarmError> {
        if let Ok(channel) = self.current_channel() {
            if channel.status().connected() {
                return Ok(channel);
            }
        }
        self.reopen_channel().await
    }

    async fn reopen_channel(&self) -> Result<Channel, SwarmError> {
        let connection = self.connection.lock().await;
        let connection = connection
            .as_ref()
            .ok_or_else(|| SwarmError::Connect("no open connection".into()))?;
        if !connection.status().connected() {
            return Err(SwarmError::Connect(
                "connection lost; waiting for the supervisor".into(),
            ));
        }
        log::info!("re-opening channel on the live connection");
        let channel = connection.create_channel().await.map_err(SwarmError::from)?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(SwarmError::from)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(SwarmError::from)?;
        let mut slot = self.channel.write().expect("channel lock poisoned");
        *slot = Some(channel.clone());
        Ok(channel)
    }

    // ── Topology ──────────────────────────────────────────────────────────

    /// Durable queue with TTL / max-length / priority / dead-letter
    /// arguments. Re-declaring with identical arguments is a no-op; a
    /// mismatch surfaces as [`SwarmError::Topology`], which the caller must
    /// translate into a delete-and-recreate decision — the client never does
    /// that on its own.
    pub async fn assert_task_queue(
        &self,
        name: &str,
        opts: TaskQueueOptions,
    ) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Queue {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            opts,
        })
        .await
    }

    /// Durable queue without extra arguments.
    pub async fn assert_plain_queue(&self, name: &str) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Queue {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            opts: TaskQueueOptions::default(),
        })
        .await
    }

    /// Non-durable auto-delete queue, for per-agent reply aggregation.
    pub async fn assert_reply_queue(&self, name: &str) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Queue {
            name: name.to_string(),
            durable: false,
            auto_delete: true,
            opts: TaskQueueOptions::default(),
        })
        .await
    }

    pub async fn assert_fanout(&self, name: &str) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Exchange {
            name: name.to_string(),
            kind: ExchangeFlavor::Fanout,
        })
        .await
    }

    pub async fn assert_topic(&self, name: &str) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Exchange {
            name: name.to_string(),
            kind: ExchangeFlavor::Topic,
        })
        .await
    }

    pub async fn assert_direct(&self, name: &str) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Exchange {
            name: name.to_string(),
            kind: ExchangeFlavor::Direct,
        })
        .await
    }

    pub async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), SwarmError> {
        self.record_and_apply(TopologyOp::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
        .await
    }

    /// Declare a broker-named exclusive auto-delete queue tied to the
    /// current connection and bind it to the given `(exchange, routing key)`
    /// pairs. Returns the generated name. Not recorded for replay: the queue
    /// dies with the connection, and consumers re-declare through their
    /// [`QueueSource::Exclusive`] on re-registration.
    pub async fn assert_exclusive_queue(
        &self,
        bindings: &[(String, String)],
    ) -> Result<String, SwarmError> {
        let channel = self.usable_channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(SwarmError::from)?;
        let name = queue.name().as_str().to_string();
        for (exchange, routing_key) in bindings {
            channel
                .queue_bind(
                    &name,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(SwarmError::from)?;
        }
        Ok(name)
    }

    async fn record_and_apply(&self, op: TopologyOp) -> Result<(), SwarmError> {
        let channel = self.usable_channel().await?;
        self.apply_op(&channel, &op).await?;
        let mut topology = self.topology.lock().expect("topology lock poisoned");
        if !topology.contains(&op) {
            topology.push(op);
        }
        Ok(())
    }

    async fn apply_op(&self, channel: &Channel, op: &TopologyOp) -> Result<(), SwarmError> {
        match op {
            TopologyOp::Queue {
                name,
                durable,
                auto_delete,
                opts,
            } => {
                let mut args = FieldTable::default();
                if let Some(ttl) = opts.message_ttl_ms {
                    args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
                }
                if let Some(max) = opts.max_length {
                    args.insert("x-max-length".into(), AMQPValue::LongLongInt(i64::from(max)));
                }
                if let Some(priority) = opts.max_priority {
                    args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(priority));
                }
                if let Some(target) = &opts.dead_letter {
                    args.insert(
                        "x-dead-letter-exchange".into(),
                        AMQPValue::LongString(target.exchange.clone().into()),
                    );
                    args.insert(
                        "x-dead-letter-routing-key".into(),
                        AMQPValue::LongString(target.routing_key.clone().into()),
                    );
                }
                channel
                    .queue_declare(
                        name,
                        QueueDeclareOptions {
                            durable: *durable,
                            auto_delete: *auto_delete,
                            ..Default::default()
                        },
                        args,
                    )
                    .await
                    .map_err(SwarmError::from)?;
            }
            TopologyOp::Exchange { name, kind } => {
                channel
                    .exchange_declare(
                        name,
                        kind.to_kind(),
                        ExchangeDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(SwarmError::from)?;
            }
            TopologyOp::Bind {
                queue,
                exchange,
                routing_key,
            } => {
                channel
                    .queue_bind(
                        queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(SwarmError::from)?;
            }
        }
        Ok(())
    }

    async fn replay_topology(&self, channel: &Channel) -> Result<(), SwarmError> {
        let ops: Vec<TopologyOp> = {
            let topology = self.topology.lock().expect("topology lock poisoned");
            topology.clone()
        };
        for op in &ops {
            self.apply_op(channel, op).await?;
        }
        Ok(())
    }

    /// Number of recorded topology assertions (stable across reconnects).
    pub fn topology_len(&self) -> usize {
        self.topology.lock().expect("topology lock poisoned").len()
    }

    // ── Publishing ────────────────────────────────────────────────────────

    /// Publish to a queue through the default exchange.
    pub async fn publish_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), SwarmError> {
        self.publish_to_exchange("", queue, payload, options).await
    }

    /// Publish and wait for the broker's confirm. Fails immediately while
    /// not connected, and after `publish_confirm_timeout_ms` without an ack.
    pub async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), SwarmError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SwarmError::Connect(format!(
                "cannot publish while {}",
                state.as_str()
            )));
        }
        let channel = self.usable_channel().await?;
        let properties = options.to_amqp();
        let timeout = Duration::from_millis(self.config.publish_confirm_timeout_ms);

        let confirmation = tokio::time::timeout(timeout, async {
            let confirm = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await?;
            confirm.await
        })
        .await
        .map_err(|_| {
            SwarmError::Publish(format!(
                "publisher confirm timed out after {}ms",
                self.config.publish_confirm_timeout_ms
            ))
        })?
        .map_err(SwarmError::from)?;

        match confirmation {
            Confirmation::Nack(_) => Err(SwarmError::Publish(
                "broker negatively acknowledged the publish".into(),
            )),
            _ => {
                StatsRegistry::incr(&self.stats.messages_published);
                Ok(())
            }
        }
    }

    // ── Consuming ─────────────────────────────────────────────────────────

    /// Register a consumer. The handler runs once per delivery, sequentially
    /// per consumer; concurrency above that is the caller's business. The
    /// consumer survives reconnects until cancelled.
    pub async fn consume(
        &self,
        source: QueueSource,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerHandle, SwarmError> {
        let tag = format!("swarmq-{}", Uuid::new_v4());
        let entry = ConsumerEntry {
            source,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        };
        {
            let mut consumers = self.consumers.lock().await;
            consumers.insert(tag.clone(), entry);
        }
        self.spawn_consumer(&tag).await?;
        Ok(ConsumerHandle { tag })
    }

    async fn spawn_consumer(&self, tag: &str) -> Result<(), SwarmError> {
        let entry = {
            let consumers = self.consumers.lock().await;
            match consumers.get(tag) {
                Some(entry) => entry.clone(),
                None => return Ok(()),
            }
        };
        if !entry.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let queue_name = match &entry.source {
            QueueSource::Named(name) => name.clone(),
            QueueSource::Exclusive { bindings } => self.assert_exclusive_queue(bindings).await?,
        };
        let channel = self.usable_channel().await?;

        let mut consumer = channel
            .basic_consume(
                &queue_name,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(SwarmError::from)?;

        let active = entry.active.clone();
        let handler = entry.handler.clone();
        let in_flight = self.in_flight.clone();
        let drained = self.drained.clone();
        let stats = self.stats.clone();
        let pump_tag = tag.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        log::warn!("consumer {} stream error: {}", pump_tag, err);
                        break;
                    }
                };
                if !active.load(Ordering::SeqCst) {
                    let _ = delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await;
                    continue;
                }

                StatsRegistry::incr(&stats.messages_consumed);
                let routing_key = delivery.routing_key.as_str().to_string();
                let redelivered = delivery.redelivered;
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(|table| {
                        table
                            .inner()
                            .iter()
                            .filter_map(|(key, value)| {
                                HeaderValue::from_amqp(value)
                                    .map(|v| (key.as_str().to_string(), v))
                            })
                            .collect()
                    })
                    .unwrap_or_else(BTreeMap::new);
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string());

                in_flight.fetch_add(1, Ordering::SeqCst);
                let message = InboundMessage {
                    payload: delivery.data,
                    routing_key,
                    redelivered,
                    headers,
                    message_id,
                };
                let completion =
                    DeliveryCompletion::new(delivery.acker, in_flight.clone(), drained.clone());
                handler.handle(message, completion).await;
            }
            log::debug!("consumer {} pump ended", pump_tag);
        });
        Ok(())
    }

    /// Re-register every active consumer on the fresh channel.
    async fn restart_consumers(&self) -> Result<(), SwarmError> {
        let tags: Vec<String> = {
            let consumers = self.consumers.lock().await;
            consumers
                .iter()
                .filter(|(_, entry)| entry.active.load(Ordering::SeqCst))
                .map(|(tag, _)| tag.clone())
                .collect()
        };
        for tag in &tags {
            self.spawn_consumer(tag).await?;
        }
        Ok(())
    }

    /// Cancel one consumer: no further deliveries reach its handler.
    pub async fn cancel_consumer(&self, handle: &ConsumerHandle) -> Result<(), SwarmError> {
        let entry = {
            let mut consumers = self.consumers.lock().await;
            consumers.remove(&handle.tag)
        };
        if let Some(entry) = entry {
            entry.active.store(false, Ordering::SeqCst);
        }
        if let Ok(channel) = self.current_channel() {
            let _ = channel
                .basic_cancel(&handle.tag, BasicCancelOptions::default())
                .await;
        }
        Ok(())
    }

    /// Stop all consumers (kept registered but inactive): shutdown step one.
    pub async fn stop_consumers(&self) {
        let tags: Vec<String> = {
            let consumers = self.consumers.lock().await;
            for entry in consumers.values() {
                entry.active.store(false, Ordering::SeqCst);
            }
            consumers.keys().cloned().collect()
        };
        if let Ok(channel) = self.current_channel() {
            for tag in &tags {
                let _ = channel
                    .basic_cancel(tag, BasicCancelOptions::default())
                    .await;
            }
        }
    }

    /// Wait until every in-flight delivery settles, or the timeout passes.
    /// Returns whether the drain completed.
    pub async fn wait_for_drain(&self, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Stop consumers, drain in-flight handlers up to `drain_timeout_ms`,
    /// then close channel and connection. Idempotent.
    pub async fn close(&self, drain_timeout_ms: u64) -> Result<(), SwarmError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(ConnectionState::Closing);
        self.stop_consumers().await;
        if !self.wait_for_drain(drain_timeout_ms).await {
            log::warn!(
                "drain timed out after {}ms with {} deliveries in flight",
                drain_timeout_ms,
                self.in_flight.load(Ordering::SeqCst)
            );
        }

        let channel = {
            let mut slot = self.channel.write().expect("channel lock poisoned");
            slot.take()
        };
        if let Some(channel) = channel {
            let _ = channel.close(200, "shutting down").await;
        }
        let connection = {
            let mut slot = self.connection.lock().await;
            slot.take()
        };
        if let Some(connection) = connection {
            let _ = connection.close(200, "shutting down").await;
        }
        // Wake the supervisor so it can observe the closing flag and exit.
        let _ = self.loss_tx.send(());
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }
}
