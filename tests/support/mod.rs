// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the broker traits, used by the integration tests.
//!
//! It keeps exchanges, queues and bindings, routes published messages (direct, topic
//! and fanout), tracks unacknowledged deliveries per connection and can drop every
//! connection at once to simulate a broker restart. Exclusive queues are deleted and
//! unacknowledged deliveries requeued when their connection goes away.

#![allow(dead_code)]

use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use rabbitmq_pubsub::{
    broker::{
        BrokerChannel, BrokerConnection, CloseCallback, Connector, DeliveryStream,
        IncomingMessage,
    },
    consumer::{ConsumerState, HandlerResult, MessageHandler},
    endpoint::Endpoint,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
    topology::AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    Consumer, ConnectionManager,
};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};

pub type Binding = (String, String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct QueueState {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

/// Broker-side topology, comparable across declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub exchanges: BTreeMap<String, (ExchangeKind, bool)>,
    pub queues: BTreeMap<String, QueueState>,
    pub bindings: BTreeSet<Binding>,
}

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    state: QueueState,
    owner: Option<u64>,
    ready: VecDeque<Stored>,
}

struct Unacked {
    queue: String,
    connection: u64,
    message: Stored,
}

struct Conn {
    alive: bool,
    callbacks: Vec<CloseCallback>,
}

#[derive(Default)]
struct State {
    down: HashSet<String>,
    connects: usize,
    exchanges: BTreeMap<String, (ExchangeKind, bool)>,
    queues: BTreeMap<String, Queue>,
    bindings: BTreeSet<Binding>,
    connections: HashMap<u64, Conn>,
    next_connection: u64,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    cancelled: HashSet<String>,
}

impl State {
    fn alive(&self, connection: u64) -> bool {
        self.connections.get(&connection).is_some_and(|c| c.alive)
    }

    fn deliver(&mut self, queue: &str, connection: u64) -> Option<IncomingMessage> {
        let message = self.queues.get_mut(queue)?.ready.pop_front()?;

        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_owned(),
                connection,
                message: message.clone(),
            },
        );

        Some(IncomingMessage {
            delivery_tag: tag,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            properties: message.properties,
            data: message.data,
        })
    }

    fn route(&mut self, exchange: &str, key: &str, message: Stored) -> Result<(), AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![key.to_owned()]
        } else {
            let Some((kind, _)) = self.exchanges.get(exchange) else {
                return Err(AmqpError::PublishingError(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            };

            self.bindings
                .iter()
                .filter(|(_, e, pattern)| {
                    e == exchange
                        && match kind {
                            ExchangeKind::Direct => pattern == key,
                            ExchangeKind::Topic => topic_matches(pattern, key),
                            ExchangeKind::Fanout | ExchangeKind::Headers => true,
                        }
                })
                .map(|(q, _, _)| q.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }

        Ok(())
    }

    /// Marks a connection dead and returns the callbacks to fire.
    fn kill(&mut self, connection: u64) -> Vec<CloseCallback> {
        let callbacks = match self.connections.get_mut(&connection) {
            Some(conn) if conn.alive => {
                conn.alive = false;
                std::mem::take(&mut conn.callbacks)
            }
            _ => return vec![],
        };

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
        }
        self.bindings.retain(|(q, _, _)| !exclusive.contains(q));

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }

        callbacks
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemConnector {
            broker: self.clone(),
        })
    }

    /// A connection manager over the default endpoint of this broker.
    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            vec![Endpoint::default()],
            self.connector(),
        ))
    }

    /// Makes `host` refuse (or accept again) new connections.
    pub fn set_down(&self, host: &str, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(host.to_owned());
        } else {
            state.down.remove(host);
        }
    }

    /// Number of connection attempts, refused ones included.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.alive).count()
    }

    /// Closes every live connection as a broker restart would.
    pub fn drop_connections(&self) {
        let callbacks: Vec<CloseCallback> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter().flat_map(|id| state.kill(id)).collect()
        };

        for mut callback in callbacks {
            callback(AmqpError::TransportFailure(
                "connection reset by peer".to_owned(),
            ));
        }
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            exchanges: state.exchanges.clone(),
            queues: state
                .queues
                .iter()
                .map(|(name, q)| (name.clone(), q.state.clone()))
                .collect(),
            bindings: state.bindings.clone(),
        }
    }

    /// Ready messages of `queue`, `None` when the queue does not exist.
    pub fn ready(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

struct MemConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.broker.lock();
        state.connects += 1;

        if state.down.contains(&endpoint.host) {
            return Err(AmqpError::BrokerUnreachable(endpoint.to_string()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            Conn {
                alive: true,
                callbacks: vec![],
            },
        );

        Ok(Arc::new(MemConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct MemConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemConnection {
    fn is_connected(&self) -> bool {
        self.broker.lock().alive(self.id)
    }

    fn on_close(&self, callback: CloseCallback) {
        if let Some(conn) = self.broker.lock().connections.get_mut(&self.id) {
            conn.callbacks.push(callback);
        }
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        Ok(Arc::new(MemChannel {
            broker: self.broker.clone(),
            connection: self.id,
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        // A graceful close does not notify the close callbacks.
        let _ = self.broker.lock().kill(self.id);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

struct MemChannel {
    broker: MemoryBroker,
    connection: u64,
    open: AtomicBool,
}

impl MemChannel {
    fn usable(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.broker.lock();
        if self.open.load(Ordering::SeqCst) && state.alive(self.connection) {
            Ok(state)
        } else {
            Err(AmqpError::TransportFailure("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemChannel {
    fn is_open(&self) -> bool {
        self.usable().is_ok()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        let name = def.wire_name();
        let wanted = (def.exchange_kind().clone(), def.is_durable());

        match state.exchanges.get(&name) {
            Some(existing) if *existing != wanted => Err(AmqpError::TopologyConflict(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name, wanted);
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        def: &QueueDefinition,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError> {
        let mut state = self.usable()?;
        let wanted = QueueState {
            durable: def.is_durable(),
            exclusive: def.is_exclusive(),
            auto_delete: def.is_auto_delete(),
            arguments,
        };

        match state.queues.get(def.name()) {
            Some(queue) if queue.owner.is_some() && queue.owner != Some(self.connection) => {
                Err(AmqpError::TransportFailure(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                    def.name()
                )))
            }
            Some(queue) if queue.state != wanted => Err(AmqpError::TopologyConflict(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                def.name()
            ))),
            Some(queue) => Ok(queue.ready.len() as u32),
            None => {
                let owner = wanted.exclusive.then_some(self.connection);
                state.queues.insert(
                    def.name().to_owned(),
                    Queue {
                        state: wanted,
                        owner,
                        ready: VecDeque::new(),
                    },
                );
                Ok(0)
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::TopologyConflict(format!(
                "NOT_FOUND - cannot bind '{}' to '{}'",
                queue, exchange
            )));
        }

        state
            .bindings
            .insert((queue.to_owned(), exchange.to_owned(), routing_key.to_owned()));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.usable()?.route(
            exchange,
            routing_key,
            Stored {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties,
                data: payload.to_vec(),
                redelivered: false,
            },
        )?;
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, AmqpError> {
        let state = self.usable()?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::TopologyConflict(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }

        Ok(Box::new(MemStream {
            broker: self.broker.clone(),
            queue: queue.to_owned(),
            connection: self.connection,
            tag: consumer_tag.to_owned(),
        }))
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<IncomingMessage>, AmqpError> {
        let connection = self.connection;
        Ok(self.usable()?.deliver(queue, connection))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self.usable()?.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError(format!(
                "unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::RejectMessageError(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        };

        let Some(queue) = state.queues.get_mut(&unacked.queue) else {
            return Ok(());
        };

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        } else if let Some(AMQPValue::LongString(target)) = queue
            .state
            .arguments
            .inner()
            .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .cloned()
        {
            state.route("", &target.to_string(), unacked.message)?;
        }

        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.usable()?.cancelled.insert(consumer_tag.to_owned());
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.usable()?;
        match state.queues.get_mut(queue) {
            Some(q) => {
                let purged = q.ready.len() as u32;
                q.ready.clear();
                Ok(purged)
            }
            None => Err(AmqpError::TopologyConflict(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            ))),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemStream {
    broker: MemoryBroker,
    queue: String,
    connection: u64,
    tag: String,
}

#[async_trait]
impl DeliveryStream for MemStream {
    async fn next(&mut self) -> Option<Result<IncomingMessage, AmqpError>> {
        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.lock();
                if !state.alive(self.connection)
                    || state.cancelled.contains(&self.tag)
                    || !state.queues.contains_key(&self.queue)
                {
                    return None;
                }

                if let Some(message) = state.deliver(&self.queue, self.connection) {
                    return Some(Ok(message));
                }
            }

            notified.await;
        }
    }
}

/// Records every message it sees and rejects the ones listed.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Value>>>,
    reject: Vec<Value>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder::default()
    }

    pub fn rejecting(mut self, message: Value) -> Recorder {
        self.reject.push(message);
        self
    }

    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn process(&self, message: Value) -> HandlerResult {
        let accepted = !self.reject.contains(&message);
        self.seen.lock().unwrap().push(message);
        Ok(accepted)
    }
}

/// Runs `consumer` on its own task.
pub fn spawn<H>(consumer: Arc<Consumer>, handler: H) -> JoinHandle<Result<(), AmqpError>>
where
    H: MessageHandler + 'static,
{
    tokio::spawn(async move { consumer.run(&handler).await })
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(consumer: &Consumer, wanted: ConsumerState) {
    let mut states = consumer.watch_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
        .await
        .expect("consumer state timeout")
        .expect("consumer dropped");
}
