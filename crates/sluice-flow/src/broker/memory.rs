//! In-memory broker implementation for testing.
//!
//! [`InMemoryBroker`] models exchanges, queues and bindings closely enough to
//! exercise routing failures, and records every operation so tests can assert
//! how often something was published or deleted.
//!
//! ## Fault injection
//!
//! [`InMemoryBroker::inject`] queues errors for a given operation; the next
//! calls of that operation fail with them, in order, before the operation
//! behaves normally again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{BrokerChannel, BrokerError, ExchangeKind, DEFAULT_EXCHANGE};

/// Broker operations, used to target fault injection and read call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    /// [`BrokerChannel::declare_exchange`].
    DeclareExchange,
    /// [`BrokerChannel::declare_queue`].
    DeclareQueue,
    /// [`BrokerChannel::bind_queue`].
    Bind,
    /// [`BrokerChannel::publish`].
    Publish,
    /// [`BrokerChannel::delete_queue`].
    DeleteQueue,
    /// [`BrokerChannel::reconnect`].
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct BrokerState {
    connected: bool,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    bindings: Vec<Binding>,
    faults: HashMap<BrokerOp, VecDeque<BrokerError>>,
    calls: HashMap<BrokerOp, usize>,
    deleted_queues: Vec<String>,
}

/// In-memory broker for testing.
///
/// ## Example
///
/// ```rust
/// use sluice_flow::broker::memory::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// // Hand `Arc::new(broker)` to a QueueTopologyManager...
/// ```
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> BrokerError {
    BrokerError::Transport("lock poisoned".into())
}

impl InMemoryBroker {
    /// Creates a connected broker with no exchanges or queues.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                connected: true,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                faults: HashMap::new(),
                calls: HashMap::new(),
                deleted_queues: Vec::new(),
            }),
        }
    }

    /// Makes the next calls of `op` fail with `errors`, in order.
    pub fn inject(&self, op: BrokerOp, errors: impl IntoIterator<Item = BrokerError>) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.entry(op).or_default().extend(errors);
        }
    }

    /// Simulates the connection dropping under the client.
    pub fn drop_connection(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
        }
    }

    /// Number of times `op` was invoked, failed or not.
    #[must_use]
    pub fn calls(&self, op: BrokerOp) -> usize {
        self.state
            .lock()
            .map(|state| state.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Returns true if the queue currently exists.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.queues.contains_key(name))
            .unwrap_or(false)
    }

    /// Returns true if the exchange currently exists.
    #[must_use]
    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.exchanges.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of queues deleted so far, in deletion order.
    #[must_use]
    pub fn deleted_queues(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.deleted_queues.clone())
            .unwrap_or_default()
    }

    /// Number of messages waiting in `queue`.
    #[must_use]
    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.queues.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Removes and decodes every message waiting in `queue`.
    ///
    /// Messages that fail to decode are skipped.
    #[must_use]
    pub fn drain<T: DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        let raw: Vec<Vec<u8>> = self
            .state
            .lock()
            .map(|mut state| {
                state
                    .queues
                    .get_mut(queue)
                    .map(|q| q.drain(..).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        raw.iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    /// Counts the call, then pops an injected fault or checks the connection.
    fn begin(&self, op: BrokerOp) -> Result<std::sync::MutexGuard<'_, BrokerState>, BrokerError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            if err.is_connection_level() {
                state.connected = false;
            }
            return Err(err);
        }
        if !state.connected && op != BrokerOp::Reconnect {
            return Err(BrokerError::ConnectionClosed("channel is closed".into()));
        }
        Ok(state)
    }
}

fn channel_not_found(what: &str) -> BrokerError {
    BrokerError::Channel {
        code: 404,
        reason: format!("NOT_FOUND - no {what}"),
    }
}

fn routing_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => binding_key == "#" || binding_key == routing_key,
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::DeclareExchange)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Channel {
                code: 406,
                reason: format!(
                    "PRECONDITION_FAILED - exchange '{name}' is {} not {}",
                    existing.as_str(),
                    kind.as_str()
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::DeclareQueue)?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::Bind)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(channel_not_found(&format!("exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(channel_not_found(&format!("queue '{queue}'")));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::Publish)?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let Some(kind) = state.exchanges.get(exchange).copied() else {
                return Err(channel_not_found(&format!("exchange '{exchange}'")));
            };
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && routing_matches(kind, &b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .filter(|q| state.queues.contains_key(q))
                .collect()
        };

        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.push_back(body.to_vec());
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::DeleteQueue)?;
        if state.queues.remove(name).is_none() {
            return Err(BrokerError::NotFound {
                resource: format!("queue '{name}'"),
            });
        }
        state.bindings.retain(|b| b.queue != name);
        state.deleted_queues.push(name.to_string());
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::Reconnect)?;
        state.connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.connected = false;
        Ok(())
    }
}
