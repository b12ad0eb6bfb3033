use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
    /// Set when the message is a retained value replayed on subscribe.
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub last_will: Option<LastWill>,
}

impl ConnectOptions {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, last_will: LastWill) -> Self {
        self.last_will = Some(last_will);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus {0} is unavailable")]
    Unavailable(String),
    #[error("unsupported bus url: {0}")]
    UnsupportedUrl(String),
    #[error("client id {0} is already connected")]
    DuplicateClient(String),
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("invalid publish topic: {0}")]
    InvalidTopic(String),
    #[error("client {0} is not connected")]
    NotConnected(String),
    #[error("bus state lock poisoned")]
    LockPoisoned,
}

impl BusError {
    /// Connection failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One connected actor's handle on the bus. Every subscription delivers into a
/// single inbound queue owned by the client.
pub trait BusClient: Send {
    fn client_id(&self) -> &str;
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError>;
    fn subscribe(&self, filter: &str) -> Result<(), BusError>;
    fn unsubscribe(&self, filter: &str) -> Result<(), BusError>;
    /// Waits up to `timeout` for the next inbound message; `Ok(None)` on timeout.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError>;
    /// Clean disconnect: the registered last-will is discarded.
    fn disconnect(&mut self) -> Result<(), BusError>;
}

pub trait BusConnector: Clone + Send + Sync + 'static {
    type Client: BusClient + 'static;

    fn connect(&self, options: &ConnectOptions) -> Result<Self::Client, BusError>;
}

#[derive(Debug)]
struct ClientEntry {
    sender: Sender<BusMessage>,
    filters: Vec<String>,
    last_will: Option<LastWill>,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    clients: HashMap<String, ClientEntry>,
    retained: BTreeMap<String, String>,
}

/// Single-process broker with retained messages, last-will and `+`/`#`
/// topic filters. Delivery is at-most-once per client per publish.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                clients: HashMap::new(),
                retained: BTreeMap::new(),
            })),
        }
    }

    /// Builds a broker from a `memory://<name>` url.
    pub fn from_url(url: &str) -> Result<Self, BusError> {
        let name = url
            .trim()
            .strip_prefix(MEMORY_SCHEME)
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| BusError::UnsupportedUrl(url.to_string()))?;
        Ok(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_available(&self, available: bool) -> Result<(), BusError> {
        self.lock()?.available = available;
        Ok(())
    }

    pub fn retained(&self, topic: &str) -> Result<Option<String>, BusError> {
        Ok(self.lock()?.retained.get(topic).cloned())
    }

    pub fn connected_clients(&self) -> Result<Vec<String>, BusError> {
        let mut ids: Vec<String> = self.lock()?.clients.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BusError> {
        self.state.lock().map_err(|_| BusError::LockPoisoned)
    }

    fn publish_from(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        validate_topic(topic)?;
        let mut state = self.lock()?;
        route(&mut state, topic, payload, retain);
        Ok(())
    }

    fn subscribe_client(&self, client_id: &str, filter: &str) -> Result<(), BusError> {
        validate_filter(filter)?;
        let mut state = self.lock()?;
        let BrokerState {
            clients, retained, ..
        } = &mut *state;

        let entry = clients
            .get_mut(client_id)
            .ok_or_else(|| BusError::NotConnected(client_id.to_string()))?;
        if !entry.filters.iter().any(|existing| existing == filter) {
            entry.filters.push(filter.to_string());
        }

        for (topic, payload) in retained.iter() {
            if topic_matches(filter, topic) {
                let _ = entry.sender.send(BusMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retained: true,
                });
            }
        }

        Ok(())
    }

    fn unsubscribe_client(&self, client_id: &str, filter: &str) -> Result<(), BusError> {
        let mut state = self.lock()?;
        let entry = state
            .clients
            .get_mut(client_id)
            .ok_or_else(|| BusError::NotConnected(client_id.to_string()))?;
        entry.filters.retain(|existing| existing != filter);
        Ok(())
    }

    fn remove_client(&self, client_id: &str, clean: bool) -> Result<(), BusError> {
        let mut state = self.lock()?;
        let entry = state
            .clients
            .remove(client_id)
            .ok_or_else(|| BusError::NotConnected(client_id.to_string()))?;

        if clean {
            tracing::debug!(broker = %self.name, client_id, "client disconnected cleanly");
            return Ok(());
        }

        tracing::info!(broker = %self.name, client_id, "client lost, publishing last will");
        if let Some(will) = entry.last_will {
            route(&mut state, &will.topic, &will.payload, will.retain);
        }
        Ok(())
    }
}

impl BusConnector for InMemoryBroker {
    type Client = InMemoryClient;

    fn connect(&self, options: &ConnectOptions) -> Result<InMemoryClient, BusError> {
        if let Some(will) = &options.last_will {
            validate_topic(&will.topic)?;
        }

        let mut state = self.lock()?;
        if !state.available {
            return Err(BusError::Unavailable(self.name.clone()));
        }
        if state.clients.contains_key(&options.client_id) {
            return Err(BusError::DuplicateClient(options.client_id.clone()));
        }

        let (sender, inbound) = mpsc::channel();
        state.clients.insert(
            options.client_id.clone(),
            ClientEntry {
                sender,
                filters: Vec::new(),
                last_will: options.last_will.clone(),
            },
        );

        Ok(InMemoryClient {
            client_id: options.client_id.clone(),
            broker: self.clone(),
            inbound,
            connected: true,
        })
    }
}

#[derive(Debug)]
pub struct InMemoryClient {
    client_id: String,
    broker: InMemoryBroker,
    inbound: Receiver<BusMessage>,
    connected: bool,
}

impl InMemoryClient {
    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.connected {
            Ok(())
        } else {
            Err(BusError::NotConnected(self.client_id.clone()))
        }
    }
}

impl BusClient for InMemoryClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.broker.publish_from(topic, payload, retain)
    }

    fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.broker.subscribe_client(&self.client_id, filter)
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.broker.unsubscribe_client(&self.client_id, filter)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        self.ensure_connected()?;
        match self.inbound.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BusError::NotConnected(self.client_id.clone()))
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.connected = false;
        self.broker.remove_client(&self.client_id, true)
    }
}

impl Drop for InMemoryClient {
    // Dropping without disconnect() is the in-process equivalent of a lost
    // connection: the broker fires the last-will.
    fn drop(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.broker.remove_client(&self.client_id, false);
        }
    }
}

fn route(state: &mut BrokerState, topic: &str, payload: &str, retain: bool) {
    if retain {
        if payload.is_empty() {
            state.retained.remove(topic);
        } else {
            state
                .retained
                .insert(topic.to_string(), payload.to_string());
        }
    }

    for entry in state.clients.values() {
        if entry
            .filters
            .iter()
            .any(|filter| topic_matches(filter, topic))
        {
            let _ = entry.sender.send(BusMessage {
                topic: topic.to_string(),
                payload: payload.to_string(),
                retained: false,
            });
        }
    }
}

/// MQTT-style filter match: `+` is one level, a trailing `#` is any suffix.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_filter(filter: &str) -> Result<(), BusError> {
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    let valid = !filter.is_empty()
        && levels.iter().enumerate().all(|(index, level)| match *level {
            "#" => index == last,
            "+" => true,
            other => !other.contains('#') && !other.contains('+'),
        });

    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidFilter(filter.to_string()))
    }
}

fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.contains('#') || topic.contains('+') {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
