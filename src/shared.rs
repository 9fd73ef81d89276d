//! State shared by every connection thread and the accept loop.
//!
//! Reads and mutations are serialized by `parking_lot::RwLock`s: the
//! subscription trie is read-heavy (many matchers, occasional writers), the
//! retained map and the client table see mostly writes on connect,
//! subscribe and disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::client::ClientHandle;
use crate::packet::QoS;
use crate::subscription::SubscriptionStore;

/// A retained message, stored by topic.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub payload: Bytes,
    /// Original publish QoS; delivery downgrades to QoS 0 for now.
    #[allow(dead_code)]
    pub qos: QoS,
}

/// Shared broker state.
pub struct SharedState {
    /// Topic subscription trie.
    pub subscriptions: RwLock<SubscriptionStore>,
    /// Retained messages by topic.
    pub retained: RwLock<HashMap<String, RetainedMessage>>,
    /// Client table: connection id → write handle. The broker exclusively
    /// owns client lifecycles; a client is removed from this table before
    /// its stream is closed.
    pub clients: RwLock<AHashMap<u64, Arc<ClientHandle>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(SubscriptionStore::new()),
            retained: RwLock::new(HashMap::new()),
            clients: RwLock::new(AHashMap::new()),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience type alias for the shared state handle.
pub type SharedStateHandle = Arc<SharedState>;
