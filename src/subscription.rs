//! Subscription store with trie-based topic matching.

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::ClientHandle;
use crate::packet::{QoS, SubscriptionOptions};

/// Subscriber info stored in the trie.
///
/// Carries the connection id for identification and removal, and a shared
/// write handle so any thread can deliver directly to the client.
#[derive(Clone)]
pub struct Subscriber {
    /// Broker-assigned connection id.
    pub id: u64,
    /// Direct write access to the client's stream.
    pub handle: Arc<ClientHandle>,
    /// Subscription QoS; deliveries are QoS 0 until the QoS 1/2 flow exists.
    #[allow(dead_code)]
    pub qos: QoS,
    /// Full subscription options from the SUBSCRIBE options byte.
    pub options: SubscriptionOptions,
    /// MQTT 5 subscription identifier (if specified in SUBSCRIBE).
    #[allow(dead_code)]
    pub subscription_id: Option<u32>,
}

/// A node in the subscription trie, keyed by topic level.
///
/// Nodes left with no subscribers and no children are not pruned.
#[derive(Default)]
struct TrieNode {
    /// Direct subscribers at this node.
    subscribers: Vec<Subscriber>,
    /// Child nodes by topic level.
    children: HashMap<String, TrieNode>,
    /// Single-level wildcard (+) child.
    single_wildcard: Option<Box<TrieNode>>,
    /// Multi-level wildcard (#) subscribers.
    multi_wildcard: Vec<Subscriber>,
}

impl TrieNode {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, levels: &[&str], subscriber: Subscriber) {
        if levels.is_empty() {
            // Duplicate subscriptions from the same client accumulate;
            // unsubscribe removes one reference at a time.
            self.subscribers.push(subscriber);
            return;
        }

        let level = levels[0];
        let remaining = &levels[1..];

        match level {
            "#" => {
                // Multi-level wildcard - must be last
                self.multi_wildcard.push(subscriber);
            }
            "+" => {
                let child = self
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()));
                child.insert(remaining, subscriber);
            }
            _ => {
                let child = self.children.entry(level.to_string()).or_default();
                child.insert(remaining, subscriber);
            }
        }
    }

    /// Remove the first reference to `id` at the filter's terminal node.
    fn remove(&mut self, levels: &[&str], id: u64) -> bool {
        if levels.is_empty() {
            return remove_first(&mut self.subscribers, id);
        }

        let level = levels[0];
        let remaining = &levels[1..];

        match level {
            "#" => remove_first(&mut self.multi_wildcard, id),
            "+" => match &mut self.single_wildcard {
                Some(child) => child.remove(remaining, id),
                None => false,
            },
            _ => match self.children.get_mut(level) {
                Some(child) => child.remove(remaining, id),
                None => false,
            },
        }
    }

    fn remove_client(&mut self, id: u64) {
        self.subscribers.retain(|subscriber| subscriber.id != id);
        self.multi_wildcard.retain(|subscriber| subscriber.id != id);

        if let Some(child) = &mut self.single_wildcard {
            child.remove_client(id);
        }

        for child in self.children.values_mut() {
            child.remove_client(id);
        }
    }

    fn collect_subscribers(&self, levels: &[&str], is_root: bool, result: &mut Vec<Subscriber>) {
        // Topics starting with $ are not matched by wildcards at root level
        // (MQTT-4.7.2-1)
        let skip_wildcards = is_root && levels.first().is_some_and(|level| level.starts_with('$'));

        if !skip_wildcards {
            // Multi-level wildcard matches everything from here
            result.extend(self.multi_wildcard.iter().cloned());
        }

        if levels.is_empty() {
            result.extend(self.subscribers.iter().cloned());
            return;
        }

        let level = levels[0];
        let remaining = &levels[1..];

        if !skip_wildcards {
            if let Some(child) = &self.single_wildcard {
                child.collect_subscribers(remaining, false, result);
            }
        }

        if let Some(child) = self.children.get(level) {
            child.collect_subscribers(remaining, false, result);
        }
    }
}

fn remove_first(subscribers: &mut Vec<Subscriber>, id: u64) -> bool {
    match subscribers.iter().position(|subscriber| subscriber.id == id) {
        Some(index) => {
            subscribers.remove(index);
            true
        }
        None => false,
    }
}

/// Subscription store using a trie for efficient topic matching.
///
/// The root node matches the empty prefix; the subscriber lists hold
/// non-owning references to clients, so every client must be stripped with
/// [`SubscriptionStore::remove_client`] before its record is destroyed.
pub struct SubscriptionStore {
    root: TrieNode,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Subscribe to a topic filter.
    pub fn subscribe(&mut self, topic_filter: &str, subscriber: Subscriber) {
        let levels: Vec<&str> = topic_filter.split('/').collect();
        self.root.insert(&levels, subscriber);
    }

    /// Remove one subscription of `id` from a topic filter. Returns whether
    /// a subscription existed.
    pub fn unsubscribe(&mut self, topic_filter: &str, id: u64) -> bool {
        let levels: Vec<&str> = topic_filter.split('/').collect();
        self.root.remove(&levels, id)
    }

    /// Remove every subscription of a client.
    pub fn remove_client(&mut self, id: u64) {
        self.root.remove_client(id);
    }

    /// Find all subscribers matching a topic, in visit order.
    pub fn matches(&self, topic: &str) -> Vec<Subscriber> {
        let mut subscribers = Vec::new();
        let levels: Vec<&str> = topic.split('/').collect();
        self.root.collect_subscribers(&levels, true, &mut subscribers);
        subscribers
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a topic matches a topic filter (which may contain wildcards).
/// Used for delivering retained messages to new subscribers.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            return true;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len() && fi == filter_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    /// Handles need a live stream; a loopback pair is the cheapest way to
    /// get one in tests.
    fn make_handle(id: u64) -> Arc<ClientHandle> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();
        Arc::new(ClientHandle::new(id, stream, addr))
    }

    fn sub(id: u64) -> Subscriber {
        Subscriber {
            id,
            handle: make_handle(id),
            qos: QoS::AtMostOnce,
            options: SubscriptionOptions::default(),
            subscription_id: None,
        }
    }

    fn ids(subscribers: &[Subscriber]) -> Vec<u64> {
        subscribers.iter().map(|subscriber| subscriber.id).collect()
    }

    #[test]
    fn test_exact_match() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", sub(1));

        assert_eq!(ids(&store.matches("a/b")), vec![1]);
        assert!(store.matches("a/c").is_empty());
        assert!(store.matches("a").is_empty());
        assert!(store.matches("a/b/c").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/+/c", sub(1));

        assert_eq!(ids(&store.matches("a/b/c")), vec![1]);
        assert_eq!(ids(&store.matches("a/x/c")), vec![1]);
        assert!(store.matches("a/b/d").is_empty());
        assert!(store.matches("a/c").is_empty());
        assert!(store.matches("a/b/c/d").is_empty());
    }

    #[test]
    fn test_multi_wildcard() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sensors/#", sub(1));

        assert_eq!(ids(&store.matches("sensors/temp")), vec![1]);
        assert_eq!(ids(&store.matches("sensors/room1/temp")), vec![1]);
        assert!(store.matches("actuators/light").is_empty());
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let mut store = SubscriptionStore::new();
        store.subscribe("#", sub(1));
        store.subscribe("+/broker", sub(2));
        store.subscribe("$SYS/broker", sub(3));

        assert_eq!(ids(&store.matches("$SYS/broker")), vec![3]);
        let matched = ids(&store.matches("any/broker"));
        assert!(matched.contains(&1));
        assert!(matched.contains(&2));
    }

    #[test]
    fn test_duplicate_subscriptions_accumulate() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", sub(1));
        store.subscribe("a/b", sub(1));

        assert_eq!(ids(&store.matches("a/b")), vec![1, 1]);

        // Unsubscribe removes one reference at a time
        assert!(store.unsubscribe("a/b", 1));
        assert_eq!(ids(&store.matches("a/b")), vec![1]);
        assert!(store.unsubscribe("a/b", 1));
        assert!(store.matches("a/b").is_empty());
        assert!(!store.unsubscribe("a/b", 1));
    }

    #[test]
    fn test_unsubscribe_leaves_other_clients() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", sub(1));
        store.subscribe("a/b", sub(2));

        assert!(store.unsubscribe("a/b", 1));
        assert_eq!(ids(&store.matches("a/b")), vec![2]);
    }

    #[test]
    fn test_unsubscribe_wildcard_filters() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/+", sub(1));
        store.subscribe("a/#", sub(1));

        assert!(store.unsubscribe("a/+", 1));
        assert_eq!(ids(&store.matches("a/b")), vec![1]);
        assert!(store.unsubscribe("a/#", 1));
        assert!(store.matches("a/b").is_empty());
    }

    #[test]
    fn test_remove_client_strips_everything() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", sub(1));
        store.subscribe("a/+", sub(1));
        store.subscribe("#", sub(1));
        store.subscribe("a/b", sub(2));

        store.remove_client(1);

        assert_eq!(ids(&store.matches("a/b")), vec![2]);
        assert!(store.matches("x/y").is_empty());
    }

    #[test]
    fn test_overlapping_filters_match_separately() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/b", sub(1));
        store.subscribe("a/+", sub(1));

        // One reference per matching filter; the dispatcher deduplicates
        assert_eq!(store.matches("a/b").len(), 2);
    }

    #[test]
    fn test_topic_matches_filter() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "#"));
        assert!(!topic_matches_filter("a/b/d", "a/+/c"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
    }
}
