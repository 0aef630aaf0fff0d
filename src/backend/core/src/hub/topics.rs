//! Two-way topic subscription index.
//!
//! `topic -> clients` answers "who receives this broadcast", and
//! `client -> topics` makes disconnect cleanup proportional to the client's
//! own subscriptions. Both maps change together or not at all.

use std::collections::{HashMap, HashSet};

use super::client::ClientId;

#[derive(Debug, Default)]
pub struct TopicIndex {
    topics: HashMap<String, HashSet<ClientId>>,
    client_topics: HashMap<ClientId, HashSet<String>>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a client to a topic. Returns false if it already was.
    pub fn subscribe(&mut self, client_id: ClientId, topic: &str) -> bool {
        let added = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id);

        if added {
            self.client_topics
                .entry(client_id)
                .or_default()
                .insert(topic.to_string());
        }

        added
    }

    /// Unsubscribe a client from a topic. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, client_id: ClientId, topic: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(members) => {
                let removed = members.remove(&client_id);
                if members.is_empty() {
                    self.topics.remove(topic);
                }
                removed
            }
            None => false,
        };

        if removed {
            if let Some(topics) = self.client_topics.get_mut(&client_id) {
                topics.remove(topic);
                if topics.is_empty() {
                    self.client_topics.remove(&client_id);
                }
            }
        }

        removed
    }

    /// Remove a client from every topic (disconnect cleanup).
    pub fn remove_client(&mut self, client_id: ClientId) {
        if let Some(topics) = self.client_topics.remove(&client_id) {
            for topic in topics {
                if let Some(members) = self.topics.get_mut(&topic) {
                    members.remove(&client_id);
                    if members.is_empty() {
                        self.topics.remove(&topic);
                    }
                }
            }
        }
    }

    /// Clients subscribed to a topic.
    pub fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        self.topics
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Topics a client is subscribed to.
    pub fn topics_of(&self, client_id: ClientId) -> Vec<String> {
        self.client_topics
            .get(&client_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_two_way() {
        let mut index = TopicIndex::new();
        let client = ClientId::new();

        assert!(index.subscribe(client, "experiment:a"));
        assert!(!index.subscribe(client, "experiment:a"));
        assert_eq!(index.subscribers("experiment:a"), vec![client]);
        assert_eq!(index.topics_of(client), vec!["experiment:a".to_string()]);
    }

    #[test]
    fn test_unsubscribe_drops_empty_topics() {
        let mut index = TopicIndex::new();
        let client = ClientId::new();

        index.subscribe(client, "metrics:a");
        assert!(index.unsubscribe(client, "metrics:a"));
        assert!(!index.unsubscribe(client, "metrics:a"));
        assert_eq!(index.topic_count(), 0);
        assert!(index.topics_of(client).is_empty());
    }

    #[test]
    fn test_remove_client_leaves_others() {
        let mut index = TopicIndex::new();
        let a = ClientId::new();
        let b = ClientId::new();

        index.subscribe(a, "experiment:x");
        index.subscribe(a, "experiment:y");
        index.subscribe(b, "experiment:x");

        index.remove_client(a);

        assert_eq!(index.subscribers("experiment:x"), vec![b]);
        assert!(index.subscribers("experiment:y").is_empty());
        assert!(index.topics_of(a).is_empty());
    }
}
