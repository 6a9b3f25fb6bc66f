//! Topic to listener bindings
//!
//! Thread-safe mapping from [`Topic`] to the set of listeners registered for
//! it, with a reverse index so a listener can be removed from every topic at
//! once. Mutations report which topics gained their first listener or lost
//! their last one, so the caller can issue incremental subscribe/unsubscribe
//! calls for exactly those topics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::listener::{ListenerHandle, MessageListener};
use crate::topic::{Topic, TopicSet};

#[derive(Default)]
struct Bindings {
    by_topic: HashMap<Topic, HashSet<ListenerHandle>>,
    by_listener: HashMap<ListenerHandle, HashSet<Topic>>,
}

/// Registry of listener bindings, read on every inbound message
#[derive(Default)]
pub struct ListenerRegistry {
    bindings: RwLock<Bindings>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `listener` to each of `topics`.
    ///
    /// Binding an existing pair is a no-op. Returns the topics that had no
    /// listener before this call.
    pub fn add<I>(&self, listener: &Arc<dyn MessageListener>, topics: I) -> Vec<Topic>
    where
        I: IntoIterator<Item = Topic>,
    {
        let handle = ListenerHandle(Arc::clone(listener));
        let mut bindings = self.bindings.write();
        let mut activated = Vec::new();

        for topic in topics {
            let listeners = bindings.by_topic.entry(topic.clone()).or_default();
            let was_empty = listeners.is_empty();
            if !listeners.insert(handle.clone()) {
                continue;
            }
            if was_empty {
                activated.push(topic.clone());
            }
            bindings
                .by_listener
                .entry(handle.clone())
                .or_default()
                .insert(topic);
        }

        activated
    }

    /// Unbind `listener` from each of `topics`.
    ///
    /// Unbinding a missing pair is a no-op. Returns the topics left without
    /// any listener by this call.
    pub fn remove<I>(&self, listener: &Arc<dyn MessageListener>, topics: I) -> Vec<Topic>
    where
        I: IntoIterator<Item = Topic>,
    {
        let handle = ListenerHandle(Arc::clone(listener));
        let mut bindings = self.bindings.write();
        let mut deactivated = Vec::new();

        for topic in topics {
            if unbind(&mut bindings, &handle, &topic) {
                deactivated.push(topic);
            }
        }

        deactivated
    }

    /// Unbind `listener` from every topic it is registered for
    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) -> Vec<Topic> {
        let handle = ListenerHandle(Arc::clone(listener));
        let mut bindings = self.bindings.write();

        let topics: Vec<Topic> = match bindings.by_listener.get(&handle) {
            Some(topics) => topics.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let mut deactivated: Vec<Topic> = topics
            .into_iter()
            .filter(|topic| unbind(&mut bindings, &handle, topic))
            .collect();
        deactivated.sort();
        deactivated
    }

    /// Listeners currently bound to `topic`
    pub fn listeners(&self, topic: &Topic) -> Vec<Arc<dyn MessageListener>> {
        self.bindings
            .read()
            .by_topic
            .get(topic)
            .map(|listeners| listeners.iter().map(|h| Arc::clone(&h.0)).collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.bindings
            .read()
            .by_topic
            .get(topic)
            .map_or(0, HashSet::len)
    }

    /// All topics with at least one listener, sorted
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.bindings.read().by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().by_topic.is_empty()
    }

    pub(crate) fn topic_set(&self) -> TopicSet {
        self.bindings.read().by_topic.keys().collect()
    }
}

/// Remove one binding; true when `topic` lost its last listener.
fn unbind(bindings: &mut Bindings, handle: &ListenerHandle, topic: &Topic) -> bool {
    let Some(listeners) = bindings.by_topic.get_mut(topic) else {
        return false;
    };
    if !listeners.remove(handle) {
        return false;
    }

    if let Some(topics) = bindings.by_listener.get_mut(handle) {
        topics.remove(topic);
        if topics.is_empty() {
            bindings.by_listener.remove(handle);
        }
    }

    if listeners.is_empty() {
        bindings.by_topic.remove(topic);
        true
    } else {
        false
    }
}
