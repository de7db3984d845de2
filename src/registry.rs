//! Subscriber registries for written-event notifications.
//!
//! Subscribers live in an arena and are addressed by generation-checked
//! [`SubscriberId`] handles, so a handle that survives its subscriber's
//! removal can never resolve to a slot that was reused for someone else.
//! Two populations share the arena: default subscribers (no aggregate
//! filter, notified of every written event) and aggregate subscribers
//! (notified when their aggregate id appears in an event's routing
//! destinations).

use std::collections::{HashMap, HashSet};

use crate::protocol::EventSubscriber;

/// Opaque handle to a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriberId {
    index: usize,
    generation: u64,
}

struct Entry {
    sender: EventSubscriber,
    aggregate_id: Option<String>,
}

struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// Arena of subscribers plus the default and per-aggregate lookup sets.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    defaults: HashSet<SubscriberId>,
    by_aggregate: HashMap<String, HashSet<SubscriberId>>,
    len: usize,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber channel under the given scope.
    ///
    /// Registration is idempotent per `(channel, scope)`: re-registering
    /// the same underlying channel with the same aggregate id returns the
    /// existing handle and reports `false`, so the caller does not spawn a
    /// second liveness watch.
    pub fn register(
        &mut self,
        sender: EventSubscriber,
        aggregate_id: Option<String>,
    ) -> (SubscriberId, bool) {
        if let Some(existing) = self.find(&sender, aggregate_id.as_deref()) {
            return (existing, false);
        }

        let entry = Entry {
            sender,
            aggregate_id: aggregate_id.clone(),
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                self.slots.len() - 1
            }
        };

        let id = SubscriberId {
            index,
            generation: self.slots[index].generation,
        };

        match aggregate_id {
            Some(aggregate_id) => {
                self.by_aggregate.entry(aggregate_id).or_default().insert(id);
            }
            None => {
                self.defaults.insert(id);
            }
        }
        self.len += 1;
        (id, true)
    }

    /// Remove a subscriber by handle. Returns `false` for a stale or
    /// unknown handle.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index) else {
            return false;
        };
        if slot.generation != id.generation {
            return false;
        }
        let Some(entry) = slot.entry.take() else {
            return false;
        };

        // Invalidate outstanding handles to this slot before reuse.
        slot.generation += 1;
        self.free.push(id.index);
        self.len -= 1;

        match entry.aggregate_id {
            Some(aggregate_id) => {
                if let Some(ids) = self.by_aggregate.get_mut(&aggregate_id) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.by_aggregate.remove(&aggregate_id);
                    }
                }
            }
            None => {
                self.defaults.remove(&id);
            }
        }
        true
    }

    /// All default subscribers.
    pub fn default_subscribers(&self) -> impl Iterator<Item = &EventSubscriber> {
        self.defaults.iter().filter_map(|id| self.sender(*id))
    }

    /// Subscribers registered under `aggregate_id`.
    pub fn aggregate_subscribers(
        &self,
        aggregate_id: &str,
    ) -> impl Iterator<Item = &EventSubscriber> {
        self.by_aggregate
            .get(aggregate_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sender(*id))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn sender(&self, id: SubscriberId) -> Option<&EventSubscriber> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(|entry| &entry.sender)
    }

    fn find(&self, sender: &EventSubscriber, aggregate_id: Option<&str>) -> Option<SubscriberId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            (entry.sender.same_channel(sender) && entry.aggregate_id.as_deref() == aggregate_id)
                .then_some(SubscriberId {
                    index,
                    generation: slot.generation,
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Notification;
    use tokio::sync::mpsc;

    fn subscriber() -> (
        EventSubscriber,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_and_lookup_default_subscriber() {
        let mut registry = SubscriberRegistry::new();
        let (tx, _rx) = subscriber();

        let (_id, fresh) = registry.register(tx.clone(), None);
        assert!(fresh);
        assert_eq!(registry.len(), 1);

        let defaults: Vec<_> = registry.default_subscribers().collect();
        assert_eq!(defaults.len(), 1);
        assert!(defaults[0].same_channel(&tx));
    }

    #[test]
    fn reverse_lookup_by_aggregate_id() {
        let mut registry = SubscriberRegistry::new();
        let (tx1, _rx1) = subscriber();
        let (tx2, _rx2) = subscriber();
        let (tx3, _rx3) = subscriber();

        registry.register(tx1.clone(), Some("agg-1".to_string()));
        registry.register(tx2.clone(), Some("agg-1".to_string()));
        registry.register(tx3.clone(), Some("agg-2".to_string()));

        let agg1: Vec<_> = registry.aggregate_subscribers("agg-1").collect();
        assert_eq!(agg1.len(), 2);
        assert_eq!(registry.aggregate_subscribers("agg-2").count(), 1);
        assert_eq!(registry.aggregate_subscribers("agg-9").count(), 0);
        assert_eq!(registry.default_subscribers().count(), 0);
    }

    #[test]
    fn re_registering_same_channel_and_scope_is_idempotent() {
        let mut registry = SubscriberRegistry::new();
        let (tx, _rx) = subscriber();

        let (first, fresh_first) = registry.register(tx.clone(), Some("agg-1".to_string()));
        let (second, fresh_second) = registry.register(tx.clone(), Some("agg-1".to_string()));

        assert!(fresh_first);
        assert!(!fresh_second);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_channel_different_scope_registers_twice() {
        let mut registry = SubscriberRegistry::new();
        let (tx, _rx) = subscriber();

        let (default_id, _) = registry.register(tx.clone(), None);
        let (aggregate_id, _) = registry.register(tx.clone(), Some("agg-1".to_string()));

        assert_ne!(default_id, aggregate_id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_clears_both_lookup_paths() {
        let mut registry = SubscriberRegistry::new();
        let (tx, _rx) = subscriber();

        let (id, _) = registry.register(tx, Some("agg-1".to_string()));
        assert!(registry.remove(id));

        assert!(registry.is_empty());
        assert_eq!(registry.aggregate_subscribers("agg-1").count(), 0);
        assert!(!registry.remove(id), "second removal must be a no-op");
    }

    #[test]
    fn stale_handle_does_not_resolve_after_slot_reuse() {
        let mut registry = SubscriberRegistry::new();
        let (tx1, _rx1) = subscriber();
        let (tx2, _rx2) = subscriber();

        let (old, _) = registry.register(tx1, None);
        assert!(registry.remove(old));

        // The freed slot is reused for a different subscriber.
        let (new, _) = registry.register(tx2, None);
        assert_ne!(old, new);

        // The stale handle neither resolves nor removes the new entry.
        assert!(registry.sender(old).is_none());
        assert!(!registry.remove(old));
        assert_eq!(registry.len(), 1);
    }
}
