use crate::models::{EntityKind, RevisionEnvelope};
use crate::revision::RevisionTracker;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A record kept in an [`EntityStore`].
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: EntityKind;

    fn key(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Optimistic,
    Authoritative,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Inserted(T),
    Updated(T),
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub key: String,
    pub change: Change<T>,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;

struct Listeners<T> {
    by_key: HashMap<String, Vec<(SubscriptionId, Listener<T>)>>,
    all: Vec<(SubscriptionId, Listener<T>)>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            by_key: HashMap::new(),
            all: Vec::new(),
        }
    }
}

struct StoreState<T> {
    records: HashMap<String, T>,
    tracker: RevisionTracker,
}

struct StoreInner<T> {
    state: Mutex<StoreState<T>>,
    listeners: Mutex<Listeners<T>>,
    next_subscription: AtomicU64,
}

/// Change events that were produced while the writer held its own locks.
/// Listeners see them once [`HeldEvents::deliver`] runs.
#[must_use = "held change events never reach listeners unless delivered"]
#[derive(Default)]
pub(crate) struct HeldEvents {
    deliveries: Vec<Box<dyn FnOnce() + Send>>,
}

impl HeldEvents {
    pub(crate) fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub(crate) fn append(&mut self, mut other: HeldEvents) {
        self.deliveries.append(&mut other.deliveries);
    }

    pub(crate) fn deliver(self) {
        for delivery in self.deliveries {
            delivery();
        }
    }
}

/// Materialized records of one entity kind plus their authoritative
/// revisions. Optimistic writes (`insert`/`update`/`delete`) never touch the
/// revision tracker; authoritative writes are gated by it.
pub struct EntityStore<T: Record> {
    inner: Arc<StoreInner<T>>,
}

impl<T: Record> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Record> Default for EntityStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> EntityStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    records: HashMap::new(),
                    tracker: RevisionTracker::new(),
                }),
                listeners: Mutex::new(Listeners::default()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.state().records.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().records.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.state().records.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn values(&self) -> Vec<T> {
        let state = self.state();
        let mut entries = state.records.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, record)| record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    pub fn insert(&self, data: T) -> Option<T> {
        let (previous, event) = self.insert_held(data);
        self.emit(vec![event]);
        previous
    }

    /// Applies `mutator` to the record under `key`. Returns false when the key
    /// is not materialized.
    pub fn update<F>(&self, key: &str, mutator: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        match self.update_held(key, mutator) {
            Some(event) => {
                self.emit(vec![event]);
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &str) -> Option<T> {
        let (removed, event) = self.delete_held(key);
        if let Some(event) = event {
            self.emit(vec![event]);
        }
        removed
    }

    pub(crate) fn insert_held(&self, data: T) -> (Option<T>, ChangeEvent<T>) {
        let key = data.key().to_string();
        let previous = self.state().records.insert(key.clone(), data.clone());
        let change = if previous.is_some() {
            Change::Updated(data)
        } else {
            Change::Inserted(data)
        };
        let event = ChangeEvent {
            key,
            change,
            origin: ChangeOrigin::Optimistic,
        };
        (previous, event)
    }

    pub(crate) fn update_held<F>(&self, key: &str, mutator: F) -> Option<ChangeEvent<T>>
    where
        F: FnOnce(&mut T),
    {
        let updated = {
            let mut state = self.state();
            let record = state.records.get_mut(key)?;
            mutator(record);
            record.clone()
        };
        Some(ChangeEvent {
            key: key.to_string(),
            change: Change::Updated(updated),
            origin: ChangeOrigin::Optimistic,
        })
    }

    pub(crate) fn delete_held(&self, key: &str) -> (Option<T>, Option<ChangeEvent<T>>) {
        let removed = self.state().records.remove(key);
        let event = removed.as_ref().map(|_| ChangeEvent {
            key: key.to_string(),
            change: Change::Deleted,
            origin: ChangeOrigin::Optimistic,
        });
        (removed, event)
    }

    /// Wraps events so they reach listeners only when the caller delivers them.
    pub(crate) fn hold(&self, events: Vec<ChangeEvent<T>>) -> HeldEvents {
        let mut held = HeldEvents::default();
        if !events.is_empty() {
            let store = self.clone();
            held.deliveries.push(Box::new(move || store.emit(events)));
        }
        held
    }

    pub fn authoritative_revision(&self, key: &str) -> u64 {
        self.state().tracker.get(key)
    }

    /// Merges one authoritative snapshot. Stale or duplicate deliveries
    /// (`revision <= tracked`) are skipped, which makes application order
    /// independent. Returns whether the snapshot was applied.
    pub fn upsert_authoritative(&self, envelope: RevisionEnvelope<T>) -> bool {
        let event = {
            let mut state = self.state();
            Self::apply_envelope(&mut state, envelope)
        };
        match event {
            Some(event) => {
                self.emit(vec![event]);
                true
            }
            None => false,
        }
    }

    /// Batched merge. Within the batch only the highest revision per key
    /// survives (the first one seen on ties), then everything is written in
    /// a single pass. Returns the number of keys written.
    pub fn upsert_many_authoritative<I>(&self, envelopes: I) -> usize
    where
        I: IntoIterator<Item = RevisionEnvelope<T>>,
    {
        let mut latest: HashMap<String, RevisionEnvelope<T>> = HashMap::new();
        let mut order = Vec::new();
        for envelope in envelopes {
            match latest.get(&envelope.id) {
                Some(existing) if existing.revision >= envelope.revision => {}
                Some(_) => {
                    latest.insert(envelope.id.clone(), envelope);
                }
                None => {
                    order.push(envelope.id.clone());
                    latest.insert(envelope.id.clone(), envelope);
                }
            }
        }

        let events = {
            let mut state = self.state();
            order
                .into_iter()
                .filter_map(|key| latest.remove(&key))
                .filter_map(|envelope| Self::apply_envelope(&mut state, envelope))
                .collect::<Vec<_>>()
        };
        let written = events.len();
        self.emit(events);
        written
    }

    pub fn delete_authoritative(&self, key: &str) -> bool {
        self.delete_many_authoritative([key]) > 0
    }

    /// Clears tracking and removes the records. Absent keys are ignored.
    pub fn delete_many_authoritative<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let events = {
            let mut state = self.state();
            keys.into_iter()
                .filter_map(|key| {
                    let key = key.as_ref();
                    let tracked = state.tracker.forget(key).is_some();
                    let removed = state.records.remove(key).is_some();
                    (tracked || removed).then(|| ChangeEvent {
                        key: key.to_string(),
                        change: Change::Deleted,
                        origin: ChangeOrigin::Authoritative,
                    })
                })
                .collect::<Vec<_>>()
        };
        let removed = events.len();
        self.emit(events);
        removed
    }

    /// Drops every record and revision, e.g. on workspace switch.
    pub fn clear(&self) {
        let events = {
            let mut state = self.state();
            state.tracker.clear();
            let mut keys = state.records.drain().map(|(key, _)| key).collect::<Vec<_>>();
            keys.sort();
            keys.into_iter()
                .map(|key| ChangeEvent {
                    key,
                    change: Change::Deleted,
                    origin: ChangeOrigin::Authoritative,
                })
                .collect::<Vec<_>>()
        };
        self.emit(events);
    }

    pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id();
        self.listeners()
            .by_key
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id();
        self.listeners().all.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.all.len();
        listeners.all.retain(|(existing, _)| *existing != id);
        let mut removed = listeners.all.len() != before;
        listeners.by_key.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(existing, _)| *existing != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Restores a pre-image captured by a transaction, unless an
    /// authoritative write advanced the key after the capture. The change
    /// event is held back for the caller to deliver.
    pub(crate) fn rollback_to(&self, key: &str, previous: Option<T>, captured_revision: u64) -> Option<HeldEvents> {
        let event = {
            let mut state = self.state();
            if state.tracker.get(key) != captured_revision {
                return None;
            }
            match previous {
                Some(record) => {
                    state.records.insert(key.to_string(), record.clone());
                    ChangeEvent {
                        key: key.to_string(),
                        change: Change::Updated(record),
                        origin: ChangeOrigin::Optimistic,
                    }
                }
                None => {
                    state.records.remove(key)?;
                    ChangeEvent {
                        key: key.to_string(),
                        change: Change::Deleted,
                        origin: ChangeOrigin::Optimistic,
                    }
                }
            }
        };
        Some(self.hold(vec![event]))
    }

    pub(crate) fn record_own_advance(&self, key: &str, from: u64, to: u64) {
        self.state().tracker.record_own_advance(key, from, to);
    }

    pub(crate) fn rebase_expected(&self, key: &str, captured: u64) -> u64 {
        self.state().tracker.rebase(key, captured)
    }

    fn apply_envelope(state: &mut StoreState<T>, envelope: RevisionEnvelope<T>) -> Option<ChangeEvent<T>> {
        if !state.tracker.is_newer(&envelope.id, envelope.revision) {
            tracing::debug!(
                entity = %T::KIND,
                key = %envelope.id,
                revision = envelope.revision,
                tracked = state.tracker.get(&envelope.id),
                "skipped stale authoritative snapshot"
            );
            return None;
        }
        let known = state.tracker.contains(&envelope.id) || state.records.contains_key(&envelope.id);
        state.tracker.observe(&envelope.id, envelope.revision);
        state.records.insert(envelope.id.clone(), envelope.data.clone());
        let change = if known {
            Change::Updated(envelope.data)
        } else {
            Change::Inserted(envelope.data)
        };
        Some(ChangeEvent {
            key: envelope.id,
            change,
            origin: ChangeOrigin::Authoritative,
        })
    }

    fn emit(&self, events: Vec<ChangeEvent<T>>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            let targets = {
                let listeners = self.listeners();
                let mut targets = listeners
                    .by_key
                    .get(&event.key)
                    .map(|entries| entries.iter().map(|(_, listener)| listener.clone()).collect::<Vec<_>>())
                    .unwrap_or_default();
                targets.extend(listeners.all.iter().map(|(_, listener)| listener.clone()));
                targets
            };
            for listener in targets {
                listener(&event);
            }
        }
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState<T>> {
        self.inner.state.lock().expect("entity store state lock")
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Listeners<T>> {
        self.inner.listeners.lock().expect("entity store listeners lock")
    }
}

#[cfg(test)]
mod tests {
    use super::{Change, ChangeOrigin, EntityStore};
    use crate::models::{PromptRecord, RevisionEnvelope};
    use std::sync::{Arc, Mutex};

    fn prompt(id: &str, title: &str) -> PromptRecord {
        PromptRecord {
            id: id.to_string(),
            title: title.to_string(),
            ..PromptRecord::default()
        }
    }

    #[test]
    fn stale_revision_is_ignored() {
        let store = EntityStore::<PromptRecord>::new();
        assert!(store.upsert_authoritative(RevisionEnvelope::new("p1", 1, prompt("p1", "A"))));
        assert!(!store.upsert_authoritative(RevisionEnvelope::new("p1", 1, prompt("p1", "B"))));
        assert_eq!(store.get("p1").expect("p1").title, "A");
        assert_eq!(store.authoritative_revision("p1"), 1);
    }

    #[test]
    fn highest_revision_wins_in_any_order() {
        let orders = [[1u64, 2, 3], [3, 1, 2], [2, 3, 1], [3, 2, 1]];
        for order in orders {
            let store = EntityStore::<PromptRecord>::new();
            for revision in order {
                store.upsert_authoritative(RevisionEnvelope::new(
                    "p1",
                    revision,
                    prompt("p1", &format!("rev-{}", revision)),
                ));
            }
            assert_eq!(store.get("p1").expect("p1").title, "rev-3");
            assert_eq!(store.authoritative_revision("p1"), 3);
        }
    }

    #[test]
    fn batch_applies_highest_revision_per_key() {
        let store = EntityStore::<PromptRecord>::new();
        let written = store.upsert_many_authoritative(vec![
            RevisionEnvelope::new("p1", 1, prompt("p1", "one")),
            RevisionEnvelope::new("p1", 2, prompt("p1", "two")),
            RevisionEnvelope::new("p1", 1, prompt("p1", "one-dup")),
            RevisionEnvelope::new("p2", 7, prompt("p2", "other")),
        ]);
        assert_eq!(written, 2);
        assert_eq!(store.get("p1").expect("p1").title, "two");
        assert_eq!(store.authoritative_revision("p1"), 2);
        assert_eq!(store.authoritative_revision("p2"), 7);
    }

    #[test]
    fn optimistic_edits_do_not_touch_revisions() {
        let store = EntityStore::<PromptRecord>::new();
        store.insert(prompt("p1", "draft"));
        assert!(store.update("p1", |record| record.title = "draft 2".to_string()));
        assert!(!store.update("missing", |record| record.title.clear()));
        assert_eq!(store.authoritative_revision("p1"), 0);

        // Known to the materialized map, so the first snapshot is an update.
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store.subscribe("p1", move |event| sink.lock().expect("events").push(event.clone()));
        store.upsert_authoritative(RevisionEnvelope::new("p1", 1, prompt("p1", "server")));
        let events = events.lock().expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, ChangeOrigin::Authoritative);
        assert!(matches!(events[0].change, Change::Updated(_)));
    }

    #[test]
    fn delete_many_clears_records_and_revisions() {
        let store = EntityStore::<PromptRecord>::new();
        store.upsert_authoritative(RevisionEnvelope::new("k1", 3, prompt("k1", "a")));
        store.upsert_authoritative(RevisionEnvelope::new("k2", 4, prompt("k2", "b")));
        assert_eq!(store.delete_many_authoritative(["k1", "k2", "absent"]), 2);
        assert!(store.get("k1").is_none());
        assert!(store.get("k2").is_none());
        assert_eq!(store.authoritative_revision("k1"), 0);
        assert_eq!(store.authoritative_revision("k2"), 0);
        assert!(!store.delete_authoritative("k1"));
    }

    #[test]
    fn subscribers_see_changes_until_unsubscribed() {
        let store = EntityStore::<PromptRecord>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = store.subscribe_all(move |event| sink.lock().expect("seen").push(event.key.clone()));

        store.insert(prompt("a", "1"));
        store.delete("a");
        assert!(store.unsubscribe(id));
        store.insert(prompt("b", "2"));

        assert_eq!(*seen.lock().expect("seen"), vec!["a".to_string(), "a".to_string()]);
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn listeners_may_read_the_store() {
        let store = EntityStore::<PromptRecord>::new();
        let reader = store.clone();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        store.subscribe("p1", move |_| {
            *sink.lock().expect("observed") = reader.get("p1").map(|record| record.title);
        });
        store.insert(prompt("p1", "visible"));
        assert_eq!(observed.lock().expect("observed").as_deref(), Some("visible"));
    }

    #[test]
    fn rollback_skips_keys_advanced_by_the_server() {
        let store = EntityStore::<PromptRecord>::new();
        store.upsert_authoritative(RevisionEnvelope::new("p1", 1, prompt("p1", "base")));
        store.update("p1", |record| record.title = "local".to_string());
        store.upsert_authoritative(RevisionEnvelope::new("p1", 2, prompt("p1", "server")));
        assert!(store.rollback_to("p1", Some(prompt("p1", "base")), 1).is_none());
        assert_eq!(store.get("p1").expect("p1").title, "server");
    }

    #[test]
    fn held_events_wait_for_delivery() {
        let store = EntityStore::<PromptRecord>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe_all(move |event| sink.lock().expect("seen").push(event.key.clone()));

        let (_, event) = store.insert_held(prompt("p1", "quiet"));
        let held = store.hold(vec![event]);
        assert_eq!(store.get("p1").expect("p1").title, "quiet");
        assert!(seen.lock().expect("seen").is_empty());

        held.deliver();
        assert_eq!(*seen.lock().expect("seen"), vec!["p1".to_string()]);
    }

    #[test]
    fn revision_zero_creates_an_untracked_key_once() {
        let store = EntityStore::<PromptRecord>::new();
        assert!(store.upsert_authoritative(RevisionEnvelope::new("p1", 0, prompt("p1", "first"))));
        assert_eq!(store.get("p1").expect("p1").title, "first");
        assert_eq!(store.authoritative_revision("p1"), 0);

        assert!(!store.upsert_authoritative(RevisionEnvelope::new("p1", 0, prompt("p1", "again"))));
        assert_eq!(store.get("p1").expect("p1").title, "first");
    }
}
