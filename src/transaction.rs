use crate::backend::Backend;
use crate::collections::CollectionHandle;
use crate::errors::{SyncError, SyncResult};
use crate::models::{EntityKind, InvokeOutcome, RevisionPayloadEntity};
use crate::store::{EntityStore, HeldEvents, Record};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: EntityKind,
    pub key: String,
    pub op: MutationOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRevision {
    pub kind: EntityKind,
    pub key: String,
    pub expected_revision: u64,
}

type UndoFn = Box<dyn FnOnce() -> Option<HeldEvents> + Send>;

struct Target {
    handle: Arc<dyn CollectionHandle>,
    kind: EntityKind,
    key: String,
    expected_revision: u64,
}

struct TransactionInner {
    state: TransactionState,
    mutations: Vec<MutationRecord>,
    undo: Vec<UndoFn>,
    touched: HashSet<(EntityKind, String)>,
    sealed: Option<Vec<Option<Value>>>,
    committed: bool,
}

pub struct TransactionBuilder {
    channel: String,
    targets: Vec<(Arc<dyn CollectionHandle>, String)>,
    args: Map<String, Value>,
}

impl TransactionBuilder {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            targets: Vec::new(),
            args: Map::new(),
        }
    }

    /// Adds the entity this transaction persists for one kind.
    pub fn target(mut self, handle: Arc<dyn CollectionHandle>, key: impl Into<String>) -> Self {
        self.targets.push((handle, key.into()));
        self
    }

    /// Extra top-level request field sent next to `payload`.
    pub fn arg(mut self, name: &str, value: Value) -> Self {
        self.args.insert(name.to_string(), value);
        self
    }

    pub fn target_keys(&self) -> Vec<(EntityKind, String)> {
        self.targets
            .iter()
            .map(|(handle, key)| (handle.kind(), key.clone()))
            .collect()
    }

    /// Captures every target's expected revision now; later commits send
    /// these values (rebased over this client's own confirmed writes).
    pub fn build(self) -> SyncResult<Arc<Transaction>> {
        if self.targets.is_empty() {
            return Err(SyncError::Internal(format!(
                "transaction on {} has no targets",
                self.channel
            )));
        }
        let mut kinds = HashSet::new();
        let mut targets = Vec::with_capacity(self.targets.len());
        for (handle, key) in self.targets {
            let kind = handle.kind();
            if !kinds.insert(kind) {
                return Err(SyncError::Internal(format!(
                    "transaction on {} targets {} more than once",
                    self.channel, kind
                )));
            }
            let expected_revision = handle.authoritative_revision(&key);
            targets.push(Target {
                handle,
                kind,
                key,
                expected_revision,
            });
        }

        Ok(Arc::new(Transaction {
            id: Uuid::new_v4(),
            channel: self.channel,
            targets,
            args: self.args,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Pending,
                mutations: Vec::new(),
                undo: Vec::new(),
                touched: HashSet::new(),
                sealed: None,
                committed: false,
            }),
        }))
    }
}

/// Optimistic mutation plus its single network commit.
pub struct Transaction {
    id: Uuid,
    channel: String,
    targets: Vec<Target>,
    args: Map<String, Value>,
    inner: Mutex<TransactionInner>,
}

/// Handed to [`Transaction::mutate`] callbacks. Every write goes straight to
/// the store and remembers the key's pre-image the first time it is touched.
pub struct MutationScope {
    mutations: Vec<MutationRecord>,
    undo: Vec<UndoFn>,
    touched: HashSet<(EntityKind, String)>,
    events: HeldEvents,
}

impl MutationScope {
    pub fn insert<T: Record>(&mut self, store: &EntityStore<T>, record: T) {
        let key = record.key().to_string();
        self.capture(store, &key);
        let (previous, event) = store.insert_held(record);
        self.events.append(store.hold(vec![event]));
        let op = if previous.is_some() {
            MutationOp::Update
        } else {
            MutationOp::Insert
        };
        self.mutations.push(MutationRecord { kind: T::KIND, key, op });
    }

    pub fn update<T, F>(&mut self, store: &EntityStore<T>, key: &str, mutator: F) -> bool
    where
        T: Record,
        F: FnOnce(&mut T),
    {
        if !store.contains(key) {
            return false;
        }
        self.capture(store, key);
        let Some(event) = store.update_held(key, mutator) else {
            return false;
        };
        self.events.append(store.hold(vec![event]));
        self.mutations.push(MutationRecord {
            kind: T::KIND,
            key: key.to_string(),
            op: MutationOp::Update,
        });
        true
    }

    pub fn delete<T: Record>(&mut self, store: &EntityStore<T>, key: &str) -> Option<T> {
        if !store.contains(key) {
            return None;
        }
        self.capture(store, key);
        let (removed, event) = store.delete_held(key);
        if let Some(event) = event {
            self.events.append(store.hold(vec![event]));
            self.mutations.push(MutationRecord {
                kind: T::KIND,
                key: key.to_string(),
                op: MutationOp::Delete,
            });
        }
        removed
    }

    fn capture<T: Record>(&mut self, store: &EntityStore<T>, key: &str) {
        if !self.touched.insert((T::KIND, key.to_string())) {
            return;
        }
        let previous = store.get(key);
        let revision = store.authoritative_revision(key);
        let store = store.clone();
        let key = key.to_string();
        self.undo
            .push(Box::new(move || store.rollback_to(&key, previous, revision)));
    }
}

impl Transaction {
    pub fn builder(channel: impl Into<String>) -> TransactionBuilder {
        TransactionBuilder::new(channel)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> TransactionState {
        self.inner().state
    }

    pub fn mutations(&self) -> Vec<MutationRecord> {
        self.inner().mutations.clone()
    }

    pub fn targets(&self) -> Vec<TargetRevision> {
        self.targets
            .iter()
            .map(|target| TargetRevision {
                kind: target.kind,
                key: target.key.clone(),
                expected_revision: target.expected_revision,
            })
            .collect()
    }

    pub fn touches(&self, kind: EntityKind, key: &str) -> bool {
        self.targets
            .iter()
            .any(|target| target.kind == kind && target.key == key)
    }

    pub fn is_sealed(&self) -> bool {
        self.inner().sealed.is_some()
    }

    /// Runs `apply` against the stores synchronously. May be called many
    /// times until the transaction is sealed.
    pub fn mutate<F>(&self, apply: F) -> SyncResult<()>
    where
        F: FnOnce(&mut MutationScope),
    {
        self.mutate_held(apply)?.deliver();
        Ok(())
    }

    /// Same as [`Transaction::mutate`] but store listeners are not called;
    /// the returned events are delivered by the caller.
    pub(crate) fn mutate_held<F>(&self, apply: F) -> SyncResult<HeldEvents>
    where
        F: FnOnce(&mut MutationScope),
    {
        let touched = {
            let inner = self.inner();
            if inner.sealed.is_some() || inner.state != TransactionState::Pending {
                return Err(SyncError::Internal(format!(
                    "transaction {} no longer accepts mutations",
                    self.id
                )));
            }
            inner.touched.clone()
        };

        let mut scope = MutationScope {
            mutations: Vec::new(),
            undo: Vec::new(),
            touched,
            events: HeldEvents::default(),
        };
        apply(&mut scope);

        let mut inner = self.inner();
        inner.mutations.extend(scope.mutations);
        inner.undo.extend(scope.undo);
        inner.touched.extend(scope.touched);
        Ok(scope.events)
    }

    /// Snapshots target data for the request. Idempotent.
    pub fn seal(&self) -> SyncResult<()> {
        if self.is_sealed() {
            return Ok(());
        }
        let snapshot = self
            .targets
            .iter()
            .map(|target| target.handle.snapshot_json(&target.key))
            .collect::<SyncResult<Vec<_>>>()?;
        let mut inner = self.inner();
        if inner.sealed.is_none() {
            inner.sealed = Some(snapshot);
        }
        Ok(())
    }

    /// Undoes every optimistic write made through this transaction, newest
    /// first. Keys that received a newer authoritative snapshot are kept.
    pub fn rollback(&self) -> usize {
        let events = self.rollback_held();
        let restored = events.len();
        events.deliver();
        restored
    }

    /// Same as [`Transaction::rollback`] with the store events held back.
    pub(crate) fn rollback_held(&self) -> HeldEvents {
        let undo = {
            let mut inner = self.inner();
            inner.state = TransactionState::Failed;
            std::mem::take(&mut inner.undo)
        };
        let mut events = HeldEvents::default();
        for restored in undo.into_iter().rev().filter_map(|undo| undo()) {
            events.append(restored);
        }
        tracing::debug!(transaction = %self.id, channel = %self.channel, restored = events.len(), "rolled back transaction");
        events
    }

    /// Performs the one network round-trip of this transaction.
    pub async fn commit(self: Arc<Self>, backend: Arc<dyn Backend>) -> SyncResult<Value> {
        self.seal()?;
        let sealed = {
            let mut inner = self.inner();
            if inner.committed || inner.state != TransactionState::Pending {
                return Err(SyncError::Internal(format!(
                    "transaction {} was already committed or rolled back",
                    self.id
                )));
            }
            inner.committed = true;
            inner.sealed.clone().unwrap_or_default()
        };

        let sent = self
            .targets
            .iter()
            .map(|target| target.handle.rebase_expected(&target.key, target.expected_revision))
            .collect::<Vec<_>>();
        let mut entities = Map::new();
        for (index, target) in self.targets.iter().enumerate() {
            let entity = RevisionPayloadEntity {
                id: target.key.clone(),
                expected_revision: sent[index],
                data: sealed.get(index).cloned().flatten().unwrap_or(Value::Null),
            };
            entities.insert(target.kind.as_str().to_string(), serde_json::to_value(entity)?);
        }
        let mut request = Map::new();
        request.insert("payload".to_string(), Value::Object(entities));
        for (name, value) in &self.args {
            request.insert(name.clone(), value.clone());
        }

        tracing::debug!(
            transaction = %self.id,
            channel = %self.channel,
            targets = self.targets.len(),
            "committing transaction"
        );
        let reply = match backend.invoke(&self.channel, Value::Object(request)).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(transaction = %self.id, channel = %self.channel, error = %error, "transaction transport failure");
                self.finish(TransactionState::Failed);
                return Err(error);
            }
        };

        let outcome = match InvokeOutcome::from_value(reply) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.finish(TransactionState::Failed);
                return Err(error);
            }
        };

        match outcome {
            InvokeOutcome::Success(payload) => {
                let observed = match self.apply_reply(&payload) {
                    Ok(observed) => observed,
                    Err(error) => {
                        self.finish(TransactionState::Failed);
                        return Err(error);
                    }
                };
                for (index, revision) in observed {
                    let target = &self.targets[index];
                    target.handle.record_own_advance(&target.key, sent[index], revision);
                }
                self.finish(TransactionState::Completed);
                Ok(payload)
            }
            InvokeOutcome::Conflict(payload) => {
                let observed = self.apply_reply(&payload).unwrap_or_else(|error| {
                    tracing::warn!(transaction = %self.id, error = %error, "conflict reply could not be merged");
                    Vec::new()
                });
                self.finish(TransactionState::Failed);
                let index = observed.first().map(|(index, _)| *index).unwrap_or(0);
                let target = &self.targets[index];
                let actual_revision = observed
                    .first()
                    .map(|(_, revision)| *revision)
                    .unwrap_or_else(|| target.handle.authoritative_revision(&target.key));
                tracing::warn!(
                    transaction = %self.id,
                    entity = %target.kind,
                    key = %target.key,
                    expected_revision = sent[index],
                    actual_revision,
                    "transaction rejected with conflict"
                );
                Err(SyncError::Conflict {
                    entity: target.kind,
                    key: target.key.clone(),
                    expected_revision: sent[index],
                    actual_revision,
                })
            }
            InvokeOutcome::Failure(message) => {
                tracing::warn!(transaction = %self.id, channel = %self.channel, error = %message, "transaction rejected by backend");
                self.finish(TransactionState::Failed);
                Err(SyncError::Backend(message))
            }
        }
    }

    /// Merges envelopes and deletions from a reply; returns the revision
    /// observed for each target that had one.
    fn apply_reply(&self, payload: &Value) -> SyncResult<Vec<(usize, u64)>> {
        let single = self.targets.len() == 1;
        let mut observed = Vec::new();
        for (index, target) in self.targets.iter().enumerate() {
            let envelopes = payload
                .get(target.kind.as_str())
                .or_else(|| if single { payload.get("entity") } else { None });
            if let Some(envelopes) = envelopes {
                let revisions = target.handle.apply_authoritative_json(envelopes)?;
                if let Some(revision) = revisions.iter().find(|seen| seen.key == target.key) {
                    observed.push((index, revision.revision));
                }
            }

            let deleted = payload
                .get("deleted")
                .and_then(|deleted| deleted.get(target.kind.as_str()))
                .and_then(Value::as_array)
                .map(|keys| {
                    keys.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if !deleted.is_empty() {
                target.handle.delete_authoritative_keys(&deleted);
            }
        }
        Ok(observed)
    }

    fn finish(&self, state: TransactionState) {
        let mut inner = self.inner();
        inner.state = state;
        inner.undo.clear();
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, TransactionInner> {
        self.inner.lock().expect("transaction lock")
    }
}
