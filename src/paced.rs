use crate::backend::Backend;
use crate::errors::{SyncError, SyncResult};
use crate::models::EntityKind;
use crate::queue::MutationQueue;
use crate::store::HeldEvents;
use crate::timer::DebounceTimer;
use crate::transaction::{MutationScope, Transaction, TransactionBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Duration;

/// Gate run right before a paced transaction is handed to the queue.
pub type Validator = Arc<dyn Fn(&Transaction) -> bool + Send + Sync>;

type Settled = watch::Receiver<Option<SyncResult<()>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Debounce,
    Manual,
    SubmitAll,
    /// An immediate mutation is about to touch the same key.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacedKey {
    pub kind: EntityKind,
    pub key: String,
}

impl PacedKey {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

pub struct PacedUpdate {
    builder: TransactionBuilder,
    debounce: Duration,
    validate: Option<Validator>,
}

impl PacedUpdate {
    /// The first target of `builder` names the key edits coalesce on.
    pub fn new(builder: TransactionBuilder, debounce: Duration) -> Self {
        Self {
            builder,
            debounce,
            validate: None,
        }
    }

    pub fn validate_with<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Transaction) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }
}

struct PendingPaced {
    generation: u64,
    /// Identifies the most recent debounce arm; older timer tasks are stale.
    armed: u64,
    transaction: Arc<Transaction>,
    timer: DebounceTimer,
    validate: Option<Validator>,
    debounce: Duration,
}

struct InFlight {
    generation: u64,
    settled: Settled,
}

#[derive(Default)]
struct PacedEntry {
    pending: Option<PendingPaced>,
    in_flight: Option<InFlight>,
}

struct PacedInner {
    queue: MutationQueue,
    backend: Arc<dyn Backend>,
    entries: Mutex<HashMap<PacedKey, PacedEntry>>,
    generations: AtomicU64,
}

/// Coalesces rapid edits per `(kind, key)` into one open transaction whose
/// debounce window restarts on every edit.
///
/// Store listeners are called after the registry lock is released and may use
/// the registry. Validators run under that lock and must not.
#[derive(Clone)]
pub struct PacedMutationRegistry {
    inner: Arc<PacedInner>,
}

impl PacedMutationRegistry {
    pub fn new(queue: MutationQueue, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(PacedInner {
                queue,
                backend,
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
            }),
        }
    }

    /// Applies one edit optimistically and (re)starts the key's debounce.
    pub fn apply<F>(&self, update: PacedUpdate, apply: F) -> SyncResult<PacedKey>
    where
        F: FnOnce(&mut MutationScope),
    {
        let (kind, key) = update
            .builder
            .target_keys()
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Internal("paced update has no target".to_string()))?;
        let key = PacedKey::new(kind, key);

        let events = {
            let mut entries = self.entries();
            match entries
                .get_mut(&key)
                .and_then(|entry| entry.pending.as_mut())
            {
                Some(pending) => {
                    let events = pending.transaction.mutate_held(apply)?;
                    pending.debounce = update.debounce;
                    if let Some(validate) = update.validate {
                        pending.validate = Some(validate);
                    }
                    self.arm(&key, pending);
                    events
                }
                None => {
                    let transaction = update.builder.build()?;
                    let events = transaction.mutate_held(apply)?;
                    let mut pending = PendingPaced {
                        generation: self.next_generation(),
                        armed: 0,
                        transaction,
                        timer: DebounceTimer::idle(),
                        validate: update.validate,
                        debounce: update.debounce,
                    };
                    self.arm(&key, &mut pending);
                    tracing::debug!(entity = %key.kind, key = %key.key, "opened paced transaction");
                    entries.entry(key.clone()).or_default().pending = Some(pending);
                    events
                }
            }
        };
        events.deliver();
        Ok(key)
    }

    /// Hands the key's pending transaction to the queue now. Returns false
    /// when nothing was pending or validation kept it back.
    pub fn flush(&self, key: &PacedKey, reason: FlushReason) -> bool {
        let was_pending = self.has_pending(key);
        self.flush_generation(key, None, reason);
        was_pending && !self.has_pending(key)
    }

    /// Flushes every pending key an immediate mutation is about to touch, so
    /// the paced edits are queued ahead of it.
    pub fn flush_superseded(&self, targets: &[(EntityKind, String)]) {
        for (kind, key) in targets {
            let key = PacedKey::new(*kind, key.clone());
            self.flush_generation(&key, None, FlushReason::Superseded);
        }
    }

    pub async fn submit_and_wait(&self, key: &PacedKey) -> SyncResult<()> {
        match self.flush_generation(key, None, FlushReason::Manual) {
            Some(settled) => wait_settled(settled).await,
            None => Ok(()),
        }
    }

    /// Flushes every pending key and waits for all of them and for anything
    /// already in flight. Returns the first failure after everything settled.
    pub async fn submit_all_and_wait(&self) -> SyncResult<()> {
        let keys = {
            let mut keys = self.entries().keys().cloned().collect::<Vec<_>>();
            keys.sort();
            keys
        };
        let settled = keys
            .iter()
            .filter_map(|key| self.flush_generation(key, None, FlushReason::SubmitAll))
            .collect::<Vec<_>>();

        let mut first_error = None;
        for receiver in settled {
            if let Err(error) = wait_settled(receiver).await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Rolls back the key's pending edits without submitting them.
    pub fn discard(&self, key: &PacedKey) -> bool {
        let events = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                return false;
            };
            let pending = entry.pending.take();
            if entry.in_flight.is_none() {
                entries.remove(key);
            }
            let Some(mut pending) = pending else {
                return false;
            };
            pending.timer.cancel();
            pending.transaction.rollback_held()
        };
        events.deliver();
        true
    }

    pub fn discard_all(&self) -> usize {
        self.pending_keys()
            .iter()
            .filter(|key| self.discard(key))
            .count()
    }

    pub fn has_pending(&self, key: &PacedKey) -> bool {
        self.entries()
            .get(key)
            .map(|entry| entry.pending.is_some())
            .unwrap_or(false)
    }

    pub fn is_in_flight(&self, key: &PacedKey) -> bool {
        self.entries()
            .get(key)
            .map(|entry| entry.in_flight.is_some())
            .unwrap_or(false)
    }

    pub fn pending_keys(&self) -> Vec<PacedKey> {
        let mut keys = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.pending.is_some())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Keys with any bookkeeping left (pending or in flight).
    pub fn tracked_len(&self) -> usize {
        self.entries().len()
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn arm(&self, key: &PacedKey, pending: &mut PendingPaced) {
        pending.armed = self.next_generation();
        let registry = Arc::downgrade(&self.inner);
        let key = key.clone();
        let armed = pending.armed;
        pending.timer.restart(pending.debounce, async move {
            if let Some(inner) = registry.upgrade() {
                PacedMutationRegistry { inner }.flush_generation(
                    &key,
                    Some(armed),
                    FlushReason::Debounce,
                );
            }
        });
    }

    /// Returns the receiver of whatever is in flight for the key afterwards.
    /// `armed` is set by debounce timers; a timer that was re-armed since it
    /// fired does nothing.
    fn flush_generation(
        &self,
        key: &PacedKey,
        armed: Option<u64>,
        reason: FlushReason,
    ) -> Option<Settled> {
        let mut events = HeldEvents::default();
        let settled = self.flush_locked(key, armed, reason, &mut events);
        events.deliver();
        settled
    }

    fn flush_locked(
        &self,
        key: &PacedKey,
        armed: Option<u64>,
        reason: FlushReason,
        events: &mut HeldEvents,
    ) -> Option<Settled> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        let current = entry.pending.as_ref().map(|pending| pending.armed);
        let stale_timer = armed.is_some() && armed != current;
        if current.is_none() || stale_timer {
            return entry.in_flight.as_ref().map(|in_flight| in_flight.settled.clone());
        }
        let mut pending = entry.pending.take()?;
        if reason == FlushReason::Debounce {
            pending.timer.disarm();
        } else {
            pending.timer.cancel();
        }

        if let Some(validate) = pending.validate.clone() {
            if !validate(&pending.transaction) {
                if reason == FlushReason::Superseded {
                    tracing::debug!(entity = %key.kind, key = %key.key, "rolled back invalid paced edit");
                    events.append(pending.transaction.rollback_held());
                } else {
                    tracing::debug!(entity = %key.kind, key = %key.key, ?reason, "paced edit kept back by validation");
                    entry.pending = Some(pending);
                }
                let settled = entry
                    .in_flight
                    .as_ref()
                    .map(|in_flight| in_flight.settled.clone());
                if entry.pending.is_none() && entry.in_flight.is_none() {
                    entries.remove(key);
                }
                return settled;
            }
        }

        if let Err(error) = pending.transaction.seal() {
            tracing::error!(entity = %key.kind, key = %key.key, error = %error, "paced transaction could not be sealed");
            events.append(pending.transaction.rollback_held());
            let settled = entry
                .in_flight
                .as_ref()
                .map(|in_flight| in_flight.settled.clone());
            if entry.in_flight.is_none() {
                entries.remove(key);
            }
            return settled;
        }

        let label = format!("paced {} {}", key.kind, key.key);
        let commit = self.inner.queue.submit(
            &label,
            pending.transaction.clone().commit(self.inner.backend.clone()),
        );
        let (sender, settled) = watch::channel(None);
        entry.in_flight = Some(InFlight {
            generation: pending.generation,
            settled: settled.clone(),
        });
        drop(entries);
        tracing::debug!(entity = %key.kind, key = %key.key, ?reason, "flushed paced transaction");

        let registry = Arc::downgrade(&self.inner);
        let key = key.clone();
        let generation = pending.generation;
        tokio::spawn(async move {
            let result = commit.wait().await.map(|_| ());
            if let Err(error) = &result {
                tracing::warn!(entity = %key.kind, key = %key.key, error = %error, "paced commit failed");
            }
            let _ = sender.send(Some(result));
            if let Some(inner) = registry.upgrade() {
                PacedMutationRegistry { inner }.release(&key, generation);
            }
        });
        Some(settled)
    }

    fn release(&self, key: &PacedKey, generation: u64) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.generation == generation)
            .unwrap_or(false)
        {
            entry.in_flight = None;
        }
        if entry.pending.is_none() && entry.in_flight.is_none() {
            entries.remove(key);
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<PacedKey, PacedEntry>> {
        self.inner.entries.lock().expect("paced registry lock")
    }
}

async fn wait_settled(mut settled: Settled) -> SyncResult<()> {
    let outcome = match settled.wait_for(|result| result.is_some()).await {
        Ok(result) => result.clone().unwrap_or(Ok(())),
        Err(_) => Err(SyncError::QueueClosed(
            "paced commit settled without a result".to_string(),
        )),
    };
    outcome
}

#[cfg(test)]
mod tests {
    use super::{FlushReason, PacedKey, PacedMutationRegistry, PacedUpdate};
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::ENTITIES_SAVE;
    use crate::collections::Collections;
    use crate::models::{EntityKind, PromptRecord, RevisionEnvelope, SettingsRecord};
    use crate::queue::MutationQueue;
    use crate::store::ChangeEvent;
    use crate::transaction::Transaction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    const DEBOUNCE: Duration = Duration::from_millis(2000);

    struct Fixture {
        collections: Collections,
        backend: InMemoryBackend,
        registry: PacedMutationRegistry,
    }

    fn fixture() -> Fixture {
        let collections = Collections::new();
        let backend = InMemoryBackend::new();
        let prompt = PromptRecord {
            id: "p1".to_string(),
            title: "A".to_string(),
            ..PromptRecord::default()
        };
        backend.seed(
            EntityKind::Prompt,
            "p1",
            1,
            serde_json::to_value(&prompt).expect("seed prompt"),
        );
        collections
            .prompts
            .upsert_authoritative(RevisionEnvelope::new("p1", 1, prompt));
        let settings = SettingsRecord::default();
        backend.seed(
            EntityKind::Settings,
            "workspace",
            1,
            serde_json::to_value(&settings).expect("seed settings"),
        );
        collections
            .settings
            .upsert_authoritative(RevisionEnvelope::new("workspace", 1, settings));

        let queue = MutationQueue::start(Duration::from_secs(5));
        let registry = PacedMutationRegistry::new(queue, Arc::new(backend.clone()));
        Fixture {
            collections,
            backend,
            registry,
        }
    }

    fn retitle(fixture: &Fixture, title: &str) -> PacedKey {
        let prompts = fixture.collections.prompts.clone();
        let title = title.to_string();
        let update = PacedUpdate::new(
            Transaction::builder(ENTITIES_SAVE)
                .target(fixture.collections.handle(EntityKind::Prompt), "p1"),
            DEBOUNCE,
        );
        fixture
            .registry
            .apply(update, move |scope| {
                scope.update(&prompts, "p1", |record| record.title = title);
            })
            .expect("paced edit")
    }

    fn font_size_is_valid(collections: &Collections) -> impl Fn(&Transaction) -> bool + Send + Sync + 'static {
        let settings = collections.settings.clone();
        move |_| {
            settings
                .get("workspace")
                .and_then(|record| record.editor_font_size.parse::<u16>().ok())
                .map(|size| (8..=48).contains(&size))
                .unwrap_or(false)
        }
    }

    fn set_font_size(fixture: &Fixture, value: &str) -> PacedKey {
        let settings = fixture.collections.settings.clone();
        let value = value.to_string();
        let update = PacedUpdate::new(
            Transaction::builder(ENTITIES_SAVE)
                .target(fixture.collections.handle(EntityKind::Settings), "workspace"),
            DEBOUNCE,
        )
        .validate_with(font_size_is_valid(&fixture.collections));
        fixture
            .registry
            .apply(update, move |scope| {
                scope.update(&settings, "workspace", |record| record.editor_font_size = value);
            })
            .expect("paced settings edit")
    }

    #[tokio::test(start_paused = true)]
    async fn edits_in_one_window_commit_once_with_the_last_value() {
        let fixture = fixture();
        retitle(&fixture, "A1");
        retitle(&fixture, "B");
        let key = retitle(&fixture, "C");
        assert_eq!(fixture.collections.prompts.get("p1").expect("p1").title, "C");
        assert!(fixture.registry.has_pending(&key));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        fixture.registry.submit_all_and_wait().await.expect("settled");

        let calls = fixture.backend.calls_on(ENTITIES_SAVE);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["payload"]["prompt"]["data"]["title"], "C");
        assert_eq!(calls[0].payload["payload"]["prompt"]["expectedRevision"], 1);
        assert_eq!(fixture.collections.prompts.authoritative_revision("p1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn each_edit_restarts_the_debounce_window() {
        let fixture = fixture();
        retitle(&fixture, "X");
        tokio::time::sleep(Duration::from_millis(500)).await;
        retitle(&fixture, "Y");

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(fixture.backend.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let calls = fixture.backend.calls_on(ENTITIES_SAVE);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["payload"]["prompt"]["data"]["title"], "Y");
    }

    #[tokio::test(start_paused = true)]
    async fn bookkeeping_is_removed_once_settled() {
        let fixture = fixture();
        let key = retitle(&fixture, "done");
        assert_eq!(fixture.registry.tracked_len(), 1);
        fixture.registry.submit_and_wait(&key).await.expect("submit");
        tokio::task::yield_now().await;
        assert!(!fixture.registry.has_pending(&key));
        assert!(!fixture.registry.is_in_flight(&key));
        assert_eq!(fixture.registry.tracked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_is_kept_back_until_it_becomes_valid() {
        let fixture = fixture();
        let key = set_font_size(&fixture, "1");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(fixture.backend.calls().is_empty());
        assert!(fixture.registry.has_pending(&key));
        assert_eq!(
            fixture.collections.settings.get("workspace").expect("settings").editor_font_size,
            "1"
        );

        assert!(!fixture.registry.flush(&key, FlushReason::Manual));
        set_font_size(&fixture, "16");
        fixture.registry.submit_and_wait(&key).await.expect("submit");
        let calls = fixture.backend.calls_on(ENTITIES_SAVE);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["payload"]["settings"]["data"]["editorFontSize"], "16");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_is_rolled_back_when_superseded() {
        let fixture = fixture();
        set_font_size(&fixture, "4");
        fixture
            .registry
            .flush_superseded(&[(EntityKind::Settings, "workspace".to_string())]);
        assert_eq!(
            fixture.collections.settings.get("workspace").expect("settings").editor_font_size,
            "14"
        );
        assert_eq!(fixture.registry.tracked_len(), 0);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(fixture.backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn discard_rolls_back_without_submitting() {
        let fixture = fixture();
        let key = retitle(&fixture, "abandoned");
        assert!(fixture.registry.discard(&key));
        assert_eq!(fixture.collections.prompts.get("p1").expect("p1").title, "A");
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(fixture.backend.calls().is_empty());
        assert_eq!(fixture.registry.discard_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_after_a_flush_open_a_new_transaction_that_rebases() {
        let fixture = fixture();
        let key = retitle(&fixture, "first");
        assert!(fixture.registry.flush(&key, FlushReason::Manual));
        retitle(&fixture, "second");
        fixture.registry.submit_all_and_wait().await.expect("settled");

        let calls = fixture.backend.calls_on(ENTITIES_SAVE);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].payload["payload"]["prompt"]["expectedRevision"], 1);
        assert_eq!(calls[1].payload["payload"]["prompt"]["expectedRevision"], 2);
        assert_eq!(calls[1].payload["payload"]["prompt"]["data"]["title"], "second");
        assert_eq!(fixture.collections.prompts.authoritative_revision("p1"), 3);
    }

    fn counting_listener<T: 'static>(
        registry: PacedMutationRegistry,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(&ChangeEvent<T>) + Send + Sync + 'static {
        move |_| {
            registry.pending_keys();
            calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_listeners_may_call_back_into_the_registry() {
        let fixture = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        fixture.collections.prompts.subscribe(
            "p1",
            counting_listener(fixture.registry.clone(), calls.clone()),
        );
        fixture.collections.settings.subscribe(
            "workspace",
            counting_listener(fixture.registry.clone(), calls.clone()),
        );

        let key = retitle(&fixture, "one");
        retitle(&fixture, "two");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(fixture.registry.discard(&key));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        set_font_size(&fixture, "4");
        fixture
            .registry
            .flush_superseded(&[(EntityKind::Settings, "workspace".to_string())]);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(fixture.registry.tracked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_timer_from_an_earlier_arm_does_not_flush() {
        let fixture = fixture();
        let key = retitle(&fixture, "one");
        let first_arm = fixture.registry.entries()[&key]
            .pending
            .as_ref()
            .map(|pending| pending.armed)
            .expect("pending");
        retitle(&fixture, "two");

        fixture
            .registry
            .flush_generation(&key, Some(first_arm), FlushReason::Debounce);
        assert!(fixture.registry.has_pending(&key));
        assert!(!fixture.registry.is_in_flight(&key));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        fixture.registry.submit_all_and_wait().await.expect("settled");
        let calls = fixture.backend.calls_on(ENTITIES_SAVE);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["payload"]["prompt"]["data"]["title"], "two");
    }
}
