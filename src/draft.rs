use crate::errors::{SyncError, SyncResult};
use crate::timer::DebounceTimer;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Duration;

pub const DEFAULT_AUTOSAVE_DELAY: Duration = Duration::from_millis(2000);

pub type SaveFuture = Pin<Box<dyn Future<Output = SyncResult<()>> + Send>>;
pub type SaveFn<D> = Arc<dyn Fn(D) -> SaveFuture + Send + Sync>;
/// Produces the draft as derived from the entity store, used to replace a
/// draft after the backend resolved a conflict in its own favour.
pub type ResyncFn<D> = Arc<dyn Fn() -> Option<D> + Send + Sync>;

struct DraftState<D> {
    draft: D,
    dirty: bool,
    saving: bool,
    timer: DebounceTimer,
    in_flight: Option<(u64, watch::Receiver<bool>)>,
    saves: u64,
    resync: Option<ResyncFn<D>>,
}

struct AutosaveInner<D> {
    label: String,
    delay: Duration,
    save: SaveFn<D>,
    state: Mutex<DraftState<D>>,
}

enum SaveStep<D> {
    Wait(u64, watch::Receiver<bool>),
    Save(u64, D, watch::Sender<bool>),
}

/// Owns the in-flight marker of one save. Dropped before `complete` (the
/// caller's future was cancelled) it clears the marker and leaves the draft
/// dirty; waiters then see the channel close and retry.
struct SaveInFlight<'a, D> {
    inner: &'a AutosaveInner<D>,
    save: u64,
    done: Option<watch::Sender<bool>>,
}

impl<D> SaveInFlight<'_, D> {
    fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(true);
        }
    }
}

impl<D> Drop for SaveInFlight<'_, D> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        if let Ok(mut state) = self.inner.state.lock() {
            clear_in_flight(&mut state, self.save);
        }
        drop(done);
        tracing::warn!(draft = %self.inner.label, "draft save cancelled; keeping it dirty");
    }
}

/// Edit buffer for one field group with debounced autosave.
pub struct AutosaveController<D> {
    inner: Arc<AutosaveInner<D>>,
}

impl<D> Clone for AutosaveController<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> AutosaveController<D>
where
    D: Clone + PartialEq + Send + 'static,
{
    pub fn new(label: impl Into<String>, initial: D, delay: Duration, save: SaveFn<D>) -> Self {
        Self {
            inner: Arc::new(AutosaveInner {
                label: label.into(),
                delay,
                save,
                state: Mutex::new(DraftState {
                    draft: initial,
                    dirty: false,
                    saving: false,
                    timer: DebounceTimer::idle(),
                    in_flight: None,
                    saves: 0,
                    resync: None,
                }),
            }),
        }
    }

    pub fn set_resync(&self, resync: ResyncFn<D>) {
        self.state().resync = Some(resync);
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn draft(&self) -> D {
        self.state().draft.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn is_saving(&self) -> bool {
        self.state().saving
    }

    pub fn has_scheduled_autosave(&self) -> bool {
        self.state().timer.is_armed()
    }

    /// Changes the draft and schedules an autosave.
    pub fn edit<F>(&self, change: F)
    where
        F: FnOnce(&mut D),
    {
        change(&mut self.state().draft);
        self.mark_dirty_and_schedule_autosave();
    }

    pub fn mark_dirty_and_schedule_autosave(&self) {
        let controller = Arc::downgrade(&self.inner);
        let mut state = self.state();
        state.dirty = true;
        state.timer.restart(self.inner.delay, async move {
            let Some(inner) = controller.upgrade() else {
                return;
            };
            let controller = AutosaveController { inner };
            // Detached so cancelling the timer later cannot abort the save.
            tokio::spawn(async move {
                if let Err(error) = controller.save_now().await {
                    tracing::warn!(draft = %controller.label(), error = %error, "autosave failed");
                }
            });
        });
    }

    /// Persists the draft if dirty. Waits out a save already in flight and
    /// re-checks, so an edit made during that save is saved as well.
    pub async fn save_now(&self) -> SyncResult<()> {
        loop {
            let step = {
                let mut state = self.state();
                if !state.dirty {
                    return Ok(());
                }
                match state.in_flight.clone() {
                    Some((save, in_flight)) => SaveStep::Wait(save, in_flight),
                    None => {
                        state.timer.cancel();
                        state.saving = true;
                        state.saves += 1;
                        let save = state.saves;
                        let (sender, receiver) = watch::channel(false);
                        state.in_flight = Some((save, receiver));
                        SaveStep::Save(save, state.draft.clone(), sender)
                    }
                }
            };

            match step {
                SaveStep::Wait(save, mut in_flight) => {
                    if in_flight.wait_for(|done| *done).await.is_err() {
                        clear_in_flight(&mut self.state(), save);
                    }
                }
                SaveStep::Save(save, snapshot, done) => {
                    let guard = SaveInFlight {
                        inner: &self.inner,
                        save,
                        done: Some(done),
                    };
                    let result = (self.inner.save)(snapshot.clone()).await;
                    self.finish_save(&snapshot, &result);
                    guard.complete();
                    return result;
                }
            }
        }
    }

    pub async fn flush(&self) -> SyncResult<()> {
        self.save_now().await
    }

    /// Adopts authoritative content when there is nothing local to keep.
    pub fn reconcile(&self, snapshot: D) -> bool {
        let mut state = self.state();
        if state.dirty || state.saving {
            return false;
        }
        state.draft = snapshot;
        true
    }

    /// Replaces the draft outright and drops any pending autosave.
    pub fn replace(&self, snapshot: D) {
        let mut state = self.state();
        state.timer.cancel();
        state.draft = snapshot;
        state.dirty = false;
    }

    /// Cancels the autosave timer and forgets unsaved changes.
    pub fn clear(&self) {
        let mut state = self.state();
        state.timer.cancel();
        state.dirty = false;
    }

    fn finish_save(&self, snapshot: &D, result: &SyncResult<()>) {
        let mut state = self.state();
        state.saving = false;
        state.in_flight = None;
        match result {
            Ok(()) => {
                if state.draft == *snapshot {
                    state.dirty = false;
                }
            }
            Err(SyncError::Conflict { .. }) => {
                let fresh = state.resync.as_ref().and_then(|resync| resync());
                if let Some(fresh) = fresh {
                    state.timer.cancel();
                    state.draft = fresh;
                    state.dirty = false;
                }
                tracing::warn!(draft = %self.inner.label, "draft replaced after conflict");
            }
            Err(error) => {
                tracing::debug!(draft = %self.inner.label, error = %error, "draft save failed; keeping it dirty");
            }
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DraftState<D>> {
        self.inner.state.lock().expect("draft state lock")
    }
}

/// Drops the in-flight marker of `save` if it is still the current one.
fn clear_in_flight<D>(state: &mut DraftState<D>, save: u64) {
    if state.in_flight.as_ref().map(|(current, _)| *current) == Some(save) {
        state.in_flight = None;
        state.saving = false;
    }
}

/// Drafts keyed by entity key.
pub struct DraftStore<D> {
    delay: Duration,
    drafts: Mutex<HashMap<String, AutosaveController<D>>>,
}

impl<D> DraftStore<D>
where
    D: Clone + PartialEq + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            drafts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing controller or creates one from `initial`.
    pub fn open<I>(&self, key: &str, initial: I, save: SaveFn<D>) -> AutosaveController<D>
    where
        I: FnOnce() -> D,
    {
        self.open_with_delay(key, initial, self.delay, save)
    }

    /// Like [`DraftStore::open`], with the autosave delay given for a newly
    /// created controller. An already open draft keeps its delay.
    pub fn open_with_delay<I>(
        &self,
        key: &str,
        initial: I,
        delay: Duration,
        save: SaveFn<D>,
    ) -> AutosaveController<D>
    where
        I: FnOnce() -> D,
    {
        let mut drafts = self.drafts();
        drafts
            .entry(key.to_string())
            .or_insert_with(|| AutosaveController::new(key, initial(), delay, save))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<AutosaveController<D>> {
        self.drafts().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.drafts().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.drafts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts().is_empty()
    }

    /// Drops the draft, e.g. when its entity is unloaded or deleted.
    pub fn remove(&self, key: &str) -> Option<AutosaveController<D>> {
        let removed = self.drafts().remove(key);
        if let Some(controller) = &removed {
            controller.clear();
        }
        removed
    }

    /// Saves every dirty draft; returns the first failure after trying all.
    pub async fn flush_all(&self) -> SyncResult<()> {
        let controllers = {
            let drafts = self.drafts();
            let mut entries = drafts.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries
                .into_iter()
                .map(|(_, controller)| controller.clone())
                .collect::<Vec<_>>()
        };
        let mut first_error = None;
        for controller in controllers {
            if let Err(error) = controller.save_now().await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn clear(&self) {
        let drained = self.drafts().drain().collect::<Vec<_>>();
        for (_, controller) in drained {
            controller.clear();
        }
    }

    fn drafts(&self) -> std::sync::MutexGuard<'_, HashMap<String, AutosaveController<D>>> {
        self.drafts.lock().expect("draft store lock")
    }
}
