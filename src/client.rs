use crate::backend::Backend;
use crate::collections::Collections;
use crate::config::SyncSettings;
use crate::errors::{SyncError, SyncResult};
use crate::models::InvokeOutcome;
use crate::paced::{PacedKey, PacedMutationRegistry, PacedUpdate};
use crate::queue::{MutationQueue, PendingCommit};
use crate::transaction::{MutationScope, Transaction, TransactionBuilder};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Entry point for mutation functions: owns the stores, the single commit
/// queue and the paced registry, all talking to one backend.
#[derive(Clone)]
pub struct SyncClient {
    backend: Arc<dyn Backend>,
    collections: Collections,
    queue: MutationQueue,
    paced: PacedMutationRegistry,
    settings: Arc<Mutex<SyncSettings>>,
}

impl SyncClient {
    /// Spawns the queue worker; must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn Backend>, settings: SyncSettings) -> Self {
        let queue = MutationQueue::start(settings.slow_commit_warn());
        let paced = PacedMutationRegistry::new(queue.clone(), backend.clone());
        Self {
            backend,
            collections: Collections::new(),
            queue,
            paced,
            settings: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn paced(&self) -> &PacedMutationRegistry {
        &self.paced
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings.lock().expect("sync settings lock").clone()
    }

    /// Merges `patch` into the current settings. The paced debounce applies
    /// to paced edits opened afterwards and the autosave delay to drafts
    /// opened afterwards; the slow-commit threshold is fixed at start.
    pub fn update_settings(&self, patch: Value) -> SyncResult<SyncSettings> {
        let mut settings = self.settings.lock().expect("sync settings lock");
        let updated = settings.merge_patch(patch)?;
        *settings = updated.clone();
        tracing::info!(
            autosave_delay_ms = updated.autosave_delay_ms,
            paced_debounce_ms = updated.paced_debounce_ms,
            "sync settings updated"
        );
        Ok(updated)
    }

    pub fn transaction(&self, channel: &str) -> TransactionBuilder {
        Transaction::builder(channel)
    }

    /// A paced update using the configured debounce window.
    pub fn paced_update(&self, builder: TransactionBuilder) -> PacedUpdate {
        PacedUpdate::new(builder, self.settings().paced_debounce())
    }

    /// Applies `apply` to the stores before returning and enqueues the
    /// commit. Pending paced edits on the same keys are flushed first so
    /// the backend sees them in edit order.
    pub fn mutate_immediate<F>(
        &self,
        builder: TransactionBuilder,
        apply: F,
    ) -> SyncResult<PendingCommit<Value>>
    where
        F: FnOnce(&mut MutationScope),
    {
        self.paced.flush_superseded(&builder.target_keys());
        let transaction = builder.build()?;
        transaction.mutate(apply)?;
        if let Err(error) = transaction.seal() {
            transaction.rollback();
            return Err(error);
        }
        let label = format!("{} {}", transaction.channel(), transaction.id());
        Ok(self
            .queue
            .submit(&label, transaction.clone().commit(self.backend.clone())))
    }

    pub fn mutate_paced<F>(&self, update: PacedUpdate, apply: F) -> SyncResult<PacedKey>
    where
        F: FnOnce(&mut MutationScope),
    {
        self.paced.apply(update, apply)
    }

    pub async fn submit_and_wait(&self, key: &PacedKey) -> SyncResult<()> {
        self.paced.submit_and_wait(key).await
    }

    pub async fn submit_all_and_wait(&self) -> SyncResult<()> {
        self.paced.submit_all_and_wait().await
    }

    /// Read-style call outside the commit queue; returns the success body.
    pub async fn load(&self, channel: &str, payload: Value) -> SyncResult<Value> {
        let reply = self.backend.invoke(channel, payload).await?;
        match InvokeOutcome::from_value(reply)? {
            InvokeOutcome::Success(body) => Ok(body),
            InvokeOutcome::Conflict(_) => Err(SyncError::InvalidResponse(format!(
                "{} answered a load with a conflict",
                channel
            ))),
            InvokeOutcome::Failure(message) if message.starts_with("NOT_FOUND") => {
                Err(SyncError::NotFound(message))
            }
            InvokeOutcome::Failure(message) => {
                tracing::warn!(channel = %channel, error = %message, "load failed");
                Err(SyncError::Backend(message))
            }
        }
    }
}
