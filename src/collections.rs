use crate::errors::{SyncError, SyncResult};
use crate::models::{EntityKind, FolderRecord, PromptRecord, RevisionEnvelope, SettingsRecord};
use crate::store::{EntityStore, Record};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRevision {
    pub key: String,
    pub revision: u64,
}

/// Kind-erased view of an [`EntityStore`] used by transactions, which carry
/// targets of several kinds and only speak JSON to the backend.
pub trait CollectionHandle: Send + Sync {
    fn kind(&self) -> EntityKind;
    fn authoritative_revision(&self, key: &str) -> u64;
    fn rebase_expected(&self, key: &str, captured: u64) -> u64;
    fn record_own_advance(&self, key: &str, from: u64, to: u64);
    fn snapshot_json(&self, key: &str) -> SyncResult<Option<Value>>;
    /// Accepts a single envelope or an array of envelopes and reports the
    /// highest revision seen per key.
    fn apply_authoritative_json(&self, value: &Value) -> SyncResult<Vec<ObservedRevision>>;
    fn delete_authoritative_keys(&self, keys: &[String]) -> usize;
}

impl<T: Record> CollectionHandle for EntityStore<T> {
    fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn authoritative_revision(&self, key: &str) -> u64 {
        EntityStore::authoritative_revision(self, key)
    }

    fn rebase_expected(&self, key: &str, captured: u64) -> u64 {
        EntityStore::rebase_expected(self, key, captured)
    }

    fn record_own_advance(&self, key: &str, from: u64, to: u64) {
        EntityStore::record_own_advance(self, key, from, to)
    }

    fn snapshot_json(&self, key: &str) -> SyncResult<Option<Value>> {
        self.get(key)
            .map(|record| serde_json::to_value(record).map_err(SyncError::from))
            .transpose()
    }

    fn apply_authoritative_json(&self, value: &Value) -> SyncResult<Vec<ObservedRevision>> {
        let envelopes: Vec<RevisionEnvelope<T>> = match value {
            Value::Array(_) => serde_json::from_value(value.clone()),
            _ => serde_json::from_value(value.clone()).map(|envelope| vec![envelope]),
        }
        .map_err(|error| {
            SyncError::InvalidResponse(format!("malformed {} envelope: {}", T::KIND, error))
        })?;

        let mut observed: BTreeMap<String, u64> = BTreeMap::new();
        for envelope in &envelopes {
            let entry = observed.entry(envelope.id.clone()).or_insert(envelope.revision);
            *entry = (*entry).max(envelope.revision);
        }
        self.upsert_many_authoritative(envelopes);

        Ok(observed
            .into_iter()
            .map(|(key, revision)| ObservedRevision { key, revision })
            .collect())
    }

    fn delete_authoritative_keys(&self, keys: &[String]) -> usize {
        self.delete_many_authoritative(keys)
    }
}

/// One typed store per entity kind.
#[derive(Clone, Default)]
pub struct Collections {
    pub prompts: EntityStore<PromptRecord>,
    pub folders: EntityStore<FolderRecord>,
    pub settings: EntityStore<SettingsRecord>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, kind: EntityKind) -> Arc<dyn CollectionHandle> {
        match kind {
            EntityKind::Prompt => Arc::new(self.prompts.clone()),
            EntityKind::Folder => Arc::new(self.folders.clone()),
            EntityKind::Settings => Arc::new(self.settings.clone()),
        }
    }

    pub fn clear_all(&self) {
        self.prompts.clear();
        self.folders.clear();
        self.settings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::Collections;
    use crate::models::EntityKind;
    use serde_json::json;

    #[test]
    fn handles_apply_single_and_batched_envelopes() {
        let collections = Collections::new();
        let prompts = collections.handle(EntityKind::Prompt);

        let observed = prompts
            .apply_authoritative_json(&json!({
                "id": "p1",
                "revision": 2,
                "data": {"id": "p1", "folderId": null, "title": "A", "body": "", "updatedAt": null}
            }))
            .expect("single envelope");
        assert_eq!(observed[0].revision, 2);
        assert_eq!(collections.prompts.get("p1").expect("p1").title, "A");

        let observed = prompts
            .apply_authoritative_json(&json!([
                {"id": "p1", "revision": 4, "data": {"id": "p1", "folderId": null, "title": "C", "body": "", "updatedAt": null}},
                {"id": "p1", "revision": 3, "data": {"id": "p1", "folderId": null, "title": "B", "body": "", "updatedAt": null}}
            ]))
            .expect("batch");
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].revision, 4);
        assert_eq!(collections.prompts.get("p1").expect("p1").title, "C");
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let collections = Collections::new();
        let err = collections
            .handle(EntityKind::Folder)
            .apply_authoritative_json(&json!({"id": "f1"}))
            .expect_err("missing revision");
        assert_eq!(err.code(), "INVALID_RESPONSE");
    }

    #[test]
    fn handles_report_their_kind() {
        let collections = Collections::new();
        for kind in EntityKind::ALL {
            assert_eq!(collections.handle(kind).kind(), kind);
        }
    }
}
