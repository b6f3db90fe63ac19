use crate::backend::{ENTITIES_DELETE, ENTITIES_SAVE, WORKSPACE_LOAD};
use crate::client::SyncClient;
use crate::draft::{AutosaveController, DraftStore, SaveFn};
use crate::errors::{SyncError, SyncResult};
use crate::models::{EntityKind, FolderRecord, PromptRecord, SettingsRecord, WorkspaceSnapshot};
use crate::paced::PacedKey;
use crate::queue::PendingCommit;
use crate::store::EntityStore;
use crate::transaction::{Transaction, TransactionBuilder};
use chrono::Utc;
use serde_json::{json, Value};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const SETTINGS_KEY: &str = "workspace";
pub const EDITOR_FONT_SIZE_RANGE: RangeInclusive<u16> = 8..=48;

/// Editable fields of a prompt held by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptDraft {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

impl PromptDraft {
    fn apply_to(&self, record: &mut PromptRecord) {
        record.title = self.title.clone();
        record.body = self.body.clone();
        record.tags = self.tags.clone();
        record.updated_at = Some(Utc::now());
    }
}

impl From<&PromptRecord> for PromptDraft {
    fn from(record: &PromptRecord) -> Self {
        Self {
            title: record.title.clone(),
            body: record.body.clone(),
            tags: record.tags.clone(),
        }
    }
}

/// Prompt, folder and settings operations for one open workspace.
#[derive(Clone)]
pub struct WorkspaceSession {
    client: SyncClient,
    drafts: Arc<DraftStore<PromptDraft>>,
    workspace_id: Arc<Mutex<Option<String>>>,
}

impl WorkspaceSession {
    pub fn new(client: SyncClient) -> Self {
        let drafts = DraftStore::new(client.settings().autosave_delay());
        Self {
            client,
            drafts: Arc::new(drafts),
            workspace_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub fn workspace_id(&self) -> Option<String> {
        self.workspace_id.lock().expect("workspace id lock").clone()
    }

    pub fn prompt(&self, id: &str) -> Option<PromptRecord> {
        self.client.collections().prompts.get(id)
    }

    pub fn folder(&self, id: &str) -> Option<FolderRecord> {
        self.client.collections().folders.get(id)
    }

    pub fn settings(&self) -> Option<SettingsRecord> {
        self.client.collections().settings.get(SETTINGS_KEY)
    }

    /// Merges the workspace's authoritative snapshot and refreshes clean drafts.
    pub async fn load_workspace(&self, workspace_id: &str) -> SyncResult<WorkspaceSnapshot> {
        let body = self
            .client
            .load(WORKSPACE_LOAD, json!({ "workspaceId": workspace_id }))
            .await?;
        let snapshot: WorkspaceSnapshot = serde_json::from_value(body)?;
        let collections = self.client.collections();
        let applied = collections.prompts.upsert_many_authoritative(snapshot.prompt.clone())
            + collections.folders.upsert_many_authoritative(snapshot.folder.clone())
            + collections.settings.upsert_many_authoritative(snapshot.settings.clone());

        for key in self.drafts.keys() {
            if let (Some(controller), Some(record)) = (self.drafts.get(&key), self.prompt(&key)) {
                controller.reconcile(PromptDraft::from(&record));
            }
        }
        *self.workspace_id.lock().expect("workspace id lock") = Some(workspace_id.to_string());
        tracing::info!(workspace = %workspace_id, applied, "workspace loaded");
        Ok(snapshot)
    }

    /// Creates a prompt, optionally appending it to a folder's order. An
    /// empty title is derived from the body.
    pub fn create_prompt(
        &self,
        folder_id: Option<&str>,
        title: &str,
        body: &str,
    ) -> SyncResult<(PromptRecord, PendingCommit<Value>)> {
        let collections = self.client.collections();
        if let Some(folder_id) = folder_id {
            if !collections.folders.contains(folder_id) {
                return Err(SyncError::NotFound(format!("folder {}", folder_id)));
            }
        }
        let title = if title.trim().is_empty() {
            derive_title(body)
        } else {
            title.trim().to_string()
        };
        let prompt = PromptRecord {
            id: Uuid::new_v4().to_string(),
            folder_id: folder_id.map(str::to_string),
            title,
            body: body.to_string(),
            tags: Vec::new(),
            updated_at: Some(Utc::now()),
        };

        let mut builder = self
            .client
            .transaction(ENTITIES_SAVE)
            .target(collections.handle(EntityKind::Prompt), prompt.id.clone());
        if let Some(folder_id) = folder_id {
            builder = builder.target(collections.handle(EntityKind::Folder), folder_id);
        }
        let prompts = collections.prompts.clone();
        let folders = collections.folders.clone();
        let record = prompt.clone();
        let commit = self.client.mutate_immediate(builder, move |scope| {
            let id = record.id.clone();
            scope.insert(&prompts, record);
            if let Some(folder_id) = folder_id {
                scope.update(&folders, folder_id, |folder| push_unique(&mut folder.prompt_order, &id));
            }
        })?;
        Ok((prompt, commit))
    }

    /// Paced: consecutive renames coalesce into one save. Blank titles are
    /// kept locally and not sent.
    pub fn rename_prompt(&self, id: &str, title: &str) -> SyncResult<PacedKey> {
        self.require_prompt(id)?;
        let prompts = self.client.collections().prompts.clone();
        let title = title.to_string();
        let update = self
            .client
            .paced_update(self.prompt_target(ENTITIES_SAVE, id))
            .validate_with(prompt_title_present(prompts.clone(), id));
        self.client.mutate_paced(update, move |scope| {
            scope.update(&prompts, id, |record| {
                record.title = title;
                record.updated_at = Some(Utc::now());
            });
        })
    }

    pub fn edit_prompt_body(&self, id: &str, body: &str) -> SyncResult<PacedKey> {
        self.require_prompt(id)?;
        let prompts = self.client.collections().prompts.clone();
        let body = body.to_string();
        let update = self.client.paced_update(self.prompt_target(ENTITIES_SAVE, id));
        self.client.mutate_paced(update, move |scope| {
            scope.update(&prompts, id, |record| {
                record.body = body;
                record.updated_at = Some(Utc::now());
            });
        })
    }

    /// Moves a prompt into `folder_id`, appending it to that folder's order.
    /// The source folder's order is left for the backend to reconcile.
    pub fn move_prompt(&self, id: &str, folder_id: &str) -> SyncResult<PendingCommit<Value>> {
        self.require_prompt(id)?;
        let collections = self.client.collections();
        if !collections.folders.contains(folder_id) {
            return Err(SyncError::NotFound(format!("folder {}", folder_id)));
        }
        let builder = self
            .prompt_target(ENTITIES_SAVE, id)
            .target(collections.handle(EntityKind::Folder), folder_id);
        let prompts = collections.prompts.clone();
        let folders = collections.folders.clone();
        self.client.mutate_immediate(builder, move |scope| {
            scope.update(&prompts, id, |record| {
                record.folder_id = Some(folder_id.to_string());
                record.updated_at = Some(Utc::now());
            });
            scope.update(&folders, folder_id, |folder| push_unique(&mut folder.prompt_order, id));
        })
    }

    pub fn delete_prompt(&self, id: &str) -> SyncResult<PendingCommit<Value>> {
        self.require_prompt(id)?;
        self.drafts.remove(id);
        let prompts = self.client.collections().prompts.clone();
        self.client
            .mutate_immediate(self.prompt_target(ENTITIES_DELETE, id), move |scope| {
                scope.delete(&prompts, id);
            })
    }

    pub fn rename_folder(&self, id: &str, name: &str) -> SyncResult<PacedKey> {
        let collections = self.client.collections();
        if !collections.folders.contains(id) {
            return Err(SyncError::NotFound(format!("folder {}", id)));
        }
        let folders = collections.folders.clone();
        let name = name.to_string();
        let check = folders.clone();
        let key = id.to_string();
        let update = self
            .client
            .paced_update(
                self.client
                    .transaction(ENTITIES_SAVE)
                    .target(collections.handle(EntityKind::Folder), id),
            )
            .validate_with(move |_| {
                check
                    .get(&key)
                    .map(|folder| !folder.name.trim().is_empty())
                    .unwrap_or(false)
            });
        self.client.mutate_paced(update, move |scope| {
            scope.update(&folders, id, |folder| folder.name = name);
        })
    }

    /// Replaces the folder's prompt order; ids not known locally are dropped.
    pub fn reorder_folder(&self, id: &str, order: Vec<String>) -> SyncResult<PendingCommit<Value>> {
        let collections = self.client.collections();
        if !collections.folders.contains(id) {
            return Err(SyncError::NotFound(format!("folder {}", id)));
        }
        let mut seen = Vec::with_capacity(order.len());
        for prompt_id in order {
            if collections.prompts.contains(&prompt_id) {
                push_unique(&mut seen, &prompt_id);
            }
        }
        let folders = collections.folders.clone();
        let builder = self
            .client
            .transaction(ENTITIES_SAVE)
            .target(collections.handle(EntityKind::Folder), id);
        self.client.mutate_immediate(builder, move |scope| {
            scope.update(&folders, id, |folder| folder.prompt_order = seen);
        })
    }

    /// Paced: the typed text is shown as-is and only sent while it parses
    /// to a size inside [`EDITOR_FONT_SIZE_RANGE`].
    pub fn set_editor_font_size(&self, value: &str) -> SyncResult<PacedKey> {
        let collections = self.client.collections();
        let settings = collections.settings.clone();
        let check = settings.clone();
        let value = value.to_string();
        let update = self
            .client
            .paced_update(
                self.client
                    .transaction(ENTITIES_SAVE)
                    .target(collections.handle(EntityKind::Settings), SETTINGS_KEY),
            )
            .validate_with(move |_| {
                check
                    .get(SETTINGS_KEY)
                    .map(|record| parse_font_size(&record.editor_font_size).is_some())
                    .unwrap_or(false)
            });
        self.client.mutate_paced(update, move |scope| {
            let updated = scope.update(&settings, SETTINGS_KEY, |record| {
                record.editor_font_size = value.clone();
            });
            if !updated {
                scope.insert(
                    &settings,
                    SettingsRecord {
                        editor_font_size: value,
                        ..SettingsRecord::default()
                    },
                );
            }
        })
    }

    /// Returns the prompt's editor draft, creating it from the store.
    pub fn open_prompt_draft(&self, id: &str) -> SyncResult<AutosaveController<PromptDraft>> {
        if let Some(controller) = self.drafts.get(id) {
            return Ok(controller);
        }
        let record = self.require_prompt(id)?;
        let controller = self.drafts.open_with_delay(
            id,
            || PromptDraft::from(&record),
            self.client.settings().autosave_delay(),
            self.draft_saver(id),
        );
        let prompts = self.client.collections().prompts.clone();
        let key = id.to_string();
        controller.set_resync(Arc::new(move || {
            prompts.get(&key).map(|record| PromptDraft::from(&record))
        }));
        Ok(controller)
    }

    pub fn prompt_draft(&self, id: &str) -> Option<AutosaveController<PromptDraft>> {
        self.drafts.get(id)
    }

    pub fn edit_prompt_draft<F>(&self, id: &str, change: F) -> SyncResult<()>
    where
        F: FnOnce(&mut PromptDraft),
    {
        self.open_prompt_draft(id)?.edit(change);
        Ok(())
    }

    pub fn close_prompt_draft(&self, id: &str) -> bool {
        self.drafts.remove(id).is_some()
    }

    pub async fn flush_drafts(&self) -> SyncResult<()> {
        self.drafts.flush_all().await
    }

    /// Saves what can be saved, then drops drafts and stores and loads the
    /// next workspace. Save failures are logged and do not block the switch.
    pub async fn switch_workspace(&self, workspace_id: &str) -> SyncResult<WorkspaceSnapshot> {
        let previous = self.workspace_id();
        if let Err(error) = self.flush_drafts().await {
            tracing::warn!(workspace = ?previous, error = %error, "draft flush failed before workspace switch");
        }
        if let Err(error) = self.client.submit_all_and_wait().await {
            tracing::warn!(workspace = ?previous, error = %error, "paced commits failed before workspace switch");
        }
        self.client.queue().idle().await?;

        self.drafts.clear();
        self.client.paced().discard_all();
        self.client.collections().clear_all();
        *self.workspace_id.lock().expect("workspace id lock") = None;
        self.load_workspace(workspace_id).await
    }

    fn draft_saver(&self, id: &str) -> SaveFn<PromptDraft> {
        let client = self.client.clone();
        let key = id.to_string();
        Arc::new(move |draft: PromptDraft| {
            let client = client.clone();
            let key = key.clone();
            Box::pin(async move {
                let prompts = client.collections().prompts.clone();
                let builder = client
                    .transaction(ENTITIES_SAVE)
                    .target(client.collections().handle(EntityKind::Prompt), key.clone());
                let commit = client.mutate_immediate(builder, |scope| {
                    scope.update(&prompts, &key, |record| draft.apply_to(record));
                })?;
                commit.wait().await.map(|_| ())
            })
        })
    }

    fn prompt_target(&self, channel: &str, id: &str) -> TransactionBuilder {
        self.client
            .transaction(channel)
            .target(self.client.collections().handle(EntityKind::Prompt), id)
    }

    fn require_prompt(&self, id: &str) -> SyncResult<PromptRecord> {
        self.prompt(id)
            .ok_or_else(|| SyncError::NotFound(format!("prompt {}", id)))
    }
}

fn prompt_title_present(
    prompts: EntityStore<PromptRecord>,
    id: &str,
) -> impl Fn(&Transaction) -> bool + Send + Sync + 'static {
    let key = id.to_string();
    move |_| {
        prompts
            .get(&key)
            .map(|record| !record.title.trim().is_empty())
            .unwrap_or(false)
    }
}

pub fn parse_font_size(raw: &str) -> Option<u16> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|size| EDITOR_FONT_SIZE_RANGE.contains(size))
}

fn push_unique(order: &mut Vec<String>, id: &str) {
    if !order.iter().any(|existing| existing == id) {
        order.push(id.to_string());
    }
}

fn derive_title(body: &str) -> String {
    let first = body
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("Untitled prompt")
        .trim();
    first
        .trim_start_matches('#')
        .trim_start_matches(['-', '*'])
        .trim()
        .chars()
        .take(120)
        .collect::<String>()
}
