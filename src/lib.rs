pub mod backend;
pub mod client;
pub mod collections;
pub mod config;
pub mod draft;
pub mod errors;
pub mod logging;
pub mod models;
pub mod paced;
pub mod queue;
pub mod revision;
pub mod store;
pub mod timer;
pub mod transaction;
pub mod workspace;

pub use crate::backend::memory::InMemoryBackend;
pub use crate::backend::{Backend, InvokeFuture};
pub use crate::client::SyncClient;
pub use crate::collections::{CollectionHandle, Collections};
pub use crate::config::SyncSettings;
pub use crate::draft::{AutosaveController, DraftStore};
pub use crate::errors::{SyncError, SyncResult};
pub use crate::models::{
    EntityKind, FolderRecord, PromptRecord, RevisionEnvelope, SettingsRecord, WorkspaceSnapshot,
};
pub use crate::paced::{FlushReason, PacedKey, PacedMutationRegistry, PacedUpdate};
pub use crate::queue::{MutationQueue, PendingCommit};
pub use crate::store::{Change, ChangeEvent, ChangeOrigin, EntityStore, Record};
pub use crate::transaction::{MutationScope, Transaction, TransactionBuilder, TransactionState};
pub use crate::workspace::{PromptDraft, WorkspaceSession};
