pub mod memory;

use crate::errors::SyncResult;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub const ENTITIES_SAVE: &str = "entities_save";
pub const ENTITIES_DELETE: &str = "entities_delete";
pub const ENTITY_GET: &str = "entity_get";
pub const WORKSPACE_LOAD: &str = "workspace_load";

pub type InvokeFuture = Pin<Box<dyn Future<Output = SyncResult<Value>> + Send>>;

/// Request/response boundary to the process that persists entities.
///
/// `Ok` carries the raw reply (`{ success, ... }`); `Err` is reserved for
/// transport failures where no reply was received.
pub trait Backend: Send + Sync {
    fn invoke(&self, channel: &str, payload: Value) -> InvokeFuture;
}

impl<F> Backend for F
where
    F: Fn(&str, Value) -> InvokeFuture + Send + Sync,
{
    fn invoke(&self, channel: &str, payload: Value) -> InvokeFuture {
        self(channel, payload)
    }
}
