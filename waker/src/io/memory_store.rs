//! Process-local state store.
//!
//! Keeps the encoded document text rather than the struct so that loads go
//! through the same strict decoder as the file store.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::core::state::AgentState;
use crate::io::state_store::{
    Committed, Loaded, StateStore, StoreError, check_commit, decode_state, encode_state,
};

#[derive(Debug)]
struct Slot {
    version: u64,
    raw: String,
}

/// Mutex-guarded single-document store.
#[derive(Debug)]
pub struct InMemoryStateStore {
    key: String,
    slot: Mutex<Option<Slot>>,
}

impl InMemoryStateStore {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            slot: Mutex::new(None),
        }
    }

    /// Replace the stored text verbatim (used to simulate corruption or
    /// documents written by another build).
    pub fn put_raw(&self, version: u64, raw: impl Into<String>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Slot {
            version,
            raw: raw.into(),
        });
    }

    /// Version of the stored document, if any.
    pub fn stored_version(&self) -> Option<u64> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|s| s.version)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn key(&self) -> &str {
        &self.key
    }

    async fn load(&self) -> Result<Loaded, StoreError> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slot.as_ref() else {
            return Err(StoreError::NotFound {
                key: self.key.clone(),
            });
        };
        let state = decode_state(&slot.raw)?;
        if state.version != slot.version {
            return Err(StoreError::Malformed(format!(
                "document version {} stored as version {}",
                state.version, slot.version
            )));
        }
        Ok(Loaded {
            state,
            version: slot.version,
        })
    }

    async fn save(
        &self,
        state: &AgentState,
        expected_version: u64,
    ) -> Result<Committed, StoreError> {
        let next = check_commit(state, expected_version)?;
        let raw = encode_state(state)?;
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let current = slot.as_ref().map_or(0, |s| s.version);
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found: current,
            });
        }
        *slot = Some(Slot { version: next, raw });
        debug!(key = %self.key, version = next, "agent state committed");
        Ok(Committed { version: next })
    }
}
