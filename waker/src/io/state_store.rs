//! State store contract and the shared agent document codec.
//!
//! Every store persists the same JSON document. Decoding is strict: the raw
//! text must parse, conform to the embedded JSON Schema, deserialize, and pass
//! the semantic invariants. Anything else is [`StoreError::Malformed`] and is
//! never coerced into a fresh state.

use std::time::Duration;

use async_trait::async_trait;
use jsonschema::validator_for;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::invariants::validate_invariants;
use crate::core::state::AgentState;

/// JSON Schema every persisted agent document must satisfy.
pub const AGENT_STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/agent_state/v1.schema.json"
));

/// Failures of the durable layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Nothing committed under this key yet (first run).
    #[error("no agent state stored under '{key}'")]
    NotFound { key: String },
    /// Another writer committed since the caller loaded `expected`.
    #[error("version conflict: expected version {expected}, store holds {found}")]
    VersionConflict { expected: u64, found: u64 },
    /// The durable layer could not be reached or did not answer in time.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    /// The stored document is corrupt or has an incompatible schema.
    #[error("malformed agent state: {0}")]
    Malformed(String),
    /// The caller tried to commit a document with the wrong version number.
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
}

/// A successfully loaded document and the version it was committed as.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub state: AgentState,
    pub version: u64,
}

/// Result of an accepted commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub version: u64,
}

/// Durable, versioned storage of one agent document.
///
/// `save` is a compare-and-swap: it succeeds only if the stored version is
/// still `expected_version`, and it either replaces the whole document or
/// changes nothing.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Identifier of the stored document.
    fn key(&self) -> &str;

    async fn load(&self) -> Result<Loaded, StoreError>;

    async fn save(
        &self,
        state: &AgentState,
        expected_version: u64,
    ) -> Result<Committed, StoreError>;
}

/// Serialize a document to pretty-printed JSON with trailing newline.
///
/// The encoded text must decode again: a document that every later load
/// would reject as malformed is refused with `InvalidCommit` instead.
pub fn encode_state(state: &AgentState) -> Result<String, StoreError> {
    let mut buf = serde_json::to_string_pretty(state)
        .map_err(|err| StoreError::InvalidCommit(format!("serialize agent state: {err}")))?;
    buf.push('\n');
    match decode_state(&buf) {
        Ok(_) => Ok(buf),
        Err(StoreError::Malformed(reason)) => Err(StoreError::InvalidCommit(format!(
            "document would not load back: {reason}"
        ))),
        Err(err) => Err(err),
    }
}

/// Parse and validate a stored document (schema + invariants).
pub fn decode_state(raw: &str) -> Result<AgentState, StoreError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| StoreError::Malformed(format!("parse json: {err}")))?;
    validate_schema(&value)?;
    let state: AgentState = serde_json::from_value(value)
        .map_err(|err| StoreError::Malformed(format!("deserialize agent state: {err}")))?;
    let errors = validate_invariants(&state);
    if !errors.is_empty() {
        return Err(StoreError::Malformed(format!(
            "invariants failed: {}",
            errors.join("; ")
        )));
    }
    Ok(state)
}

/// Ensure `state` is the successor of `expected_version`.
pub fn check_commit(state: &AgentState, expected_version: u64) -> Result<u64, StoreError> {
    let next = expected_version + 1;
    if state.version != next {
        return Err(StoreError::InvalidCommit(format!(
            "document version {} is not the successor of {}",
            state.version, expected_version
        )));
    }
    Ok(next)
}

fn validate_schema(value: &Value) -> Result<(), StoreError> {
    let schema: Value = serde_json::from_str(AGENT_STATE_SCHEMA)
        .map_err(|err| StoreError::Malformed(format!("parse embedded schema: {err}")))?;
    let compiled = validator_for(&schema)
        .map_err(|err| StoreError::Malformed(format!("invalid embedded schema: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(StoreError::Malformed(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

/// Load the current document, synthesizing the zero state on first run.
pub async fn load_or_init(
    store: &dyn StateStore,
    timeout: Duration,
) -> Result<Loaded, StoreError> {
    match tokio::time::timeout(timeout, store.load()).await {
        Ok(Ok(loaded)) => {
            debug!(key = store.key(), version = loaded.version, "agent state loaded");
            Ok(loaded)
        }
        Ok(Err(StoreError::NotFound { key })) => {
            debug!(key = %key, "no agent state yet, starting from zero");
            Ok(Loaded {
                state: AgentState::zero(),
                version: 0,
            })
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            warn!(key = store.key(), timeout_ms = timeout.as_millis() as u64, "state load timed out");
            Err(StoreError::Unavailable(format!(
                "load timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

/// Commit `state` over `expected_version`, bounded by `timeout`.
///
/// An elapsed timeout is reported as unavailability. The write may still have
/// landed; the next load observes whichever version is durable.
pub async fn save_with_timeout(
    store: &dyn StateStore,
    state: &AgentState,
    expected_version: u64,
    timeout: Duration,
) -> Result<Committed, StoreError> {
    match tokio::time::timeout(timeout, store.save(state, expected_version)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(key = store.key(), expected_version, "state save timed out");
            Err(StoreError::Unavailable(format!(
                "save timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MarketplaceSummary, Priority};
    use crate::test_support::{record, state_with_tasks, task, ts};

    #[test]
    fn encode_then_decode_preserves_document() {
        let mut state = state_with_tasks(vec![task("a", Priority::High, 0)]);
        state.version = 3;
        state.wake_count = 1;
        state.last_wake_at = Some(ts(10));
        state.history.push_back(record(1));

        let raw = encode_state(&state).expect("encode");
        assert!(raw.ends_with("}\n"));
        assert_eq!(decode_state(&raw).expect("decode"), state);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_state("{not json").expect_err("garbage");
        assert!(matches!(err, StoreError::Malformed(ref msg) if msg.contains("parse json")));
    }

    #[test]
    fn decode_rejects_schema_violations() {
        let raw = r#"{"schema_version":1,"version":1,"wake_count":0,"last_wake_at":null,
            "next_task_seq":0,"tasks":"nope","history":[]}"#;
        let err = decode_state(raw).expect_err("schema");
        assert!(matches!(err, StoreError::Malformed(ref msg) if msg.contains("schema validation failed")));
    }

    #[test]
    fn decode_rejects_incompatible_schema_version() {
        let mut state = AgentState::zero();
        state.schema_version = 2;
        let raw = serde_json::to_string(&state).expect("serialize");
        assert!(matches!(decode_state(&raw), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_invariant_violations() {
        let mut state = state_with_tasks(vec![task("a", Priority::High, 0)]);
        state.next_task_seq = 0;
        let raw = serde_json::to_string(&state).expect("serialize");
        let err = decode_state(&raw).expect_err("invariants");
        assert!(matches!(err, StoreError::Malformed(ref msg) if msg.contains("invariants failed")));
    }

    #[test]
    fn encode_refuses_documents_that_would_not_load() {
        let mut state = AgentState::zero();
        state.version = 1;
        state.ledger.insert(
            "clawgig".to_string(),
            MarketplaceSummary {
                earned_usd: f64::NAN,
                pending_usd: 0.0,
                jobs_completed: 0,
                fetched_at: ts(0),
            },
        );
        let err = encode_state(&state).expect_err("nan earnings");
        assert!(matches!(err, StoreError::InvalidCommit(ref msg) if msg.contains("would not load back")));

        let mut state = state_with_tasks(vec![task("a", Priority::High, 0)]);
        state.next_task_seq = 0;
        assert!(matches!(
            encode_state(&state),
            Err(StoreError::InvalidCommit(_))
        ));
    }

    #[test]
    fn check_commit_requires_successor_version() {
        let mut state = AgentState::zero();
        state.version = 5;
        assert_eq!(check_commit(&state, 4), Ok(5));
        assert!(matches!(
            check_commit(&state, 5),
            Err(StoreError::InvalidCommit(_))
        ));
    }
}
