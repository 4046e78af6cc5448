//! Semantic invariants of the agent document not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::state::{AgentState, SCHEMA_VERSION};

/// Check semantic invariants not expressible in JSON Schema:
/// - Schema version matches this build
/// - No duplicate task ids or sequence numbers
/// - Every `seq < next_task_seq`
/// - `updated_at >= created_at`
/// - History cycle numbers strictly increasing and not above `wake_count`
/// - `last_wake_at` present iff `wake_count > 0`
pub fn validate_invariants(state: &AgentState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.schema_version != SCHEMA_VERSION {
        errors.push(format!(
            "incompatible schema_version {} (expected {})",
            state.schema_version, SCHEMA_VERSION
        ));
    }

    let mut ids = HashSet::new();
    let mut seqs = HashSet::new();
    for task in state.tasks.iter() {
        if !ids.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
        if !seqs.insert(task.seq) {
            errors.push(format!("{}: duplicate seq {}", task.id, task.seq));
        }
        if task.seq >= state.next_task_seq {
            errors.push(format!(
                "{}: seq {} not below next_task_seq {}",
                task.id, task.seq, state.next_task_seq
            ));
        }
        if task.updated_at < task.created_at {
            errors.push(format!("{}: updated_at precedes created_at", task.id));
        }
    }

    let mut previous: Option<u64> = None;
    for record in &state.history {
        if let Some(prev) = previous
            && record.cycle_number <= prev
        {
            errors.push(format!(
                "history cycle {} does not follow cycle {}",
                record.cycle_number, prev
            ));
        }
        if record.cycle_number > state.wake_count {
            errors.push(format!(
                "history cycle {} exceeds wake_count {}",
                record.cycle_number, state.wake_count
            ));
        }
        previous = Some(record.cycle_number);
    }

    match (state.wake_count, state.last_wake_at) {
        (0, Some(_)) => errors.push("last_wake_at set but wake_count is 0".to_string()),
        (count, None) if count > 0 => {
            errors.push(format!("wake_count {count} but last_wake_at missing"));
        }
        _ => {}
    }

    errors
}
