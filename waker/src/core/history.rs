//! Bounded wake history.

use std::collections::VecDeque;

use crate::core::types::WakeRecord;

/// Append `record` and evict the oldest entries so that at most `cap` remain.
///
/// Returns the number of evicted records.
pub fn push_bounded(history: &mut VecDeque<WakeRecord>, record: WakeRecord, cap: usize) -> usize {
    history.push_back(record);
    let mut evicted = 0;
    while history.len() > cap {
        history.pop_front();
        evicted += 1;
    }
    evicted
}

/// The last `n` records, oldest first.
pub fn recent(history: &VecDeque<WakeRecord>, n: usize) -> Vec<WakeRecord> {
    let skip = history.len().saturating_sub(n);
    history.iter().skip(skip).cloned().collect()
}
