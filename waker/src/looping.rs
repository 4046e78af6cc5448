//! Periodic trigger loop for `waker run` and the server's timer.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::cycle::{CycleError, CycleReport};
use crate::orchestrator::Orchestrator;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The configured number of cycles ran.
    MaxCycles,
    /// The shutdown future resolved.
    Shutdown,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub cycles_run: u64,
    pub committed: u64,
    pub failed: u64,
    pub stop: LoopStop,
}

/// Trigger a cycle every `interval` until `max_cycles` have run or
/// `shutdown` resolves.
///
/// The first cycle starts immediately. Ticks missed while a cycle overran are
/// skipped rather than replayed back to back. A failed or skipped cycle is
/// logged and the loop keeps going; the next tick starts from whatever
/// version is committed.
pub async fn run_loop<S, F>(
    orchestrator: &Orchestrator,
    interval: Duration,
    max_cycles: Option<u64>,
    shutdown: S,
    mut on_cycle: F,
) -> LoopOutcome
where
    S: Future<Output = ()>,
    F: FnMut(&Result<CycleReport, CycleError>),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut outcome = LoopOutcome {
        cycles_run: 0,
        committed: 0,
        failed: 0,
        stop: LoopStop::MaxCycles,
    };
    loop {
        if max_cycles.is_some_and(|max| outcome.cycles_run >= max) {
            outcome.stop = LoopStop::MaxCycles;
            return outcome;
        }
        tokio::select! {
            _ = &mut shutdown => {
                info!(cycles = outcome.cycles_run, "shutdown requested, stopping loop");
                outcome.stop = LoopStop::Shutdown;
                return outcome;
            }
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = &mut shutdown => {
                // Dropping the cycle before its commit leaves no durable change.
                info!("shutdown requested mid-cycle, abandoning uncommitted work");
                outcome.stop = LoopStop::Shutdown;
                return outcome;
            }
            result = orchestrator.trigger_cycle() => result,
        };
        outcome.cycles_run += 1;
        match &result {
            Ok(_) => outcome.committed += 1,
            Err(err) => {
                outcome.failed += 1;
                warn!(err = %err, "wake cycle did not commit, continuing");
            }
        }
        on_cycle(&result);
    }
}
