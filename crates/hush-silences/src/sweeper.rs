//! Background expiry sweep.
//!
//! Each pass:
//! 1. Reloads the index if an earlier write ended with an unknown outcome.
//! 2. Publishes one `silence_expired` event per silence that has ended and
//!    was not announced before.
//! 3. Writes changed status hints back to the store in batches.
//!
//! The sweep only copies entries out of the index; it never holds the index
//! lock across store I/O.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::error::Result;
use crate::events::{SilenceEvent, SilenceEventKind};
use crate::manager::SilenceManager;
use crate::types::SilenceStatus;

/// Counters for one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Number of silences inspected.
    pub scanned: usize,
    /// Expiry events published.
    pub expired_events: usize,
    /// Status hints written to the store.
    pub hints_written: usize,
    /// Status hints that could not be written.
    pub hints_failed: usize,
    /// True if the index was reloaded first.
    pub resynced: bool,
}

/// Runs a single sweep pass.
///
/// Hint write failures are logged and counted but do not fail the pass;
/// the same hints are retried on the next pass.
///
/// # Errors
///
/// Returns an error only if a required resync fails.
pub async fn sweep_once(manager: &SilenceManager, ctx: &RequestContext) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    if manager.needs_resync() {
        manager.hydrate(ctx).await?;
        report.resynced = true;
    }

    let now = manager.now();
    let entries = manager.entries();
    report.scanned = entries.len();

    let mut stale_hints = Vec::new();
    for entry in &entries {
        let status = entry.silence.status_at(now);
        if status == SilenceStatus::Expired && entry.claim_expiry() {
            manager
                .events()
                .publish(SilenceEvent::new(SilenceEventKind::Expired, &entry.silence, now));
            report.expired_events += 1;
            info!(silence_id = %entry.silence.id, "silence expired");
        }
        if entry.hint() != status {
            stale_hints.push((Arc::clone(entry), status));
        }
    }

    for batch in stale_hints.chunks(manager.config().hint_batch_size.max(1)) {
        let hints: Vec<(String, SilenceStatus)> = batch
            .iter()
            .map(|(entry, status)| (entry.silence.id.clone(), *status))
            .collect();

        match manager
            .store_call(ctx, "set_status_hints", manager.store().set_status_hints(&hints))
            .await
        {
            Ok(_) => {
                for (entry, status) in batch {
                    entry.set_hint(*status);
                }
                report.hints_written += batch.len();
            }
            Err(e) => {
                let remaining = stale_hints.len() - report.hints_written;
                warn!(error = %e, pending = remaining, "could not write status hints");
                report.hints_failed += remaining;
                break;
            }
        }
    }

    debug!(
        scanned = report.scanned,
        expired_events = report.expired_events,
        hints_written = report.hints_written,
        hints_failed = report.hints_failed,
        resynced = report.resynced,
        "expiry sweep finished"
    );
    Ok(report)
}

/// Spawns the periodic expiry sweep.
#[derive(Debug, Clone, Copy)]
pub struct ExpirySweeper;

impl ExpirySweeper {
    /// Starts sweeping every `interval` until `shutdown` is cancelled or the
    /// returned handle is stopped.
    #[must_use]
    pub fn spawn(
        manager: Arc<SilenceManager>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> SweeperHandle {
        let token = shutdown.child_token();
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "expiry sweeper started");

            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let ctx = RequestContext::with_token(manager.config().store_timeout, task_token.child_token());
                if let Err(e) = sweep_once(&manager, &ctx).await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }

            info!("expiry sweeper stopped");
        });

        SweeperHandle { token, task }
    }
}

/// Handle for controlling a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Asks the sweeper to stop after the current pass.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns true while the task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn join(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "expiry sweeper task ended abnormally");
        }
    }
}
