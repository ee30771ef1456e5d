//! Background cleanup of expired actions and abandoned workspaces.

use crate::action_ledger::ActionLedger;
use crate::workspace::{self, WORKSPACE_PREFIX};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub failed: usize,
}

pub struct WorkspaceJanitor {
    root: PathBuf,
    running: AtomicBool,
}

/// Clears the running flag when a sweep finishes, even by panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WorkspaceJanitor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            running: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Removes workspaces whose modification time is strictly older than
    /// `max_age`.
    ///
    /// Returns `None` without touching the disk when another sweep is
    /// already in progress.
    pub fn sweep(&self, max_age: Duration) -> Option<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Workspace sweep already running, skipping");
            return None;
        }
        let _guard = RunGuard(&self.running);
        Some(self.sweep_at(SystemTime::now(), max_age))
    }

    fn sweep_at(&self, now: SystemTime, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Workspace root {} not readable: {}", self.root.display(), e);
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_workspace = entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX)
                && entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_workspace {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cannot read age of {}: {}", path.display(), e);
                    report.failed += 1;
                    continue;
                }
            };
            // Entries with a future mtime count as fresh.
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            let previous = workspace::mark_reaped(&path);
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!("Reaped {} (last state {:?})", path.display(), previous);
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!("Failed to reap {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }

        if !report.removed.is_empty() || report.failed > 0 {
            info!(
                "Workspace sweep removed {}, failed {}",
                report.removed.len(),
                report.failed
            );
        }
        report
    }

    /// Runs ledger and workspace sweeps every `period` until the handle is
    /// aborted.
    pub fn spawn(self: Arc<Self>, ledger: Arc<ActionLedger>, period: Duration, max_age: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                ledger.sweep(ledger.ttl());

                // Filesystem work stays off the async workers. A slow sweep
                // makes the next tick skip instead of piling up.
                let janitor = Arc::clone(&self);
                tokio::task::spawn_blocking(move || janitor.sweep(max_age));
            }
        })
    }
}
