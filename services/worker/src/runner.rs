//! services/worker/src/runner.rs
//!
//! One pass over every linked user: a quick sync followed by a categorization run.

use futures::stream::{self, StreamExt};
use likeshelf_core::{Categorizer, DatabaseService, PortError, PortResult, SyncEngine};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the cycle should do with a user after a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Only the user can fix this. Leave them alone until the next cycle.
    Skip,
    Fail,
}

fn disposition(err: &PortError) -> Disposition {
    if err.requires_user_action() {
        Disposition::Skip
    } else {
        Disposition::Fail
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserOutcome {
    Completed { new: usize, categorized: usize },
    Skipped,
    Failed,
}

/// Totals for one cycle, for the log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub users: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_items: usize,
    pub categorized: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: UserOutcome) {
        self.users += 1;
        match outcome {
            UserOutcome::Completed { new, categorized } => {
                self.completed += 1;
                self.new_items += new;
                self.categorized += categorized;
            }
            UserOutcome::Skipped => self.skipped += 1,
            UserOutcome::Failed => self.failed += 1,
        }
    }
}

pub struct Runner {
    db: Arc<dyn DatabaseService>,
    sync_engine: Arc<SyncEngine>,
    categorizer: Arc<Categorizer>,
    user_concurrency: usize,
}

impl Runner {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        sync_engine: Arc<SyncEngine>,
        categorizer: Arc<Categorizer>,
        user_concurrency: usize,
    ) -> Self {
        Self {
            db,
            sync_engine,
            categorizer,
            user_concurrency: user_concurrency.max(1),
        }
    }

    /// Processes every user with a linked account, `user_concurrency` at a time.
    /// Per-user failures are logged and counted, never returned.
    pub async fn run_cycle(&self) -> PortResult<CycleReport> {
        let users = self.db.list_linked_users().await?;
        info!(users = users.len(), "Cycle started");

        let outcomes: Vec<UserOutcome> = stream::iter(users)
            .map(|user_id| self.run_user(user_id))
            .buffer_unordered(self.user_concurrency)
            .collect()
            .await;

        let report = outcomes.into_iter().fold(CycleReport::default(), |mut report, outcome| {
            report.record(outcome);
            report
        });
        info!(
            users = report.users,
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            new_items = report.new_items,
            categorized = report.categorized,
            "Cycle finished"
        );
        Ok(report)
    }

    async fn run_user(&self, user_id: Uuid) -> UserOutcome {
        let new = match self.sync_engine.quick_sync(user_id).await {
            Ok(result) => result.new,
            // An exhausted sync quota says nothing about the categorize quota.
            Err(PortError::QuotaExceeded(exceeded)) => {
                warn!(%user_id, "Sync skipped: {}", exceeded);
                0
            }
            Err(e) => return report_failure(user_id, "sync", &e),
        };

        match self.categorizer.categorize_user(user_id, false).await {
            Ok(result) => UserOutcome::Completed {
                new,
                categorized: result.categorized,
            },
            Err(e) => report_failure(user_id, "categorize", &e),
        }
    }
}

fn report_failure(user_id: Uuid, stage: &str, err: &PortError) -> UserOutcome {
    match disposition(err) {
        Disposition::Skip => {
            match err {
                PortError::QuotaExceeded(_) => warn!(%user_id, stage, "Skipping user: {}", err),
                _ => info!(%user_id, stage, "Skipping user: {}", err),
            }
            UserOutcome::Skipped
        }
        Disposition::Fail => {
            error!(%user_id, stage, error = %err, "User run failed");
            UserOutcome::Failed
        }
    }
}
