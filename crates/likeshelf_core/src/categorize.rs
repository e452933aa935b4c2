//! crates/likeshelf_core/src/categorize.rs
//!
//! The categorization pipeline: picks the items that need (re)classification,
//! pays for them up front, sends them to the classifier in batches and persists
//! whatever valid answers come back.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    Assignment, CategorizeResult, Category, ClassificationOutcome, ClassifyCategory, ClassifyItem,
    Item,
};
use crate::ports::{ClassificationService, DatabaseService, PortResult};
use crate::quota::{QuotaManager, QuotaType};
use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct CategorizeSettings {
    /// Items per classifier call.
    pub batch_size: usize,
    /// Classifier calls in flight at once within one run.
    pub concurrency: usize,
    pub classifier_retry: RetryPolicy,
}

impl Default for CategorizeSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 3,
            classifier_retry: RetryPolicy::default(),
        }
    }
}

pub struct Categorizer {
    db: Arc<dyn DatabaseService>,
    classifier: Arc<dyn ClassificationService>,
    quota: QuotaManager,
    settings: CategorizeSettings,
}

impl Categorizer {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        classifier: Arc<dyn ClassificationService>,
        settings: CategorizeSettings,
    ) -> Self {
        let quota = QuotaManager::new(db.clone());
        Self {
            db,
            classifier,
            quota,
            settings,
        }
    }

    /// Classifies the user's pending items, or every active item with `force`.
    ///
    /// At most the remaining categorize quota is taken per run, oldest items first;
    /// the rest wait for a later run. Quota for the selected items is consumed before
    /// the first classifier call and is not refunded if a batch later fails.
    pub async fn categorize_user(&self, user_id: Uuid, force: bool) -> PortResult<CategorizeResult> {
        let categories = self.db.list_categories(user_id).await?;
        if categories.is_empty() {
            debug!(%user_id, "No categories, nothing to classify into");
            return Ok(CategorizeResult::empty());
        }

        let categories_updated_at = categories.iter().map(|c| c.updated_at).max();
        let mut candidates = self
            .db
            .items_needing_analysis(user_id, categories_updated_at, force)
            .await?;
        if candidates.is_empty() {
            debug!(%user_id, force, "No items need classification");
            return Ok(CategorizeResult::empty());
        }

        let pending = candidates.len();
        let remaining = self.quota.get_usage(user_id).await?.categorize.remaining;
        // With nothing left the reservation below refuses with the real count.
        if remaining > 0 {
            candidates.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
        }
        let total = candidates.len();
        self.quota
            .reserve(user_id, QuotaType::Categorize, total as u64)
            .await?;
        info!(%user_id, total, deferred = pending - total, force, "Categorization started");

        let targets: Arc<[ClassifyCategory]> = categories.iter().map(ClassifyCategory::from).collect();
        let proposals = self.classify_in_batches(user_id, &candidates, targets).await?;
        let outcome = validate_assignments(user_id, &candidates, &categories, proposals);

        self.db
            .apply_classification(user_id, &outcome, Utc::now())
            .await?;

        let categorized = outcome.categorized_count();
        let result = CategorizeResult {
            categorized,
            total,
            skipped: total - categorized,
        };
        info!(
            %user_id,
            categorized = result.categorized,
            skipped = result.skipped,
            "Categorization finished"
        );
        Ok(result)
    }

    async fn classify_in_batches(
        &self,
        user_id: Uuid,
        candidates: &[Item],
        targets: Arc<[ClassifyCategory]>,
    ) -> PortResult<Vec<Assignment>> {
        let chunks = candidates.chunks(self.settings.batch_size.max(1));
        let batch_count = chunks.len();
        let jobs: Vec<_> = chunks
            .enumerate()
            .map(|(index, chunk)| {
                classify_batch(
                    self.classifier.clone(),
                    self.settings.classifier_retry.clone(),
                    chunk.iter().map(Item::to_classify_item).collect(),
                    targets.clone(),
                    user_id,
                    (index + 1, batch_count),
                )
            })
            .collect();

        let answers: Vec<Vec<Assignment>> = stream::iter(jobs)
            .buffer_unordered(self.settings.concurrency.max(1))
            .try_collect()
            .await?;

        Ok(answers.into_iter().flatten().collect())
    }
}

/// One classifier call with retries. Owns its inputs so batches can run concurrently.
async fn classify_batch(
    classifier: Arc<dyn ClassificationService>,
    retry: RetryPolicy,
    batch: Vec<ClassifyItem>,
    targets: Arc<[ClassifyCategory]>,
    user_id: Uuid,
    (number, batch_count): (usize, usize),
) -> PortResult<Vec<Assignment>> {
    let answer = retry_with_backoff(&retry, "classify batch", || {
        classifier.classify(&batch, &targets)
    })
    .await;
    match &answer {
        Ok(assignments) => debug!(
            %user_id,
            batch = number,
            batch_count,
            returned = assignments.len(),
            "Batch classified"
        ),
        Err(e) => warn!(%user_id, batch = number, batch_count, error = %e, "Batch failed"),
    }
    answer
}

/// Keeps only pairs naming one of the candidates and one of the user's categories.
/// The first valid answer for an item wins. Candidates without a valid answer end
/// up in `unassigned`.
pub fn validate_assignments(
    user_id: Uuid,
    candidates: &[Item],
    categories: &[Category],
    proposals: Vec<Assignment>,
) -> ClassificationOutcome {
    let candidate_ids: HashSet<Uuid> = candidates.iter().map(|item| item.id).collect();
    let category_ids: HashSet<Uuid> = categories.iter().map(|c| c.id).collect();

    let mut outcome = ClassificationOutcome::default();
    let mut assigned: HashSet<Uuid> = HashSet::new();
    let mut dropped = 0usize;

    for proposal in proposals {
        if !candidate_ids.contains(&proposal.item_id) || !category_ids.contains(&proposal.category_id) {
            dropped += 1;
            warn!(
                %user_id,
                item_id = %proposal.item_id,
                category_id = %proposal.category_id,
                "Classifier returned an assignment outside the request, ignoring"
            );
            continue;
        }
        if !assigned.insert(proposal.item_id) {
            continue;
        }
        outcome
            .assignments
            .entry(proposal.category_id)
            .or_default()
            .push(proposal.item_id);
    }

    outcome.unassigned = candidates
        .iter()
        .map(|item| item.id)
        .filter(|id| !assigned.contains(id))
        .collect();

    if !outcome.unassigned.is_empty() || dropped > 0 {
        warn!(
            %user_id,
            dropped,
            unassigned = outcome.unassigned.len(),
            "Some items were analyzed without a category"
        );
    }
    outcome
}
