//! crates/likeshelf_core/src/sync.rs
//!
//! The progressive sync engine: pages through the user's liked items, inserts the
//! ones the store has not seen yet, and stops once it has caught up with history.
//!
//! A run ends in one of three ways:
//! - the source has no more pages (`reached_end`), the only case in which items
//!   missing from the traversal are marked unliked;
//! - `initial_limit` items were scanned and the last `early_stop_threshold` pages
//!   held nothing new;
//! - `max_depth` items were scanned.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cooldown::CooldownRegistry;
use crate::domain::{SourceItem, SyncResult};
use crate::ports::{DatabaseService, LikedItemSource, PortError, PortResult, QuotaCharge};
use crate::quota::QuotaType;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// The largest page the external source serves.
pub const MAX_PAGE_SIZE: usize = 50;

/// Depth limits for one kind of run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProfile {
    /// Items to scan before an early stop is allowed.
    pub initial_limit: usize,
    /// Hard cap on items scanned in one run.
    pub max_depth: usize,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: usize,
    /// Consecutive pages without new items that end a run early.
    pub early_stop_threshold: usize,
    pub quick: SyncProfile,
    pub extended: SyncProfile,
    pub full: SyncProfile,
    pub full_sync_cooldown: Duration,
    pub fetch_retry: RetryPolicy,
    pub last_seen_retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            early_stop_threshold: 2,
            quick: SyncProfile {
                initial_limit: 50,
                max_depth: 200,
            },
            extended: SyncProfile {
                initial_limit: 200,
                max_depth: 1000,
            },
            full: SyncProfile {
                initial_limit: 5000,
                max_depth: 5000,
            },
            full_sync_cooldown: Duration::from_secs(300),
            fetch_retry: RetryPolicy::default(),
            last_seen_retry: RetryPolicy::default(),
        }
    }
}

/// Parameters for a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub initial_limit: usize,
    pub max_depth: usize,
    pub page_size: usize,
    /// Refuse inserts that would exceed the sync quota. When false the usage is
    /// still recorded.
    pub enforce_quota: bool,
}

impl SyncOptions {
    pub fn from_profile(profile: SyncProfile, page_size: usize, enforce_quota: bool) -> Self {
        Self {
            initial_limit: profile.initial_limit,
            max_depth: profile.max_depth,
            page_size,
            enforce_quota,
        }
    }

    pub fn validate(&self) -> PortResult<()> {
        if self.max_depth == 0 {
            return Err(PortError::Validation("max_depth must be positive".to_string()));
        }
        if self.initial_limit > self.max_depth {
            return Err(PortError::Validation(format!(
                "initial_limit ({}) exceeds max_depth ({})",
                self.initial_limit, self.max_depth
            )));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(PortError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        Ok(())
    }

    fn quota_charge(&self) -> QuotaCharge {
        if self.enforce_quota {
            QuotaCharge::Enforce(QuotaType::Sync)
        } else {
            QuotaCharge::RecordOnly(QuotaType::Sync)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traversal {
    Fetching,
    ReachedEnd,
    EarlyStopped,
    DepthExhausted,
}

pub struct SyncEngine {
    db: Arc<dyn DatabaseService>,
    source: Arc<dyn LikedItemSource>,
    settings: SyncSettings,
    full_sync_cooldown: CooldownRegistry,
}

impl SyncEngine {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        source: Arc<dyn LikedItemSource>,
        settings: SyncSettings,
    ) -> Self {
        let full_sync_cooldown = CooldownRegistry::new(settings.full_sync_cooldown);
        Self {
            db,
            source,
            settings,
            full_sync_cooldown,
        }
    }

    /// Shallow run meant for the periodic timer.
    pub async fn quick_sync(&self, user_id: Uuid) -> PortResult<SyncResult> {
        let options = SyncOptions::from_profile(self.settings.quick, self.settings.page_size, true);
        self.sync(user_id, &options).await
    }

    /// Deeper user-triggered catch-up run.
    pub async fn extended_sync(&self, user_id: Uuid) -> PortResult<SyncResult> {
        let options =
            SyncOptions::from_profile(self.settings.extended, self.settings.page_size, true);
        self.sync(user_id, &options).await
    }

    /// Administrative backfill to the hard maximum. Quota is recorded but not
    /// enforced, and each user can start at most one per cooldown window.
    pub async fn full_sync(&self, user_id: Uuid) -> PortResult<SyncResult> {
        if let Err(retry_after) = self.full_sync_cooldown.try_begin(user_id) {
            info!(%user_id, retry_after_secs = retry_after.as_secs(), "Full sync refused, cooldown active");
            return Err(PortError::Throttled { retry_after });
        }
        let options = SyncOptions::from_profile(self.settings.full, self.settings.page_size, false);
        self.sync(user_id, &options).await
    }

    /// Runs one traversal with explicit options.
    pub async fn sync(&self, user_id: Uuid, options: &SyncOptions) -> PortResult<SyncResult> {
        options.validate()?;
        info!(
            %user_id,
            initial_limit = options.initial_limit,
            max_depth = options.max_depth,
            enforce_quota = options.enforce_quota,
            "Sync started"
        );

        let mut state = Traversal::Fetching;
        let mut result = SyncResult::default();
        let mut consecutive_known_pages = 0usize;
        let mut page_token: Option<String> = None;
        let mut seen_ids: Vec<String> = Vec::new();
        let mut seen_set: HashSet<String> = HashSet::new();

        while result.fetched < options.max_depth {
            let page_size = options.page_size.min(options.max_depth - result.fetched);
            let token = page_token.as_deref();
            let page = retry_with_backoff(&self.settings.fetch_retry, "fetch liked page", || {
                self.source.fetch_page(user_id, page_size, token)
            })
            .await?;

            if page.items.is_empty() {
                state = Traversal::ReachedEnd;
                break;
            }

            let page_ids: Vec<String> = page.items.iter().map(|item| item.external_id.clone()).collect();
            for id in &page_ids {
                if seen_set.insert(id.clone()) {
                    seen_ids.push(id.clone());
                }
            }

            let known = self.db.existing_external_ids(user_id, &page_ids).await?;
            let mut queued: HashSet<&str> = HashSet::new();
            let fresh: Vec<SourceItem> = page
                .items
                .iter()
                .filter(|item| !known.contains(&item.external_id) && queued.insert(&item.external_id))
                .cloned()
                .collect();

            let inserted = if fresh.is_empty() {
                consecutive_known_pages += 1;
                0
            } else {
                consecutive_known_pages = 0;
                self.db
                    .insert_items_with_quota(user_id, &fresh, options.quota_charge(), Utc::now())
                    .await? as usize
            };
            // Repeats within a page and rows lost to a concurrent insert count as existing.
            result.new += inserted;
            result.existing += page.items.len() - inserted;

            self.touch_last_seen(user_id, &page_ids).await;

            result.fetched += page.items.len();
            debug!(
                %user_id,
                fetched = result.fetched,
                new = result.new,
                consecutive_known_pages,
                "Page processed"
            );

            page_token = page.next_token;
            if page_token.is_none() {
                state = Traversal::ReachedEnd;
                break;
            }
            if result.fetched >= options.initial_limit
                && consecutive_known_pages >= self.settings.early_stop_threshold
            {
                state = Traversal::EarlyStopped;
                break;
            }
        }

        if state == Traversal::Fetching {
            state = Traversal::DepthExhausted;
        }
        result.reached_end = state == Traversal::ReachedEnd;

        if result.reached_end && !seen_ids.is_empty() {
            result.unliked = self.db.mark_unliked(user_id, &seen_ids).await? as usize;
        }

        info!(
            %user_id,
            outcome = ?state,
            fetched = result.fetched,
            new = result.new,
            existing = result.existing,
            unliked = result.unliked,
            "Sync finished"
        );
        Ok(result)
    }

    /// A failure here only degrades unliked detection, so it is logged and swallowed.
    async fn touch_last_seen(&self, user_id: Uuid, external_ids: &[String]) {
        let seen_at = Utc::now();
        let outcome = retry_with_backoff(&self.settings.last_seen_retry, "touch last seen", || {
            self.db.touch_last_seen(user_id, external_ids, seen_at)
        })
        .await;
        if let Err(e) = outcome {
            warn!(%user_id, items = external_ids.len(), error = %e, "Could not update last seen timestamps");
        }
    }
}
