//! crates/likeshelf_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Assignment, Category, CategoryDraft, ClassificationOutcome, ClassifyCategory, ClassifyItem,
    Item, ItemPage, LinkedAccount, SourceItem,
};
use crate::quota::{QuotaExceeded, QuotaState, QuotaType, QuotaUsage};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// Why the external platform cannot be reached on the user's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no linked account")]
    NoLinkedAccount,
    #[error("no access token")]
    NoAccessToken,
    #[error("no refresh token")]
    NoRefreshToken,
    #[error("token refresh failed")]
    RefreshFailed,
}

/// The error type for all port operations and engine entry points.
///
/// Adapters map their native errors into these variants; the engine only ever
/// decides what to do based on the variant, never on message text.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Not found: {0}")]
    NotFound(String),
    /// The user has to re-authenticate. Never retried automatically.
    #[error("Re-authentication required: {0}")]
    Authentication(AuthFailure),
    #[error("{0}")]
    QuotaExceeded(QuotaExceeded),
    #[error("Invalid input: {0}")]
    Validation(String),
    /// A per-user cooldown is still running.
    #[error("Too many requests, try again in {}s", .retry_after.as_secs())]
    Throttled { retry_after: Duration },
    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    /// Whether repeating the same call after a delay may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PortError::RateLimited(_) | PortError::Transient(_))
    }

    /// Whether only the end user can resolve this (re-linking, waiting for the reset).
    pub fn requires_user_action(&self) -> bool {
        matches!(self, PortError::Authentication(_) | PortError::QuotaExceeded(_))
    }
}

impl From<QuotaExceeded> for PortError {
    fn from(exceeded: QuotaExceeded) -> Self {
        PortError::QuotaExceeded(exceeded)
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// How an insert is accounted for against the user's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCharge {
    /// Fail the whole write with `QuotaExceeded` if it does not fit.
    Enforce(QuotaType),
    /// Record the usage without checking the limit.
    RecordOnly(QuotaType),
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Accounts ---
    async fn linked_account(&self, user_id: Uuid) -> PortResult<Option<LinkedAccount>>;

    async fn list_linked_users(&self) -> PortResult<Vec<Uuid>>;

    // --- Items ---
    /// Returns the subset of `external_ids` already stored for the user.
    async fn existing_external_ids(
        &self,
        user_id: Uuid,
        external_ids: &[String],
    ) -> PortResult<HashSet<String>>;

    /// Inserts `items`, skipping any (user, external id) already present, and charges
    /// the number of rows actually inserted against the quota. Both happen in one
    /// transaction: if the charge fails nothing is inserted.
    async fn insert_items_with_quota(
        &self,
        user_id: Uuid,
        items: &[SourceItem],
        charge: QuotaCharge,
        now: DateTime<Utc>,
    ) -> PortResult<u64>;

    /// Stamps `last_seen_at` on the listed items and reactivates any marked unliked.
    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        external_ids: &[String],
        seen_at: DateTime<Utc>,
    ) -> PortResult<u64>;

    /// Marks every active item whose external id is not in `seen_external_ids` as unliked.
    async fn mark_unliked(&self, user_id: Uuid, seen_external_ids: &[String]) -> PortResult<u64>;

    async fn items_needing_analysis(
        &self,
        user_id: Uuid,
        categories_updated_at: Option<DateTime<Utc>>,
        force: bool,
    ) -> PortResult<Vec<Item>>;

    /// Persists a categorization run in one transaction and returns the rows touched.
    async fn apply_classification(
        &self,
        user_id: Uuid,
        outcome: &ClassificationOutcome,
        analyzed_at: DateTime<Utc>,
    ) -> PortResult<u64>;

    // --- Categories ---
    async fn list_categories(&self, user_id: Uuid) -> PortResult<Vec<Category>>;

    async fn create_category(&self, user_id: Uuid, draft: &CategoryDraft) -> PortResult<Category>;

    async fn rename_category(
        &self,
        user_id: Uuid,
        category_id: Uuid,
        name: &str,
    ) -> PortResult<Category>;

    /// Deletes a category and its children. Items lose their category and become
    /// eligible for analysis again.
    async fn delete_category(&self, user_id: Uuid, category_id: Uuid) -> PortResult<()>;

    // --- Quota ---
    /// Reads the counters, applying a due monthly reset first.
    async fn quota_state(&self, user_id: Uuid, now: DateTime<Utc>) -> PortResult<QuotaState>;

    /// Atomically checks `used + amount <= limit` and increments.
    async fn reserve_quota(
        &self,
        user_id: Uuid,
        quota: QuotaType,
        amount: u64,
        now: DateTime<Utc>,
    ) -> PortResult<QuotaUsage>;
}

#[async_trait]
pub trait LikedItemSource: Send + Sync {
    /// Fetches one page (at most 50 records) of the user's liked items.
    async fn fetch_page(
        &self,
        user_id: Uuid,
        page_size: usize,
        page_token: Option<&str>,
    ) -> PortResult<ItemPage>;
}

#[async_trait]
pub trait ClassificationService: Send + Sync {
    /// Proposes a category for each item. Entries may be missing or invalid.
    async fn classify(
        &self,
        items: &[ClassifyItem],
        categories: &[ClassifyCategory],
    ) -> PortResult<Vec<Assignment>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure_kind() {
        let missing = PortError::NotFound("Category 7 not found".to_string());
        assert_eq!(missing.to_string(), "Not found: Category 7 not found");

        let throttled = PortError::Throttled { retry_after: Duration::from_secs(42) };
        assert_eq!(throttled.to_string(), "Too many requests, try again in 42s");
    }

    #[test]
    fn only_upstream_hiccups_are_retried() {
        assert!(PortError::Transient("timeout".to_string()).is_retriable());
        assert!(PortError::RateLimited("429".to_string()).is_retriable());
        assert!(!PortError::NotFound("x".to_string()).is_retriable());
        assert!(!PortError::Authentication(AuthFailure::RefreshFailed).is_retriable());
        assert!(PortError::Authentication(AuthFailure::NoLinkedAccount).requires_user_action());
        assert!(!PortError::Validation("x".to_string()).requires_user_action());
    }
}
