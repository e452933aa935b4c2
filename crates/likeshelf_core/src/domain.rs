//! crates/likeshelf_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ports::PortError;

/// Shortest accepted category name, in characters.
pub const CATEGORY_NAME_MIN: usize = 2;
/// Longest accepted category name, in characters.
pub const CATEGORY_NAME_MAX: usize = 50;

//=========================================================================================
// Items
//=========================================================================================

/// Whether an item is still liked on the external platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Active,
    Unliked,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Active => "ACTIVE",
            SyncStatus::Unliked => "UNLIKED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SyncStatus::Active),
            "UNLIKED" => Ok(SyncStatus::Unliked),
            other => Err(PortError::Unexpected(format!("unknown sync status '{other}'"))),
        }
    }
}

/// A liked record stored for one user.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub category_id: Option<Uuid>,
    /// When classification last ran for this item. `None` means never.
    pub last_analyzed_at: Option<DateTime<Utc>>,
    /// When the item was last observed in the external source. `None` means never.
    pub last_seen_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Whether the categorization pipeline should pick this item up.
    ///
    /// Only active items qualify. With `force` every active item does; otherwise
    /// an item qualifies when it was never analyzed, or when the user's categories
    /// changed after its last analysis. An item that was analyzed but left without a
    /// category is *not* picked up again on its own, so a classifier that keeps
    /// failing on it is not charged for it on every run.
    pub fn needs_analysis(&self, categories_updated_at: Option<DateTime<Utc>>, force: bool) -> bool {
        if self.sync_status != SyncStatus::Active {
            return false;
        }
        if force {
            return true;
        }
        match self.last_analyzed_at {
            None => true,
            Some(analyzed_at) => categories_updated_at.is_some_and(|changed| analyzed_at < changed),
        }
    }

    pub fn to_classify_item(&self) -> ClassifyItem {
        ClassifyItem {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            channel_name: self.channel_name.clone(),
        }
    }
}

/// A liked record as reported by the external source, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// One page of liked records plus the continuation token for the next one.
#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    pub items: Vec<SourceItem>,
    pub next_token: Option<String>,
}

//=========================================================================================
// Categories
//=========================================================================================

/// A user-defined target for classification.
#[derive(Debug, Clone)]
pub struct Category {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub is_default: bool,
    pub parent_id: Option<Uuid>,
    pub exported_playlist_id: Option<String>,
    pub last_exported_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a category.
#[derive(Debug, Clone)]
pub struct CategoryDraft {
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_default: bool,
}

impl CategoryDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_id: None,
            is_default: false,
        }
    }

    /// Returns the trimmed name if it is acceptable.
    pub fn validate(&self) -> Result<String, PortError> {
        validate_category_name(&self.name)
    }
}

/// Trims `name` and checks its length. Uniqueness is the store's job.
pub fn validate_category_name(name: &str) -> Result<String, PortError> {
    let trimmed = name.trim();
    let length = trimmed.chars().count();
    if !(CATEGORY_NAME_MIN..=CATEGORY_NAME_MAX).contains(&length) {
        return Err(PortError::Validation(format!(
            "category name must be between {CATEGORY_NAME_MIN} and {CATEGORY_NAME_MAX} characters, got {length}"
        )));
    }
    Ok(trimmed.to_string())
}

//=========================================================================================
// Accounts
//=========================================================================================

/// The user's link to the external platform.
#[derive(Debug, Clone)]
pub struct LinkedAccount {
    pub user_id: Uuid,
    pub provider_account_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

//=========================================================================================
// Classification
//=========================================================================================

/// The part of an item the classifier gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyItem {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
}

/// A candidate category offered to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifyCategory {
    pub id: Uuid,
    pub name: String,
}

impl From<&Category> for ClassifyCategory {
    fn from(category: &Category) -> Self {
        Self {
            id: category.id,
            name: category.name.clone(),
        }
    }
}

/// One (item, category) pair proposed by the classifier. Not trusted until validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub item_id: Uuid,
    pub category_id: Uuid,
}

/// The validated result of one categorization run, ready to be persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationOutcome {
    /// Category id -> items moved into it.
    pub assignments: BTreeMap<Uuid, Vec<Uuid>>,
    /// Items analyzed without receiving a valid category.
    pub unassigned: Vec<Uuid>,
}

impl ClassificationOutcome {
    pub fn categorized_count(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }
}

//=========================================================================================
// Run Results
//=========================================================================================

/// Advisory counts from one sync run. The store stays authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    #[serde(rename = "synced")]
    pub fetched: usize,
    pub new: usize,
    pub existing: usize,
    pub unliked: usize,
    pub reached_end: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategorizeResult {
    pub categorized: usize,
    pub total: usize,
    pub skipped: usize,
}

impl CategorizeResult {
    pub fn empty() -> Self {
        Self::default()
    }
}
