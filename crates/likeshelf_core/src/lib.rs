pub mod categorize;
pub mod cooldown;
pub mod domain;
pub mod ports;
pub mod quota;
pub mod retry;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use categorize::{CategorizeSettings, Categorizer};
pub use domain::{
    Assignment, CategorizeResult, Category, CategoryDraft, ClassificationOutcome, ClassifyCategory,
    ClassifyItem, Item, ItemPage, LinkedAccount, SourceItem, SyncResult, SyncStatus,
};
pub use ports::{
    AuthFailure, ClassificationService, DatabaseService, LikedItemSource, PortError, PortResult,
    QuotaCharge,
};
pub use quota::{QuotaExceeded, QuotaManager, QuotaPolicy, QuotaReport, QuotaState, QuotaType, QuotaUsage};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use sync::{SyncEngine, SyncOptions, SyncProfile, SyncSettings};
