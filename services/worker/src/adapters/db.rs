//! services/worker/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Every read-modify-write of a user's quota counters runs inside one transaction
//! that first locks the user row with `SELECT ... FOR UPDATE`, so concurrent
//! reservations for the same user are serialized by Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use likeshelf_core::domain::{
    validate_category_name, Category, CategoryDraft, ClassificationOutcome, Item, LinkedAccount,
    SourceItem, SyncStatus,
};
use likeshelf_core::ports::{DatabaseService, PortError, PortResult, QuotaCharge};
use likeshelf_core::quota::{QuotaCounter, QuotaPolicy, QuotaState, QuotaType, QuotaUsage};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

const ITEM_COLUMNS: &str = "id, user_id, external_id, title, description, thumbnail_url, \
     channel_name, channel_id, published_at, category_id, last_analyzed_at, last_seen_at, \
     sync_status, created_at, updated_at";

const CATEGORY_COLUMNS: &str = "id, user_id, name, is_default, parent_id, exported_playlist_id, \
     last_exported_at, created_at, updated_at";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
    quota_policy: QuotaPolicy,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool, quota_policy: QuotaPolicy) -> Self {
        Self { pool, quota_policy }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> PortResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(db_error)
    }

    /// Locks the user row and returns its counters with any due reset applied.
    /// The reset is only persisted once the caller stores the state.
    async fn lock_quota(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<(QuotaState, bool)> {
        let record = sqlx::query_as::<_, QuotaRecord>(
            "SELECT sync_quota_used, sync_quota_limit, categorize_quota_used, \
                    categorize_quota_limit, quota_reset_at \
             FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error)?
        .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))?;

        let mut state = record.to_domain();
        let was_reset = state.reset_if_due(now, &self.quota_policy);
        if was_reset {
            debug!(%user_id, reset_at = ?state.reset_at, "Quota counters reset");
        }
        Ok((state, was_reset))
    }
}

/// Writes the counters and reset time back to the locked user row.
async fn store_quota(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    state: &QuotaState,
) -> PortResult<()> {
    sqlx::query(
        "UPDATE users SET sync_quota_used = $2, categorize_quota_used = $3, \
                quota_reset_at = $4, updated_at = now() \
         WHERE id = $1",
    )
    .bind(user_id)
    .bind(to_column(state.sync.used))
    .bind(to_column(state.categorize.used))
    .bind(state.reset_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Maps driver errors onto the port's retry classes.
fn db_error(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PortError::Transient(e.to_string())
        }
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) => {
            PortError::Transient(e.to_string())
        }
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn to_column(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_column(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct QuotaRecord {
    sync_quota_used: i64,
    sync_quota_limit: i64,
    categorize_quota_used: i64,
    categorize_quota_limit: i64,
    quota_reset_at: Option<DateTime<Utc>>,
}
impl QuotaRecord {
    fn to_domain(self) -> QuotaState {
        QuotaState {
            sync: QuotaCounter::new(from_column(self.sync_quota_used), from_column(self.sync_quota_limit)),
            categorize: QuotaCounter::new(
                from_column(self.categorize_quota_used),
                from_column(self.categorize_quota_limit),
            ),
            reset_at: self.quota_reset_at,
        }
    }
}

#[derive(FromRow)]
struct LinkedAccountRecord {
    user_id: Uuid,
    provider_account_id: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}
impl LinkedAccountRecord {
    fn to_domain(self) -> LinkedAccount {
        LinkedAccount {
            user_id: self.user_id,
            provider_account_id: self.provider_account_id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
        }
    }
}

#[derive(FromRow)]
struct ItemRecord {
    id: Uuid,
    user_id: Uuid,
    external_id: String,
    title: String,
    description: Option<String>,
    thumbnail_url: Option<String>,
    channel_name: Option<String>,
    channel_id: Option<String>,
    published_at: Option<DateTime<Utc>>,
    category_id: Option<Uuid>,
    last_analyzed_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
    sync_status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl ItemRecord {
    fn to_domain(self) -> PortResult<Item> {
        Ok(Item {
            id: self.id,
            user_id: self.user_id,
            external_id: self.external_id,
            title: self.title,
            description: self.description,
            thumbnail_url: self.thumbnail_url,
            channel_name: self.channel_name,
            channel_id: self.channel_id,
            published_at: self.published_at,
            category_id: self.category_id,
            last_analyzed_at: self.last_analyzed_at,
            last_seen_at: self.last_seen_at,
            sync_status: self.sync_status.parse::<SyncStatus>()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct CategoryRecord {
    id: Uuid,
    user_id: Uuid,
    name: String,
    is_default: bool,
    parent_id: Option<Uuid>,
    exported_playlist_id: Option<String>,
    last_exported_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl CategoryRecord {
    fn to_domain(self) -> Category {
        Category {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            is_default: self.is_default,
            parent_id: self.parent_id,
            exported_playlist_id: self.exported_playlist_id,
            last_exported_at: self.last_exported_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// New items split into one array per column, bound to a single `UNNEST` insert.
struct ItemColumns {
    ids: Vec<Uuid>,
    external_ids: Vec<String>,
    titles: Vec<String>,
    descriptions: Vec<Option<String>>,
    thumbnails: Vec<Option<String>>,
    channel_names: Vec<Option<String>>,
    channel_ids: Vec<Option<String>>,
    published: Vec<Option<DateTime<Utc>>>,
}

impl ItemColumns {
    fn new(items: &[SourceItem]) -> Self {
        let mut columns = Self {
            ids: Vec::with_capacity(items.len()),
            external_ids: Vec::with_capacity(items.len()),
            titles: Vec::with_capacity(items.len()),
            descriptions: Vec::with_capacity(items.len()),
            thumbnails: Vec::with_capacity(items.len()),
            channel_names: Vec::with_capacity(items.len()),
            channel_ids: Vec::with_capacity(items.len()),
            published: Vec::with_capacity(items.len()),
        };
        for item in items {
            columns.ids.push(Uuid::new_v4());
            columns.external_ids.push(item.external_id.clone());
            columns.titles.push(item.title.clone());
            columns.descriptions.push(item.description.clone());
            columns.thumbnails.push(item.thumbnail_url.clone());
            columns.channel_names.push(item.channel_name.clone());
            columns.channel_ids.push(item.channel_id.clone());
            columns.published.push(item.published_at);
        }
        columns
    }
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    // --- Accounts ---

    async fn linked_account(&self, user_id: Uuid) -> PortResult<Option<LinkedAccount>> {
        let record = sqlx::query_as::<_, LinkedAccountRecord>(
            "SELECT user_id, provider_account_id, access_token, refresh_token, expires_at \
             FROM linked_accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(record.map(LinkedAccountRecord::to_domain))
    }

    async fn list_linked_users(&self) -> PortResult<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>("SELECT DISTINCT user_id FROM linked_accounts ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
    }

    // --- Items ---

    async fn existing_external_ids(
        &self,
        user_id: Uuid,
        external_ids: &[String],
    ) -> PortResult<HashSet<String>> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let found = sqlx::query_scalar::<_, String>(
            "SELECT external_id FROM items WHERE user_id = $1 AND external_id = ANY($2)",
        )
        .bind(user_id)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(found.into_iter().collect())
    }

    async fn insert_items_with_quota(
        &self,
        user_id: Uuid,
        items: &[SourceItem],
        charge: QuotaCharge,
        now: DateTime<Utc>,
    ) -> PortResult<u64> {
        let mut tx = self.begin().await?;
        let (mut state, _) = self.lock_quota(&mut tx, user_id, now).await?;

        let columns = ItemColumns::new(items);
        let inserted = if items.is_empty() {
            0
        } else {
            sqlx::query(
                "INSERT INTO items (id, user_id, external_id, title, description, thumbnail_url, \
                                    channel_name, channel_id, published_at, last_seen_at, \
                                    sync_status, created_at, updated_at) \
                 SELECT u.id, $1, u.external_id, u.title, u.description, u.thumbnail_url, \
                        u.channel_name, u.channel_id, u.published_at, $2, 'ACTIVE', $2, $2 \
                 FROM UNNEST($3::uuid[], $4::text[], $5::text[], $6::text[], $7::text[], \
                             $8::text[], $9::text[], $10::timestamptz[]) \
                      AS u(id, external_id, title, description, thumbnail_url, \
                           channel_name, channel_id, published_at) \
                 ON CONFLICT (user_id, external_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(now)
            .bind(columns.ids)
            .bind(columns.external_ids)
            .bind(columns.titles)
            .bind(columns.descriptions)
            .bind(columns.thumbnails)
            .bind(columns.channel_names)
            .bind(columns.channel_ids)
            .bind(columns.published)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected()
        };

        // Returning early drops `tx`, which rolls the inserts back.
        match charge {
            QuotaCharge::Enforce(quota) => {
                state.reserve(quota, inserted)?;
            }
            QuotaCharge::RecordOnly(quota) => {
                state.increment(quota, inserted);
            }
        }
        store_quota(&mut tx, user_id, &state).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(inserted)
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        external_ids: &[String],
        seen_at: DateTime<Utc>,
    ) -> PortResult<u64> {
        let result = sqlx::query(
            "UPDATE items SET last_seen_at = $3, sync_status = 'ACTIVE', updated_at = $3 \
             WHERE user_id = $1 AND external_id = ANY($2)",
        )
        .bind(user_id)
        .bind(external_ids)
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn mark_unliked(&self, user_id: Uuid, seen_external_ids: &[String]) -> PortResult<u64> {
        let result = sqlx::query(
            "UPDATE items SET sync_status = 'UNLIKED', updated_at = now() \
             WHERE user_id = $1 AND sync_status = 'ACTIVE' AND NOT (external_id = ANY($2))",
        )
        .bind(user_id)
        .bind(seen_external_ids)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn items_needing_analysis(
        &self,
        user_id: Uuid,
        categories_updated_at: Option<DateTime<Utc>>,
        force: bool,
    ) -> PortResult<Vec<Item>> {
        let query = format!(
            "SELECT {ITEM_COLUMNS} FROM items \
             WHERE user_id = $1 AND sync_status = 'ACTIVE' \
               AND ($2 OR last_analyzed_at IS NULL \
                    OR ($3::timestamptz IS NOT NULL AND last_analyzed_at < $3)) \
             ORDER BY created_at ASC"
        );
        let records = sqlx::query_as::<_, ItemRecord>(&query)
            .bind(user_id)
            .bind(force)
            .bind(categories_updated_at)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        records.into_iter().map(ItemRecord::to_domain).collect()
    }

    async fn apply_classification(
        &self,
        user_id: Uuid,
        outcome: &ClassificationOutcome,
        analyzed_at: DateTime<Utc>,
    ) -> PortResult<u64> {
        let mut tx = self.begin().await?;
        let mut touched = 0u64;

        for (category_id, item_ids) in &outcome.assignments {
            let result = sqlx::query(
                "UPDATE items SET category_id = $3, last_analyzed_at = $4, updated_at = $4 \
                 WHERE user_id = $1 AND id = ANY($2)",
            )
            .bind(user_id)
            .bind(item_ids.as_slice())
            .bind(category_id)
            .bind(analyzed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            touched += result.rows_affected();
        }

        if !outcome.unassigned.is_empty() {
            let result = sqlx::query(
                "UPDATE items SET last_analyzed_at = $3, updated_at = $3 \
                 WHERE user_id = $1 AND id = ANY($2)",
            )
            .bind(user_id)
            .bind(outcome.unassigned.as_slice())
            .bind(analyzed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            touched += result.rows_affected();
        }

        tx.commit().await.map_err(db_error)?;
        Ok(touched)
    }

    // --- Categories ---

    async fn list_categories(&self, user_id: Uuid) -> PortResult<Vec<Category>> {
        let query = format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories WHERE user_id = $1 ORDER BY created_at ASC, name ASC"
        );
        let records = sqlx::query_as::<_, CategoryRecord>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(records.into_iter().map(CategoryRecord::to_domain).collect())
    }

    async fn create_category(&self, user_id: Uuid, draft: &CategoryDraft) -> PortResult<Category> {
        let name = draft.validate()?;

        if let Some(parent_id) = draft.parent_id {
            let parent_exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM categories WHERE id = $1 AND user_id = $2)",
            )
            .bind(parent_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
            if !parent_exists {
                return Err(PortError::NotFound(format!("Category {} not found", parent_id)));
            }
        }

        let query = format!(
            "INSERT INTO categories (id, user_id, name, is_default, parent_id) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {CATEGORY_COLUMNS}"
        );
        let record = sqlx::query_as::<_, CategoryRecord>(&query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(&name)
            .bind(draft.is_default)
            .bind(draft.parent_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    PortError::Validation(format!("category '{}' already exists", name))
                } else {
                    db_error(e)
                }
            })?;
        Ok(record.to_domain())
    }

    async fn rename_category(
        &self,
        user_id: Uuid,
        category_id: Uuid,
        name: &str,
    ) -> PortResult<Category> {
        let name = validate_category_name(name)?;
        let query = format!(
            "UPDATE categories SET name = $3, updated_at = now() \
             WHERE id = $2 AND user_id = $1 RETURNING {CATEGORY_COLUMNS}"
        );
        let record = sqlx::query_as::<_, CategoryRecord>(&query)
            .bind(user_id)
            .bind(category_id)
            .bind(&name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    PortError::Validation(format!("category '{}' already exists", name))
                } else {
                    db_error(e)
                }
            })?
            .ok_or_else(|| PortError::NotFound(format!("Category {} not found", category_id)))?;
        Ok(record.to_domain())
    }

    async fn delete_category(&self, user_id: Uuid, category_id: Uuid) -> PortResult<()> {
        let mut tx = self.begin().await?;

        let doomed = sqlx::query_scalar::<_, Uuid>(
            "WITH RECURSIVE subtree AS ( \
                 SELECT id FROM categories WHERE id = $2 AND user_id = $1 \
                 UNION ALL \
                 SELECT c.id FROM categories c JOIN subtree s ON c.parent_id = s.id \
             ) \
             SELECT id FROM subtree",
        )
        .bind(user_id)
        .bind(category_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;
        if doomed.is_empty() {
            return Err(PortError::NotFound(format!("Category {} not found", category_id)));
        }

        sqlx::query(
            "UPDATE items SET category_id = NULL, last_analyzed_at = NULL, updated_at = now() \
             WHERE user_id = $1 AND category_id = ANY($2)",
        )
        .bind(user_id)
        .bind(doomed.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query("DELETE FROM categories WHERE user_id = $1 AND id = ANY($2)")
            .bind(user_id)
            .bind(doomed.as_slice())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        debug!(%user_id, %category_id, removed = doomed.len(), "Category subtree deleted");
        Ok(())
    }

    // --- Quota ---

    async fn quota_state(&self, user_id: Uuid, now: DateTime<Utc>) -> PortResult<QuotaState> {
        let mut tx = self.begin().await?;
        let (state, was_reset) = self.lock_quota(&mut tx, user_id, now).await?;
        if was_reset {
            store_quota(&mut tx, user_id, &state).await?;
        }
        tx.commit().await.map_err(db_error)?;
        Ok(state)
    }

    async fn reserve_quota(
        &self,
        user_id: Uuid,
        quota: QuotaType,
        amount: u64,
        now: DateTime<Utc>,
    ) -> PortResult<QuotaUsage> {
        let mut tx = self.begin().await?;
        let (mut state, _) = self.lock_quota(&mut tx, user_id, now).await?;
        let usage = state.reserve(quota, amount)?;
        store_quota(&mut tx, user_id, &state).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(usage)
    }
}
