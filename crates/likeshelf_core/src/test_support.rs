//! In-memory implementations of the ports for the engine tests.
//!
//! `InMemoryDb` holds a single mutex for the duration of each call, which gives every
//! operation the same all-or-nothing behaviour a database transaction would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{
    validate_category_name, Assignment, Category, CategoryDraft, ClassificationOutcome,
    ClassifyCategory, ClassifyItem, Item, ItemPage, LinkedAccount, SourceItem, SyncStatus,
};
use crate::ports::{
    ClassificationService, DatabaseService, LikedItemSource, PortError, PortResult, QuotaCharge,
};
use crate::quota::{next_reset_after, QuotaPolicy, QuotaState, QuotaType, QuotaUsage};

pub fn source_item(external_id: &str) -> SourceItem {
    SourceItem {
        external_id: external_id.to_string(),
        title: format!("Video {external_id}"),
        description: None,
        thumbnail_url: None,
        channel_name: Some("Some Channel".to_string()),
        channel_id: None,
        published_at: None,
    }
}

/// `prefix1 ..= prefixN` style ids.
pub fn external_ids(prefix: &str, range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|n| format!("{prefix}{n}")).collect()
}

//=========================================================================================
// Store
//=========================================================================================

#[derive(Default)]
struct Tables {
    quotas: HashMap<Uuid, QuotaState>,
    accounts: HashMap<Uuid, LinkedAccount>,
    items: Vec<Item>,
    categories: Vec<Category>,
}

pub struct InMemoryDb {
    tables: Mutex<Tables>,
    policy: QuotaPolicy,
    touch_failures: AtomicUsize,
    touch_calls: AtomicUsize,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            policy: QuotaPolicy::default(),
            touch_failures: AtomicUsize::new(0),
            touch_calls: AtomicUsize::new(0),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }

    pub fn add_user(&self, sync_limit: u64, categorize_limit: u64) -> Uuid {
        let user_id = Uuid::new_v4();
        let mut state = QuotaState::new(sync_limit, categorize_limit);
        state.reset_at = Some(next_reset_after(Utc::now(), self.policy.reset_day));
        let mut tables = self.tables();
        tables.quotas.insert(user_id, state);
        tables.accounts.insert(
            user_id,
            LinkedAccount {
                user_id,
                provider_account_id: format!("acct-{user_id}"),
                access_token: Some("access".to_string()),
                refresh_token: Some("refresh".to_string()),
                expires_at: None,
            },
        );
        user_id
    }

    pub fn set_used(&self, user_id: Uuid, quota: QuotaType, used: u64) {
        let mut tables = self.tables();
        let state = tables.quotas.get_mut(&user_id).unwrap();
        match quota {
            QuotaType::Sync => state.sync.used = used,
            QuotaType::Categorize => state.categorize.used = used,
        }
    }

    pub fn quota(&self, user_id: Uuid) -> QuotaState {
        self.tables().quotas[&user_id].clone()
    }

    pub fn seed_items(&self, user_id: Uuid, ids: &[String]) {
        let now = Utc::now();
        let mut tables = self.tables();
        for id in ids {
            tables.items.push(new_item(user_id, &source_item(id), now));
        }
    }

    pub fn items(&self, user_id: Uuid) -> Vec<Item> {
        self.tables()
            .items
            .iter()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn item(&self, user_id: Uuid, external_id: &str) -> Item {
        self.items(user_id)
            .into_iter()
            .find(|item| item.external_id == external_id)
            .unwrap()
    }

    pub fn add_category(&self, user_id: Uuid, name: &str) -> Uuid {
        let now = Utc::now();
        let category = Category {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            is_default: false,
            parent_id: None,
            exported_playlist_id: None,
            last_exported_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = category.id;
        self.tables().categories.push(category);
        id
    }

    pub fn set_category_updated_at(&self, category_id: Uuid, at: DateTime<Utc>) {
        let mut tables = self.tables();
        if let Some(category) = tables.categories.iter_mut().find(|c| c.id == category_id) {
            category.updated_at = at;
        }
    }

    /// Makes the next `times` calls to `touch_last_seen` fail transiently.
    pub fn fail_touch_last_seen(&self, times: usize) {
        self.touch_failures.store(times, Ordering::SeqCst);
    }

    pub fn touch_calls(&self) -> usize {
        self.touch_calls.load(Ordering::SeqCst)
    }
}

fn new_item(user_id: Uuid, source: &SourceItem, now: DateTime<Utc>) -> Item {
    Item {
        id: Uuid::new_v4(),
        user_id,
        external_id: source.external_id.clone(),
        title: source.title.clone(),
        description: source.description.clone(),
        thumbnail_url: source.thumbnail_url.clone(),
        channel_name: source.channel_name.clone(),
        channel_id: source.channel_id.clone(),
        published_at: source.published_at,
        category_id: None,
        last_analyzed_at: None,
        last_seen_at: Some(now),
        sync_status: SyncStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

fn name_taken(tables: &Tables, user_id: Uuid, name: &str, except: Option<Uuid>) -> bool {
    tables.categories.iter().any(|c| {
        c.user_id == user_id && Some(c.id) != except && c.name.to_lowercase() == name.to_lowercase()
    })
}

#[async_trait]
impl DatabaseService for InMemoryDb {
    async fn linked_account(&self, user_id: Uuid) -> PortResult<Option<LinkedAccount>> {
        Ok(self.tables().accounts.get(&user_id).cloned())
    }

    async fn list_linked_users(&self) -> PortResult<Vec<Uuid>> {
        let mut users: Vec<Uuid> = self.tables().accounts.keys().copied().collect();
        users.sort();
        Ok(users)
    }

    async fn existing_external_ids(
        &self,
        user_id: Uuid,
        external_ids: &[String],
    ) -> PortResult<HashSet<String>> {
        let wanted: HashSet<&String> = external_ids.iter().collect();
        Ok(self
            .tables()
            .items
            .iter()
            .filter(|item| item.user_id == user_id && wanted.contains(&item.external_id))
            .map(|item| item.external_id.clone())
            .collect())
    }

    async fn insert_items_with_quota(
        &self,
        user_id: Uuid,
        items: &[SourceItem],
        charge: QuotaCharge,
        now: DateTime<Utc>,
    ) -> PortResult<u64> {
        let mut tables = self.tables();
        let mut quota = tables
            .quotas
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {user_id} not found")))?;

        let mut known: HashSet<String> = tables
            .items
            .iter()
            .filter(|item| item.user_id == user_id)
            .map(|item| item.external_id.clone())
            .collect();
        let fresh: Vec<Item> = items
            .iter()
            .filter(|source| known.insert(source.external_id.clone()))
            .map(|source| new_item(user_id, source, now))
            .collect();
        let inserted = fresh.len() as u64;

        quota.reset_if_due(now, &self.policy);
        match charge {
            QuotaCharge::Enforce(kind) => {
                quota.reserve(kind, inserted)?;
            }
            QuotaCharge::RecordOnly(kind) => {
                quota.increment(kind, inserted);
            }
        }

        tables.quotas.insert(user_id, quota);
        tables.items.extend(fresh);
        Ok(inserted)
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        external_ids: &[String],
        seen_at: DateTime<Utc>,
    ) -> PortResult<u64> {
        self.touch_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.touch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.touch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PortError::Transient("connection reset".to_string()));
        }

        let wanted: HashSet<&String> = external_ids.iter().collect();
        let mut touched = 0;
        for item in self.tables().items.iter_mut() {
            if item.user_id == user_id && wanted.contains(&item.external_id) {
                item.last_seen_at = Some(seen_at);
                item.sync_status = SyncStatus::Active;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn mark_unliked(&self, user_id: Uuid, seen_external_ids: &[String]) -> PortResult<u64> {
        let seen: HashSet<&String> = seen_external_ids.iter().collect();
        let mut marked = 0;
        for item in self.tables().items.iter_mut() {
            if item.user_id == user_id
                && item.sync_status == SyncStatus::Active
                && !seen.contains(&item.external_id)
            {
                item.sync_status = SyncStatus::Unliked;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn items_needing_analysis(
        &self,
        user_id: Uuid,
        categories_updated_at: Option<DateTime<Utc>>,
        force: bool,
    ) -> PortResult<Vec<Item>> {
        Ok(self
            .tables()
            .items
            .iter()
            .filter(|item| item.user_id == user_id && item.needs_analysis(categories_updated_at, force))
            .cloned()
            .collect())
    }

    async fn apply_classification(
        &self,
        user_id: Uuid,
        outcome: &ClassificationOutcome,
        analyzed_at: DateTime<Utc>,
    ) -> PortResult<u64> {
        let mut targets: HashMap<Uuid, Option<Uuid>> = HashMap::new();
        for (category_id, item_ids) in &outcome.assignments {
            for item_id in item_ids {
                targets.insert(*item_id, Some(*category_id));
            }
        }
        for item_id in &outcome.unassigned {
            targets.insert(*item_id, None);
        }

        let mut touched = 0;
        for item in self.tables().items.iter_mut() {
            if item.user_id != user_id {
                continue;
            }
            if let Some(target) = targets.get(&item.id) {
                if let Some(category_id) = target {
                    item.category_id = Some(*category_id);
                }
                item.last_analyzed_at = Some(analyzed_at);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn list_categories(&self, user_id: Uuid) -> PortResult<Vec<Category>> {
        Ok(self
            .tables()
            .categories
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_category(&self, user_id: Uuid, draft: &CategoryDraft) -> PortResult<Category> {
        let name = draft.validate()?;
        let mut tables = self.tables();
        if name_taken(&tables, user_id, &name, None) {
            return Err(PortError::Validation(format!("category '{name}' already exists")));
        }
        if let Some(parent_id) = draft.parent_id {
            if !tables.categories.iter().any(|c| c.id == parent_id && c.user_id == user_id) {
                return Err(PortError::NotFound(format!("Category {parent_id} not found")));
            }
        }
        let now = Utc::now();
        let category = Category {
            id: Uuid::new_v4(),
            user_id,
            name,
            is_default: draft.is_default,
            parent_id: draft.parent_id,
            exported_playlist_id: None,
            last_exported_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.categories.push(category.clone());
        Ok(category)
    }

    async fn rename_category(
        &self,
        user_id: Uuid,
        category_id: Uuid,
        name: &str,
    ) -> PortResult<Category> {
        let name = validate_category_name(name)?;
        let mut tables = self.tables();
        if name_taken(&tables, user_id, &name, Some(category_id)) {
            return Err(PortError::Validation(format!("category '{name}' already exists")));
        }
        let category = tables
            .categories
            .iter_mut()
            .find(|c| c.id == category_id && c.user_id == user_id)
            .ok_or_else(|| PortError::NotFound(format!("Category {category_id} not found")))?;
        category.name = name;
        category.updated_at = Utc::now();
        Ok(category.clone())
    }

    async fn delete_category(&self, user_id: Uuid, category_id: Uuid) -> PortResult<()> {
        let mut tables = self.tables();
        if !tables.categories.iter().any(|c| c.id == category_id && c.user_id == user_id) {
            return Err(PortError::NotFound(format!("Category {category_id} not found")));
        }

        let mut doomed: HashSet<Uuid> = HashSet::from([category_id]);
        loop {
            let children: Vec<Uuid> = tables
                .categories
                .iter()
                .filter(|c| c.parent_id.is_some_and(|p| doomed.contains(&p)) && !doomed.contains(&c.id))
                .map(|c| c.id)
                .collect();
            if children.is_empty() {
                break;
            }
            doomed.extend(children);
        }

        for item in tables.items.iter_mut() {
            if item.category_id.is_some_and(|c| doomed.contains(&c)) {
                item.category_id = None;
                item.last_analyzed_at = None;
            }
        }
        tables.categories.retain(|c| !doomed.contains(&c.id));
        Ok(())
    }

    async fn quota_state(&self, user_id: Uuid, now: DateTime<Utc>) -> PortResult<QuotaState> {
        let mut tables = self.tables();
        let state = tables
            .quotas
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {user_id} not found")))?;
        state.reset_if_due(now, &self.policy);
        Ok(state.clone())
    }

    async fn reserve_quota(
        &self,
        user_id: Uuid,
        quota: QuotaType,
        amount: u64,
        now: DateTime<Utc>,
    ) -> PortResult<QuotaUsage> {
        let mut tables = self.tables();
        let state = tables
            .quotas
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {user_id} not found")))?;
        state.reset_if_due(now, &self.policy);
        Ok(state.reserve(quota, amount)?)
    }
}

//=========================================================================================
// Liked-item source
//=========================================================================================

type FailureFactory = Box<dyn Fn() -> PortError + Send + Sync>;

/// Serves a fixed list of pages; the continuation token is the next page index.
pub struct ScriptedSource {
    pages: Vec<Vec<SourceItem>>,
    failure: Option<FailureFactory>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Vec<SourceItem>>) -> Self {
        Self {
            pages,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_ids(ids: &[String], page_size: usize) -> Self {
        Self::new(
            ids.chunks(page_size)
                .map(|chunk| chunk.iter().map(|id| source_item(id)).collect())
                .collect(),
        )
    }

    pub fn failing(failure: impl Fn() -> PortError + Send + Sync + 'static) -> Self {
        Self {
            failure: Some(Box::new(failure)),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LikedItemSource for ScriptedSource {
    async fn fetch_page(
        &self,
        _user_id: Uuid,
        _page_size: usize,
        page_token: Option<&str>,
    ) -> PortResult<ItemPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = &self.failure {
            return Err(failure());
        }
        let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let Some(items) = self.pages.get(index) else {
            return Ok(ItemPage::default());
        };
        let next_token = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(ItemPage {
            items: items.clone(),
            next_token,
        })
    }
}

//=========================================================================================
// Classifier
//=========================================================================================

type Responder =
    Box<dyn Fn(&[ClassifyItem], &[ClassifyCategory]) -> PortResult<Vec<Assignment>> + Send + Sync>;

pub struct ScriptedClassifier {
    respond: Responder,
    calls: AtomicUsize,
    seen: Mutex<Vec<Uuid>>,
}

impl ScriptedClassifier {
    pub fn new(
        respond: impl Fn(&[ClassifyItem], &[ClassifyCategory]) -> PortResult<Vec<Assignment>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Puts every item into the first offered category.
    pub fn first_category() -> Self {
        Self::new(|items, categories| {
            Ok(items
                .iter()
                .map(|item| Assignment {
                    item_id: item.id,
                    category_id: categories[0].id,
                })
                .collect())
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn classified_items(&self) -> Vec<Uuid> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationService for ScriptedClassifier {
    async fn classify(
        &self,
        items: &[ClassifyItem],
        categories: &[ClassifyCategory],
    ) -> PortResult<Vec<Assignment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .extend(items.iter().map(|item| item.id));
        (self.respond)(items, categories)
    }
}
