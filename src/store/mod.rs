// Container store: write-through in-memory index over a SQLite document table.
// All writes are serialized by `write_lock` so read-modify-write never interleaves.

mod migrate;

pub use migrate::is_incompatible;

use chrono::Utc;
use serde::Deserialize;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::event::EventBus;
use crate::models::{Container, NotificationLevel, ValidationError};
use crate::tag;

/// A success notification younger than this wins dedup ties.
const RECENT_NOTIFICATION: chrono::Duration = chrono::Duration::minutes(15);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Equality filters for listings. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerQuery {
    pub watcher: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub registry: Option<String>,
    pub update_available: Option<bool>,
}

impl ContainerQuery {
    pub fn watcher(watcher: &str) -> Self {
        Self {
            watcher: Some(watcher.to_string()),
            ..Default::default()
        }
    }

    pub fn name_and_watcher(name: &str, watcher: &str) -> Self {
        Self {
            watcher: Some(watcher.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn matches(&self, c: &Container) -> bool {
        self.watcher.as_deref().is_none_or(|w| c.watcher == w)
            && self.name.as_deref().is_none_or(|n| c.name == n)
            && self.status.as_deref().is_none_or(|s| c.status == s)
            && self
                .registry
                .as_deref()
                .is_none_or(|r| c.image.registry.name == r)
            && self
                .update_available
                .is_none_or(|u| c.update_available() == u)
    }
}

struct Entry {
    container: Container,
    seq: u64,
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl Index {
    fn put(&mut self, container: Container) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.entries
            .insert(container.id.clone(), Entry { container, seq });
    }
}

pub struct ContainerStore {
    index: RwLock<Index>,
    write_lock: Mutex<()>,
    pool: Option<SqlitePool>,
    bus: EventBus,
}

impl ContainerStore {
    /// Store without persistence (tests, ephemeral runs).
    pub fn in_memory(bus: EventBus) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            write_lock: Mutex::new(()),
            pool: None,
            bus,
        }
    }

    pub async fn open(path: &str, bus: EventBus) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(Self {
            index: RwLock::new(Index::default()),
            write_lock: Mutex::new(()),
            pool: Some(pool),
            bus,
        })
    }

    /// Create tables, migrate against `version` and load stored documents.
    pub async fn init(&self, version: &str) -> Result<(), StoreError> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS containers (id TEXT PRIMARY KEY, data TEXT NOT NULL)")
            .execute(pool)
            .await?;
        migrate::migrate(pool, version).await?;

        let rows = sqlx::query("SELECT id, data FROM containers")
            .fetch_all(pool)
            .await?;
        let mut index = self.index.write().await;
        for row in rows {
            let id: String = row.try_get("id")?;
            let data: String = row.try_get("data")?;
            let parsed = serde_json::from_str::<serde_json::Value>(&data)
                .map_err(ValidationError::from)
                .and_then(Container::from_value);
            match parsed {
                Ok(container) => index.put(container),
                Err(e) => tracing::warn!(id = %id, error = %e, "Skipping invalid stored container"),
            }
        }
        tracing::info!(containers = index.entries.len(), "Container store loaded");
        Ok(())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn persist(&self, container: &Container) -> Result<(), StoreError> {
        if let Some(pool) = &self.pool {
            let data = serde_json::to_string(container)?;
            sqlx::query("INSERT OR REPLACE INTO containers (id, data) VALUES ($1, $2)")
                .bind(&container.id)
                .bind(data)
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    async fn unpersist(&self, id: &str) -> Result<(), StoreError> {
        if let Some(pool) = &self.pool {
            sqlx::query("DELETE FROM containers WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    async fn persisted(&self, id: &str) -> Result<bool, StoreError> {
        let Some(pool) = &self.pool else {
            return Ok(false);
        };
        let row = sqlx::query("SELECT 1 AS present FROM containers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, container), fields(repo = "store", operation = "insert", id = %container.id))]
    pub async fn insert(&self, container: Container) -> Result<Container, StoreError> {
        let container = container.validate()?;
        let _guard = self.write_lock.lock().await;
        self.persist(&container).await?;
        self.index.write().await.put(container.clone());
        self.bus.emit_container_added(&container);
        Ok(container)
    }

    /// Replace the record with the same id.
    #[instrument(skip(self, container), fields(repo = "store", operation = "update", id = %container.id))]
    pub async fn update(&self, container: Container) -> Result<Container, StoreError> {
        self.upsert_with(container, |_, incoming| incoming).await
    }

    /// Serialized read-modify-write: `merge` sees the current record for the id (if any)
    /// and returns the record to store.
    pub async fn upsert_with<F>(&self, container: Container, merge: F) -> Result<Container, StoreError>
    where
        F: FnOnce(Option<&Container>, Container) -> Container,
    {
        let _guard = self.write_lock.lock().await;
        let existing = self
            .index
            .read()
            .await
            .entries
            .get(&container.id)
            .map(|e| e.container.clone());
        let merged = merge(existing.as_ref(), container).validate()?;
        self.persist(&merged).await?;
        self.index.write().await.put(merged.clone());
        self.bus.emit_container_updated(&merged);
        Ok(merged)
    }

    /// Serialized in-place edit of an existing record.
    pub async fn modify<F>(&self, id: &str, edit: F) -> Result<Container, StoreError>
    where
        F: FnOnce(&mut Container),
    {
        let _guard = self.write_lock.lock().await;
        let mut container = self
            .index
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.container.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        edit(&mut container);
        let container = container.validate()?;
        self.persist(&container).await?;
        self.index.write().await.put(container.clone());
        self.bus.emit_container_updated(&container);
        Ok(container)
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        self.index
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.container.clone())
    }

    /// Every matching record, duplicates included.
    pub async fn list_all(&self, query: &ContainerQuery) -> Vec<Container> {
        let index = self.index.read().await;
        let mut out: Vec<Container> = index
            .entries
            .values()
            .filter(|e| query.matches(&e.container))
            .map(|e| e.container.clone())
            .collect();
        out.sort_by(listing_order);
        out
    }

    /// Matching records, one per (name, watcher, registry).
    pub async fn list(&self, query: &ContainerQuery) -> Vec<Container> {
        let index = self.index.read().await;
        let mut best: HashMap<(String, String, String), &Entry> = HashMap::new();
        for entry in index.entries.values().filter(|e| query.matches(&e.container)) {
            let c = &entry.container;
            let key = (
                c.name.clone(),
                c.watcher.clone(),
                c.image.registry.name.clone(),
            );
            let replace = best
                .get(&key)
                .is_none_or(|current| preference(current, entry) == Ordering::Less);
            if replace {
                best.insert(key, entry);
            }
        }
        let mut out: Vec<Container> = best.into_values().map(|e| e.container.clone()).collect();
        out.sort_by(listing_order);
        out
    }

    #[instrument(skip(self), fields(repo = "store", operation = "delete"))]
    pub async fn delete(&self, id: &str) -> Result<Option<Container>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(removed) = self.index.write().await.entries.remove(id) else {
            tracing::warn!(id = %id, "Container not found for deletion");
            return Ok(None);
        };
        self.unpersist(id).await?;
        self.bus.emit_container_removed(&removed.container);

        let still_indexed = self.index.read().await.entries.contains_key(id);
        if still_indexed || self.persisted(id).await? {
            tracing::warn!(id = %id, "Container still exists after deletion attempt");
        } else {
            tracing::debug!(id = %id, "Container deleted");
        }
        Ok(Some(removed.container))
    }
}

fn listing_order(a: &Container, b: &Container) -> Ordering {
    (
        &a.watcher,
        &a.image.registry.name,
        &a.name,
        &a.image.tag.value,
    )
        .cmp(&(
            &b.watcher,
            &b.image.registry.name,
            &b.name,
            &b.image.tag.value,
        ))
}

fn has_recent_success(c: &Container) -> bool {
    c.notification.as_ref().is_some_and(|n| {
        n.level == NotificationLevel::Success && Utc::now() - n.at < RECENT_NOTIFICATION
    })
}

fn newer_tag(a: &Container, b: &Container) -> Ordering {
    if tag::is_greater(&a.image.tag.value, &b.image.tag.value) {
        Ordering::Greater
    } else if tag::is_greater(&b.image.tag.value, &a.image.tag.value) {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Greater means `a` should be shown instead of `b`. Full ties go to the latest write.
fn preference(a: &Entry, b: &Entry) -> Ordering {
    let (ca, cb) = (&a.container, &b.container);
    ca.is_running()
        .cmp(&cb.is_running())
        .then((!ca.update_available()).cmp(&!cb.update_available()))
        .then_with(|| newer_tag(ca, cb))
        .then(has_recent_success(ca).cmp(&has_recent_success(cb)))
        .then(a.seq.cmp(&b.seq))
}
