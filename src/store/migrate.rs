// Schema version bookkeeping. A major version change wipes the containers collection.

use sqlx::Row;
use sqlx::sqlite::SqlitePool;

const VERSION_KEY: &str = "app";

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// True when stored documents cannot be read by `to`.
pub fn is_incompatible(from: Option<&str>, to: &str) -> bool {
    match from {
        Some(from) => major(from) != major(to),
        None => false,
    }
}

pub(super) async fn stored_version(pool: &SqlitePool) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT value FROM schema_version WHERE key = $1")
        .bind(VERSION_KEY)
        .fetch_optional(pool)
        .await?;
    row.map(|r| r.try_get::<String, _>("value")).transpose()
}

/// Wipe incompatible state, then record `to` as the current version.
pub(super) async fn migrate(pool: &SqlitePool, to: &str) -> Result<(), sqlx::Error> {
    let from = stored_version(pool).await?;
    if from.as_deref() != Some(to) {
        tracing::info!(from = ?from, to = %to, "Migrate data");
    }
    if is_incompatible(from.as_deref(), to) {
        tracing::info!("Incompatible state found; reset");
        sqlx::query("DELETE FROM containers").execute(pool).await?;
    }
    sqlx::query("INSERT OR REPLACE INTO schema_version (key, value) VALUES ($1, $2)")
        .bind(VERSION_KEY)
        .bind(to)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_major_changes_are_incompatible() {
        assert!(!is_incompatible(None, "8.0.0"));
        assert!(!is_incompatible(Some("8.0.0"), "8.3.1"));
        assert!(is_incompatible(Some("7.2.0"), "8.0.0"));
    }
}
