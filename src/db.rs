//! Bookkeeping Store (A4): a local `SQLite` audit log of every accepted
//! mutating RPC call, written best-effort after the coordinator mutation
//! commits (§4.10).

use std::path::Path;

use sqlx::{Row as _, Sqlite, SqlitePool, migrate::MigrateDatabase};

use crate::error::Result;

/// Database connection pool type alias.
pub type DbPool = SqlitePool;

/// Creates or opens the `SQLite` database and runs migrations. `:memory:`
/// is accepted for `db.path` when bookkeeping persistence isn't needed.
pub async fn init_db(db_path: &str) -> Result<DbPool> {
    let db_url = if db_path == ":memory:" { "sqlite::memory:".to_string() } else { format!("sqlite:{db_path}") };

    if db_path != ":memory:" && !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
        Sqlite::create_database(&db_url).await?;
    }

    let pool = SqlitePool::connect(&db_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        crate::error::FrontendError::Io(std::io::Error::other(format!("running bookkeeping migrations: {e}")))
    })?;
    Ok(pool)
}

/// One audit row for an accepted mutating RPC call.
pub struct BookkeepingRow<'a> {
    pub method: &'a str,
    pub prefix_or_server: Option<&'a str>,
    pub watch_bumped_at_millis: i64,
}

/// Records a bookkeeping row. Callers treat failures as best-effort: log,
/// don't propagate to the RPC caller (§4.10).
pub async fn record(pool: &DbPool, row: BookkeepingRow<'_>) -> Result<()> {
    sqlx::query("INSERT INTO bookkeeping (method, prefix_or_server, watch_bumped_at_millis) VALUES (?, ?, ?)")
        .bind(row.method)
        .bind(row.prefix_or_server)
        .bind(row.watch_bumped_at_millis)
        .execute(pool)
        .await?;
    Ok(())
}

/// Recent rows, most recent first, for diagnostics / `check-config`-adjacent tooling.
pub async fn recent(pool: &DbPool, limit: i64) -> Result<Vec<(String, Option<String>, i64)>> {
    let rows = sqlx::query("SELECT method, prefix_or_server, watch_bumped_at_millis FROM bookkeeping ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("method"), r.get::<Option<String>, _>("prefix_or_server"), r.get::<i64, _>("watch_bumped_at_millis")))
        .collect())
}

#[must_use]
pub fn resolve_db_path(config_path: &Path, raw: &str) -> String {
    if raw == ":memory:" {
        return raw.to_string();
    }
    crate::config::resolve_config_relative_paths(config_path, raw).display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_recent_round_trips() {
        let pool = init_db(":memory:").await.unwrap();
        record(&pool, BookkeepingRow { method: "addUpstreamServerRegistration", prefix_or_server: Some("app.example.com/foo"), watch_bumped_at_millis: 12345 })
            .await
            .unwrap();
        let rows = recent(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "addUpstreamServerRegistration");
        assert_eq!(rows[0].1.as_deref(), Some("app.example.com/foo"));
    }
}
