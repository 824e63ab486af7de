use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::StoreError;
use crate::event::LastAction;

/// One closed window, as written to the durable table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCount {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub last_action: LastAction,
    pub event_count: i64,
}

/// Durable table of per-window counts, unique on `(window_start, last_action)`.
#[async_trait]
pub trait WindowTable: Send + Sync {
    /// Idempotent: writing the same window twice leaves one row with the
    /// latest count.
    async fn upsert(&self, counts: &[WindowCount]) -> Result<(), StoreError>;
}

pub struct PgWindowTable {
    pool: PgPool,
}

impl PgWindowTable {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("visit_window_counts migrations applied");

        Ok(Self::from_pool(pool))
    }

    /// Uses an existing pool whose schema is already migrated.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WindowTable for PgWindowTable {
    async fn upsert(&self, counts: &[WindowCount]) -> Result<(), StoreError> {
        if counts.is_empty() {
            return Ok(());
        }

        let mut starts = Vec::with_capacity(counts.len());
        let mut ends = Vec::with_capacity(counts.len());
        let mut actions = Vec::with_capacity(counts.len());
        let mut event_counts = Vec::with_capacity(counts.len());
        for count in counts {
            starts.push(count.window_start);
            ends.push(count.window_end);
            actions.push(count.last_action.as_str().to_owned());
            event_counts.push(count.event_count);
        }

        sqlx::query(
            r#"
INSERT INTO visit_window_counts (window_start, window_end, last_action, event_count)
    (SELECT * FROM UNNEST(
        $1::timestamptz[],
        $2::timestamptz[],
        $3::text[],
        $4::bigint[]))
ON CONFLICT (window_start, last_action)
DO UPDATE SET event_count = EXCLUDED.event_count, committed_at = NOW()"#,
        )
        .bind(&starts)
        .bind(&ends)
        .bind(&actions)
        .bind(&event_counts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Table kept in memory, unique on `(window_start, last_action)` like the real one.
#[derive(Default)]
pub struct MemoryWindowTable {
    rows: Mutex<BTreeMap<(DateTime<Utc>, LastAction), WindowCount>>,
    unavailable: AtomicBool,
    upserts: AtomicU32,
}

impl MemoryWindowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Rows written, counting overwrites of the same key.
    pub fn upserts(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Current rows, ordered by window then action.
    pub fn rows(&self) -> Vec<WindowCount> {
        self.rows
            .lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WindowTable for MemoryWindowTable {
    async fn upsert(&self, counts: &[WindowCount]) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("window table is down".to_string()));
        }

        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("window table lock poisoned".to_string()))?;
        for count in counts {
            rows.insert((count.window_start, count.last_action), count.clone());
            self.upserts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(start_secs: i64, action: LastAction, event_count: i64) -> WindowCount {
        WindowCount {
            window_start: DateTime::from_timestamp(start_secs, 0).unwrap(),
            window_end: DateTime::from_timestamp(start_secs + 5, 0).unwrap(),
            last_action: action,
            event_count,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_same_window() {
        let table = MemoryWindowTable::new();
        table
            .upsert(&[count(0, LastAction::Order, 2), count(0, LastAction::Faq, 1)])
            .await
            .unwrap();
        table
            .upsert(&[count(0, LastAction::Order, 2)])
            .await
            .unwrap();

        assert_eq!(
            table.rows(),
            vec![count(0, LastAction::Faq, 1), count(0, LastAction::Order, 2)]
        );
        assert_eq!(table.upserts(), 3);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn pg_upsert_keeps_one_row_per_window(db: PgPool) {
        let table = PgWindowTable::from_pool(db.clone());

        table
            .upsert(&[count(0, LastAction::Order, 2), count(0, LastAction::Faq, 1)])
            .await
            .unwrap();
        table
            .upsert(&[count(0, LastAction::Order, 5), count(5, LastAction::Order, 1)])
            .await
            .unwrap();
        table.upsert(&[]).await.unwrap();

        let rows: Vec<(DateTime<Utc>, String, i64)> = sqlx::query_as(
            "SELECT window_start, last_action, event_count FROM visit_window_counts \
             ORDER BY window_start, last_action",
        )
        .fetch_all(&db)
        .await
        .unwrap();

        assert_eq!(
            rows,
            vec![
                (DateTime::from_timestamp(0, 0).unwrap(), "FAQ".to_string(), 1),
                (DateTime::from_timestamp(0, 0).unwrap(), "Order".to_string(), 5),
                (DateTime::from_timestamp(5, 0).unwrap(), "Order".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn unavailable_table_rejects_writes() {
        let table = MemoryWindowTable::new();
        table.set_unavailable(true);

        assert!(table.upsert(&[count(0, LastAction::Order, 1)]).await.is_err());
        assert!(table.rows().is_empty());
    }
}
