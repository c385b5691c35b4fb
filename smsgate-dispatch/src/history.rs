use std::path::Path;

use jiff::{SignedDuration, Timestamp};
use serde::Serialize;
use smsgate_core::{Event, EventKind};
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid event kind: {0}")]
    InvalidKind(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// A forwarded event as kept in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub device: String,
    pub kind: EventKind,
    pub number: String,
    pub body: Option<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub sms: u64,
    pub calls: u64,
    /// Events whose timestamp lies within the last 24 hours.
    pub last_24h: u64,
}

/// SQLite log of every event the sink accepted.
#[derive(Clone)]
pub struct NotificationHistory {
    pool: SqlitePool,
}

impl NotificationHistory {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, HistoryError> {
        // Every connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn record(&self, event: &Event) -> Result<(), HistoryError> {
        let body = match event {
            Event::Sms(sms) => sms.body.to_string(),
            Event::Call(call) => format!("{} call", call.call_type.as_str()),
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO notifications (id, device, kind, number, body, timestamp, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id().0.to_string())
        .bind(event.device())
        .bind(event.kind().as_str())
        .bind(event.number())
        .bind(body)
        .bind(event.timestamp().as_second())
        .bind(Timestamp::now().as_second())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent first, optionally only one kind.
    pub async fn recent(
        &self,
        limit: u32,
        kind: Option<EventKind>,
    ) -> Result<Vec<Notification>, HistoryError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, device, kind, number, body, timestamp FROM notifications",
        );
        if let Some(kind) = kind {
            query.push(" WHERE kind = ").push_bind(kind.as_str());
        }
        query
            .push(" ORDER BY timestamp DESC, rowid DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn by_number(
        &self,
        number: &str,
        limit: u32,
    ) -> Result<Vec<Notification>, HistoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, device, kind, number, body, timestamp FROM notifications
            WHERE number = ?
            ORDER BY timestamp DESC, rowid DESC LIMIT ?
            "#,
        )
        .bind(number)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row).collect()
    }

    pub async fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let since = Timestamp::now() - SignedDuration::from_hours(24);
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN kind = 'sms' THEN 1 ELSE 0 END), 0) AS sms,
                COALESCE(SUM(CASE WHEN kind = 'call' THEN 1 ELSE 0 END), 0) AS calls,
                COALESCE(SUM(CASE WHEN timestamp >= ? THEN 1 ELSE 0 END), 0) AS last_24h
            FROM notifications
            "#,
        )
        .bind(since.as_second())
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, HistoryError> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
        };

        Ok(HistoryStats {
            total: count("total")?,
            sms: count("sms")?,
            calls: count("calls")?,
            last_24h: count("last_24h")?,
        })
    }
}

fn map_row(row: &SqliteRow) -> Result<Notification, HistoryError> {
    let kind: String = row.try_get("kind")?;
    let kind = kind
        .parse::<EventKind>()
        .map_err(|_| HistoryError::InvalidKind(kind.clone()))?;
    let seconds: i64 = row.try_get("timestamp")?;
    let timestamp =
        Timestamp::from_second(seconds).map_err(|_| HistoryError::InvalidTimestamp(seconds))?;

    Ok(Notification {
        id: row.try_get("id")?,
        device: row.try_get("device")?,
        kind,
        number: row.try_get("number")?,
        body: row.try_get("body")?,
        timestamp,
    })
}
