use gcs_shared::{StatusDetails, StatusEvent, StatusRecord};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DB_RETRIES: usize = 5;
const DB_RETRY_DELAY_MS: u64 = 50;

/// Opens (creating if needed) the status database and its tables.
pub async fn open(db_path: &str) -> anyhow::Result<SqlitePool> {
    if let Some(dir) = Path::new(db_path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
        .create_if_missing(true);
    let db = SqlitePool::connect_with(options).await?;
    init_schema(&db).await?;
    Ok(db)
}

pub async fn init_schema(db: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mission_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_ms INTEGER NOT NULL,
            success      INTEGER NOT NULL,
            message      TEXT    NOT NULL,
            details_json TEXT
        );
        "#,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub async fn insert_with_retry<F, Fut>(mut f: F) -> Result<(), sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>>,
{
    let mut delay = DB_RETRY_DELAY_MS;
    let mut last_err: Option<sqlx::Error> = None;

    for _ in 0..=DB_RETRIES {
        match f().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(1000);
            }
        }
    }

    Err(last_err.unwrap_or(sqlx::Error::PoolTimedOut))
}

pub async fn insert_status(
    db: &SqlitePool,
    timestamp_ms: i64,
    event: &StatusEvent,
) -> Result<(), sqlx::Error> {
    let details_json = event
        .details
        .as_ref()
        .and_then(|d| serde_json::to_string(d).ok());

    insert_with_retry(|| {
        sqlx::query(
            "INSERT INTO mission_events (timestamp_ms, success, message, details_json) VALUES (?, ?, ?, ?)",
        )
        .bind(timestamp_ms)
        .bind(event.success)
        .bind(event.message.as_str())
        .bind(details_json.as_deref())
        .execute(db)
    })
    .await
}

/// Status events newer than `since_ms`, newest first.
pub async fn status_history(
    db: &SqlitePool,
    since_ms: i64,
) -> Result<Vec<StatusRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT timestamp_ms, success, message, details_json
        FROM mission_events
        WHERE timestamp_ms >= ?
        ORDER BY timestamp_ms DESC, id DESC
        "#,
    )
    .bind(since_ms)
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| StatusRecord {
            timestamp_ms: row.get::<i64, _>("timestamp_ms"),
            event: StatusEvent {
                success: row.get::<bool, _>("success"),
                message: row.get::<String, _>("message"),
                details: row
                    .try_get::<Option<String>, _>("details_json")
                    .ok()
                    .flatten()
                    .and_then(|raw| serde_json::from_str::<StatusDetails>(&raw).ok()),
            },
        })
        .collect())
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) async fn memory_db() -> SqlitePool {
    let db = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_schema(&db).await.expect("schema");
    db
}
