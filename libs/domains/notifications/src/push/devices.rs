//! Registered iOS devices and the reminder query over them.

use super::payload::NotificationTask;
use crate::error::NotificationResult;
use async_trait::async_trait;
use futures::StreamExt;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Items expiring within this window trigger a reminder.
pub const EXPIRING_WITHIN: &str = "25 hours";

/// Items added more recently than this are left alone.
pub const ADDED_BEFORE: &str = "3 hours";

const NOTIFICATIONS_SQL: &str = r#"
    WITH expiring_items AS (
        SELECT ii.name AS name,
               ii.expiration_date AS expiration_date,
               d.token AS device_token
        FROM items_info ii
        INNER JOIN items i ON i.id = ii.id
        INNER JOIN storages s ON i.storage_id = s.id
        INNER JOIN ios_devices d ON d.user_id = s.owner_id
        WHERE ii.expiration_date BETWEEN NOW() AND (NOW() + $1::INTERVAL)
          AND ii.added_date < (NOW() - $2::INTERVAL)
    )
    SELECT device_token,
           COUNT(name) AS expiring_items,
           (SELECT name FROM expiring_items ei2
            WHERE ei2.device_token = ei.device_token
            ORDER BY ei2.expiration_date
            LIMIT 1) AS closest_expiring_item_name
    FROM expiring_items ei
    GROUP BY device_token
"#;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Stream one task per device into `tx`. Returns when the query is
    /// exhausted, fails, or the receiver is gone; `tx` is dropped on return.
    async fn notifications(&self, tx: mpsc::Sender<NotificationTask>) -> NotificationResult<()>;

    /// Register a device for an owner. Re-registering is a no-op.
    async fn add_device_token(&self, token: &str, owner_id: Uuid) -> NotificationResult<()>;

    /// Delete every device whose token is listed, in one statement.
    async fn remove_device_tokens(&self, tokens: Vec<String>) -> NotificationResult<u64>;
}

#[derive(Debug, FromQueryResult)]
struct NotificationRow {
    device_token: String,
    expiring_items: i64,
    closest_expiring_item_name: Option<String>,
}

impl From<NotificationRow> for NotificationTask {
    fn from(row: NotificationRow) -> Self {
        NotificationTask {
            device_token: row.device_token,
            expiring_soon_items_count: row.expiring_items,
            closest_expiring_item_name: row.closest_expiring_item_name.unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct PostgresDeviceRepository {
    db: DatabaseConnection,
}

impl PostgresDeviceRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    async fn notifications(&self, tx: mpsc::Sender<NotificationTask>) -> NotificationResult<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            NOTIFICATIONS_SQL,
            [EXPIRING_WITHIN.into(), ADDED_BEFORE.into()],
        );

        let mut rows = NotificationRow::find_by_statement(stmt).stream(&self.db).await?;
        let mut streamed = 0u64;
        while let Some(row) = rows.next().await {
            let task = NotificationTask::from(row?);
            if tx.send(task).await.is_err() {
                warn!(streamed, "Notification receiver dropped, stopping query");
                return Ok(());
            }
            streamed += 1;
        }

        debug!(streamed, "Notification query exhausted");
        Ok(())
    }

    async fn add_device_token(&self, token: &str, owner_id: Uuid) -> NotificationResult<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "INSERT INTO ios_devices (token, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            [token.into(), owner_id.into()],
        );
        self.db.execute_raw(stmt).await?;
        Ok(())
    }

    async fn remove_device_tokens(&self, tokens: Vec<String>) -> NotificationResult<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "DELETE FROM ios_devices WHERE token = ANY($1)",
            [tokens.into()],
        );
        let result = self.db.execute_raw(stmt).await?;
        Ok(result.rows_affected())
    }
}
