use async_trait::async_trait;
use sqlx::PgPool;

use super::{NotificationStore, StoreError};
use crate::models::Notification;

/// Postgres-backed notification store
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn save(&self, notification: &Notification) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, kind, recipient, department, message, assigned_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(&notification.kind)
        .bind(&notification.recipient)
        .bind(&notification.department)
        .bind(&notification.message)
        .bind(notification.assigned_by.as_deref())
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(id = %notification.id, "Notification already stored");
        }

        Ok(())
    }
}
