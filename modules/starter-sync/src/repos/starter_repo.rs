use async_trait::async_trait;
use sqlx::PgPool;

use super::{Page, StarterFilter, StarterSource, StoreError};
use crate::models::Starter;

/// Postgres-backed system of record for starters
#[derive(Clone)]
pub struct PgStarterSource {
    pool: PgPool,
}

impl PgStarterSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StarterSource for PgStarterSource {
    async fn find_by_key(&self, domain: &str) -> Result<Starter, StoreError> {
        let starter = sqlx::query_as::<_, Starter>(
            r#"
            SELECT domain, name, email, department, title, start_date, updated_at
            FROM starters
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        starter.ok_or_else(|| StoreError::NotFound(format!("starter {}", domain)))
    }

    async fn list(
        &self,
        filter: &StarterFilter,
        page: Page,
    ) -> Result<(Vec<Starter>, u64), StoreError> {
        let starters = sqlx::query_as::<_, Starter>(
            r#"
            SELECT domain, name, email, department, title, start_date, updated_at
            FROM starters
            WHERE ($1::TEXT IS NULL OR department = $1)
            ORDER BY domain
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(filter.department.as_deref())
        .bind(i64::from(page.limit))
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM starters
            WHERE ($1::TEXT IS NULL OR department = $1)
            "#,
        )
        .bind(filter.department.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok((starters, total.max(0) as u64))
    }
}
