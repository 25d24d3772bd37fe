//! Coordination entries shared by every instance through Postgres.

use std::time::Duration;

use async_trait::async_trait;

use crate::application::repos::{CoordinationError, CoordinationStore};

use super::{PostgresRepositories, map_coordination_error};

impl PostgresRepositories {
    /// Delete expired coordination entries; returns how many were removed.
    pub async fn purge_expired_coordination(&self) -> Result<u64, CoordinationError> {
        let result = sqlx::query("DELETE FROM coordination_entries WHERE expires_at <= now()")
            .execute(self.pool())
            .await
            .map_err(map_coordination_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CoordinationStore for PostgresRepositories {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO coordination_entries (key, token, counter, expires_at)
            VALUES ($1, $2, NULL, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET token = EXCLUDED.token,
                counter = NULL,
                expires_at = EXCLUDED.expires_at
            WHERE coordination_entries.expires_at <= now()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl.as_secs_f64())
        .fetch_optional(self.pool())
        .await
        .map_err(map_coordination_error)?;

        Ok(claimed.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        let result = sqlx::query(
            r#"
            DELETE FROM coordination_entries
            WHERE key = $1 AND token = $2 AND expires_at > now()
            "#,
        )
        .bind(key)
        .bind(token)
        .execute(self.pool())
        .await
        .map_err(map_coordination_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment(
        &self,
        key: &str,
        by: i64,
        ttl: Duration,
    ) -> Result<i64, CoordinationError> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO coordination_entries (key, token, counter, expires_at)
            VALUES ($1, NULL, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET counter = CASE
                    WHEN coordination_entries.expires_at <= now() THEN EXCLUDED.counter
                    ELSE COALESCE(coordination_entries.counter, 0) + EXCLUDED.counter
                END,
                token = NULL,
                expires_at = CASE
                    WHEN coordination_entries.expires_at <= now() THEN EXCLUDED.expires_at
                    ELSE coordination_entries.expires_at
                END
            RETURNING counter
            "#,
        )
        .bind(key)
        .bind(by)
        .bind(ttl.as_secs_f64())
        .fetch_one(self.pool())
        .await
        .map_err(map_coordination_error)?;

        total.ok_or_else(|| CoordinationError::unavailable(format!("counter `{key}` is empty")))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CoordinationError> {
        let value: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT counter FROM coordination_entries WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_coordination_error)?;

        Ok(value.flatten())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError> {
        let seconds: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT EXTRACT(EPOCH FROM (expires_at - now()))::float8
            FROM coordination_entries
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_coordination_error)?;

        Ok(seconds
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64))
    }
}
