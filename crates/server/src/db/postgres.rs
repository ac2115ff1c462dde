//! `PostgreSQL` resource store.
//!
//! Documents live in `wishlist.documents`. Versions are drawn from the
//! `wishlist.document_version` sequence, so they are unique across keys and
//! survive delete and re-create without reuse.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{Precondition, ResourceStore, StoreError, Version, Versioned};

/// [`ResourceStore`] backed by a `PostgreSQL` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT version, body
            FROM wishlist.documents
            WHERE key = $1
            ",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<_, StoreError> {
            Ok(Versioned {
                version: Version::new(r.try_get("version")?),
                value: r.try_get("body")?,
            })
        })
        .transpose()
    }

    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        value: serde_json::Value,
    ) -> Result<Version, StoreError> {
        let row = match precondition {
            Precondition::Absent => {
                sqlx::query(
                    r"
                    INSERT INTO wishlist.documents (key, version, body)
                    VALUES ($1, nextval('wishlist.document_version'), $2)
                    ON CONFLICT (key) DO NOTHING
                    RETURNING version
                    ",
                )
                .bind(key)
                .bind(&value)
                .fetch_optional(&self.pool)
                .await?
            }
            Precondition::Matches(expected) => {
                sqlx::query(
                    r"
                    UPDATE wishlist.documents
                    SET body = $2,
                        version = nextval('wishlist.document_version'),
                        updated_at = NOW()
                    WHERE key = $1 AND version = $3
                    RETURNING version
                    ",
                )
                .bind(key)
                .bind(&value)
                .bind(expected.as_i64())
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(r) => Ok(Version::new(r.try_get("version")?)),
            None => Err(StoreError::Conflict(key.to_owned())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wishlist.documents WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            r"
            SELECT key
            FROM wishlist.documents
            WHERE key LIKE $1 ESCAPE '\'
            ORDER BY key
            ",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("key").map_err(StoreError::from))
            .collect()
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
