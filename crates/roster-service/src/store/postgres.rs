use std::fmt;

use async_trait::async_trait;
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use super::{StoreError, UserStore, parse_id};
use crate::config::Database;
use crate::types::{NewUser, User, UserPatch};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (first_name, last_name)
)";

/// A [`UserStore`] backed by a PostgreSQL `users` table.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.pool.status();
        f.debug_struct("PostgresStore")
            .field("size", &status.size)
            .field("available", &status.available)
            .finish()
    }
}

impl PostgresStore {
    /// Creates a connection pool for `url`.
    ///
    /// Connections are established lazily, so this does not fail for an unreachable server.
    pub fn connect(url: &str, config: &Database) -> Result<Self, StoreError> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.to_owned());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(config.max_connections);
        pool_config.timeouts.wait = Some(config.connect_timeout);
        pool_config.timeouts.create = Some(config.connect_timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable(format!("failed to create pool: {e}")))?;

        Ok(Self { pool })
    }

    /// Creates the `users` table if it does not exist yet.
    pub async fn bootstrap_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        tracing::info!("users table is ready");
        Ok(())
    }
}

fn user_from_row(row: &Row) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_unique_violation(err: tokio_postgres::Error) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StoreError::Conflict
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn fetch_by_id(&self, id: &str) -> Result<User, StoreError> {
        let id = parse_id(id).ok_or(StoreError::NotFound)?;
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id::text AS id, first_name, last_name, created_at
                 FROM users WHERE id = $1",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        user_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id::text AS id, first_name, last_name, created_at
                 FROM users ORDER BY id",
                &[],
            )
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn create(&self, user: &NewUser) -> Result<User, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "INSERT INTO users (first_name, last_name) VALUES ($1, $2)
                 RETURNING id::text AS id, first_name, last_name, created_at",
                &[&user.first_name, &user.last_name],
            )
            .await
            .map_err(map_unique_violation)?;
        user_from_row(&row)
    }

    async fn update_by_id(&self, id: &str, patch: &UserPatch) -> Result<User, StoreError> {
        let id = parse_id(id).ok_or(StoreError::NotFound)?;
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "UPDATE users
                 SET first_name = COALESCE($2, first_name),
                     last_name = COALESCE($3, last_name)
                 WHERE id = $1
                 RETURNING id::text AS id, first_name, last_name, created_at",
                &[&id, &patch.first_name, &patch.last_name],
            )
            .await
            .map_err(map_unique_violation)?
            .ok_or(StoreError::NotFound)?;
        user_from_row(&row)
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let id = parse_id(id).ok_or(StoreError::NotFound)?;
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }
}
