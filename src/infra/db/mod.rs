//! Postgres adapters for the book table and the coordination table.
//!
//! One `PostgresRepositories` value implements both `BooksRepo` and
//! `CoordinationStore`, so a deployment with a database shares a single pool.

mod books;
mod coordination;
mod util;

pub use util::{map_coordination_error, map_sqlx_error};

use std::sync::Arc;
use std::time::Duration;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};

// A saturated pool should surface as a storage error, not a hung request.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    /// Probe used by `/healthz`; touches the books table so a missing
    /// migration fails the check too.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1 FROM library_books LIMIT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
    }
}
