use std::str::FromStr;

use sqlx::{
    Error, Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use utils::assets::database_path;

pub mod models;

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
    options: SqliteConnectOptions,
}

impl DBService {
    /// Open the database named by `DATABASE_URL`, or the asset-dir SQLite file.
    pub async fn new() -> Result<DBService, Error> {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}", database_path().to_string_lossy())
        });
        Self::new_with_url(&database_url).await
    }

    pub async fn new_with_url(database_url: &str) -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        Self::new_with_options(options, SqlitePoolOptions::new()).await
    }

    pub async fn new_with_options(
        options: SqliteConnectOptions,
        pool_options: SqlitePoolOptions,
    ) -> Result<DBService, Error> {
        let pool = pool_options.connect_with(options.clone()).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool, options })
    }

    /// Private in-memory database, used by tests and throwaway runs.
    ///
    /// Capped at one connection so every query sees the same memory db.
    pub async fn new_in_memory() -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::new_with_options(options, SqlitePoolOptions::new().max_connections(1)).await
    }

    /// Open a second, independent single-connection pool on the same database.
    ///
    /// Background runs fall back to this when their own pool is unusable and
    /// they still owe the database a terminal state.
    pub async fn reconnect(&self) -> Result<DBService, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(self.options.clone())
            .await?;
        Ok(DBService {
            pool,
            options: self.options.clone(),
        })
    }
}
