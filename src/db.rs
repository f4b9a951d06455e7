use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::str::FromStr;
use tracing::info;

use crate::database::Result;

// Catalog connection pool type
pub type DbPool = Pool<Sqlite>;

/// Open the artifact catalog database, creating it and running migrations if necessary
pub async fn init_db(database_url: &str) -> Result<DbPool> {
    // An in-memory database lives and dies with its single connection
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = pool_options.connect_with(options).await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await.map_err(sqlx::Error::from)?;

    info!("Artifact catalog ready at {}", database_url);
    Ok(pool)
}
