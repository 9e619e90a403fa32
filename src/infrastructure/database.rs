use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Error as SqlxError,
};
use std::str::FromStr;

pub async fn setup_database(url: &str) -> Result<SqlitePool, SqlxError> {
    // Pragmas set through `SqliteConnectOptions` are replayed on every
    // connection the pool opens, unlike a one-off `PRAGMA` query which only
    // touches whichever connection served it.
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5))
        .pragma("synchronous", "NORMAL")
        .pragma("temp_store", "MEMORY");

    let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

    Ok(pool)
}
