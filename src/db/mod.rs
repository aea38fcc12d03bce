use std::path::Path;

use anyhow::{Context, Result};
use tokio_rusqlite::Connection;

pub mod records;

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open catalog {}", path.display()))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// Throwaway catalog for tests and simulation runs.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;
    Ok(())
}
