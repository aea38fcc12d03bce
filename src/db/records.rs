//! Backup Record persistence.
//!
//! Records are written whole, in one statement, and only once they are
//! terminal (Verified or Failed). The only later mutations are the
//! Verified/Failed -> Expired transition and the prune failure counter.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::models::{BackupRecord, BackupStatus};

const COLUMNS: &str = "id, container_ref, kind, created_at, compression_level, checksum, \
     size_bytes, storage_backend_id, storage_key, status, metadata_snapshot, image_ref, \
     failure, verified_at, expired_at, prune_failures";

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {:?}", raw))?
        .with_timezone(&Utc))
}

/// Column values as SQLite hands them back.
struct RawRecord {
    id: String,
    container_ref: String,
    kind: String,
    created_at: String,
    compression_level: i64,
    checksum: Option<String>,
    size_bytes: i64,
    storage_backend_id: String,
    storage_key: String,
    status: String,
    metadata_snapshot: Option<String>,
    image_ref: Option<String>,
    failure: Option<String>,
    verified_at: Option<String>,
    expired_at: Option<String>,
    prune_failures: i64,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        container_ref: row.get(1)?,
        kind: row.get(2)?,
        created_at: row.get(3)?,
        compression_level: row.get(4)?,
        checksum: row.get(5)?,
        size_bytes: row.get(6)?,
        storage_backend_id: row.get(7)?,
        storage_key: row.get(8)?,
        status: row.get(9)?,
        metadata_snapshot: row.get(10)?,
        image_ref: row.get(11)?,
        failure: row.get(12)?,
        verified_at: row.get(13)?,
        expired_at: row.get(14)?,
        prune_failures: row.get(15)?,
    })
}

impl TryFrom<RawRecord> for BackupRecord {
    type Error = anyhow::Error;

    fn try_from(raw: RawRecord) -> Result<Self> {
        Ok(BackupRecord {
            id: Uuid::parse_str(&raw.id)?,
            container_ref: raw.container_ref,
            kind: raw.kind.parse().map_err(|e: String| anyhow!(e))?,
            created_at: parse_ts(&raw.created_at)?,
            compression_level: u8::try_from(raw.compression_level)?,
            checksum: raw.checksum,
            size_bytes: u64::try_from(raw.size_bytes)?,
            storage_backend_id: raw.storage_backend_id,
            storage_key: raw.storage_key,
            status: raw.status.parse().map_err(|e: String| anyhow!(e))?,
            metadata_snapshot: raw
                .metadata_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            image_ref: raw.image_ref,
            failure: raw.failure.as_deref().map(serde_json::from_str).transpose()?,
            verified_at: raw.verified_at.as_deref().map(parse_ts).transpose()?,
            expired_at: raw.expired_at.as_deref().map(parse_ts).transpose()?,
            prune_failures: u32::try_from(raw.prune_failures)?,
        })
    }
}

fn convert(rows: Vec<RawRecord>) -> Result<Vec<BackupRecord>> {
    rows.into_iter().map(BackupRecord::try_from).collect()
}

pub async fn insert(conn: &Connection, record: &BackupRecord) -> Result<()> {
    if !record.status.is_terminal() {
        bail!("refusing to catalog record {} in status {}", record.id, record.status);
    }

    let id = record.id.to_string();
    let container_ref = record.container_ref.clone();
    let kind = record.kind.as_str();
    let created_at = format_ts(&record.created_at);
    let compression_level = i64::from(record.compression_level);
    let checksum = record.checksum.clone();
    let size_bytes = i64::try_from(record.size_bytes)?;
    let storage_backend_id = record.storage_backend_id.clone();
    let storage_key = record.storage_key.clone();
    let status = record.status.as_str();
    let snapshot = record
        .metadata_snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let image_ref = record.image_ref.clone();
    let failure = record.failure.as_ref().map(serde_json::to_string).transpose()?;
    let verified_at = record.verified_at.as_ref().map(format_ts);
    let expired_at = record.expired_at.as_ref().map(format_ts);
    let prune_failures = i64::from(record.prune_failures);

    conn.call(move |c| {
        c.execute(
            &format!(
                "INSERT INTO backups ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                COLUMNS
            ),
            params![
                id,
                container_ref,
                kind,
                created_at,
                compression_level,
                checksum,
                size_bytes,
                storage_backend_id,
                storage_key,
                status,
                snapshot,
                image_ref,
                failure,
                verified_at,
                expired_at,
                prune_failures
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to insert backup record: {}", e))
}

pub async fn get(conn: &Connection, id: Uuid) -> Result<Option<BackupRecord>> {
    let raw = conn
        .call(move |c| {
            c.query_row(
                &format!("SELECT {} FROM backups WHERE id = ?1", COLUMNS),
                params![id.to_string()],
                read_row,
            )
            .optional()
        })
        .await
        .map_err(|e| anyhow!("Failed to get backup record: {}", e))?;

    raw.map(BackupRecord::try_from).transpose()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub container_ref: Option<String>,
    #[serde(default)]
    pub status: Option<BackupStatus>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Newest first.
pub async fn list(conn: &Connection, filter: RecordFilter) -> Result<Vec<BackupRecord>> {
    let status = filter.status.map(|s| s.as_str());
    let limit = filter.limit.map(i64::from).unwrap_or(-1);

    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM backups
                 WHERE (?1 IS NULL OR container_ref = ?1)
                   AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
                COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![filter.container_ref, status, limit], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to list backup records: {}", e))?;

    convert(rows)
}

/// Verified or Failed records for these containers created before `cutoff`, oldest first.
pub async fn list_expirable(
    conn: &Connection,
    container_refs: &[String],
    cutoff: DateTime<Utc>,
) -> Result<Vec<BackupRecord>> {
    let containers = container_refs.to_vec();
    let cutoff = format_ts(&cutoff);

    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM backups
                 WHERE container_ref = ?1
                   AND status IN ('verified', 'failed')
                   AND created_at < ?2
                 ORDER BY created_at ASC",
                COLUMNS
            ))?;

            let mut rows = Vec::new();
            for container in &containers {
                let batch = stmt
                    .query_map(params![container, cutoff], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.extend(batch);
            }
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to list expirable records: {}", e))?;

    convert(rows)
}

/// Verified/Failed -> Expired. Returns false when the record was not eligible.
pub async fn mark_expired(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let at = format_ts(&at);
    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE backups SET status = 'expired', expired_at = ?2
                 WHERE id = ?1 AND status IN ('verified', 'failed')",
                params![id.to_string(), at],
            )
        })
        .await
        .map_err(|e| anyhow!("Failed to expire backup record: {}", e))?;

    Ok(changed == 1)
}

/// Bump and return the consecutive prune failure count.
pub async fn record_prune_failure(conn: &Connection, id: Uuid) -> Result<u32> {
    let count = conn
        .call(move |c| {
            let tx = c.transaction()?;
            tx.execute(
                "UPDATE backups SET prune_failures = prune_failures + 1 WHERE id = ?1",
                params![id.to_string()],
            )?;
            let count: i64 = tx.query_row(
                "SELECT prune_failures FROM backups WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok::<_, rusqlite::Error>(count)
        })
        .await
        .map_err(|e| anyhow!("Failed to record prune failure: {}", e))?;

    Ok(u32::try_from(count)?)
}

pub async fn count_by_status(conn: &Connection) -> Result<BTreeMap<String, u64>> {
    let rows = conn
        .call(|c| {
            let mut stmt = c.prepare("SELECT status, COUNT(*) FROM backups GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to count backup records: {}", e))?;

    Ok(rows
        .into_iter()
        .map(|(status, count)| (status, count.max(0) as u64))
        .collect())
}
