use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::audit::{AuditEntry, RunCategory, RunStatus};
use crate::classifier::QuarantineRecord;
use crate::dimension::{DimensionSnapshot, DimensionVersion};
use crate::facts::FactRecord;

// ============================================================================
// TIMESTAMP ENCODING
// ============================================================================
// All timestamps are stored as fixed-width RFC 3339 UTC strings so that
// lexicographic comparison inside SQL matches chronological order.

/// Encode a timestamp for storage and SQL range comparison
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid stored timestamp: {}", s))?;
    Ok(dt.with_timezone(&Utc))
}

fn parse_ts_sql(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

// ============================================================================
// STAGING RECORDS
// ============================================================================

// JSON feeds carry explicit nulls; they must reach the classifier as blank
// fields, not fail deserialization
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

/// Raw staging row as landed by the ingestion collaborator.
/// Amount and event_time stay unparsed strings: deciding whether they are
/// valid is the quality classifier's job, not the loader's.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub transaction_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub store_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub customer_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub product_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub event_type: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub amount: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub currency: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub event_time: String,
    /// Stamped by the loader from the source label, not read from the file
    #[serde(default)]
    pub source_system: String,
    pub ingested_at: DateTime<Utc>,
}

/// One landed batch: parseable rows plus a count of rows the ingestion
/// layer could not even deserialize (tolerated per-record, never fatal)
#[derive(Debug)]
pub struct StagingBatch {
    pub records: Vec<StagingRecord>,
    pub malformed: usize,
}

/// Load a staging batch from CSV, stamping every row with the source label
pub fn load_staging_csv(path: &Path, source_system: &str) -> Result<StagingBatch> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open staging CSV: {:?}", path))?;

    let mut records = Vec::new();
    let mut malformed = 0;

    for result in rdr.deserialize::<StagingRecord>() {
        match result {
            Ok(mut record) => {
                record.source_system = source_system.to_string();
                records.push(record);
            }
            Err(_) => malformed += 1,
        }
    }

    Ok(StagingBatch { records, malformed })
}

/// Load a staging batch from newline-delimited JSON (POS / e-commerce feeds)
pub fn load_staging_jsonl(path: &Path, source_system: &str) -> Result<StagingBatch> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open staging JSONL: {:?}", path))?;

    let mut records = Vec::new();
    let mut malformed = 0;

    for line in BufReader::new(file).lines() {
        let line = line.context("Failed to read staging JSONL line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StagingRecord>(&line) {
            Ok(mut record) => {
                record.source_system = source_system.to_string();
                records.push(record);
            }
            Err(_) => malformed += 1,
        }
    }

    Ok(StagingBatch { records, malformed })
}

// ============================================================================
// DIMENSION SNAPSHOT FEEDS (CRM customers, ERP products)
// ============================================================================

#[derive(Debug, Deserialize)]
struct CrmCustomerRow {
    customer_id: String,
    first_name: String,
    last_name: String,
    email: String,
    loyalty_status: String,
    city: String,
    country: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErpProductRow {
    product_id: String,
    product_name: String,
    category: String,
    brand: String,
    supplier: String,
    updated_at: DateTime<Utc>,
}

/// Load customer attribute snapshots from a CRM extract
pub fn load_customer_snapshots(path: &Path) -> Result<Vec<DimensionSnapshot>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CRM extract: {:?}", path))?;

    let mut snapshots = Vec::new();
    for result in rdr.deserialize::<CrmCustomerRow>() {
        let row = result.context("Failed to deserialize CRM customer row")?;
        let mut snapshot = DimensionSnapshot::new(&row.customer_id, row.updated_at);
        snapshot.set_attribute("first_name", &row.first_name);
        snapshot.set_attribute("last_name", &row.last_name);
        snapshot.set_attribute("email", &row.email);
        snapshot.set_attribute("loyalty_status", &row.loyalty_status);
        snapshot.set_attribute("city", &row.city);
        snapshot.set_attribute("country", &row.country);
        snapshots.push(snapshot);
    }

    Ok(snapshots)
}

/// Load product attribute snapshots from an ERP extract
pub fn load_product_snapshots(path: &Path) -> Result<Vec<DimensionSnapshot>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open ERP extract: {:?}", path))?;

    let mut snapshots = Vec::new();
    for result in rdr.deserialize::<ErpProductRow>() {
        let row = result.context("Failed to deserialize ERP product row")?;
        let mut snapshot = DimensionSnapshot::new(&row.product_id, row.updated_at);
        snapshot.set_attribute("product_name", &row.product_name);
        snapshot.set_attribute("category", &row.category);
        snapshot.set_attribute("brand", &row.brand);
        snapshot.set_attribute("supplier", &row.supplier);
        snapshots.push(snapshot);
    }

    Ok(snapshots)
}

// ============================================================================
// WAREHOUSE
// ============================================================================

/// Transactional boundary around the shared warehouse state.
///
/// Every component takes the warehouse explicitly; there is no global
/// handle. Statement groups that must be atomic (close + insert in the
/// merge engine, a whole assembly run) go through `transaction()`.
pub struct Warehouse {
    conn: Connection,
}

impl Warehouse {
    /// Open (or create) a file-backed warehouse with WAL enabled
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open warehouse: {:?}", path))?;

        // Enable WAL mode for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;

        setup_schema(&conn)?;
        Ok(Warehouse { conn })
    }

    /// Open an in-memory warehouse (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_schema(&conn)?;
        Ok(Warehouse { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a statement group that commits or rolls back as one unit
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

fn setup_schema(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Quarantine table (raw fields + rejection metadata, kept for reprocessing)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS quarantine (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_hash TEXT UNIQUE NOT NULL,
            transaction_id TEXT NOT NULL,
            store_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            event_time TEXT NOT NULL,
            source_system TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            rejection_reason TEXT NOT NULL,
            quarantined_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Dimension versions (historized; overwrite policy keeps one row per key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dim_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dimension TEXT NOT NULL,
            surrogate_key INTEGER NOT NULL,
            natural_key TEXT NOT NULL,
            attributes TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            is_current INTEGER NOT NULL,
            UNIQUE(dimension, surrogate_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Fact table (append-only; transaction_id uniqueness is the rerun guard)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fact_transactions (
            transaction_id TEXT PRIMARY KEY,
            customer_sk INTEGER NOT NULL,
            product_id TEXT NOT NULL,
            event_time TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            amount REAL NOT NULL,
            source_system TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Audit log (append-only run outcomes)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            category TEXT NOT NULL,
            status TEXT NOT NULL,
            total INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            detail TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dim_natural_key
         ON dim_versions(dimension, natural_key)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dim_current
         ON dim_versions(dimension, is_current)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quarantine_source
         ON quarantine(source_system, rejection_reason)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_log(run_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// QUARANTINE STORAGE
// ============================================================================

/// Deduplication hash over the delivered record plus its rejection reason.
/// The same redelivered record classified the same way hashes identically,
/// so a retried run cannot double its quarantine rows.
pub fn quarantine_record_hash(qr: &QuarantineRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        qr.record.transaction_id,
        qr.record.customer_id,
        qr.record.product_id,
        qr.record.event_type,
        qr.record.amount,
        qr.record.event_time,
        qr.record.source_system,
        format_ts(qr.record.ingested_at),
        qr.rejection_reason.as_str(),
    ));
    format!("{:x}", hasher.finalize())
}

/// Insert quarantine rows; a row whose hash is already present is skipped,
/// so retried runs never alter committed quarantine output. Returns the
/// count of newly inserted rows.
pub fn insert_quarantine_records(
    conn: &Connection,
    records: &[QuarantineRecord],
) -> Result<usize> {
    let mut inserted = 0;

    for qr in records {
        let result = conn.execute(
            "INSERT INTO quarantine (
                record_hash, transaction_id, store_id, customer_id, product_id,
                event_type, quantity, unit_price, amount, currency, event_time,
                source_system, ingested_at, rejection_reason, quarantined_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                quarantine_record_hash(qr),
                qr.record.transaction_id,
                qr.record.store_id,
                qr.record.customer_id,
                qr.record.product_id,
                qr.record.event_type,
                qr.record.quantity,
                qr.record.unit_price,
                qr.record.amount,
                qr.record.currency,
                qr.record.event_time,
                qr.record.source_system,
                format_ts(qr.record.ingested_at),
                qr.rejection_reason.as_str(),
                format_ts(qr.quarantined_at),
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(inserted)
}

pub fn quarantine_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM quarantine", [], |row| row.get(0))?;
    Ok(count)
}

/// Derived aggregate: quarantine counts by source and rejection reason
#[derive(Debug, Clone)]
pub struct QuarantineStat {
    pub source_system: String,
    pub rejection_reason: String,
    pub record_count: i64,
}

pub fn quarantine_summary(conn: &Connection) -> Result<Vec<QuarantineStat>> {
    let mut stmt = conn.prepare(
        "SELECT source_system, rejection_reason, COUNT(*) as record_count
         FROM quarantine
         GROUP BY source_system, rejection_reason
         ORDER BY source_system, rejection_reason",
    )?;

    let stats = stmt
        .query_map([], |row| {
            Ok(QuarantineStat {
                source_system: row.get(0)?,
                rejection_reason: row.get(1)?,
                record_count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stats)
}

// ============================================================================
// DIMENSION STORAGE
// ============================================================================

pub fn insert_version(
    conn: &Connection,
    dimension: &str,
    version: &DimensionVersion,
) -> Result<()> {
    let attributes_json = serde_json::to_string(&version.attributes)?;

    conn.execute(
        "INSERT INTO dim_versions (
            dimension, surrogate_key, natural_key, attributes,
            valid_from, valid_to, is_current
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            dimension,
            version.surrogate_key,
            version.natural_key,
            attributes_json,
            format_ts(version.valid_from),
            version.valid_to.map(format_ts),
            version.is_current,
        ],
    )?;

    Ok(())
}

/// Close a version: set valid_to and clear the current flag in one statement
pub fn close_version(
    conn: &Connection,
    dimension: &str,
    surrogate_key: i64,
    valid_to: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE dim_versions
         SET valid_to = ?1, is_current = 0
         WHERE dimension = ?2 AND surrogate_key = ?3",
        params![format_ts(valid_to), dimension, surrogate_key],
    )?;

    Ok(())
}

/// Remove all stored versions for a natural key (overwrite policy only)
pub fn delete_versions(conn: &Connection, dimension: &str, natural_key: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM dim_versions WHERE dimension = ?1 AND natural_key = ?2",
        params![dimension, natural_key],
    )?;
    Ok(deleted)
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DimensionVersion> {
    let attributes_json: String = row.get(3)?;
    let attributes = serde_json::from_str(&attributes_json)
        .map_err(|_| rusqlite::Error::InvalidQuery)?;

    let valid_from_str: String = row.get(4)?;
    let valid_to_str: Option<String> = row.get(5)?;

    Ok(DimensionVersion {
        surrogate_key: row.get(1)?,
        natural_key: row.get(2)?,
        attributes,
        valid_from: parse_ts_sql(&valid_from_str)?,
        valid_to: match valid_to_str {
            Some(s) => Some(parse_ts_sql(&s)?),
            None => None,
        },
        is_current: row.get(6)?,
    })
}

const VERSION_COLUMNS: &str =
    "dimension, surrogate_key, natural_key, attributes, valid_from, valid_to, is_current";

/// Current version per natural key for one dimension
pub fn load_current_versions(
    conn: &Connection,
    dimension: &str,
) -> Result<HashMap<String, DimensionVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dim_versions WHERE dimension = ?1 AND is_current = 1",
        VERSION_COLUMNS
    ))?;

    let versions = stmt
        .query_map([dimension], version_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(versions
        .into_iter()
        .map(|v| (v.natural_key.clone(), v))
        .collect())
}

/// Full interval history for one natural key, oldest first
pub fn version_history(
    conn: &Connection,
    dimension: &str,
    natural_key: &str,
) -> Result<Vec<DimensionVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dim_versions
         WHERE dimension = ?1 AND natural_key = ?2
         ORDER BY valid_from",
        VERSION_COLUMNS
    ))?;

    let versions = stmt
        .query_map(params![dimension, natural_key], version_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(versions)
}

/// Point-in-time lookup: the surrogate key whose validity interval contains
/// the given instant (inclusive lower bound, exclusive upper bound)
pub fn resolve_surrogate_at(
    conn: &Connection,
    dimension: &str,
    natural_key: &str,
    at: DateTime<Utc>,
) -> Result<Option<i64>> {
    let at_str = format_ts(at);

    let sk = conn
        .query_row(
            "SELECT surrogate_key FROM dim_versions
             WHERE dimension = ?1 AND natural_key = ?2
               AND valid_from <= ?3
               AND (valid_to IS NULL OR valid_to > ?3)",
            params![dimension, natural_key, at_str],
            |row| row.get(0),
        )
        .optional()?;

    Ok(sk)
}

// ============================================================================
// FACT STORAGE
// ============================================================================

/// Insert a fact row; returns false if the transaction identity is already
/// present (re-run of already-assembled input)
pub fn insert_fact(conn: &Connection, fact: &FactRecord) -> Result<bool> {
    let result = conn.execute(
        "INSERT INTO fact_transactions (
            transaction_id, customer_sk, product_id, event_time,
            quantity, unit_price, amount, source_system, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            fact.transaction_id,
            fact.customer_sk,
            fact.product_id,
            format_ts(fact.event_time),
            fact.quantity,
            fact.unit_price,
            fact.amount,
            fact.source_system,
            format_ts(fact.created_at),
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn fact_count(conn: &Connection) -> Result<i64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM fact_transactions", [], |row| row.get(0))?;
    Ok(count)
}

pub fn get_fact(conn: &Connection, transaction_id: &str) -> Result<Option<FactRecord>> {
    let mut stmt = conn.prepare(
        "SELECT transaction_id, customer_sk, product_id, event_time,
                quantity, unit_price, amount, source_system, created_at
         FROM fact_transactions
         WHERE transaction_id = ?1",
    )?;

    let fact = stmt
        .query_row([transaction_id], |row| {
            let event_time_str: String = row.get(3)?;
            let created_at_str: String = row.get(8)?;

            Ok(FactRecord {
                transaction_id: row.get(0)?,
                customer_sk: row.get(1)?,
                product_id: row.get(2)?,
                event_time: parse_ts_sql(&event_time_str)?,
                quantity: row.get(4)?,
                unit_price: row.get(5)?,
                amount: row.get(6)?,
                source_system: row.get(7)?,
                created_at: parse_ts_sql(&created_at_str)?,
            })
        })
        .optional()?;

    Ok(fact)
}

// ============================================================================
// AUDIT STORAGE
// ============================================================================

pub fn insert_audit_entry(conn: &Connection, entry: &AuditEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (
            run_id, recorded_at, category, status, total, passed, failed, detail
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.run_id,
            format_ts(entry.recorded_at),
            entry.category.as_str(),
            entry.status.as_str(),
            entry.total,
            entry.passed,
            entry.failed,
            entry.detail,
        ],
    )?;

    Ok(())
}

pub fn audit_entries_for_run(conn: &Connection, run_id: &str) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, recorded_at, category, status, total, passed, failed, detail
         FROM audit_log
         WHERE run_id = ?1
         ORDER BY id",
    )?;

    let entries = stmt
        .query_map([run_id], |row| {
            let recorded_at_str: String = row.get(1)?;
            let category_str: String = row.get(2)?;
            let status_str: String = row.get(3)?;

            Ok(AuditEntry {
                run_id: row.get(0)?,
                recorded_at: parse_ts_sql(&recorded_at_str)?,
                category: RunCategory::parse(&category_str)
                    .ok_or(rusqlite::Error::InvalidQuery)?,
                status: RunStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
                total: row.get(4)?,
                passed: row.get(5)?,
                failed: row.get(6)?,
                detail: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

// ============================================================================
// TESTS
// ============================================================================
