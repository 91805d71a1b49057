use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use agreement_retirement_core::{
    from_unix_millis, CompiledQuery, Predicate, QueryField, RetirementError, RetirementOutcome,
    RetirementRecord, RetirementStore, SortField, SortOrder,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;
const RECORDS_FILE: &str = "agreement_retirements.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS agreement_retirements (
  agreement_id TEXT PRIMARY KEY CHECK (length(agreement_id) > 0),
  reason TEXT NOT NULL CHECK (length(reason) > 0),
  retired_at_ms INTEGER NOT NULL,
  retired_by TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_agreement_retirements_retired_at
  ON agreement_retirements(retired_at_ms, agreement_id);
CREATE INDEX IF NOT EXISTS idx_agreement_retirements_reason
  ON agreement_retirements(reason);
";

const SELECT_COLUMNS: &str = "agreement_id, reason, retired_at_ms, retired_by";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_existing_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed retirement store and configure required runtime pragmas.
    ///
    /// `busy_timeout` bounds how long any statement waits for a competing writer.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA case_sensitive_like = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to create retirement indexes")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration v2")?;
            version = current_schema_version(&self.conn)?;
            tracing::info!(version, "applied retirement store migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if table_exists(&self.conn, "agreement_retirements")? {
            // Table created outside the migration runner; adopt it as v1.
            if !table_has_column(&self.conn, "agreement_retirements", "retired_at_ms")? {
                return Err(anyhow!(
                    "database schema is invalid: agreement_retirements has no retired_at_ms column"
                ));
            }
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(1)
    }

    /// Insert `record` unless its agreement is already retired, inside a scoped
    /// `BEGIN IMMEDIATE` transaction. Dropping the transaction on any error path
    /// rolls it back.
    ///
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] for invalid records,
    /// [`RetirementError::TransientStoreFailure`] when the database is busy or unreachable,
    /// and [`RetirementError::Persistence`] otherwise.
    pub fn insert_if_absent(&mut self, record: &RetirementRecord) -> Result<RetirementOutcome, RetirementError> {
        record.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;
        let outcome = Self::insert_if_absent_in(&tx, record)?;
        tx.commit().map_err(classify)?;
        Ok(outcome)
    }

    /// Insert within a transaction owned by the caller. Nothing is committed here.
    ///
    /// # Errors
    /// See [`SqliteStore::insert_if_absent`].
    pub fn insert_if_absent_in(
        tx: &Transaction<'_>,
        record: &RetirementRecord,
    ) -> Result<RetirementOutcome, RetirementError> {
        record.validate()?;
        let inserted = tx
            .execute(
                "INSERT INTO agreement_retirements(agreement_id, reason, retired_at_ms, retired_by)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agreement_id) DO NOTHING",
                params![
                    record.agreement_id,
                    record.reason,
                    record.retired_at_millis(),
                    record.retired_by,
                ],
            )
            .map_err(classify)?;

        let stored = Self::get_in(tx, &record.agreement_id)?.ok_or_else(|| {
            RetirementError::Persistence(format!(
                "retirement for {} missing after insert",
                record.agreement_id
            ))
        })?;
        Ok(RetirementOutcome { record: stored, was_new: inserted == 1 })
    }

    /// # Errors
    /// See [`SqliteStore::insert_if_absent`].
    pub fn get(&self, agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError> {
        Self::get_in(&self.conn, agreement_id)
    }

    /// Point lookup on any connection, including an open transaction.
    ///
    /// # Errors
    /// See [`SqliteStore::insert_if_absent`].
    pub fn get_in(conn: &Connection, agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError> {
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM agreement_retirements WHERE agreement_id = ?1"),
                params![agreement_id],
                read_row,
            )
            .optional()
            .map_err(classify)?;
        row.map(into_record).transpose()
    }

    /// # Errors
    /// See [`SqliteStore::insert_if_absent`].
    pub fn query(&self, query: &CompiledQuery) -> Result<Vec<RetirementRecord>, RetirementError> {
        let (sql, values) = build_select(query);
        let mut stmt = self.conn.prepare(&sql).map_err(classify)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), read_row).map_err(classify)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(row.map_err(classify)?)?);
        }
        Ok(records)
    }

    /// Run `work` inside one scoped transaction on this connection. The transaction
    /// commits when `work` returns `Ok` and rolls back on every other exit path.
    ///
    /// # Errors
    /// Propagates the error returned by `work`, or a store error from begin/commit.
    pub fn transaction<T, F>(&mut self, work: F) -> Result<T, RetirementError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, RetirementError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;
        let value = work(&tx)?;
        tx.commit().map_err(classify)?;
        Ok(value)
    }

    /// Load every record in the canonical sort order.
    ///
    /// # Errors
    /// See [`SqliteStore::insert_if_absent`].
    pub fn list_all(&self) -> Result<Vec<RetirementRecord>, RetirementError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM agreement_retirements
                 ORDER BY retired_at_ms ASC, agreement_id ASC"
            ))
            .map_err(classify)?;
        let rows = stmt.query_map([], read_row).map_err(classify)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(row.map_err(classify)?)?);
        }
        Ok(records)
    }

    /// Export all retirements as deterministic NDJSON plus a SHA-256 manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list_all()?;
        let (sha256, count) = write_ndjson_file(&out_dir.join(RECORDS_FILE), &records)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest { path: RECORDS_FILE.to_string(), sha256, records: count }],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot. Agreements that are already retired keep their
    /// existing record and are counted as skipped.
    ///
    /// # Errors
    /// Returns an error when the manifest does not verify or any insert fails.
    pub fn import_snapshot(&mut self, in_dir: &Path) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let records = read_ndjson_file::<RetirementRecord>(&in_dir.join(RECORDS_FILE))?;
        let mut summary = ImportSummary { imported_records: 0, skipped_existing_records: 0 };
        self.transaction(|tx| {
            for record in &records {
                if Self::insert_if_absent_in(tx, record)?.was_new {
                    summary.imported_records += 1;
                } else {
                    summary.skipped_existing_records += 1;
                }
            }
            Ok(())
        })?;
        Ok(summary)
    }

    /// Run quick-check plus schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let record_count = if table_exists(&self.conn, "agreement_retirements")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM agreement_retirements", [], |row| row.get(0))
                .context("failed to count retirement records")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_count,
            schema_status: self.schema_status()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteStoreOptions {
    pub busy_timeout: Duration,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self { busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

/// [`RetirementStore`] over a database file. Every operation opens its own
/// connection, so the handle is cheap to share across request threads.
#[derive(Debug, Clone)]
pub struct SqliteRetirementStore {
    db_path: PathBuf,
    options: SqliteStoreOptions,
}

impl SqliteRetirementStore {
    /// Open the database at `db_path` and migrate it to the latest schema.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(db_path: impl Into<PathBuf>, options: SqliteStoreOptions) -> Result<Self> {
        let db_path = db_path.into();
        let mut store = SqliteStore::open(&db_path, options.busy_timeout)?;
        store.migrate()?;
        Ok(Self { db_path, options })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// # Errors
    /// Returns [`RetirementError::TransientStoreFailure`] when the database cannot be opened.
    pub fn connect(&self) -> Result<SqliteStore, RetirementError> {
        SqliteStore::open(&self.db_path, self.options.busy_timeout)
            .map_err(|err| RetirementError::TransientStoreFailure(format!("{err:#}")))
    }

    /// Participate in a larger unit of work: `work` receives the open transaction and
    /// may combine retirement writes with its own statements.
    ///
    /// # Errors
    /// See [`SqliteStore::transaction`].
    pub fn with_transaction<T, F>(&self, work: F) -> Result<T, RetirementError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, RetirementError>,
    {
        self.connect()?.transaction(work)
    }
}

impl RetirementStore for SqliteRetirementStore {
    fn insert_if_absent(&self, record: &RetirementRecord) -> Result<RetirementOutcome, RetirementError> {
        self.connect()?.insert_if_absent(record)
    }

    fn get_by_agreement_id(&self, agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError> {
        self.connect()?.get(agreement_id)
    }

    fn query(&self, query: &CompiledQuery) -> Result<Vec<RetirementRecord>, RetirementError> {
        self.connect()?.query(query)
    }
}

type RawRow = (String, String, i64, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_record((agreement_id, reason, retired_at_ms, retired_by): RawRow) -> Result<RetirementRecord, RetirementError> {
    Ok(RetirementRecord {
        agreement_id,
        reason,
        retired_at: from_unix_millis(retired_at_ms)?,
        retired_by,
    })
}

/// Map SQLite failures onto the store error taxonomy.
fn classify(err: rusqlite::Error) -> RetirementError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
            ) =>
        {
            RetirementError::TransientStoreFailure(err.to_string())
        }
        _ => RetirementError::Persistence(err.to_string()),
    }
}

fn column(field: QueryField) -> &'static str {
    match field {
        QueryField::AgreementId => "agreement_id",
        QueryField::Reason => "reason",
        QueryField::RetiredBy => "retired_by",
        QueryField::RetiredAt => "retired_at_ms",
    }
}

fn build_select(query: &CompiledQuery) -> (String, Vec<Value>) {
    let mut clauses = Vec::with_capacity(query.predicates.len());
    let mut values = Vec::new();

    for predicate in &query.predicates {
        match predicate {
            Predicate::TextEq { field, value } => {
                clauses.push(format!("{} = ?", column(*field)));
                values.push(Value::Text(value.clone()));
            }
            Predicate::TextLike { field, pattern } => {
                clauses.push(format!("{} LIKE ? ESCAPE '\\'", column(*field)));
                values.push(Value::Text(pattern.clone()));
            }
            Predicate::TextIn { field, values: candidates } => {
                let placeholders = vec!["?"; candidates.len()].join(", ");
                clauses.push(format!("{} IN ({placeholders})", column(*field)));
                values.extend(candidates.iter().cloned().map(Value::Text));
            }
            Predicate::AtEq(at) => {
                clauses.push("retired_at_ms = ?".to_string());
                values.push(Value::Integer(*at));
            }
            Predicate::AtGt(at) => {
                clauses.push("retired_at_ms > ?".to_string());
                values.push(Value::Integer(*at));
            }
            Predicate::AtLt(at) => {
                clauses.push("retired_at_ms < ?".to_string());
                values.push(Value::Integer(*at));
            }
            Predicate::AtBetween(from, to) => {
                clauses.push("retired_at_ms BETWEEN ? AND ?".to_string());
                values.push(Value::Integer(*from));
                values.push(Value::Integer(*to));
            }
        }
    }

    let direction = match query.sort_order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    let order_by = match query.sort_field {
        SortField::RetiredAt => format!("retired_at_ms {direction}, agreement_id {direction}"),
        SortField::AgreementId => format!("agreement_id {direction}"),
    };
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    values.push(Value::Integer(i64::from(query.limit)));
    values.push(Value::Integer(i64::from(query.offset)));
    (
        format!(
            "SELECT {SELECT_COLUMNS} FROM agreement_retirements{where_clause} ORDER BY {order_by} LIMIT ? OFFSET ?"
        ),
        values,
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_has_column(conn, "agreement_retirements", "retired_at_ms")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((hex::encode(hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let Some(expected) = manifest.files.iter().find(|file| file.path == RECORDS_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {RECORDS_FILE}"));
    };

    let file_path = in_dir.join(RECORDS_FILE);
    let bytes = fs::read(&file_path)
        .with_context(|| format!("manifest references missing file {}", file_path.display()))?;
    let actual_sha256 = hex::encode(Sha256::digest(&bytes));
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {RECORDS_FILE}: expected {}, got {actual_sha256}",
            expected.sha256
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use agreement_retirement_core::{
        Criterion, CriterionValue, InMemoryRetirementStore, Operator, QuerySpec, RetirementQuery,
        MANUAL_REASON,
    };
    use ulid::Ulid;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("agreement-retirement-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn at(offset_secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000 + offset_secs)
    }

    fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"), DEFAULT_BUSY_TIMEOUT)?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn migrate_creates_latest_schema() -> Result<()> {
        let store = memory_store()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_adopts_table_created_without_migration_records() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"), DEFAULT_BUSY_TIMEOUT)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 1);
        assert!(before.inferred_from_legacy);
        assert_eq!(before.pending_versions, vec![2]);

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 2);
        Ok(())
    }

    #[test]
    fn check_constraints_reject_blank_identity() -> Result<()> {
        let store = memory_store()?;
        let result = store.conn.execute(
            "INSERT INTO agreement_retirements(agreement_id, reason, retired_at_ms, retired_by)
             VALUES ('', 'MANUAL', 0, 'tester')",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn insert_if_absent_is_idempotent_and_keeps_first_record() -> Result<()> {
        let mut store = memory_store()?;
        let first = store.insert_if_absent(&RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))?;
        let second = store.insert_if_absent(&RetirementRecord::new("a-1", "EXPIRED", "bob", at(30)))?;

        assert!(first.was_new);
        assert!(!second.was_new);
        assert_eq!(second.record.reason, MANUAL_REASON);
        assert_eq!(second.record.retired_by, "alice");
        assert_eq!(second.record.retired_at, at(0));
        Ok(())
    }

    #[test]
    fn invalid_record_is_rejected_without_write() -> Result<()> {
        let mut store = memory_store()?;
        let result = store.insert_if_absent(&RetirementRecord::new("a-1", " ", "alice", at(0)));
        assert!(matches!(result, Err(RetirementError::InvalidArgument(_))));
        assert!(store.get("a-1")?.is_none());
        Ok(())
    }

    #[test]
    fn failed_ambient_transaction_rolls_back_retirement() -> Result<()> {
        let mut store = memory_store()?;
        let result: Result<(), RetirementError> = store.transaction(|tx| {
            SqliteStore::insert_if_absent_in(tx, &RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))?;
            Err(RetirementError::Persistence("enclosing unit of work failed".to_string()))
        });
        assert!(result.is_err());
        assert!(store.get("a-1")?.is_none());

        store.transaction(|tx| {
            SqliteStore::insert_if_absent_in(tx, &RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))
        })?;
        assert!(store.get("a-1")?.is_some());
        Ok(())
    }

    #[test]
    fn like_queries_are_case_sensitive() -> Result<()> {
        let mut store = memory_store()?;
        store.insert_if_absent(&RetirementRecord::new("agr-1", MANUAL_REASON, "alice", at(0)))?;
        store.insert_if_absent(&RetirementRecord::new("AGR-2", MANUAL_REASON, "alice", at(1)))?;

        let query = RetirementQuery { agreement_id_prefix: Some("agr-".to_string()), ..RetirementQuery::default() }
            .compile()?;
        let found = store.query(&query)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agreement_id, "agr-1");
        Ok(())
    }

    #[test]
    fn like_with_trailing_escape_matches_nothing_in_either_store() -> Result<()> {
        let mut store = memory_store()?;
        let memory = InMemoryRetirementStore::new();
        for id in ["abc", "abc\\"] {
            let record = RetirementRecord::new(id, MANUAL_REASON, "alice", at(0));
            store.insert_if_absent(&record)?;
            memory.insert_if_absent(&record)?;
        }

        let query = QuerySpec {
            criteria: vec![Criterion::new(
                QueryField::AgreementId,
                Operator::Like,
                CriterionValue::One("abc\\".to_string()),
            )],
            ..QuerySpec::default()
        }
        .compile()?;
        assert!(store.query(&query)?.is_empty());
        assert!(memory.query(&query)?.is_empty());
        Ok(())
    }

    #[test]
    fn raw_criteria_translate_to_sql() -> Result<()> {
        let mut store = memory_store()?;
        store.insert_if_absent(&RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))?;
        store.insert_if_absent(&RetirementRecord::new("a-2", "POLICY_VIOLATION:c-1", "policy-monitor", at(10)))?;
        store.insert_if_absent(&RetirementRecord::new("a-3", "EXPIRED", "policy-monitor", at(20)))?;

        let spec = QuerySpec {
            criteria: vec![
                Criterion::new(
                    QueryField::RetiredBy,
                    Operator::In,
                    CriterionValue::Many(vec!["policy-monitor".into(), "nobody".into()]),
                ),
                Criterion::new(
                    QueryField::RetiredAt,
                    Operator::Between,
                    CriterionValue::Many(vec!["1700000000".into(), "1700000010".into()]),
                ),
            ],
            sort_order: SortOrder::Desc,
            ..QuerySpec::default()
        };
        let found = store.query(&spec.compile()?)?;
        assert_eq!(found.iter().map(|r| r.agreement_id.as_str()).collect::<Vec<_>>(), vec!["a-2"]);

        let all_desc = QuerySpec { sort_order: SortOrder::Desc, ..QuerySpec::default() }.compile()?;
        let ids = store.query(&all_desc)?.into_iter().map(|r| r.agreement_id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a-3", "a-2", "a-1"]);
        Ok(())
    }

    #[test]
    fn paging_visits_every_record_exactly_once_in_order() -> Result<()> {
        let mut store = memory_store()?;
        // Several records share a timestamp so the agreement_id tie-break is exercised.
        for index in 0..37_i64 {
            store.insert_if_absent(&RetirementRecord::new(
                format!("agreement-{:02}", 36 - index),
                MANUAL_REASON,
                "pager",
                at(index / 4),
            ))?;
        }

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = store.query(
                &RetirementQuery { offset: Some(offset), limit: Some(5), ..RetirementQuery::default() }
                    .compile()?,
            )?;
            if page.is_empty() {
                break;
            }
            offset += u32::try_from(page.len())?;
            seen.extend(page);
        }

        assert_eq!(seen.len(), 37);
        let unique = seen.iter().map(|r| r.agreement_id.clone()).collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), 37);
        assert!(seen.windows(2).all(|pair| {
            (pair[0].retired_at, &pair[0].agreement_id) < (pair[1].retired_at, &pair[1].agreement_id)
        }));
        Ok(())
    }

    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let source_path = unique_temp_db_path();
        let target_path = unique_temp_db_path();
        let export_dir = std::env::temp_dir().join(format!("agreement-retirement-export-{}", Ulid::new()));

        let mut source = SqliteStore::open(&source_path, DEFAULT_BUSY_TIMEOUT)?;
        source.migrate()?;
        source.insert_if_absent(&RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))?;
        source.insert_if_absent(&RetirementRecord::new("a-2", "EXPIRED", "policy-monitor", at(1)))?;
        let manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files[0].records, 2);

        let mut target = SqliteStore::open(&target_path, DEFAULT_BUSY_TIMEOUT)?;
        target.migrate()?;
        target.insert_if_absent(&RetirementRecord::new("a-1", "EXPIRED", "someone-else", at(99)))?;
        let summary = target.import_snapshot(&export_dir)?;
        assert_eq!(summary, ImportSummary { imported_records: 1, skipped_existing_records: 1 });
        assert_eq!(target.get("a-1")?.map(|r| r.retired_by), Some("someone-else".to_string()));

        fs::write(export_dir.join(RECORDS_FILE), "{}\n")?;
        assert!(target.import_snapshot(&export_dir).is_err());

        let _ = fs::remove_dir_all(&export_dir);
        cleanup(&source_path);
        cleanup(&target_path);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = memory_store()?;
        store.insert_if_absent(&RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.record_count, 1);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn concurrent_retirements_of_one_agreement_have_one_winner() -> Result<()> {
        let db_path = unique_temp_db_path();
        let store = SqliteRetirementStore::open(&db_path, SqliteStoreOptions::default())?;

        let threads = 6;
        let barrier = Arc::new(Barrier::new(threads));
        let handles = (0..threads)
            .map(|index| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.insert_if_absent(&RetirementRecord::new(
                        "contested",
                        format!("reason-{index}"),
                        format!("racer-{index}"),
                        at(0),
                    ))
                })
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::new();
        for handle in handles {
            let Ok(outcome) = handle.join() else {
                return Err(anyhow!("retirement thread panicked"));
            };
            outcomes.push(outcome?);
        }

        assert_eq!(outcomes.iter().filter(|outcome| outcome.was_new).count(), 1);
        let winner = store
            .get_by_agreement_id("contested")?
            .ok_or_else(|| anyhow!("winning record missing"))?;
        assert!(outcomes.iter().all(|outcome| outcome.record == winner));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn with_transaction_commits_alongside_caller_statements() -> Result<()> {
        let db_path = unique_temp_db_path();
        let store = SqliteRetirementStore::open(&db_path, SqliteStoreOptions::default())?;
        store.with_transaction(|tx| {
            tx.execute_batch("CREATE TABLE IF NOT EXISTS enforcement_log (agreement_id TEXT NOT NULL)")
                .map_err(|err| RetirementError::Persistence(err.to_string()))?;
            tx.execute("INSERT INTO enforcement_log(agreement_id) VALUES ('a-1')", [])
                .map_err(|err| RetirementError::Persistence(err.to_string()))?;
            SqliteStore::insert_if_absent_in(tx, &RetirementRecord::new("a-1", MANUAL_REASON, "alice", at(0)))
        })?;

        assert!(store.get_by_agreement_id("a-1")?.is_some());
        cleanup(&db_path);
        Ok(())
    }
}
