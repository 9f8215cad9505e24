use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::SystemTime,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, TypeInfo, ValueRef,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use shared::{domain::BackupType, protocol::BackupFileInfo};

/// Extension every produced backup file carries.
pub const DEFAULT_EXTENSION: &str = ".sql.gz";

const FILE_NAME_PREFIX: &str = "backup__";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Failures surfaced to the caller. The `Display` text of each variant is a
/// message key the backend translates before showing it to the user;
/// underlying causes only go to the log.
#[derive(Debug, Error)]
pub enum DumperError {
    #[error("database_backup_type_invalid")]
    UnknownType(BackupType),
    #[error("database_backup_create_failed")]
    DumpFailed(anyhow::Error),
}

/// How many files of a backup type are kept after a new dump lands.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct RetentionPolicy {
    pub max_files: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_files: 10 }
    }
}

/// Handle to an existing backup file on disk.
#[derive(Debug, Clone)]
pub struct BackupFile {
    pub file_name: String,
    pub backup_type: BackupType,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl BackupFile {
    pub fn info(&self) -> BackupFileInfo {
        BackupFileInfo {
            file_name: self.file_name.clone(),
            backup_type: self.backup_type.clone(),
            size_bytes: self.size_bytes,
            modified_at: self.modified_at,
        }
    }
}

/// Produces, names, stores, enumerates, and prunes database backups.
///
/// Backups are plain SQL dumps of the source SQLite database, gzipped into
/// `<backup_dir>/<type>/backup__<timestamp>.sql.gz`. Each registered backup
/// type owns one subdirectory and a retention policy.
#[derive(Clone)]
pub struct Dumper {
    pool: Pool<Sqlite>,
    backup_dir: PathBuf,
    types: BTreeMap<BackupType, RetentionPolicy>,
    // Serializes simultaneous dump requests.
    backup_lock: Arc<Mutex<()>>,
}

impl Dumper {
    pub async fn new(
        database_url: &str,
        backup_dir: impl Into<PathBuf>,
        types: BTreeMap<BackupType, RetentionPolicy>,
    ) -> Result<Self> {
        let backup_dir = backup_dir.into();

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        for backup_type in types.keys() {
            let dir = backup_dir.join(backup_type.as_str());
            fs::create_dir_all(&dir).with_context(|| {
                format!("failed to create backup directory '{}'", dir.display())
            })?;
        }

        Ok(Self {
            pool,
            backup_dir,
            types,
            backup_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn backup_types(&self) -> impl Iterator<Item = &BackupType> {
        self.types.keys()
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Dumps the database into a new backup file of the given type and prunes
    /// that type's directory down to its retention limit.
    pub async fn do_backup(&self, backup_type: &BackupType) -> Result<BackupFileInfo, DumperError> {
        let Some(policy) = self.types.get(backup_type).copied() else {
            warn!(%backup_type, "backup requested for unregistered type");
            return Err(DumperError::UnknownType(backup_type.clone()));
        };

        let _guard = self.backup_lock.lock().await;

        let sql = self.dump_sql().await.map_err(|error| {
            warn!(%backup_type, %error, "database dump failed");
            DumperError::DumpFailed(error)
        })?;

        let file_name = format!(
            "{FILE_NAME_PREFIX}{}{DEFAULT_EXTENSION}",
            Utc::now().format(TIMESTAMP_FORMAT)
        );
        let type_dir = self.backup_dir.join(backup_type.as_str());
        let path = type_dir.join(&file_name);

        write_gzipped(&path, sql.as_bytes()).map_err(|error| {
            warn!(%backup_type, %error, "failed to write backup file");
            DumperError::DumpFailed(error)
        })?;

        if let Err(error) = prune_directory(&type_dir, policy.max_files) {
            // A failed prune leaves extra files around but the dump itself
            // succeeded.
            warn!(%backup_type, %error, "pruning old backups failed");
        }

        let file = backup_file_at(&path, backup_type).map_err(DumperError::DumpFailed)?;
        info!(%backup_type, file_name = %file.file_name, size_bytes = file.size_bytes, "backup created");
        Ok(file.info())
    }

    /// Looks up an existing backup file by name, scoped to one type when
    /// given. Absence is `Ok(None)`; names that try to leave the backup
    /// directory never resolve.
    pub async fn get_backup_file(
        &self,
        file_name: &str,
        backup_type: Option<&BackupType>,
    ) -> Result<Option<BackupFile>> {
        if !is_plain_file_name(file_name) {
            return Ok(None);
        }

        let candidates: Vec<&BackupType> = match backup_type {
            Some(requested) => match self.types.get_key_value(requested) {
                Some((known, _)) => vec![known],
                None => return Ok(None),
            },
            None => self.types.keys().collect(),
        };

        for candidate in candidates {
            let path = self.backup_dir.join(candidate.as_str()).join(file_name);
            if path.is_file() {
                return backup_file_at(&path, candidate).map(Some);
            }
        }

        Ok(None)
    }

    /// Enumerates every registered type's backups, newest first. Types
    /// without any backups map to an empty list.
    pub async fn get_backup_types_files_list(
        &self,
    ) -> Result<BTreeMap<String, Vec<BackupFileInfo>>> {
        let mut listing = BTreeMap::new();
        for backup_type in self.types.keys() {
            let mut files = self.list_files_for_type(backup_type)?;
            files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
            listing.insert(
                backup_type.as_str().to_string(),
                files.into_iter().map(|file| file.info()).collect(),
            );
        }
        Ok(listing)
    }

    fn list_files_for_type(&self, backup_type: &BackupType) -> Result<Vec<BackupFile>> {
        let dir = self.backup_dir.join(backup_type.as_str());
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }

        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read backup directory '{}'", dir.display()))?
        {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(DEFAULT_EXTENSION) {
                continue;
            }
            files.push(backup_file_at(&entry.path(), backup_type)?);
        }

        Ok(files)
    }

    /// Serializes the whole database to SQL text: schema from
    /// `sqlite_master`, one INSERT per row, then indexes, triggers, and
    /// views.
    async fn dump_sql(&self) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "-- database dump, generated {}", Utc::now().to_rfc3339())?;
        writeln!(out, "PRAGMA foreign_keys=OFF;")?;
        writeln!(out, "BEGIN TRANSACTION;")?;

        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to read table schema")?;

        for (name, create_sql) in tables {
            writeln!(out, "{create_sql};")?;

            let rows = sqlx::query(&format!("SELECT * FROM \"{name}\""))
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("failed to read rows of table '{name}'"))?;
            for row in rows {
                let mut values = Vec::with_capacity(row.len());
                for idx in 0..row.len() {
                    values.push(sql_literal(&row, idx)?);
                }
                writeln!(out, "INSERT INTO \"{name}\" VALUES ({});", values.join(","))?;
            }
        }

        let extras: Vec<String> = sqlx::query_scalar(
            "SELECT sql FROM sqlite_master \
             WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL \
             ORDER BY type, name",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to read index/trigger/view schema")?;
        for sql in extras {
            writeln!(out, "{sql};")?;
        }

        writeln!(out, "COMMIT;")?;
        Ok(out)
    }
}

/// Renders one column of a row as a SQL literal.
fn sql_literal(row: &SqliteRow, idx: usize) -> Result<String> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok("NULL".to_string());
    }

    let type_name = raw.type_info().name().to_string();
    match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => Ok(row.try_get::<i64, _>(idx)?.to_string()),
        "REAL" => Ok(row.try_get::<f64, _>(idx)?.to_string()),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get(idx)?;
            let mut hex = String::with_capacity(bytes.len() * 2);
            for byte in bytes {
                write!(hex, "{byte:02X}")?;
            }
            Ok(format!("X'{hex}'"))
        }
        _ => {
            let text: String = row.try_get(idx)?;
            Ok(format!("'{}'", text.replace('\'', "''")))
        }
    }
}

fn is_plain_file_name(file_name: &str) -> bool {
    !file_name.is_empty()
        && !file_name.contains('/')
        && !file_name.contains('\\')
        && file_name != "."
        && file_name != ".."
}

/// Gzips `contents` into `path`, going through a temp name so a crash never
/// leaves a half-written file under the final name.
fn write_gzipped(path: &Path, contents: &[u8]) -> Result<()> {
    let part_path = path.with_extension("part");
    let file = fs::File::create(&part_path)
        .with_context(|| format!("failed to create '{}'", part_path.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(contents)?;
    encoder.finish()?;
    fs::rename(&part_path, path)
        .with_context(|| format!("failed to move backup into '{}'", path.display()))?;
    Ok(())
}

fn backup_file_at(path: &Path, backup_type: &BackupType) -> Result<BackupFile> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to stat backup file '{}'", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("backup file has no usable name")?
        .to_string();
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    Ok(BackupFile {
        file_name,
        backup_type: backup_type.clone(),
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        modified_at: DateTime::<Utc>::from(modified),
    })
}

/// Keeps the newest `max_files` backups in `dir` and removes the rest.
fn prune_directory(dir: &Path, max_files: usize) -> Result<()> {
    let max_files = max_files.max(1);

    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        files.push((modified, entry.path()));
    }

    if files.len() <= max_files {
        return Ok(());
    }

    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in files.split_off(max_files) {
        info!(path = %path.display(), "removing expired backup");
        fs::remove_file(path)?;
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
