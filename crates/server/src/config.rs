use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use dumper::RetentionPolicy;
use serde::Deserialize;
use server_api::AdminUser;
use shared::domain::BackupType;

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
}

impl UserEntry {
    pub fn as_admin_user(&self) -> AdminUser {
        AdminUser {
            name: self.name.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeSettings {
    #[serde(default)]
    pub max_files: Option<usize>,
    /// When set, a background task keeps backups of this type no older than
    /// this many seconds. `manual` is never scheduled.
    #[serde(default)]
    pub interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub backup_dir: String,
    pub download_file_name_current: Option<String>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut types = BTreeMap::new();
        types.insert(
            BackupType::MANUAL.to_string(),
            TypeSettings {
                max_files: Some(10),
                interval_seconds: None,
            },
        );
        types.insert(
            "daily".to_string(),
            TypeSettings {
                max_files: Some(7),
                interval_seconds: Some(24 * 60 * 60),
            },
        );

        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/app.db".into(),
            backup_dir: "./data/backups".into(),
            download_file_name_current: Some("current_db".into()),
            users: Vec::new(),
            types,
        }
    }
}

impl Settings {
    /// Registered backup types with their retention limits, for the dumper.
    /// `manual` is always present even if the config file dropped it.
    pub fn retention(&self) -> BTreeMap<BackupType, RetentionPolicy> {
        let mut retention = BTreeMap::new();
        retention.insert(BackupType::manual(), RetentionPolicy::default());
        for (name, type_settings) in &self.types {
            let policy = type_settings
                .max_files
                .map(|max_files| RetentionPolicy { max_files })
                .unwrap_or_default();
            retention.insert(BackupType(name.clone()), policy);
        }
        retention
    }

    /// Types a background task should keep fresh: everything with an
    /// interval, except `manual`.
    pub fn schedules(&self) -> Vec<(BackupType, u64)> {
        self.types
            .iter()
            .filter(|(name, _)| name.as_str() != BackupType::MANUAL)
            .filter_map(|(name, type_settings)| {
                type_settings
                    .interval_seconds
                    .filter(|seconds| *seconds > 0)
                    .map(|seconds| (BackupType(name.clone()), seconds))
            })
            .collect()
    }
}

/// Partial settings as they appear in `backup.toml`; anything absent keeps
/// its default.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_bind: Option<String>,
    database_url: Option<String>,
    backup_dir: Option<String>,
    download_file_name_current: Option<String>,
    users: Option<Vec<UserEntry>>,
    types: Option<BTreeMap<String, TypeSettings>>,
}

pub fn load_settings() -> Settings {
    load_settings_from("backup.toml")
}

fn load_settings_from(path: impl AsRef<Path>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(error) => {
                tracing::warn!(%error, "ignoring unparsable config file");
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("BACKUP_DIR") {
        settings.backup_dir = v;
    }
    if let Ok(v) = std::env::var("DOWNLOAD_FILE_NAME_CURRENT") {
        settings.download_file_name_current = if v.is_empty() { None } else { Some(v) };
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_bind {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.backup_dir {
        settings.backup_dir = v;
    }
    if let Some(v) = file_cfg.download_file_name_current {
        settings.download_file_name_current = if v.is_empty() { None } else { Some(v) };
    }
    if let Some(v) = file_cfg.users {
        settings.users = v;
    }
    if let Some(v) = file_cfg.types {
        settings.types = v;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn retention_always_includes_manual() {
        let mut settings = Settings::default();
        settings.types.clear();

        let retention = settings.retention();
        assert!(retention.contains_key(&BackupType::manual()));
    }

    #[test]
    fn manual_is_never_scheduled() {
        let mut settings = Settings::default();
        settings.types.insert(
            BackupType::MANUAL.to_string(),
            TypeSettings {
                max_files: Some(3),
                interval_seconds: Some(60),
            },
        );

        let schedules = settings.schedules();
        assert!(schedules.iter().all(|(t, _)| !t.is_manual()));
        assert_eq!(schedules, vec![(BackupType::from("daily"), 24 * 60 * 60)]);
    }

    #[test]
    fn file_settings_override_defaults() {
        let raw = r#"
            server_bind = "0.0.0.0:9000"
            download_file_name_current = ""

            [[users]]
            name = "admin"
            token = "secret"
            [users.permissions]
            modules = ["database_backup"]

            [types.manual]
            max_files = 3
        "#;
        let file_cfg: FileSettings = toml::from_str(raw).expect("parse");
        let mut settings = Settings::default();
        apply_file_settings(&mut settings, file_cfg);

        assert_eq!(settings.server_bind, "0.0.0.0:9000");
        assert_eq!(settings.download_file_name_current, None);
        assert_eq!(settings.users.len(), 1);
        assert!(settings.users[0]
            .as_admin_user()
            .has_access("database_backup", "modules"));
        assert_eq!(settings.retention()[&BackupType::manual()].max_files, 3);
    }
}
