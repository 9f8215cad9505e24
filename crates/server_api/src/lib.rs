use std::{collections::HashMap, sync::Arc};

use dumper::{BackupFile, Dumper, DEFAULT_EXTENSION};
use shared::{
    domain::BackupType,
    error::{ApiError, ErrorCode},
    protocol::{FlashMessage, ListingPage},
};
use tokio::sync::Mutex;
use tracing::info;

/// Capability and category guarding every operation of this module.
pub const MODULE_PERMISSION: &str = "database_backup";
pub const MODULE_CATEGORY: &str = "modules";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdminUser {
    pub name: String,
    /// Permission category to granted capabilities.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
}

impl AdminUser {
    pub fn has_access(&self, capability: &str, category: &str) -> bool {
        self.permissions
            .get(category)
            .is_some_and(|granted| granted.iter().any(|entry| entry == capability))
    }
}

/// One-time message queues, keyed by user. A message is shown on the next
/// rendered listing and then discarded.
#[derive(Clone, Default)]
pub struct FlashStore {
    queues: Arc<Mutex<HashMap<String, Vec<FlashMessage>>>>,
}

impl FlashStore {
    pub async fn push(&self, user: &str, message: FlashMessage) {
        let mut queues = self.queues.lock().await;
        queues.entry(user.to_string()).or_default().push(message);
    }

    pub async fn drain(&self, user: &str) -> Vec<FlashMessage> {
        let mut queues = self.queues.lock().await;
        queues.remove(user).unwrap_or_default()
    }
}

/// Message-key catalog. An unregistered key translates to itself, so error
/// texts that are not keys pass through unchanged.
#[derive(Clone, Default)]
pub struct Translator;

const CATALOG: &[(&str, &str)] = &[
    (
        "database_backup_create_successful",
        "The database backup was created successfully.",
    ),
    (
        "database_backup_create_not_allowed",
        "Only manual backups can be created from here.",
    ),
    (
        "database_backup_not_found",
        "The requested backup file could not be found.",
    ),
    (
        "database_backup_type_invalid",
        "The requested backup type is not configured.",
    ),
    (
        "database_backup_create_failed",
        "Creating the database backup failed. See the server log for details.",
    ),
];

impl Translator {
    pub fn trans(&self, key: &str) -> String {
        CATALOG
            .iter()
            .find(|(id, _)| *id == key)
            .map(|(_, text)| (*text).to_string())
            .unwrap_or_else(|| key.to_string())
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub dumper: Dumper,
    pub flash: FlashStore,
    pub translator: Translator,
    /// When set, an unscoped download is suggested under this name plus the
    /// dumper's default extension instead of the stored file name.
    pub download_file_name_current: Option<String>,
}

/// A resolved download: the file on disk and the name to suggest to the
/// client.
#[derive(Debug, Clone)]
pub struct ResolvedDownload {
    pub file: BackupFile,
    pub download_name: String,
}

pub fn ensure_access(user: &AdminUser) -> Result<(), ApiError> {
    if !user.has_access(MODULE_PERMISSION, MODULE_CATEGORY) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            format!("not enough permissions to access {MODULE_PERMISSION}"),
        ));
    }
    Ok(())
}

/// Attempts to create a backup of the given type and queues the outcome as a
/// flash message. The caller always answers with a redirect to the listing.
///
/// A non-`manual` type queues a warning but the attempt still goes ahead;
/// whether such requests should be rejected outright is an open question, so
/// the historical behavior is kept.
pub async fn create_backup(
    ctx: &ApiContext,
    user: &AdminUser,
    create_type: &str,
) -> Result<(), ApiError> {
    ensure_access(user)?;

    let backup_type = BackupType::from(create_type);
    if !backup_type.is_manual() {
        ctx.flash
            .push(
                &user.name,
                FlashMessage::warning(ctx.translator.trans("database_backup_create_not_allowed")),
            )
            .await;
    }

    match ctx.dumper.do_backup(&backup_type).await {
        Ok(info) => {
            info!(user = %user.name, file_name = %info.file_name, "backup created on request");
            ctx.flash
                .push(
                    &user.name,
                    FlashMessage::confirmation(
                        ctx.translator.trans("database_backup_create_successful"),
                    ),
                )
                .await;
        }
        Err(error) => {
            // The error's display text doubles as the translation key.
            ctx.flash
                .push(
                    &user.name,
                    FlashMessage::error(ctx.translator.trans(&error.to_string())),
                )
                .await;
        }
    }

    Ok(())
}

/// Resolves a backup file for download. `Ok(None)` means the name did not
/// resolve; an error flash is queued and the caller answers with the
/// redirect.
pub async fn download_backup(
    ctx: &ApiContext,
    user: &AdminUser,
    file_name: &str,
    backup_type: Option<BackupType>,
) -> Result<Option<ResolvedDownload>, ApiError> {
    ensure_access(user)?;

    let file = ctx
        .dumper
        .get_backup_file(file_name, backup_type.as_ref())
        .await
        .map_err(internal)?;

    let Some(file) = file else {
        ctx.flash
            .push(
                &user.name,
                FlashMessage::error(ctx.translator.trans("database_backup_not_found")),
            )
            .await;
        return Ok(None);
    };

    let download_name = match (&backup_type, &ctx.download_file_name_current) {
        (None, Some(current)) if !current.is_empty() => {
            format!("{current}{DEFAULT_EXTENSION}")
        }
        _ => file.file_name.clone(),
    };

    Ok(Some(ResolvedDownload {
        file,
        download_name,
    }))
}

/// Builds the listing page: back link, drained flash messages, and the
/// backups grouped by type.
pub async fn list_backups(
    ctx: &ApiContext,
    user: &AdminUser,
    back_url: &str,
) -> Result<ListingPage, ApiError> {
    ensure_access(user)?;

    let messages = ctx.flash.drain(&user.name).await;
    let backup_types = ctx
        .dumper
        .get_backup_types_files_list()
        .await
        .map_err(internal)?;

    Ok(ListingPage {
        back_url: back_url.to_string(),
        messages,
        backup_types,
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
