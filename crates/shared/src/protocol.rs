use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BackupType, FlashLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFileInfo {
    pub file_name: String,
    pub backup_type: BackupType,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// One-time notice queued by an action and shown on the next rendered
/// listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashMessage {
    pub level: FlashLevel,
    pub message: String,
}

impl FlashMessage {
    pub fn confirmation(message: impl Into<String>) -> Self {
        Self {
            level: FlashLevel::Confirmation,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: FlashLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: FlashLevel::Error,
            message: message.into(),
        }
    }
}

/// Payload backing the module's listing view: back link, pending flash
/// messages, and the available backups grouped by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPage {
    pub back_url: String,
    pub messages: Vec<FlashMessage>,
    pub backup_types: BTreeMap<String, Vec<BackupFileInfo>>,
}
