use std::fmt;

use serde::{Deserialize, Serialize};

/// Category tag distinguishing how a backup was produced (`manual`, or a
/// scheduled tier such as `daily`). Types other than `manual` are defined by
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupType(pub String);

impl BackupType {
    pub const MANUAL: &'static str = "manual";

    pub fn manual() -> Self {
        Self(Self::MANUAL.to_string())
    }

    pub fn is_manual(&self) -> bool {
        self.0 == Self::MANUAL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackupType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashLevel {
    Confirmation,
    Warning,
    Error,
}
