use std::time::Duration;

use chrono::Utc;
use dumper::Dumper;
use shared::domain::BackupType;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

const MAX_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Spawns one task per scheduled type. Each task re-checks the newest
/// backup's age and dumps when it has gone stale, so a restart does not
/// reset the schedule.
pub fn spawn_schedules(dumper: &Dumper, schedules: Vec<(BackupType, u64)>) {
    for (backup_type, seconds) in schedules {
        let dumper = dumper.clone();
        tokio::spawn(run_schedule(
            dumper,
            backup_type,
            Duration::from_secs(seconds),
        ));
    }
}

async fn run_schedule(dumper: Dumper, backup_type: BackupType, every: Duration) {
    info!(%backup_type, every_seconds = every.as_secs(), "backup schedule started");
    let mut ticker = interval(every.min(MAX_CHECK_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match newest_backup_age(&dumper, &backup_type).await {
            Ok(Some(age)) if age < every => {}
            Ok(_) => {
                if let Err(error) = dumper.do_backup(&backup_type).await {
                    warn!(%backup_type, %error, "scheduled backup failed");
                }
            }
            Err(error) => {
                warn!(%backup_type, %error, "could not inspect existing backups");
            }
        }
    }
}

async fn newest_backup_age(
    dumper: &Dumper,
    backup_type: &BackupType,
) -> anyhow::Result<Option<Duration>> {
    let listing = dumper.get_backup_types_files_list().await?;
    let newest = listing
        .get(backup_type.as_str())
        .and_then(|files| files.first());
    Ok(newest.map(|file| (Utc::now() - file.modified_at).to_std().unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dumper::RetentionPolicy;

    use super::*;

    async fn test_dumper(root: &std::path::Path) -> Dumper {
        let database_url = format!(
            "sqlite://{}",
            root.join("source.db").to_string_lossy().replace('\\', "/")
        );
        let mut types = BTreeMap::new();
        types.insert(BackupType::from("daily"), RetentionPolicy { max_files: 3 });
        Dumper::new(&database_url, root.join("backups"), types)
            .await
            .expect("dumper")
    }

    #[tokio::test]
    async fn age_is_none_without_any_backup() {
        let root = tempfile::tempdir().expect("tempdir");
        let dumper = test_dumper(root.path()).await;

        let age = newest_backup_age(&dumper, &BackupType::from("daily"))
            .await
            .expect("age");
        assert!(age.is_none());
    }

    #[tokio::test]
    async fn fresh_backup_reports_a_small_age() {
        let root = tempfile::tempdir().expect("tempdir");
        let dumper = test_dumper(root.path()).await;
        dumper
            .do_backup(&BackupType::from("daily"))
            .await
            .expect("backup");

        let age = newest_backup_age(&dumper, &BackupType::from("daily"))
            .await
            .expect("age")
            .expect("one backup exists");
        assert!(age < Duration::from_secs(60));
    }
}
