//! Background housekeeping: terminates sessions whose wall-clock budget ran
//! out while no actions were arriving, and (under the `auto_expire` policy)
//! sweeps old rendered frames.

use std::{
    fs,
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

use crate::{
    config::{CleanupPolicy, Config},
    session::Sessions,
};

const SWEEP_EVERY_TICKS: u64 = 60;

pub async fn run(sessions: Arc<Sessions>) {
    let mut ticks: u64 = 0;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        for session in sessions.all() {
            sessions.expire_if_stalled(&session);
        }

        ticks += 1;
        if sessions.config().cleanup_policy == CleanupPolicy::AutoExpire
            && ticks.is_multiple_of(SWEEP_EVERY_TICKS)
        {
            sweep_expired_images(sessions.config());
        }
    }
}

/// Deletes rendered frames older than the configured TTL, then any session
/// directories left empty.
pub fn sweep_expired_images(config: &Config) {
    let ttl = Duration::from_secs(config.temp_expire_hours * 3600);
    let Some(cutoff) = SystemTime::now().checked_sub(ttl) else {
        return;
    };

    let Ok(session_dirs) = fs::read_dir(&config.temp_images_dir) else {
        return;
    };

    let mut removed = 0usize;
    for session_dir in session_dirs.filter_map(|e| e.ok()) {
        let Ok(files) = fs::read_dir(session_dir.path()) else {
            continue;
        };

        let mut remaining = 0usize;
        for file in files.filter_map(|e| e.ok()) {
            let expired = file
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if expired {
                if let Err(e) = fs::remove_file(file.path()) {
                    warn!("failed to expire {}: {e}", file.path().display());
                    remaining += 1;
                } else {
                    removed += 1;
                }
            } else {
                remaining += 1;
            }
        }

        if remaining == 0 {
            let _ = fs::remove_dir(session_dir.path());
        }
    }

    if removed > 0 {
        debug!("expired {removed} rendered frames");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::Config;

    fn config_with_temp_dir(dir: &Path, temp_expire_hours: u64) -> Config {
        let mut config = Config::from_env();
        config.temp_images_dir = dir.to_path_buf();
        config.temp_expire_hours = temp_expire_hours;
        config
    }

    #[test]
    fn test_sweep_removes_old_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let session_dir = dir.path().join("session_a");
        fs::create_dir_all(&session_dir).unwrap();
        fs::write(session_dir.join("step_0.jpg"), b"jpeg").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // ttl of 0 hours: everything written before "now" is expired
        sweep_expired_images(&config_with_temp_dir(dir.path(), 0));
        assert!(!session_dir.exists());

        // a long ttl keeps fresh files
        let session_dir = dir.path().join("session_b");
        fs::create_dir_all(&session_dir).unwrap();
        fs::write(session_dir.join("step_0.jpg"), b"jpeg").unwrap();
        sweep_expired_images(&config_with_temp_dir(dir.path(), 24));
        assert!(session_dir.join("step_0.jpg").exists());
    }

    #[test]
    fn test_sweep_tolerates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_temp_dir(&dir.path().join("nope"), 1);
        sweep_expired_images(&config);
    }
}
