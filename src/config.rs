use std::{env, path::PathBuf, str::FromStr, sync::LazyLock};

use serde::Serialize;

pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_env);

/// What happens to the rendered perspective frames under
/// `temp_images/{session_id}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Never delete anything.
    KeepAll,
    /// Keep the frames of sessions that terminated normally, delete the rest.
    KeepOnComplete,
    /// Only the most recent frame of a session is kept on disk.
    DeleteOnSend,
    /// Delete the whole session directory once the session is terminal.
    DeleteOnSessionEnd,
    /// Frames older than `temp_expire_hours` are swept by the monitor task.
    AutoExpire,
}

impl FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_all" => Ok(Self::KeepAll),
            "keep_on_complete" => Ok(Self::KeepOnComplete),
            "delete_on_send" => Ok(Self::DeleteOnSend),
            "delete_on_session_end" => Ok(Self::DeleteOnSessionEnd),
            "auto_expire" => Ok(Self::AutoExpire),
            other => Err(format!("unknown cleanup policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,

    pub data_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub geofence_config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub temp_images_dir: PathBuf,

    pub zoom_level: u8,
    pub cleanup_policy: CleanupPolicy,
    pub temp_expire_hours: u64,

    pub render_width: u32,
    pub render_height: u32,
    pub render_default_fov: f64,

    pub prefetch_delay_min: f64,
    pub prefetch_delay_max: f64,
    pub prefetch_retry_max: u32,
    pub prefetch_retry_backoff: f64,
    pub prefetch_workers: usize,

    pub tile_base_url: String,
    pub metadata_base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let (render_width, render_height) = env::var("RENDER_OUTPUT_SIZE")
            .ok()
            .and_then(|s| parse_output_size(&s))
            .unwrap_or((1024, 768));

        Self {
            port: env_parsed("PORT", 8080),

            data_dir: env_path("DATA_DIR", "data"),
            tasks_dir: env_path("TASKS_DIR", "tasks"),
            geofence_config_path: env_path(
                "GEOFENCE_CONFIG_PATH",
                "config/geofence_config.json",
            ),
            logs_dir: env_path("LOGS_DIR", "logs"),
            temp_images_dir: env_path("TEMP_IMAGES_DIR", "temp_images"),

            zoom_level: env_parsed("PANORAMA_ZOOM_LEVEL", 2),
            cleanup_policy: env_parsed(
                "TEMP_IMAGE_CLEANUP_POLICY",
                CleanupPolicy::DeleteOnSessionEnd,
            ),
            temp_expire_hours: env_parsed("TEMP_IMAGE_EXPIRE_HOURS", 24),

            render_width,
            render_height,
            render_default_fov: env_parsed("RENDER_DEFAULT_FOV", 90.),

            prefetch_delay_min: env_parsed("PREFETCH_REQUEST_DELAY_MIN", 1.0),
            prefetch_delay_max: env_parsed("PREFETCH_REQUEST_DELAY_MAX", 3.0),
            prefetch_retry_max: env_parsed("PREFETCH_RETRY_MAX", 3),
            prefetch_retry_backoff: env_parsed("PREFETCH_RETRY_BACKOFF", 2.0),
            prefetch_workers: env_parsed("PREFETCH_PARALLEL_WORKERS", 4),

            tile_base_url: env::var("PRELOAD_TILE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9090/tiles".to_string()),
            metadata_base_url: env::var("PRELOAD_METADATA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9090/metadata".to_string()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cache.db")
    }

    pub fn panoramas_dir(&self) -> PathBuf {
        self.data_dir.join("panoramas")
    }
}

fn env_parsed<T: FromStr + Clone>(name: &str, default: T) -> T {
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!("invalid value for {name}: {raw:?}, using default");
            default
        }
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn parse_output_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}
