//! Persistent store for panorama metadata and equirectangular images.
//!
//! Metadata and indexes live in a single SQLite database (WAL mode so request
//! handlers can read while the preloader writes); image bytes live as plain
//! JPEG files under `data/panoramas/{pano_id}_z{N}.jpg`. The preloader is the
//! only writer of panorama data, everything on the request path is read-only.

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use eyre::{Context, bail};
use image::RgbImage;
use parking_lot::Mutex;
use quick_cache::sync::Cache as MemoryCache;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::{ApiError, ApiResult},
    model::{Link, Location, PanoId, PanoMetadata},
};

const META_MEMORY_CACHE_SIZE: usize = 4096;

pub struct Cache {
    conn: Mutex<Connection>,
    images_dir: PathBuf,
    /// Hot metadata records, so repeated observations don't hit SQLite.
    meta_cache: MemoryCache<PanoId, Arc<PanoMetadata>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub metadata_rows: u64,
    pub image_rows: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerProgress {
    pub player_id: String,
    pub task_id: String,
    pub session_id: String,
    pub status: String,
    pub score: Option<f64>,
    pub attempts: i64,
    pub last_attempt_at: i64,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Cache {
    pub fn open(db_path: PathBuf, images_dir: PathBuf) -> eyre::Result<Self> {
        info!("initializing cache at {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&images_dir)?;

        let conn = Connection::open(&db_path)
            .wrap_err_with(|| format!("failed to open {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS panoramas (
                pano_id TEXT NOT NULL,
                zoom INTEGER NOT NULL,
                image_path TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (pano_id, zoom)
            );
            CREATE TABLE IF NOT EXISTS metadata (
                pano_id TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                capture_date TEXT,
                center_heading REAL NOT NULL,
                links_json TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                source TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS locations (
                pano_id TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lng REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS player_progress (
                player_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                score REAL,
                attempts INTEGER NOT NULL,
                last_attempt_at INTEGER NOT NULL,
                PRIMARY KEY (player_id, task_id)
            );",
        )?;

        info!("finished initializing cache");

        Ok(Self {
            conn: Mutex::new(conn),
            images_dir,
            meta_cache: MemoryCache::new(META_MEMORY_CACHE_SIZE),
        })
    }

    // --- metadata ---

    pub fn has_meta(&self, pano: &PanoId) -> bool {
        if self.meta_cache.get(pano).is_some() {
            return true;
        }
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM metadata WHERE pano_id = ?1",
            params![pano.as_str()],
            |_| Ok(()),
        )
        .optional()
        .ok()
        .flatten()
        .is_some()
    }

    pub fn get_meta(&self, pano: &PanoId) -> Option<Arc<PanoMetadata>> {
        if let Some(meta) = self.meta_cache.get(pano) {
            return Some(meta);
        }

        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT lat, lng, capture_date, center_heading, links_json, fetched_at, source
                 FROM metadata WHERE pano_id = ?1",
                params![pano.as_str()],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .unwrap_or_default()?
        };

        let (lat, lng, capture_date, center_heading, links_json, fetched_at, source) = row;
        let mut links_bytes = links_json.into_bytes();
        let links: Vec<Link> = match simd_json::from_slice(&mut links_bytes) {
            Ok(links) => links,
            Err(e) => {
                warn!("corrupt links_json for pano {pano}: {e}");
                return None;
            }
        };

        let meta = Arc::new(PanoMetadata {
            id: pano.clone(),
            loc: Location::new(lat, lng),
            capture_date,
            center_heading,
            links,
            fetched_at,
            source,
        });
        self.meta_cache.insert(pano.clone(), meta.clone());
        Some(meta)
    }

    /// Fatal-per-request variant used by the runtime: a miss means an
    /// incomplete preload, not a transient condition.
    pub fn require_meta(&self, pano: &PanoId) -> ApiResult<Arc<PanoMetadata>> {
        self.get_meta(pano)
            .ok_or_else(|| ApiError::CacheMissMeta(pano.clone()))
    }

    /// Idempotent write; replaying the same metadata is a no-op apart from
    /// `fetched_at`.
    pub fn put_meta(&self, meta: &PanoMetadata) -> eyre::Result<()> {
        if !meta.loc.is_valid() {
            bail!("refusing to store invalid location {} for {}", meta.loc, meta.id);
        }

        let links_json = simd_json::to_string(&meta.links)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO metadata
             (pano_id, lat, lng, capture_date, center_heading, links_json, fetched_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                meta.id.as_str(),
                meta.loc.lat,
                meta.loc.lng,
                meta.capture_date,
                meta.center_heading,
                links_json,
                meta.fetched_at,
                meta.source,
            ],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO locations (pano_id, lat, lng) VALUES (?1, ?2, ?3)",
            params![meta.id.as_str(), meta.loc.lat, meta.loc.lng],
        )?;
        drop(conn);

        self.meta_cache
            .insert(meta.id.clone(), Arc::new(meta.clone()));
        Ok(())
    }

    pub fn get_location(&self, pano: &PanoId) -> Option<Location> {
        if let Some(meta) = self.meta_cache.get(pano) {
            return Some(meta.loc);
        }
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT lat, lng FROM locations WHERE pano_id = ?1",
            params![pano.as_str()],
            |row| Ok(Location::new(row.get(0)?, row.get(1)?)),
        )
        .optional()
        .unwrap_or_default()
    }

    // --- images ---

    pub fn image_path(&self, pano: &PanoId, zoom: u8) -> PathBuf {
        self.images_dir.join(format!("{pano}_z{zoom}.jpg"))
    }

    pub fn has_image(&self, pano: &PanoId, zoom: u8) -> bool {
        let row_path: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT image_path FROM panoramas WHERE pano_id = ?1 AND zoom = ?2",
                params![pano.as_str(), zoom],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_default()
        };
        row_path.is_some_and(|p| PathBuf::from(p).exists())
    }

    pub fn put_image(&self, pano: &PanoId, zoom: u8, bytes: &[u8]) -> eyre::Result<PathBuf> {
        if pano.as_str().contains(['/', '\\']) {
            bail!("pano id {pano} is not a valid file stem");
        }

        let path = self.image_path(pano, zoom);
        fs::write(&path, bytes)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO panoramas (pano_id, zoom, image_path, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                pano.as_str(),
                zoom,
                path.to_string_lossy().into_owned(),
                unix_now(),
            ],
        )?;
        Ok(path)
    }

    /// Reads and decodes a cached panorama. A corrupt file is reported and
    /// treated as a miss; the runtime never repairs the cache.
    pub fn decode_image(&self, pano: &PanoId, zoom: u8) -> ApiResult<RgbImage> {
        let row_path: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT image_path FROM panoramas WHERE pano_id = ?1 AND zoom = ?2",
                params![pano.as_str(), zoom],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_default()
        };
        let Some(path) = row_path else {
            return Err(ApiError::CacheMissImage(pano.clone(), zoom));
        };

        let bytes = fs::read(&path).map_err(|e| {
            warn!("cached image {path} unreadable: {e}");
            ApiError::CacheMissImage(pano.clone(), zoom)
        })?;

        match image::load_from_memory(&bytes) {
            Ok(img) => Ok(img.to_rgb8()),
            Err(e) => {
                warn!("cached image {path} is corrupt: {e}");
                Err(ApiError::CacheMissImage(pano.clone(), zoom))
            }
        }
    }

    // --- stats ---

    pub fn stats(&self) -> CacheStats {
        let conn = self.conn.lock();
        let metadata_rows = conn
            .query_row("SELECT COUNT(*) FROM metadata", [], |row| row.get::<_, u64>(0))
            .unwrap_or(0);
        let image_rows = conn
            .query_row("SELECT COUNT(*) FROM panoramas", [], |row| row.get::<_, u64>(0))
            .unwrap_or(0);
        CacheStats {
            metadata_rows,
            image_rows,
        }
    }

    // --- player progress ---

    pub fn record_attempt(
        &self,
        player_id: &str,
        task_id: &str,
        session_id: &str,
        status: &str,
        score: Option<f64>,
    ) -> eyre::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO player_progress
             (player_id, task_id, session_id, status, score, attempts, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(player_id, task_id) DO UPDATE SET
                session_id = excluded.session_id,
                status = excluded.status,
                score = excluded.score,
                attempts = player_progress.attempts + 1,
                last_attempt_at = excluded.last_attempt_at",
            params![player_id, task_id, session_id, status, score, unix_now()],
        )?;
        Ok(())
    }

    pub fn progress_for(&self, player_id: &str) -> eyre::Result<Vec<PlayerProgress>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT player_id, task_id, session_id, status, score, attempts, last_attempt_at
             FROM player_progress WHERE player_id = ?1 ORDER BY task_id",
        )?;
        let rows = stmt
            .query_map(params![player_id], |row| {
                Ok(PlayerProgress {
                    player_id: row.get(0)?,
                    task_id: row.get(1)?,
                    session_id: row.get(2)?,
                    status: row.get(3)?,
                    score: row.get(4)?,
                    attempts: row.get(5)?,
                    last_attempt_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
