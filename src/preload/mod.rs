//! Offline cache-fill pipeline.
//!
//! One job per geofence: every pano id in the fence ends up with a metadata
//! row and an assembled equirectangular image at the configured zoom. Only
//! missing items are fetched, a fixed-size worker pool drains the queue, and
//! every upstream request goes through the per-source rate limiter.

pub mod source;

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use coarsetime::Instant;
use image::{GenericImage, RgbImage};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    cache::{Cache, unix_now},
    config::Config,
    geofence::GeofenceSet,
    model::{PanoId, TILE_SIZE, tile_grid},
    preload::source::{FetchError, MetadataSource, TileSource, ingest_metadata},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadState {
    Running,
    Completed,
    CompletedWithErrors,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloadProgress {
    pub status: PreloadState,
    pub done: usize,
    pub total: usize,
    pub percentage: f64,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub delay_min: f64,
    pub delay_max: f64,
    pub retry_max: u32,
    pub retry_backoff: f64,
    pub workers: usize,
}

impl PreloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delay_min: config.prefetch_delay_min,
            delay_max: config.prefetch_delay_max,
            retry_max: config.prefetch_retry_max.max(1),
            retry_backoff: config.prefetch_retry_backoff,
            workers: config.prefetch_workers.max(1),
        }
    }
}

/// Random delay between requests to the same upstream provider.
pub struct RateLimiter {
    delay_min: f64,
    delay_max: f64,
}

impl RateLimiter {
    pub fn new(delay_min: f64, delay_max: f64) -> Self {
        let delay_min = delay_min.max(0.);
        Self {
            delay_min,
            delay_max: delay_max.max(delay_min),
        }
    }

    pub async fn wait(&self) {
        let delay = if self.delay_max > 0. {
            rand::rng().random_range(self.delay_min..=self.delay_max)
        } else {
            0.
        };
        if delay > 0. {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }
}

pub struct PreloadJob {
    pub geofence: String,
    pub zoom: u8,
    total: usize,
    done: AtomicUsize,
    failures: Mutex<Vec<(PanoId, String)>>,
    state: RwLock<PreloadState>,
}

impl PreloadJob {
    pub fn progress(&self) -> PreloadProgress {
        let done = self.done.load(Ordering::Relaxed);
        let failed = self.failures.lock().len();
        PreloadProgress {
            status: *self.state.read(),
            done,
            total: self.total,
            percentage: if self.total == 0 {
                100.
            } else {
                done as f64 / self.total as f64 * 100.
            },
            failed,
        }
    }

    pub fn failures(&self) -> Vec<(PanoId, String)> {
        self.failures.lock().clone()
    }
}

#[derive(Clone, Copy)]
struct WorkItem<'a> {
    pano: &'a PanoId,
    needs_meta: bool,
    needs_image: bool,
}

#[derive(Default)]
pub struct PreloadRegistry {
    jobs: Mutex<FxHashMap<String, Arc<PreloadJob>>>,
}

impl PreloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, geofence: &str) -> Option<Arc<PreloadJob>> {
        self.jobs.lock().get(geofence).cloned()
    }

    /// Starts (or joins) the preload job for a geofence. Items already in the
    /// cache are never re-fetched, so preloading a fully cached geofence makes
    /// zero upstream requests.
    pub fn start(
        &self,
        geofence_name: &str,
        fence: &GeofenceSet,
        zoom: u8,
        cache: Arc<Cache>,
        tiles: Arc<dyn TileSource>,
        metadata: Arc<dyn MetadataSource>,
        settings: PreloadSettings,
    ) -> Arc<PreloadJob> {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get(geofence_name)
            && *existing.state.read() == PreloadState::Running
        {
            return existing.clone();
        }

        let mut queue = VecDeque::new();
        for pano in fence {
            let needs_meta = !cache.has_meta(pano);
            let needs_image = !cache.has_image(pano, zoom);
            if needs_meta || needs_image {
                queue.push_back(OwnedWorkItem {
                    pano: pano.clone(),
                    needs_meta,
                    needs_image,
                });
            }
        }

        let total = fence.len();
        let missing = queue.len();
        let job = Arc::new(PreloadJob {
            geofence: geofence_name.to_string(),
            zoom,
            total,
            done: AtomicUsize::new(total - missing),
            failures: Mutex::new(Vec::new()),
            state: RwLock::new(if missing == 0 {
                PreloadState::Completed
            } else {
                PreloadState::Running
            }),
        });
        jobs.insert(geofence_name.to_string(), job.clone());
        drop(jobs);

        if missing == 0 {
            info!("geofence {geofence_name} already fully preloaded ({total} panos)");
            return job;
        }

        info!("preloading geofence {geofence_name}: {missing}/{total} panos missing");
        tokio::spawn(run_job(
            job.clone(),
            queue,
            cache,
            tiles,
            metadata,
            settings,
        ));

        job
    }
}

struct OwnedWorkItem {
    pano: PanoId,
    needs_meta: bool,
    needs_image: bool,
}

async fn run_job(
    job: Arc<PreloadJob>,
    queue: VecDeque<OwnedWorkItem>,
    cache: Arc<Cache>,
    tiles: Arc<dyn TileSource>,
    metadata: Arc<dyn MetadataSource>,
    settings: PreloadSettings,
) {
    let start = Instant::now();
    let queue = Arc::new(Mutex::new(queue));
    let limiter = Arc::new(RateLimiter::new(settings.delay_min, settings.delay_max));

    let mut workers = JoinSet::new();
    for _ in 0..settings.workers {
        let job = job.clone();
        let queue = queue.clone();
        let cache = cache.clone();
        let tiles = tiles.clone();
        let metadata = metadata.clone();
        let limiter = limiter.clone();
        let settings = settings.clone();

        workers.spawn(async move {
            loop {
                let item = queue.lock().pop_front();
                let Some(item) = item else { break };

                let work = WorkItem {
                    pano: &item.pano,
                    needs_meta: item.needs_meta,
                    needs_image: item.needs_image,
                };
                if let Err(reason) =
                    process_item(work, job.zoom, &cache, &*tiles, &*metadata, &limiter, &settings)
                        .await
                {
                    warn!("preload failed for {}: {reason}", item.pano);
                    job.failures.lock().push((item.pano.clone(), reason));
                }
                job.done.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    workers.join_all().await;

    let failed = job.failures.lock().len();
    *job.state.write() = if failed == 0 {
        PreloadState::Completed
    } else {
        PreloadState::CompletedWithErrors
    };
    info!(
        "preload of {} finished in {:?} ({failed} failures)",
        job.geofence,
        start.elapsed()
    );
}

async fn process_item(
    item: WorkItem<'_>,
    zoom: u8,
    cache: &Cache,
    tiles: &dyn TileSource,
    metadata: &dyn MetadataSource,
    limiter: &RateLimiter,
    settings: &PreloadSettings,
) -> Result<(), String> {
    if item.needs_meta {
        let provider = retrying(settings, limiter, || metadata.fetch_metadata(item.pano))
            .await
            .map_err(|e| format!("metadata: {e}"))?;
        let record = ingest_metadata(item.pano, provider, metadata.name(), unix_now());
        cache.put_meta(&record).map_err(|e| format!("store metadata: {e}"))?;
    }

    if item.needs_image {
        let jpeg = fetch_panorama_image(item.pano, zoom, tiles, limiter, settings).await?;
        cache
            .put_image(item.pano, zoom, &jpeg)
            .map_err(|e| format!("store image: {e}"))?;
    }

    Ok(())
}

/// Fetches all tiles of a panorama and stitches them into one
/// equirectangular JPEG.
async fn fetch_panorama_image(
    pano: &PanoId,
    zoom: u8,
    tiles: &dyn TileSource,
    limiter: &RateLimiter,
    settings: &PreloadSettings,
) -> Result<Vec<u8>, String> {
    let (tiles_w, tiles_h) = tile_grid(zoom);
    let mut assembled = RgbImage::new(tiles_w * TILE_SIZE, tiles_h * TILE_SIZE);

    for y in 0..tiles_h {
        for x in 0..tiles_w {
            let bytes = retrying(settings, limiter, || tiles.fetch_tile(pano, zoom, x, y))
                .await
                .map_err(|e| format!("tile ({x},{y}): {e}"))?;

            let tile = image::load_from_memory(&bytes)
                .map_err(|e| format!("tile ({x},{y}) is not a valid image: {e}"))?
                .to_rgb8();
            assembled
                .copy_from(&tile, x * TILE_SIZE, y * TILE_SIZE)
                .map_err(|e| format!("tile ({x},{y}) has wrong dimensions: {e}"))?;
        }
    }

    let mut jpeg = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
        .encode_image(&assembled)
        .map_err(|e| format!("encode panorama: {e}"))?;
    Ok(jpeg)
}

/// Runs one upstream fetch with the rate limiter in front and exponential
/// backoff on retryable failures.
async fn retrying<T, F>(
    settings: &PreloadSettings,
    limiter: &RateLimiter,
    mut op: impl FnMut() -> F,
) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        limiter.wait().await;

        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() || attempt >= settings.retry_max => return Err(e),
            Err(e) => {
                let backoff = settings.retry_backoff.powi(attempt as i32 - 1);
                warn!("upstream fetch failed (attempt {attempt}): {e}, backing off {backoff:.1}s");
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            }
        }
    }
}
