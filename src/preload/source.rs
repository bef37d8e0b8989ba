//! Upstream provider abstractions used by the preloader.
//!
//! Nothing outside the preloader is allowed to touch these; the runtime
//! request path is strictly cache-read-only.

use std::sync::LazyLock;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    math::normalize_heading,
    model::{Link, Location, PanoId, PanoMetadata},
};

/// The upstream viewer reports panorama yaw in image-longitude space, a flat
/// 180° off true north. Applied exactly once, at ingestion.
const VIEWER_YAW_OFFSET: f64 = 180.;

#[derive(Error, Debug)]
pub enum FetchError {
    /// 429/503; the caller backs off and retries.
    #[error("rate limited by upstream")]
    RateLimited,
    /// Transport-level failure; retryable.
    #[error("transport error: {0}")]
    Transport(String),
    /// Anything else (bad pano id, malformed body); retrying won't help.
    #[error("{0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Metadata as the provider reports it, before heading normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub capture_date: Option<String>,
    /// Yaw of the image centre column, in the provider's image space.
    pub pano_yaw_degrees: f64,
    #[serde(default)]
    pub links: Vec<ProviderLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderLink {
    pub pano_id: PanoId,
    pub heading: f64,
    #[serde(default)]
    pub distance_meters: Option<f64>,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

/// Converts provider metadata into the true-north record the cache stores.
pub fn ingest_metadata(
    pano: &PanoId,
    provider: ProviderMetadata,
    source: &str,
    fetched_at: i64,
) -> PanoMetadata {
    PanoMetadata {
        id: pano.clone(),
        loc: Location::new(provider.lat, provider.lng),
        capture_date: provider.capture_date,
        center_heading: normalize_heading(provider.pano_yaw_degrees + VIEWER_YAW_OFFSET),
        links: provider
            .links
            .into_iter()
            .map(|l| Link {
                target: l.pano_id,
                heading: normalize_heading(l.heading),
                distance_meters: l.distance_meters,
                is_virtual: l.is_virtual,
            })
            .collect(),
        fetched_at,
        source: source.to_string(),
    }
}

pub trait TileSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// One 512x512 JPEG tile of the equirectangular panorama.
    fn fetch_tile<'a>(
        &'a self,
        pano: &'a PanoId,
        zoom: u8,
        x: u32,
        y: u32,
    ) -> BoxFuture<'a, Result<Vec<u8>, FetchError>>;
}

pub trait MetadataSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch_metadata<'a>(
        &'a self,
        pano: &'a PanoId,
    ) -> BoxFuture<'a, Result<ProviderMetadata, FetchError>>;
}

static CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent("panowalk-preloader")
        .cookie_store(true)
        .build()
        .expect("client config is static")
});

/// HTTP tile provider. Some providers hand out short-lived session tokens;
/// the token is created lazily and refreshed when the provider rejects it.
pub struct HttpTileSource {
    base_url: String,
    session_token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

impl HttpTileSource {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            session_token: Mutex::new(None),
        }
    }

    async fn ensure_session(&self) -> Result<String, FetchError> {
        if let Some(token) = self.session_token.lock().clone() {
            return Ok(token);
        }

        info!("creating upstream tile session");
        let res = CLIENT
            .post(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let res = check_status(res)?;

        let body = res
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let mut body = body.to_vec();
        let session: SessionResponse = simd_json::from_slice(&mut body)
            .map_err(|e| FetchError::Fatal(format!("bad session response: {e}")))?;

        *self.session_token.lock() = Some(session.token.clone());
        Ok(session.token)
    }
}

impl TileSource for HttpTileSource {
    fn name(&self) -> &'static str {
        "tiles"
    }

    fn fetch_tile<'a>(
        &'a self,
        pano: &'a PanoId,
        zoom: u8,
        x: u32,
        y: u32,
    ) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move {
            let token = self.ensure_session().await?;

            let url = format!("{}/{pano}/{zoom}/{x}/{y}.jpg", self.base_url);
            debug!("fetching tile {url}");
            let res = CLIENT
                .get(&url)
                .query(&[("session", token.as_str())])
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;

            if matches!(res.status().as_u16(), 401 | 403) {
                // stale token, drop it so the next attempt re-creates one
                *self.session_token.lock() = None;
                return Err(FetchError::Transport("session token rejected".to_string()));
            }
            let res = check_status(res)?;

            let bytes = res
                .bytes()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }
}

pub struct HttpMetadataSource {
    base_url: String,
}

impl HttpMetadataSource {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

impl MetadataSource for HttpMetadataSource {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn fetch_metadata<'a>(
        &'a self,
        pano: &'a PanoId,
    ) -> BoxFuture<'a, Result<ProviderMetadata, FetchError>> {
        Box::pin(async move {
            let url = format!("{}/{pano}", self.base_url);
            debug!("fetching metadata {url}");
            let res = CLIENT
                .get(&url)
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            let res = check_status(res)?;

            let body = res
                .bytes()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            let mut body = body.to_vec();
            simd_json::from_slice(&mut body)
                .map_err(|e| FetchError::Fatal(format!("bad metadata response: {e}")))
        })
    }
}

fn check_status(res: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    match res.status().as_u16() {
        200..=299 => Ok(res),
        429 | 503 => Err(FetchError::RateLimited),
        code => Err(FetchError::Fatal(format!("upstream returned {code}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_applies_viewer_offset_once() {
        let provider = ProviderMetadata {
            lat: 40.,
            lng: -73.,
            capture_date: None,
            pano_yaw_degrees: 0.,
            links: vec![ProviderLink {
                pano_id: PanoId::from("P1"),
                heading: 365.,
                distance_meters: None,
                is_virtual: false,
            }],
        };

        let meta = ingest_metadata(&PanoId::from("P0"), provider, "test", 123);
        // image-space yaw 0 is true-north 180
        assert_eq!(meta.center_heading, 180.);
        // link headings are already true-north, only normalized
        assert_eq!(meta.links[0].heading, 5.);
        assert_eq!(meta.fetched_at, 123);
        assert_eq!(meta.source, "test");
    }

    #[test]
    fn test_fetch_error_retryability() {
        assert!(FetchError::RateLimited.is_retryable());
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(!FetchError::Fatal("404".into()).is_retryable());
    }
}
