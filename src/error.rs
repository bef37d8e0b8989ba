//! Error taxonomy surfaced by the HTTP API.

use http::StatusCode;
use thiserror::Error;

use crate::model::PanoId;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadTask(String),

    #[error("pano {pano} is not inside geofence {geofence}")]
    OutOfGeofence { pano: PanoId, geofence: String },

    #[error("{0}")]
    ActionInvalid(String),

    #[error("{0}")]
    RotationInvalid(String),

    #[error("session has already terminated")]
    SessionTerminated,

    #[error("no cached metadata for pano {0}; run preload for this task first")]
    CacheMissMeta(PanoId),

    #[error("no cached image for pano {0} at zoom {1}; run preload for this task first")]
    CacheMissImage(PanoId, u8),

    #[error("upstream source unavailable: {0}")]
    PreloadSourceUnavailable(String),

    #[error("rate limited by upstream")]
    RateLimited,

    #[error("failed to write step log: {0}")]
    LogWriteFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Stable machine-readable kind, serialized as `error_kind` in responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadTask(_) => "bad_task",
            Self::OutOfGeofence { .. } => "out_of_geofence",
            Self::ActionInvalid(_) => "action_invalid",
            Self::RotationInvalid(_) => "rotation_invalid",
            Self::SessionTerminated => "session_terminated",
            Self::CacheMissMeta(_) => "cache_miss_meta",
            Self::CacheMissImage(..) => "cache_miss_image",
            Self::PreloadSourceUnavailable(_) => "preload_source_unavailable",
            Self::RateLimited => "rate_limited",
            Self::LogWriteFailed(_) => "log_write_failed",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadTask(_)
            | Self::ActionInvalid(_)
            | Self::RotationInvalid(_) => StatusCode::BAD_REQUEST,
            Self::SessionTerminated => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CacheMissMeta(_) | Self::CacheMissImage(..) => {
                StatusCode::PRECONDITION_FAILED
            }
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::OutOfGeofence { .. }
            | Self::PreloadSourceUnavailable(_)
            | Self::LogWriteFailed(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
