//! Durable per-session step logs and terminal summaries.
//!
//! One JSON-Lines file per session; a record is flushed to disk before the
//! transition it describes is committed, so a crash can never reorder
//! history.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    model::PanoId,
    session::{ActionRecord, DoneReason, MoveOption, SessionStatus},
};

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub pano_id: PanoId,
    pub heading: f64,
    pub pitch: f64,
    pub fov: f64,
    pub step_count: u32,
    pub status: SessionStatus,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub session_id: String,
    pub timestamp_ms: i64,
    pub step: u32,
    pub state: StateSnapshot,
    pub action: ActionRecord,
    pub available_moves: Vec<MoveOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub final_pano: PanoId,
    pub trajectory: Vec<PanoId>,
    pub reached_target: bool,
    pub submitted_answer: Option<String>,
    pub elapsed_seconds: f64,
    pub step_count: u32,
    pub done_reason: DoneReason,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct StepLogWriter {
    file: File,
    path: PathBuf,
}

impl StepLogWriter {
    pub fn create(logs_dir: &Path, session_id: &str) -> eyre::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// Appends one record and syncs it to disk. A failure here must abort the
    /// transition, so the error is surfaced rather than swallowed.
    pub fn append(&mut self, record: &StepRecord) -> ApiResult<()> {
        let mut line = simd_json::to_string(record)
            .map_err(|e| ApiError::LogWriteFailed(e.to_string()))?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| {
                ApiError::LogWriteFailed(format!("{}: {e}", self.path.display()))
            })
    }
}

pub fn write_summary(logs_dir: &Path, summary: &SessionSummary) -> eyre::Result<()> {
    let path = logs_dir.join(format!("{}.summary.json", summary.session_id));
    let json = simd_json::to_string_pretty(summary)?;
    fs::write(&path, json)?;
    Ok(())
}

/// Parses a session's step log back into JSON values, for replay.
pub fn read_log(logs_dir: &Path, session_id: &str) -> ApiResult<Vec<simd_json::OwnedValue>> {
    if session_id.contains(['/', '\\', '.']) {
        return Err(ApiError::NotFound(format!("no such session: {session_id}")));
    }

    let path = logs_dir.join(format!("{session_id}.jsonl"));
    let raw = fs::read_to_string(&path)
        .map_err(|_| ApiError::NotFound(format!("no log for session {session_id}")))?;

    let mut records = Vec::new();
    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        let mut bytes = line.as_bytes().to_vec();
        let value = simd_json::to_owned_value(&mut bytes)
            .map_err(|e| ApiError::Internal(eyre::eyre!("corrupt log line: {e}")))?;
        records.push(value);
    }
    Ok(records)
}
