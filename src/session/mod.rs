//! Per-session state machine.
//!
//! One `Session` per run of one agent over one task. Every HTTP request maps
//! to exactly one transition here; transitions for the same session are
//! serialized by the session's state mutex, and a transition is only
//! committed after its step-log record is durable (log-then-commit).

pub mod log;
pub mod monitor;

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    cache::Cache,
    config::{CleanupPolicy, Config},
    directions::relative_direction,
    error::{ApiError, ApiResult},
    geofence::{GeofenceSet, GeofenceStore},
    graph,
    math::normalize_heading,
    model::PanoId,
    render::{self, FOV_MAX, FOV_MIN, PITCH_MAX, PITCH_MIN, ViewParams},
    session::log::{SessionSummary, StateSnapshot, StepLogWriter, StepRecord, now_ms},
    task::{Task, TaskStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Agent,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Timeout,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Timeout | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Stopped,
    MaxSteps,
    MaxTime,
    Error,
}

impl DoneReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::MaxSteps => "max_steps",
            Self::MaxTime => "max_time",
            Self::Error => "error",
        }
    }
}

/// An agent action, already shape-checked by the HTTP layer.
#[derive(Debug, Clone)]
pub enum Action {
    Move { move_id: u32 },
    Rotation { heading: f64, pitch: f64, fov: f64 },
    Stop { answer: Option<String> },
}

/// What actually happened, as written to the step log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionRecord {
    Create,
    Move { move_id: u32, target: PanoId },
    Rotation { heading: f64, pitch: f64, fov: f64 },
    Stop { answer: Option<String> },
    Pause,
    Resume,
    End,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveOption {
    pub id: u32,
    pub target: PanoId,
    pub heading: f64,
    pub direction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub task_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panorama_url: Option<String>,
    pub available_moves: Vec<MoveOption>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pano: PanoId,
    heading: f64,
    pitch: f64,
    fov: f64,
    step_count: u32,
    status: SessionStatus,
    done_reason: Option<DoneReason>,
    submitted_answer: Option<String>,
    trajectory: Vec<PanoId>,

    started: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
    last_active_ms: i64,

    /// Moves offered by the latest observation; their ids are only valid for
    /// the very next action.
    moves: Vec<MoveOption>,
    last_observation: Option<Observation>,
    last_image_path: Option<PathBuf>,
    summary: Option<SessionSummary>,
}

impl SessionState {
    fn elapsed(&self) -> Duration {
        let mut total = self.started.elapsed().saturating_sub(self.paused_total);
        if let Some(paused_at) = self.paused_at {
            total = total.saturating_sub(paused_at.elapsed());
        }
        total
    }

    fn time_expired(&self, task: &Task) -> bool {
        task.max_time_seconds
            .is_some_and(|limit| self.elapsed().as_secs_f64() >= limit)
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            pano_id: self.pano.clone(),
            heading: self.heading,
            pitch: self.pitch,
            fov: self.fov,
            step_count: self.step_count,
            status: self.status,
            elapsed_seconds: self.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub mode: Mode,
    pub task: Arc<Task>,
    state: Mutex<SessionState>,
    log: Mutex<StepLogWriter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub mode: Mode,
    pub status: SessionStatus,
    pub step_count: u32,
    pub last_active_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub observation: Option<Observation>,
    pub done: bool,
    pub done_reason: Option<DoneReason>,
}

/// The session registry plus everything a transition needs to read.
pub struct Sessions {
    cache: Arc<Cache>,
    geofences: Arc<GeofenceStore>,
    tasks: Arc<TaskStore>,
    config: Arc<Config>,
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
}

fn new_session_id() -> String {
    let bits: u128 = rand::rng().random();
    format!("{bits:032x}")
}

impl Sessions {
    pub fn new(
        cache: Arc<Cache>,
        geofences: Arc<GeofenceStore>,
        tasks: Arc<TaskStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cache,
            geofences,
            tasks,
            config,
            sessions: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get(&self, session_id: &str) -> ApiResult<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("no such session: {session_id}")))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read();
        let mut infos = sessions
            .values()
            .map(|s| {
                let state = s.state.lock();
                SessionInfo {
                    session_id: s.id.clone(),
                    agent_id: s.agent_id.clone(),
                    task_id: s.task.task_id.clone(),
                    mode: s.mode,
                    status: state.status,
                    step_count: state.step_count,
                    last_active_ms: state.last_active_ms,
                }
            })
            .collect::<Vec<_>>();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn create(
        &self,
        agent_id: &str,
        task_id: &str,
        mode: Mode,
    ) -> ApiResult<(Arc<Session>, Observation)> {
        let task = Arc::new(self.tasks.get(task_id)?);
        let fence = self.geofences.get(&task.geofence)?;
        if !fence.contains(&task.spawn_point) {
            return Err(ApiError::BadTask(format!(
                "spawn point {} is not inside geofence {}",
                task.spawn_point, task.geofence
            )));
        }

        let session_id = new_session_id();
        let mut state = SessionState {
            pano: task.spawn_point.clone(),
            heading: normalize_heading(task.spawn_heading),
            pitch: 0.,
            fov: self.config.render_default_fov,
            step_count: 0,
            status: SessionStatus::Running,
            done_reason: None,
            submitted_answer: None,
            trajectory: vec![task.spawn_point.clone()],
            started: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
            last_active_ms: now_ms(),
            moves: Vec::new(),
            last_observation: None,
            last_image_path: None,
            summary: None,
        };

        let observation = self.observe(&session_id, mode, &task, &fence, &mut state)?;

        let mut log = StepLogWriter::create(&self.config.logs_dir, &session_id)
            .map_err(|e| ApiError::LogWriteFailed(e.to_string()))?;
        log.append(&StepRecord {
            session_id: session_id.clone(),
            timestamp_ms: now_ms(),
            step: 0,
            state: state.snapshot(),
            action: ActionRecord::Create,
            available_moves: state.moves.clone(),
            image_path: state.last_image_path.as_ref().map(path_to_string),
        })?;

        let session = Arc::new(Session {
            id: session_id.clone(),
            agent_id: agent_id.to_string(),
            mode,
            task,
            state: Mutex::new(state),
            log: Mutex::new(log),
        });
        self.sessions
            .write()
            .insert(session_id.clone(), session.clone());

        info!("created session {session_id} for agent {agent_id} on task {task_id}");
        Ok((session, observation))
    }

    /// Applies one agent action. The returned observation reflects the state
    /// *after* the action; its move ids are only valid for the next call.
    pub fn action(&self, session: &Session, action: Action) -> ApiResult<ActionOutcome> {
        let mut state = session.state.lock();
        if state.status.is_terminal() {
            return Err(ApiError::SessionTerminated);
        }
        if state.status == SessionStatus::Paused {
            return Err(ApiError::ActionInvalid("session is paused".to_string()));
        }

        // a stalled session may have run out of time before this action
        if state.time_expired(&session.task) {
            return self.terminate_for_timeout(session, &mut state);
        }

        let mut scratch = state.clone();
        let record = match action {
            Action::Move { move_id } => {
                let Some(chosen) = scratch.moves.iter().find(|m| m.id == move_id).cloned()
                else {
                    return Err(ApiError::ActionInvalid(format!(
                        "unknown move_id: {move_id}"
                    )));
                };

                scratch.pano = chosen.target.clone();
                // the agent turns to face its direction of travel
                scratch.heading = chosen.heading;
                scratch.step_count += 1;
                scratch.trajectory.push(chosen.target.clone());

                ActionRecord::Move {
                    move_id,
                    target: chosen.target,
                }
            }
            Action::Rotation { heading, pitch, fov } => {
                if session.mode != Mode::Agent {
                    return Err(ApiError::ActionInvalid(
                        "rotation is only available in agent mode".to_string(),
                    ));
                }
                validate_rotation(heading, pitch, fov)?;

                scratch.heading = heading;
                scratch.pitch = pitch;
                scratch.fov = fov;

                ActionRecord::Rotation { heading, pitch, fov }
            }
            Action::Stop { answer } => {
                scratch.status = SessionStatus::Stopped;
                scratch.done_reason = Some(DoneReason::Stopped);
                scratch.submitted_answer = answer.clone();

                ActionRecord::Stop { answer }
            }
        };

        // termination check after the transition
        if !scratch.status.is_terminal() {
            if let Some(max_steps) = session.task.max_steps
                && scratch.step_count >= max_steps
            {
                scratch.status = SessionStatus::Completed;
                scratch.done_reason = Some(DoneReason::MaxSteps);
            } else if scratch.time_expired(&session.task) {
                scratch.status = SessionStatus::Timeout;
                scratch.done_reason = Some(DoneReason::MaxTime);
            }
        }

        if !scratch.status.is_terminal() {
            let fence = self.geofences.get(&session.task.geofence)?;
            match self.observe(&session.id, session.mode, &session.task, &fence, &mut scratch)
            {
                Ok(_) => {}
                Err(e @ ApiError::OutOfGeofence { .. }) => {
                    error!("invariant violation in session {}: {e}", session.id);
                    return self.terminate_for_error(session, &mut state, scratch, record, e);
                }
                Err(e) => return Err(e),
            }
        } else {
            scratch.moves.clear();
            scratch.last_observation = None;
        }

        scratch.last_active_ms = now_ms();
        session.log.lock().append(&StepRecord {
            session_id: session.id.clone(),
            timestamp_ms: now_ms(),
            step: scratch.step_count,
            state: scratch.snapshot(),
            action: record,
            available_moves: scratch.moves.clone(),
            image_path: scratch.last_image_path.as_ref().map(path_to_string),
        })?;

        *state = scratch;

        let done = state.status.is_terminal();
        let done_reason = state.done_reason;
        let observation = state.last_observation.clone();
        if done {
            self.finalize(session, &mut state);
        }

        Ok(ActionOutcome {
            observation: if done { None } else { observation },
            done,
            done_reason,
        })
    }

    pub fn pause(&self, session: &Session) -> ApiResult<SessionStatus> {
        if session.mode != Mode::Human {
            return Err(ApiError::ActionInvalid(
                "pause is only available in human mode".to_string(),
            ));
        }

        let mut state = session.state.lock();
        if state.status.is_terminal() {
            return Err(ApiError::SessionTerminated);
        }
        if state.status != SessionStatus::Running {
            return Err(ApiError::ActionInvalid("session is not running".to_string()));
        }

        let mut scratch = state.clone();
        scratch.status = SessionStatus::Paused;
        scratch.paused_at = Some(Instant::now());
        scratch.last_active_ms = now_ms();

        self.log_transition(session, &scratch, ActionRecord::Pause)?;
        *state = scratch;
        Ok(state.status)
    }

    pub fn resume(&self, session: &Session) -> ApiResult<SessionStatus> {
        if session.mode != Mode::Human {
            return Err(ApiError::ActionInvalid(
                "resume is only available in human mode".to_string(),
            ));
        }

        let mut state = session.state.lock();
        if state.status.is_terminal() {
            return Err(ApiError::SessionTerminated);
        }
        if state.status != SessionStatus::Paused {
            return Err(ApiError::ActionInvalid("session is not paused".to_string()));
        }

        let mut scratch = state.clone();
        if let Some(paused_at) = scratch.paused_at.take() {
            scratch.paused_total += paused_at.elapsed();
        }
        scratch.status = SessionStatus::Running;
        scratch.last_active_ms = now_ms();

        self.log_transition(session, &scratch, ActionRecord::Resume)?;
        *state = scratch;
        Ok(state.status)
    }

    /// Ends the session without an answer, if it hasn't already terminated.
    pub fn end(&self, session: &Session) -> ApiResult<SessionSummary> {
        let mut state = session.state.lock();
        if let Some(summary) = &state.summary {
            return Ok(summary.clone());
        }

        let mut scratch = state.clone();
        if let Some(paused_at) = scratch.paused_at.take() {
            scratch.paused_total += paused_at.elapsed();
        }
        scratch.status = SessionStatus::Stopped;
        scratch.done_reason = Some(DoneReason::Stopped);
        scratch.moves.clear();
        scratch.last_observation = None;
        scratch.last_active_ms = now_ms();

        self.log_transition(session, &scratch, ActionRecord::End)?;
        *state = scratch;

        let summary = self.finalize(session, &mut state);
        Ok(summary)
    }

    /// Returns the current status plus the latest observation.
    pub fn observation(&self, session: &Session) -> (SessionStatus, Option<Observation>) {
        let state = session.state.lock();
        (state.status, state.last_observation.clone())
    }

    pub fn summary(&self, session: &Session) -> Option<SessionSummary> {
        session.state.lock().summary.clone()
    }

    /// Called by the monitor task; terminates the session if its wall-clock
    /// budget ran out while it sat idle.
    pub fn expire_if_stalled(&self, session: &Session) {
        let mut state = session.state.lock();
        if state.status != SessionStatus::Running || !state.time_expired(&session.task) {
            return;
        }
        if let Err(e) = self.terminate_for_timeout(session, &mut state) {
            warn!("failed to expire session {}: {e}", session.id);
        }
    }

    fn terminate_for_timeout(
        &self,
        session: &Session,
        state: &mut SessionState,
    ) -> ApiResult<ActionOutcome> {
        let mut scratch = state.clone();
        scratch.status = SessionStatus::Timeout;
        scratch.done_reason = Some(DoneReason::MaxTime);
        scratch.moves.clear();
        scratch.last_observation = None;
        scratch.last_active_ms = now_ms();

        self.log_transition(session, &scratch, ActionRecord::Timeout)?;
        *state = scratch;

        self.finalize(session, state);
        Ok(ActionOutcome {
            observation: None,
            done: true,
            done_reason: Some(DoneReason::MaxTime),
        })
    }

    /// Commits the attempted (invariant-violating) transition so the log and
    /// summary record what actually happened, then surfaces the error.
    fn terminate_for_error(
        &self,
        session: &Session,
        state: &mut SessionState,
        mut scratch: SessionState,
        record: ActionRecord,
        err: ApiError,
    ) -> ApiResult<ActionOutcome> {
        scratch.status = SessionStatus::Stopped;
        scratch.done_reason = Some(DoneReason::Error);
        scratch.moves.clear();
        scratch.last_observation = None;
        scratch.last_active_ms = now_ms();

        // best effort; we're already on a failure path
        if let Err(e) = self.log_transition(session, &scratch, record) {
            warn!("failed to log error termination for {}: {e}", session.id);
        }
        *state = scratch;

        self.finalize(session, state);
        Err(err)
    }

    fn log_transition(
        &self,
        session: &Session,
        state: &SessionState,
        action: ActionRecord,
    ) -> ApiResult<()> {
        session.log.lock().append(&StepRecord {
            session_id: session.id.clone(),
            timestamp_ms: now_ms(),
            step: state.step_count,
            state: state.snapshot(),
            action,
            available_moves: state.moves.clone(),
            image_path: state.last_image_path.as_ref().map(path_to_string),
        })
    }

    /// Builds the observation for the current state: legal moves with ids and
    /// relative directions, plus a freshly rendered frame in agent mode.
    fn observe(
        &self,
        session_id: &str,
        mode: Mode,
        task: &Task,
        fence: &GeofenceSet,
        state: &mut SessionState,
    ) -> ApiResult<Observation> {
        let neighbours = graph::neighbours(&self.cache, fence, &task.geofence, &state.pano)?;
        let moves = neighbours
            .into_iter()
            .zip(1u32..)
            .map(|(n, id)| MoveOption {
                id,
                direction: relative_direction(state.heading, n.heading),
                target: n.target,
                heading: n.heading,
                distance_meters: n.distance_meters,
                is_virtual: n.is_virtual,
            })
            .collect::<Vec<_>>();

        let (current_image, panorama_url) = match mode {
            Mode::Agent => {
                let url = self.render_frame(session_id, state)?;
                (Some(url), None)
            }
            Mode::Human => (None, Some(format!("/panoramas/{}", state.pano))),
        };

        let observation = Observation {
            task_description: task.description.clone(),
            current_image,
            panorama_url,
            available_moves: moves.clone(),
        };

        state.moves = moves;
        state.last_observation = Some(observation.clone());
        Ok(observation)
    }

    fn render_frame(&self, session_id: &str, state: &mut SessionState) -> ApiResult<String> {
        let meta = self.cache.require_meta(&state.pano)?;
        let pano_image = self
            .cache
            .decode_image(&state.pano, self.config.zoom_level)?;

        let jpeg = render::render_perspective(
            &pano_image,
            meta.center_heading,
            &ViewParams {
                heading: state.heading,
                pitch: state.pitch,
                fov: state.fov,
                width: self.config.render_width,
                height: self.config.render_height,
            },
        )?;

        let dir = self.config.temp_images_dir.join(session_id);
        fs::create_dir_all(&dir).map_err(|e| ApiError::Internal(e.into()))?;
        let file_name = format!("step_{}.jpg", state.step_count);
        let path = dir.join(&file_name);
        fs::write(&path, &jpeg).map_err(|e| ApiError::Internal(e.into()))?;

        if self.config.cleanup_policy == CleanupPolicy::DeleteOnSend
            && let Some(previous) = state.last_image_path.take()
            && previous != path
        {
            let _ = fs::remove_file(previous);
        }
        state.last_image_path = Some(path);

        Ok(format!("/images/{session_id}/{file_name}"))
    }

    /// Writes the summary, records player progress and applies the temp-image
    /// cleanup policy. Requires `state` to already be terminal.
    fn finalize(&self, session: &Session, state: &mut SessionState) -> SessionSummary {
        let done_reason = state.done_reason.unwrap_or(DoneReason::Stopped);
        let reached_target = session.task.target_pano_ids.contains(&state.pano);

        let summary = SessionSummary {
            session_id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            task_id: session.task.task_id.clone(),
            final_pano: state.pano.clone(),
            trajectory: state.trajectory.clone(),
            reached_target,
            submitted_answer: state.submitted_answer.clone(),
            elapsed_seconds: state.elapsed().as_secs_f64(),
            step_count: state.step_count,
            done_reason,
        };

        if let Err(e) = log::write_summary(&self.config.logs_dir, &summary) {
            warn!("failed to write summary for {}: {e}", session.id);
        }
        if let Err(e) = self.cache.record_attempt(
            &session.agent_id,
            &session.task.task_id,
            &session.id,
            done_reason.as_str(),
            Some(if reached_target { 1. } else { 0. }),
        ) {
            warn!("failed to record progress for {}: {e}", session.id);
        }

        self.cleanup_temp_images(session, done_reason);

        state.summary = Some(summary.clone());
        info!(
            "session {} terminated: {} after {} steps",
            session.id,
            done_reason.as_str(),
            state.step_count
        );
        summary
    }

    fn cleanup_temp_images(&self, session: &Session, done_reason: DoneReason) {
        let dir = self.config.temp_images_dir.join(&session.id);
        let delete = match self.config.cleanup_policy {
            CleanupPolicy::KeepAll | CleanupPolicy::AutoExpire => false,
            CleanupPolicy::DeleteOnSessionEnd | CleanupPolicy::DeleteOnSend => true,
            CleanupPolicy::KeepOnComplete => done_reason == DoneReason::Error,
        };
        if delete && let Err(e) = fs::remove_dir_all(&dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to clean up {}: {e}", dir.display());
        }
    }
}

fn validate_rotation(heading: f64, pitch: f64, fov: f64) -> ApiResult<()> {
    if !(0. ..360.).contains(&heading) {
        return Err(ApiError::RotationInvalid(format!(
            "heading {heading} out of range [0, 360)"
        )));
    }
    if !(PITCH_MIN..=PITCH_MAX).contains(&pitch) {
        return Err(ApiError::RotationInvalid(format!(
            "pitch {pitch} out of range [{PITCH_MIN}, {PITCH_MAX}]"
        )));
    }
    if !(FOV_MIN..=FOV_MAX).contains(&fov) {
        return Err(ApiError::RotationInvalid(format!(
            "fov {fov} out of range [{FOV_MIN}, {FOV_MAX}]"
        )));
    }
    Ok(())
}

fn path_to_string(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::{
        cache::unix_now,
        model::{Link, Location, PanoMetadata},
    };

    struct TestEnv {
        dir: tempfile::TempDir,
        sessions: Sessions,
        geofences: Arc<GeofenceStore>,
    }

    impl TestEnv {
        fn log_lines(&self, session_id: &str) -> usize {
            let path = self
                .dir
                .path()
                .join("logs")
                .join(format!("{session_id}.jsonl"));
            fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            port: 0,
            data_dir: dir.join("data"),
            tasks_dir: dir.join("tasks"),
            geofence_config_path: dir.join("config/geofence_config.json"),
            logs_dir: dir.join("logs"),
            temp_images_dir: dir.join("temp_images"),
            zoom_level: 0,
            cleanup_policy: CleanupPolicy::KeepAll,
            temp_expire_hours: 24,
            render_width: 32,
            render_height: 24,
            render_default_fov: 90.,
            prefetch_delay_min: 0.,
            prefetch_delay_max: 0.,
            prefetch_retry_max: 3,
            prefetch_retry_backoff: 0.,
            prefetch_workers: 1,
            tile_base_url: String::new(),
            metadata_base_url: String::new(),
        }
    }

    fn pano_jpeg() -> Vec<u8> {
        let img = RgbImage::from_pixel(64, 32, image::Rgb([90, 120, 150]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 85)
            .encode_image(&img)
            .unwrap();
        jpeg
    }

    fn put_pano(cache: &Cache, id: &str, loc: Location, links: Vec<(&str, f64)>) {
        cache
            .put_meta(&PanoMetadata {
                id: PanoId::from(id),
                loc,
                capture_date: None,
                center_heading: 0.,
                links: links
                    .into_iter()
                    .map(|(target, heading)| Link {
                        target: PanoId::from(target),
                        heading,
                        distance_meters: None,
                        is_virtual: false,
                    })
                    .collect(),
                fetched_at: unix_now(),
                source: "test".to_string(),
            })
            .unwrap();
        cache.put_image(&PanoId::from(id), 0, &pano_jpeg()).unwrap();
    }

    fn write_task(
        dir: &std::path::Path,
        task_id: &str,
        max_steps: Option<u32>,
        max_time_seconds: Option<f64>,
        target: &str,
    ) {
        let max_steps = max_steps
            .map(|n| format!("\"max_steps\": {n},"))
            .unwrap_or_default();
        let max_time = max_time_seconds
            .map(|t| format!("\"max_time_seconds\": {t},"))
            .unwrap_or_default();
        let body = format!(
            r#"{{
                "task_id": "{task_id}",
                "task_type": "navigation_to_poi",
                "geofence": "g",
                "spawn_point": "P0",
                "spawn_heading": 0.0,
                "description": "Walk to the fountain.",
                {max_steps}
                {max_time}
                "target_pano_ids": ["{target}"]
            }}"#
        );
        fs::write(dir.join(format!("{task_id}.json")), body).unwrap();
    }

    /// Three panos: P0 links east to P1 and south to P2, both link back.
    fn env() -> TestEnv {
        env_with_config(|_| {})
    }

    fn env_with_config(tweak: impl FnOnce(&mut Config)) -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        fs::create_dir_all(&config.tasks_dir).unwrap();
        fs::create_dir_all(config.geofence_config_path.parent().unwrap()).unwrap();
        fs::write(
            &config.geofence_config_path,
            r#"{"g": ["P0", "P1", "P2"]}"#,
        )
        .unwrap();

        let cache = Arc::new(
            Cache::open(
                config.data_dir.join("cache.db"),
                config.data_dir.join("panoramas"),
            )
            .unwrap(),
        );
        put_pano(
            &cache,
            "P0",
            Location::new(40., -73.),
            vec![("P1", 90.), ("P2", 180.)],
        );
        put_pano(&cache, "P1", Location::new(40., -72.9998), vec![("P0", 270.)]);
        put_pano(&cache, "P2", Location::new(39.9998, -73.), vec![("P0", 0.)]);

        write_task(&config.tasks_dir, "nav_T1", None, None, "P1");
        write_task(&config.tasks_dir, "nav_steps", Some(2), None, "P1");
        write_task(&config.tasks_dir, "nav_slow", None, Some(1.0), "P1");
        write_task(&config.tasks_dir, "nav_fast", None, Some(0.05), "P1");

        let geofences = Arc::new(GeofenceStore::load(config.geofence_config_path.clone()));
        let tasks = Arc::new(TaskStore::new(config.tasks_dir.clone()));
        let sessions = Sessions::new(cache, geofences.clone(), tasks, Arc::new(config));

        TestEnv {
            dir,
            sessions,
            geofences,
        }
    }

    fn snapshot(session: &Session) -> StateSnapshot {
        session.state.lock().snapshot()
    }

    #[test]
    fn test_single_step_move() {
        let env = env();
        let (session, obs) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();

        assert!(obs.current_image.is_some());
        assert!(obs.panorama_url.is_none());
        assert_eq!(obs.available_moves.len(), 2);
        assert_eq!(obs.available_moves[0].id, 1);
        assert_eq!(obs.available_moves[0].target, PanoId::from("P1"));
        assert_eq!(obs.available_moves[0].direction, "right");
        assert_eq!(obs.available_moves[1].id, 2);
        assert_eq!(obs.available_moves[1].target, PanoId::from("P2"));
        assert_eq!(obs.available_moves[1].direction, "back");

        let outcome = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
        assert!(!outcome.done);

        let state = snapshot(&session);
        assert_eq!(state.pano_id, PanoId::from("P1"));
        assert_eq!(state.heading, 90.);
        assert_eq!(state.step_count, 1);

        // the new observation is for P1: only P0 behind us
        let obs = outcome.observation.unwrap();
        assert_eq!(obs.available_moves.len(), 1);
        assert_eq!(obs.available_moves[0].target, PanoId::from("P0"));
        assert_eq!(obs.available_moves[0].direction, "back");
    }

    #[test]
    fn test_invalid_move_id_leaves_state_and_log_untouched() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        let lines_before = env.log_lines(&session.id);
        let before = snapshot(&session);

        let err = env
            .sessions
            .action(&session, Action::Move { move_id: 99 })
            .unwrap_err();
        assert_eq!(err.kind(), "action_invalid");

        let after = snapshot(&session);
        assert_eq!(after.pano_id, before.pano_id);
        assert_eq!(after.step_count, before.step_count);
        assert_eq!(env.log_lines(&session.id), lines_before);
    }

    #[test]
    fn test_rotation_does_not_step() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();

        let outcome = env
            .sessions
            .action(
                &session,
                Action::Rotation {
                    heading: 45.,
                    pitch: -10.,
                    fov: 75.,
                },
            )
            .unwrap();

        let state = snapshot(&session);
        assert_eq!(state.heading, 45.);
        assert_eq!(state.pitch, -10.);
        assert_eq!(state.fov, 75.);
        assert_eq!(state.step_count, 0);

        // directions are relative to the new heading
        let obs = outcome.observation.unwrap();
        assert_eq!(obs.available_moves[0].direction, "front-right 45°");
        assert_eq!(obs.available_moves[1].direction, "right-back 45°");
    }

    #[test]
    fn test_rotation_bounds() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();

        let rotate = |heading, pitch, fov| {
            env.sessions
                .action(&session, Action::Rotation { heading, pitch, fov })
        };

        // the exact boundary is accepted
        rotate(0., 85., 30.).unwrap();
        rotate(359.99, -85., 100.).unwrap();

        // one past it is not
        for (heading, pitch, fov) in [
            (360., 0., 90.),
            (-1., 0., 90.),
            (0., 86., 90.),
            (0., -86., 90.),
            (0., 0., 29.),
            (0., 0., 101.),
        ] {
            let err = rotate(heading, pitch, fov).unwrap_err();
            assert_eq!(err.kind(), "rotation_invalid", "{heading}/{pitch}/{fov}");
        }
    }

    #[test]
    fn test_rotation_rejected_in_human_mode() {
        let env = env();
        let (session, obs) = env
            .sessions
            .create("human-1", "nav_T1", Mode::Human)
            .unwrap();
        assert_eq!(obs.panorama_url.as_deref(), Some("/panoramas/P0"));
        assert!(obs.current_image.is_none());

        let err = env
            .sessions
            .action(
                &session,
                Action::Rotation {
                    heading: 45.,
                    pitch: 0.,
                    fov: 90.,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), "action_invalid");
    }

    #[test]
    fn test_max_steps_terminates() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_steps", Mode::Agent)
            .unwrap();

        let outcome = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
        assert!(!outcome.done);

        let outcome = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
        assert!(outcome.done);
        assert_eq!(outcome.done_reason, Some(DoneReason::MaxSteps));
        assert!(outcome.observation.is_none());

        let err = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap_err();
        assert_eq!(err.kind(), "session_terminated");

        let summary = env.sessions.summary(&session).unwrap();
        assert_eq!(summary.step_count, 2);
        assert_eq!(summary.done_reason, DoneReason::MaxSteps);
        assert_eq!(
            summary.trajectory,
            vec![PanoId::from("P0"), PanoId::from("P1"), PanoId::from("P0")]
        );
    }

    #[test]
    fn test_stop_with_answer() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();

        let outcome = env
            .sessions
            .action(
                &session,
                Action::Stop {
                    answer: Some("yes".to_string()),
                },
            )
            .unwrap();
        assert!(outcome.done);
        assert_eq!(outcome.done_reason, Some(DoneReason::Stopped));

        let summary = env.sessions.summary(&session).unwrap();
        assert_eq!(summary.submitted_answer.as_deref(), Some("yes"));
        assert!(!summary.reached_target);

        let summary_path = env
            .dir
            .path()
            .join("logs")
            .join(format!("{}.summary.json", session.id));
        assert!(summary_path.exists());
    }

    #[test]
    fn test_pause_excludes_time() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("human-1", "nav_slow", Mode::Human)
            .unwrap();

        env.sessions.pause(&session).unwrap();
        std::thread::sleep(Duration::from_millis(1200));
        env.sessions.resume(&session).unwrap();

        // wall clock exceeded max_time_seconds=1, but paused time is excluded
        let outcome = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
        assert!(!outcome.done);

        let state = snapshot(&session);
        assert!(state.elapsed_seconds < 0.5, "{}", state.elapsed_seconds);
    }

    #[test]
    fn test_pause_only_in_human_mode() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        let err = env.sessions.pause(&session).unwrap_err();
        assert_eq!(err.kind(), "action_invalid");
    }

    #[test]
    fn test_action_while_paused_is_invalid() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("human-1", "nav_T1", Mode::Human)
            .unwrap();
        env.sessions.pause(&session).unwrap();

        let err = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap_err();
        assert_eq!(err.kind(), "action_invalid");

        env.sessions.resume(&session).unwrap();
        env.sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
    }

    #[test]
    fn test_timeout_on_action_arrival() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_fast", Mode::Agent)
            .unwrap();
        std::thread::sleep(Duration::from_millis(120));

        let outcome = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
        assert!(outcome.done);
        assert_eq!(outcome.done_reason, Some(DoneReason::MaxTime));

        let state = snapshot(&session);
        assert_eq!(state.status, SessionStatus::Timeout);
        // the move itself was not applied
        assert_eq!(state.step_count, 0);
    }

    #[test]
    fn test_monitor_expires_stalled_session() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_fast", Mode::Agent)
            .unwrap();
        std::thread::sleep(Duration::from_millis(120));

        env.sessions.expire_if_stalled(&session);
        let state = snapshot(&session);
        assert_eq!(state.status, SessionStatus::Timeout);
        assert!(env.sessions.summary(&session).is_some());
    }

    #[test]
    fn test_move_out_of_shrunk_geofence_is_error_termination() {
        let env = env();
        let (session, obs) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        assert_eq!(obs.available_moves[0].target, PanoId::from("P1"));

        // the fence loses P1 after the observation handed out its move ids
        fs::write(
            &env.sessions.config().geofence_config_path,
            r#"{"g": ["P0", "P2"]}"#,
        )
        .unwrap();
        env.geofences.refresh().unwrap();

        let err = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap_err();
        assert_eq!(err.kind(), "out_of_geofence");
        // the error names the violating pano, not the one we left
        assert!(err.to_string().contains("P1"), "{err}");

        // the attempted transition is committed, not silently rolled back
        let state = snapshot(&session);
        assert_eq!(state.status, SessionStatus::Stopped);
        assert_eq!(state.pano_id, PanoId::from("P1"));
        assert_eq!(state.step_count, 1);

        let summary = env.sessions.summary(&session).unwrap();
        assert_eq!(summary.done_reason, DoneReason::Error);
        assert_eq!(summary.final_pano, PanoId::from("P1"));
        assert_eq!(
            summary.trajectory,
            vec![PanoId::from("P0"), PanoId::from("P1")]
        );

        // the step log's last record is the move that violated the invariant
        let records = log::read_log(&env.sessions.config().logs_dir, &session.id).unwrap();
        use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
        let last = records.last().unwrap();
        assert_eq!(last.get_u64("step").unwrap(), 1);
        assert_eq!(
            last.get("action").and_then(|a| a.get_str("type")),
            Some("move")
        );

        let err = env
            .sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap_err();
        assert_eq!(err.kind(), "session_terminated");
    }

    #[test]
    fn test_end_without_answer() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        env.sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();

        let summary = env.sessions.end(&session).unwrap();
        assert_eq!(summary.done_reason, DoneReason::Stopped);
        assert_eq!(summary.submitted_answer, None);
        // ended on P1, which is the target
        assert!(summary.reached_target);

        // ending again returns the same summary
        let again = env.sessions.end(&session).unwrap();
        assert_eq!(again.step_count, summary.step_count);
    }

    #[test]
    fn test_create_rejects_bad_tasks() {
        let env = env();
        let err = env
            .sessions
            .create("a", "missing_task", Mode::Agent)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        // spawn point outside its geofence
        write_task(
            &env.sessions.config().tasks_dir.clone(),
            "bad_spawn",
            None,
            None,
            "P1",
        );
        let tasks_dir = env.sessions.config().tasks_dir.clone();
        let body = fs::read_to_string(tasks_dir.join("bad_spawn.json"))
            .unwrap()
            .replace("\"P0\"", "\"P999\"");
        fs::write(tasks_dir.join("bad_spawn.json"), body).unwrap();

        let err = env
            .sessions
            .create("a", "bad_spawn", Mode::Agent)
            .unwrap_err();
        assert_eq!(err.kind(), "bad_task");
    }

    #[test]
    fn test_log_steps_are_monotonic() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        env.sessions
            .action(
                &session,
                Action::Rotation {
                    heading: 10.,
                    pitch: 0.,
                    fov: 90.,
                },
            )
            .unwrap();
        env.sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();
        env.sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();

        let records = log::read_log(&env.sessions.config().logs_dir, &session.id).unwrap();
        use simd_json::derived::ValueObjectAccessAsScalar;
        let steps: Vec<u64> = records.iter().map(|r| r.get_u64("step").unwrap()).collect();
        assert_eq!(steps, vec![0, 0, 1, 2]);
    }

    #[test]
    fn test_delete_on_session_end_removes_frames() {
        let env = env_with_config(|c| c.cleanup_policy = CleanupPolicy::DeleteOnSessionEnd);
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();

        let temp_dir = env
            .sessions
            .config()
            .temp_images_dir
            .join(&session.id);
        assert!(temp_dir.exists());

        env.sessions
            .action(&session, Action::Stop { answer: None })
            .unwrap();
        assert!(!temp_dir.exists());
    }

    #[test]
    fn test_delete_on_send_keeps_only_latest_frame() {
        let env = env_with_config(|c| c.cleanup_policy = CleanupPolicy::DeleteOnSend);
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        env.sessions
            .action(&session, Action::Move { move_id: 1 })
            .unwrap();

        let temp_dir = env
            .sessions
            .config()
            .temp_images_dir
            .join(&session.id);
        let frames: Vec<_> = fs::read_dir(&temp_dir).unwrap().collect();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_sessions_list() {
        let env = env();
        let (session, _) = env
            .sessions
            .create("agent-1", "nav_T1", Mode::Agent)
            .unwrap();
        env.sessions.create("agent-2", "nav_T1", Mode::Human).unwrap();

        let infos = env.sessions.list();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|i| i.session_id == session.id));
        assert!(infos.iter().all(|i| i.status == SessionStatus::Running));
    }
}

