//! Task definitions produced offline by the task generator.
//!
//! Each task lives in its own `tasks/{task_id}.json` file; the runtime only
//! ever reads them.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    model::PanoId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    NavigationToPoi,
    ExplorationFindPoi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruth {
    pub target_pano_id: PanoId,
    pub target_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_distance_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: TaskType,
    pub geofence: String,
    pub spawn_point: PanoId,
    pub spawn_heading: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub target_pano_ids: Vec<PanoId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<GroundTruth>,
}

pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn get(&self, task_id: &str) -> ApiResult<Task> {
        // task ids become file names, refuse anything that could escape the dir
        if task_id.contains(['/', '\\', '.']) {
            return Err(ApiError::NotFound(format!("no such task: {task_id}")));
        }

        let path = self.dir.join(format!("{task_id}.json"));
        let raw = fs::read(&path)
            .map_err(|_| ApiError::NotFound(format!("no such task: {task_id}")))?;

        parse_task(raw)
    }

    /// All task ids available on disk, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut ids = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

fn parse_task(mut raw: Vec<u8>) -> ApiResult<Task> {
    let task: Task = simd_json::from_slice(&mut raw)
        .map_err(|e| ApiError::BadTask(format!("malformed task json: {e}")))?;

    if task.spawn_heading < 0. || task.spawn_heading >= 360. {
        return Err(ApiError::BadTask(format!(
            "spawn_heading {} out of range [0, 360)",
            task.spawn_heading
        )));
    }

    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_task(dir: &std::path::Path, id: &str, body: &str) {
        fs::write(dir.join(format!("{id}.json")), body).unwrap();
    }

    const NAV_TASK: &str = r#"{
        "task_id": "nav_T1",
        "task_type": "navigation_to_poi",
        "geofence": "downtown",
        "spawn_point": "P0",
        "spawn_heading": 0.0,
        "description": "Walk to the fountain.",
        "target_pano_ids": ["P2"],
        "max_steps": 10,
        "ground_truth": {
            "target_pano_id": "P2",
            "target_name": "fountain",
            "optimal_distance_meters": 55.0
        }
    }"#;

    #[test]
    fn test_load_task() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), "nav_T1", NAV_TASK);

        let store = TaskStore::new(dir.path().to_path_buf());
        let task = store.get("nav_T1").unwrap();
        assert_eq!(task.task_type, TaskType::NavigationToPoi);
        assert_eq!(task.spawn_point, PanoId::from("P0"));
        assert_eq!(task.max_steps, Some(10));
        assert_eq!(task.max_time_seconds, None);
        assert_eq!(task.ground_truth.unwrap().target_name, "fountain");
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf());
        let err = store.get("missing").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_task_id_cannot_escape_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf());
        let err = store.get("../secrets").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_malformed_task_is_bad_task() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), "broken", r#"{"task_id": "broken"}"#);

        let store = TaskStore::new(dir.path().to_path_buf());
        let err = store.get("broken").unwrap_err();
        assert_eq!(err.kind(), "bad_task");
    }

    #[test]
    fn test_list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), "b_task", NAV_TASK);
        write_task(dir.path(), "a_task", NAV_TASK);

        let store = TaskStore::new(dir.path().to_path_buf());
        assert_eq!(store.list(), vec!["a_task".to_string(), "b_task".to_string()]);
    }
}
