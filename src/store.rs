// src/store.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

pub const DB_FILE_NAME: &str = "db.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),

    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
}

// Helper to create context-aware IO errors
fn io_context<E: Into<std::io::Error>, S: Into<String>>(source: E, context: S) -> StoreError {
    StoreError::Io {
        source: source.into(),
        context: context.into(),
    }
}

// --- Persisted Data Structures ---

/// Submission parameters for the single configured (project, task) pair.
/// `task_id` is the remote numeric identifier, not the human-facing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkConfig {
    pub project_id: i64,
    pub task_id: i64,
    #[serde(default = "default_hours")]
    pub hours: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_hours() -> Decimal {
    dec!(8)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub work_config: Option<WorkConfig>,
    pub desc_list: Vec<String>,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Partial update for the persisted configuration; absent fields keep their
/// stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub username: Option<String>,
    pub password: Option<String>,
    pub work_config: Option<WorkConfig>,
    pub desc_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    pub message: String,
    pub execute_time: DateTime<Utc>,
}

/// Status record of the scheduled task. Written only on the Run Guard's
/// paths; everything else just reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskStatus {
    pub is_running: bool,
    pub last_execute_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_result: Option<TaskResult>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DbData {
    config: PersistedConfig,
    task_status: TaskStatus,
}

// --- Store ---

/// JSON-file-backed config and status store. The whole document is held in
/// memory and rewritten on every mutation; reads and writes go through one
/// mutex, so callers see atomic read-then-write, last writer wins.
pub struct Store {
    path: PathBuf,
    data: Mutex<DbData>,
}

impl Store {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| io_context(e, format!("Failed to create data directory: {:?}", data_dir)))?;

        let path = data_dir.join(DB_FILE_NAME);
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| io_context(e, format!("Failed to read store file: {:?}", path)))?;
            serde_json::from_str(&raw)?
        } else {
            DbData::default()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn write_locked(&self, data: &DbData) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(data)?;
        let mut file = File::create(&self.path)
            .map_err(|e| io_context(e, format!("Failed to create store file: {:?}", self.path)))?;
        file.write_all(json.as_bytes())
            .map_err(|e| io_context(e, format!("Failed to write store file: {:?}", self.path)))?;
        Ok(())
    }

    pub fn config(&self) -> PersistedConfig {
        self.data.lock().unwrap().config.clone()
    }

    pub fn update_config(&self, patch: ConfigPatch) -> Result<PersistedConfig, StoreError> {
        let mut data = self.data.lock().unwrap();
        let config = &mut data.config;
        if let Some(username) = patch.username {
            config.username = Some(username);
        }
        if let Some(password) = patch.password {
            config.password = Some(password);
        }
        if let Some(work_config) = patch.work_config {
            config.work_config = Some(work_config);
        }
        if let Some(desc_list) = patch.desc_list {
            config.desc_list = desc_list;
        }
        config.last_update_time = Some(Utc::now());
        let merged = config.clone();
        self.write_locked(&data)?;
        Ok(merged)
    }

    pub fn task_status(&self) -> TaskStatus {
        self.data.lock().unwrap().task_status.clone()
    }

    /// Marking the task idle also stamps `last_execute_time`, so the status
    /// view reflects the most recent attempt even when no outcome was
    /// recorded.
    pub fn set_task_running(&self, running: bool) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.task_status.is_running = running;
        if !running {
            data.task_status.last_execute_time = Some(Utc::now());
        }
        self.write_locked(&data)
    }

    /// Records the outcome of one run and resets the running marker.
    /// `last_success_time` moves only on success — the cadence policy keys
    /// off it.
    pub fn set_task_outcome(&self, success: bool, message: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut data = self.data.lock().unwrap();
        let status = &mut data.task_status;
        status.last_execute_time = Some(now);
        if success {
            status.last_success_time = Some(now);
        }
        status.last_result = Some(TaskResult {
            success,
            message: message.to_string(),
            execute_time: now,
        });
        status.is_running = false;
        self.write_locked(&data)
    }

    /// Startup recovery: a crash mid-run can strand `is_running = true` in
    /// the file. No run can be in flight before the scheduler starts, so a
    /// set flag at this point is stale by definition.
    pub fn clear_stale_running(&self) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        if data.task_status.is_running {
            warn!("persisted task status was left marked running, clearing stale flag");
            data.task_status.is_running = false;
            self.write_locked(&data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn open_test_store(test_name: &str) -> (Store, PathBuf) {
        let dir = env::temp_dir().join(format!("worktime_store_{}", test_name));
        let _ = fs::remove_dir_all(&dir);
        let store = Store::open(&dir).expect("Failed to open test store");
        (store, dir)
    }

    fn teardown(dir: PathBuf) {
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn open_without_file_yields_defaults() {
        let (store, dir) = open_test_store("defaults");

        let config = store.config();
        assert!(config.username.is_none());
        assert!(config.work_config.is_none());
        assert!(config.desc_list.is_empty());
        assert!(!store.task_status().is_running);

        teardown(dir);
    }

    #[test]
    fn update_config_merges_partial_patches() {
        let (store, dir) = open_test_store("merge");

        store
            .update_config(ConfigPatch {
                username: Some("jone".to_string()),
                password: Some("secret".to_string()),
                ..Default::default()
            })
            .unwrap();

        // A later patch must not wipe the credentials.
        let merged = store
            .update_config(ConfigPatch {
                work_config: Some(WorkConfig {
                    project_id: 11,
                    task_id: 22,
                    hours: dec!(8),
                    description: Some("daily work".to_string()),
                }),
                desc_list: Some(vec!["wrote code".to_string()]),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(merged.username.as_deref(), Some("jone"));
        assert_eq!(merged.password.as_deref(), Some("secret"));
        assert_eq!(merged.work_config.as_ref().unwrap().project_id, 11);
        assert_eq!(merged.desc_list, vec!["wrote code".to_string()]);
        assert!(merged.last_update_time.is_some());

        teardown(dir);
    }

    #[test]
    fn config_survives_reopen() {
        let (store, dir) = open_test_store("reopen");
        store
            .update_config(ConfigPatch {
                username: Some("jone".to_string()),
                ..Default::default()
            })
            .unwrap();
        drop(store);

        let reopened = Store::open(&dir).unwrap();
        assert_eq!(reopened.config().username.as_deref(), Some("jone"));

        teardown(dir);
    }

    #[test]
    fn marking_idle_stamps_last_execute_time() {
        let (store, dir) = open_test_store("running");

        store.set_task_running(true).unwrap();
        let status = store.task_status();
        assert!(status.is_running);
        assert!(status.last_execute_time.is_none());

        store.set_task_running(false).unwrap();
        let status = store.task_status();
        assert!(!status.is_running);
        assert!(status.last_execute_time.is_some());

        teardown(dir);
    }

    #[test]
    fn success_outcome_moves_last_success_time() {
        let (store, dir) = open_test_store("outcome");

        store.set_task_running(true).unwrap();
        store.set_task_outcome(true, "filled 3/3").unwrap();
        let status = store.task_status();
        assert!(!status.is_running);
        assert!(status.last_success_time.is_some());
        let result = status.last_result.unwrap();
        assert!(result.success);
        assert_eq!(result.message, "filled 3/3");

        let success_time = store.task_status().last_success_time;
        store.set_task_outcome(false, "login failed").unwrap();
        let status = store.task_status();
        assert_eq!(
            status.last_success_time, success_time,
            "a failed run must not move last_success_time"
        );
        assert!(!status.last_result.unwrap().success);

        teardown(dir);
    }

    #[test]
    fn stale_running_flag_is_cleared_on_startup() {
        let (store, dir) = open_test_store("stale");
        store.set_task_running(true).unwrap();
        drop(store);

        // Simulates the restart after a crash mid-run.
        let reopened = Store::open(&dir).unwrap();
        assert!(reopened.task_status().is_running);
        reopened.clear_stale_running().unwrap();
        assert!(!reopened.task_status().is_running);

        teardown(dir);
    }
}
