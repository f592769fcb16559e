// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task state persistence and retrieval.
//!
//! An in-memory map of task records backed by one serialized JSON file per
//! task (`<dir>/<task_id>.json`). Status transitions follow write-through
//! discipline: the caller persists before emitting the event for the
//! transition, so recovery after a crash never observes an event for a
//! state that is not on disk.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use forge_core::{RequestContext, TaskRecord};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Errors from task store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The task id is unknown to the store.
    #[error("task not found: {id}")]
    TaskNotFound {
        /// The offending id.
        id: String,
    },
    /// A record could not be read or written.
    #[error("store I/O failed for {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A record could not be serialized or parsed.
    #[error("store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    /// An update patch was not a JSON object.
    #[error("update patch must be a JSON object")]
    InvalidPatch,
}

/// Aggregate statistics over the stored tasks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    /// Number of tasks held in memory.
    pub total: usize,
    /// Task counts keyed by status wire string.
    pub by_status: BTreeMap<String, usize>,
    /// `updated_at` of the least recently updated task.
    pub oldest_updated_at: Option<DateTime<Utc>>,
    /// `updated_at` of the most recently updated task.
    pub newest_updated_at: Option<DateTime<Utc>>,
}

/// File-backed task store.
///
/// Per-task operations are serial (one orchestration loop per task id);
/// cross-task operations are independent. `updated_at` is strictly
/// monotone per task.
#[derive(Debug)]
pub struct TaskStore {
    dir: PathBuf,
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskStore {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// first persist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory for persisted records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a fresh pending task, persist it, and return the record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the initial record cannot be written.
    pub fn create_task(
        &self,
        request: impl Into<String>,
        context: RequestContext,
    ) -> Result<TaskRecord, StoreError> {
        let task = TaskRecord::new(request, context);
        self.insert(task.clone())?;
        debug!(target: "forge.store", id = %task.id, "task created");
        Ok(task)
    }

    /// Insert a pre-built record (used by regeneration) and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the record cannot be written.
    pub fn insert(&self, task: TaskRecord) -> Result<(), StoreError> {
        let id = task.id.clone();
        self.tasks
            .lock()
            .expect("store lock poisoned")
            .insert(id.clone(), task);
        self.persist(&id)
    }

    /// Fetch a task by id.
    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<TaskRecord> {
        self.tasks
            .lock()
            .expect("store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Apply a typed mutation to a task, bump `updated_at`, and persist.
    ///
    /// This is the write path the orchestrator uses for status transitions;
    /// the record is on disk before this returns.
    ///
    /// # Errors
    ///
    /// [`StoreError::TaskNotFound`] for unknown ids, [`StoreError::Io`] when
    /// persistence fails.
    pub fn modify<F>(&self, id: &str, mutate: F) -> Result<TaskRecord, StoreError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let updated = {
            let mut tasks = self.tasks.lock().expect("store lock poisoned");
            let task = tasks.get_mut(id).ok_or_else(|| StoreError::TaskNotFound {
                id: id.to_string(),
            })?;
            mutate(task);
            Self::bump_updated_at(task);
            task.clone()
        };
        self.persist(id)?;
        Ok(updated)
    }

    /// Deep-merge a JSON patch into a task by top-level field and persist.
    ///
    /// Each top-level key of `patch` replaces the corresponding field of the
    /// serialized record.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidPatch`] when `patch` is not an object,
    /// [`StoreError::TaskNotFound`] / [`StoreError::Io`] as for
    /// [`modify`](Self::modify), [`StoreError::Serde`] when the merged value
    /// no longer parses as a task record.
    pub fn update_task(
        &self,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<TaskRecord, StoreError> {
        let serde_json::Value::Object(patch) = patch else {
            return Err(StoreError::InvalidPatch);
        };
        let updated = {
            let mut tasks = self.tasks.lock().expect("store lock poisoned");
            let task = tasks.get_mut(id).ok_or_else(|| StoreError::TaskNotFound {
                id: id.to_string(),
            })?;
            let mut value = serde_json::to_value(&*task)?;
            {
                let obj = value
                    .as_object_mut()
                    .expect("task record serializes to an object");
                for (key, field) in patch {
                    obj.insert(key, field);
                }
            }
            let mut merged: TaskRecord = serde_json::from_value(value)?;
            merged.id = id.to_string();
            Self::bump_updated_at(&mut merged);
            *task = merged.clone();
            merged
        };
        self.persist(id)?;
        Ok(updated)
    }

    /// Write a task's current record to disk.
    ///
    /// # Errors
    ///
    /// [`StoreError::TaskNotFound`] for unknown ids, [`StoreError::Io`] on
    /// write failure.
    pub fn persist(&self, id: &str) -> Result<(), StoreError> {
        let task = self
            .get_task(id)
            .ok_or_else(|| StoreError::TaskNotFound { id: id.to_string() })?;
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.task_path(id);
        let json = serde_json::to_string_pretty(&task)?;
        std::fs::write(&path, json).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Load a task from disk into memory, returning the recovered record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] when the file cannot be read, [`StoreError::Serde`]
    /// when it does not parse.
    pub fn recover(&self, id: &str) -> Result<TaskRecord, StoreError> {
        let path = self.task_path(id);
        let json = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let task: TaskRecord = serde_json::from_str(&json)?;
        self.tasks
            .lock()
            .expect("store lock poisoned")
            .insert(id.to_string(), task.clone());
        debug!(target: "forge.store", id = %id, status = task.status.as_str(), "task recovered");
        Ok(task)
    }

    /// List tasks newest-first by `updated_at`, up to `limit`.
    #[must_use]
    pub fn list_tasks(&self, limit: usize) -> Vec<TaskRecord> {
        let tasks = self.tasks.lock().expect("store lock poisoned");
        let mut all: Vec<TaskRecord> = tasks.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit);
        all
    }

    /// Remove a task from memory and disk.
    ///
    /// # Errors
    ///
    /// [`StoreError::TaskNotFound`] for unknown ids; a missing file on disk
    /// is not an error.
    pub fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let removed = self
            .tasks
            .lock()
            .expect("store lock poisoned")
            .remove(id)
            .is_some();
        if !removed {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        let path = self.task_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path, source }),
        }
        Ok(())
    }

    /// Delete terminal tasks whose `updated_at` is older than `max_age`.
    /// Returns the number of tasks removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = {
            let tasks = self.tasks.lock().expect("store lock poisoned");
            tasks
                .values()
                .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
                .map(|t| t.id.clone())
                .collect()
        };
        let mut removed = 0;
        for id in stale {
            match self.delete_task(&id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(target: "forge.store", id = %id, error = %e, "cleanup failed"),
            }
        }
        removed
    }

    /// Aggregate statistics over the stored tasks.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let tasks = self.tasks.lock().expect("store lock poisoned");
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for task in tasks.values() {
            *by_status.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        }
        StoreStats {
            total: tasks.len(),
            by_status,
            oldest_updated_at: tasks.values().map(|t| t.updated_at).min(),
            newest_updated_at: tasks.values().map(|t| t.updated_at).max(),
        }
    }

    /// Ids of all records present on disk (not necessarily loaded).
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] when the directory cannot be read; a missing
    /// directory yields an empty list.
    pub fn persisted_ids(&self) -> Result<Vec<String>, StoreError> {
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let mut ids = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    // --- helpers ---

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Keep `updated_at` strictly increasing even when the clock does not
    /// move between updates.
    fn bump_updated_at(task: &mut TaskRecord) {
        let now = Utc::now();
        task.updated_at = if now > task.updated_at {
            now
        } else {
            task.updated_at + Duration::milliseconds(1)
        };
    }
}
