//! Project registry: the in-memory and on-disk directory of projects.
//!
//! On-disk layout, rooted at the configured data directory:
//!
//! ```text
//! <data_dir>/projects/<project-id>/metadata.json
//! <data_dir>/projects/<project-id>/logs/messages_<timestamp>.jsonl
//! <data_dir>/projects/<project-id>/logs/latest
//! ```
//!
//! Metadata writes are atomic (write-temp-then-rename), so a failed write
//! never corrupts the previous good state. Startup loads every readable
//! metadata file and skips corrupt ones with a warning.

mod project;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::RegistryError;
use crate::history::MessageLog;

pub use project::{ConnectionId, Outbox, Project, ProjectMetadata, ProjectState};

const METADATA_FILE: &str = "metadata.json";
const LOGS_DIR: &str = "logs";

pub struct ProjectRegistry {
    projects_dir: PathBuf,
    projects: RwLock<HashMap<Uuid, Arc<Project>>>,
}

impl ProjectRegistry {
    /// Load the registry from disk, creating the directory tree on first
    /// run. Projects with unreadable or corrupt metadata are skipped and
    /// logged; startup continues for all others.
    pub fn load(data_dir: &Path) -> Result<Self, RegistryError> {
        let projects_dir = data_dir.join("projects");
        fs::create_dir_all(&projects_dir)?;

        let mut projects = HashMap::new();
        for entry in fs::read_dir(&projects_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            match load_project(&dir) {
                Ok(project) => {
                    info!(id = %project.id, path = %project.path.display(), "loaded project");
                    projects.insert(project.id, Arc::new(project));
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unloadable project");
                }
            }
        }

        info!(count = projects.len(), "project registry loaded");
        Ok(Self {
            projects_dir,
            projects: RwLock::new(projects),
        })
    }

    /// Register a new project rooted at `path`.
    ///
    /// The path is canonicalized, then checked against every live project
    /// for prefix overlap in either direction; nesting is refused without
    /// mutation. On success the project directory, message log, and
    /// metadata file all exist before the project becomes visible.
    pub fn create(&self, path: &Path) -> Result<Arc<Project>, RegistryError> {
        let canonical = path.canonicalize()?;

        let mut projects = self.write_lock();
        for existing in projects.values() {
            if canonical.starts_with(&existing.path) || existing.path.starts_with(&canonical) {
                return Err(RegistryError::NestedPath {
                    path: canonical,
                    existing: existing.path.clone(),
                });
            }
        }

        let id = Uuid::new_v4();
        let dir = self.projects_dir.join(id.to_string());
        let log = MessageLog::open(dir.join(LOGS_DIR))?;
        let project = Arc::new(Project::new(id, canonical, log));
        write_metadata(&dir, &project.metadata())?;

        info!(id = %id, path = %project.path.display(), "project created");
        projects.insert(id, project.clone());
        Ok(project)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Project>> {
        self.read_lock().get(&id).cloned()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<Arc<Project>> {
        let canonical = path.canonicalize().ok()?;
        self.read_lock()
            .values()
            .find(|p| p.path == canonical)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Project>> {
        self.read_lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    /// Remove a project. Refused while an execution is in flight. The
    /// on-disk directory is removed best-effort: a failure there is logged,
    /// not fatal — the project is already gone from memory.
    pub fn delete(&self, id: Uuid) -> Result<Arc<Project>, RegistryError> {
        let project = {
            let mut projects = self.write_lock();
            let std::collections::hash_map::Entry::Occupied(entry) = projects.entry(id) else {
                return Err(RegistryError::ProjectNotFound { id });
            };
            if entry.get().state() == ProjectState::Executing {
                return Err(RegistryError::ExecutionInProgress { id });
            }
            entry.remove()
        };

        let dir = self.projects_dir.join(id.to_string());
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(id = %id, dir = %dir.display(), error = %e, "failed to remove project directory");
        }
        info!(id = %id, "project deleted");
        Ok(project)
    }

    /// Re-persist a project's metadata (after a session change or reset).
    pub fn persist(&self, project: &Project) -> Result<(), RegistryError> {
        let dir = self.projects_dir.join(project.id.to_string());
        write_metadata(&dir, &project.metadata())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<Project>>> {
        self.projects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<Project>>> {
        self.projects.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_project(dir: &Path) -> Result<Project, RegistryError> {
    let meta_path = dir.join(METADATA_FILE);
    let raw = fs::read_to_string(&meta_path)?;
    let meta: ProjectMetadata =
        serde_json::from_str(&raw).map_err(|e| RegistryError::Metadata {
            path: meta_path,
            source: std::io::Error::other(e),
        })?;
    let log = MessageLog::open(dir.join(LOGS_DIR))?;
    Ok(Project::from_metadata(meta, log))
}

/// Write metadata atomically: serialize to a temp file in the same
/// directory, then rename over the final path.
fn write_metadata(dir: &Path, meta: &ProjectMetadata) -> Result<(), RegistryError> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(METADATA_FILE);
    let tmp_path = dir.join(format!("{METADATA_FILE}.tmp"));

    let json = serde_json::to_string_pretty(meta).map_err(std::io::Error::other)?;
    fs::write(&tmp_path, json).map_err(|e| RegistryError::Metadata {
        path: tmp_path.clone(),
        source: e,
    })?;
    fs::rename(&tmp_path, &final_path).map_err(|e| RegistryError::Metadata {
        path: final_path,
        source: e,
    })
}
