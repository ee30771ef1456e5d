//! Per-apply isolated working directories.
//!
//! Each apply gets its own `ws-<uuid>` directory under the workspace root.
//! Only rendered artifacts and a `workspace.json` status record are written;
//! credentials never touch this directory.

use crate::error::BridgeError;
use crate::plan_generator::ResourceType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix that marks a directory as a workspace the janitor may reap.
pub const WORKSPACE_PREFIX: &str = "ws-";
/// Name of the status record inside each workspace.
pub const RECORD_FILE: &str = "workspace.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Initialized,
    Executing,
    Completed,
    Failed,
    Reaped,
}

#[derive(Debug, Serialize)]
struct WorkspaceRecord<'a> {
    id: &'a str,
    action_id: &'a str,
    resource_type: ResourceType,
    state: WorkspaceState,
    rendered_files: &'a [String],
}

#[derive(Debug)]
pub struct Workspace {
    pub id: String,
    pub directory: PathBuf,
    pub rendered_files: Vec<String>,
    pub state: WorkspaceState,
    action_id: String,
    resource_type: ResourceType,
}

impl Workspace {
    /// Creates a fresh, uniquely named workspace under `root`.
    pub fn create(root: &Path, action_id: &str, resource_type: ResourceType) -> Result<Self, BridgeError> {
        fs::create_dir_all(root)?;

        let id = format!("{}{}", WORKSPACE_PREFIX, Uuid::now_v7().simple());
        let directory = root.join(&id);
        create_private_dir(&directory)?;
        debug!("Created workspace {}", directory.display());

        let workspace = Self {
            id,
            directory,
            rendered_files: Vec::new(),
            state: WorkspaceState::Initialized,
            action_id: action_id.to_string(),
            resource_type,
        };
        workspace.write_record()?;
        Ok(workspace)
    }

    /// Writes a rendered artifact into the workspace.
    pub fn render(&mut self, file_name: &str, contents: &str) -> Result<PathBuf, BridgeError> {
        let path = self.directory.join(file_name);
        fs::write(&path, contents)?;
        self.rendered_files.push(file_name.to_string());
        self.write_record()?;
        Ok(path)
    }

    /// Moves to `state` and records it on disk.
    ///
    /// A failure to write the record is logged, not propagated: the state
    /// file is informational and must not mask the execution result.
    pub fn transition(&mut self, state: WorkspaceState) {
        self.state = state;
        if let Err(e) = self.write_record() {
            warn!("Failed to record state {:?} for {}: {}", state, self.id, e);
        }
    }

    fn write_record(&self) -> Result<(), BridgeError> {
        let record = WorkspaceRecord {
            id: &self.id,
            action_id: &self.action_id,
            resource_type: self.resource_type,
            state: self.state,
            rendered_files: &self.rendered_files,
        };
        fs::write(self.directory.join(RECORD_FILE), serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }
}

/// Marks an on-disk workspace as reaped and returns the state it was in.
///
/// Returns `None` when the record is missing or unreadable.
pub fn mark_reaped(directory: &Path) -> Option<WorkspaceState> {
    let path = directory.join(RECORD_FILE);
    let mut record: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).ok()?).ok()?;
    let previous = serde_json::from_value(record.get("state")?.clone()).ok()?;
    record["state"] = serde_json::json!(WorkspaceState::Reaped);
    if let Err(e) = fs::write(&path, record.to_string()) {
        debug!("Could not mark {} as reaped: {}", directory.display(), e);
    }
    Some(previous)
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_makes_unique_directories() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path(), "act-1", ResourceType::SqsQueue).unwrap();
        let b = Workspace::create(root.path(), "act-1", ResourceType::SqsQueue).unwrap();

        assert_ne!(a.directory, b.directory);
        assert!(a.directory.is_dir());
        assert!(a.id.starts_with(WORKSPACE_PREFIX));
        assert_eq!(a.state, WorkspaceState::Initialized);
    }

    #[cfg(unix)]
    #[test]
    fn test_workspace_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path(), "act", ResourceType::S3Bucket).unwrap();

        let mode = fs::metadata(&ws.directory).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_render_and_transition_update_record() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(root.path(), "act-9", ResourceType::Ec2Instance).unwrap();

        let path = ws.render("main.tf", "resource {}").unwrap();
        ws.transition(WorkspaceState::Completed);

        assert_eq!(fs::read_to_string(path).unwrap(), "resource {}");
        let record: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ws.directory.join(RECORD_FILE)).unwrap()).unwrap();
        assert_eq!(record["state"], "completed");
        assert_eq!(record["action_id"], "act-9");
        assert_eq!(record["rendered_files"][0], "main.tf");
    }

    #[test]
    fn test_mark_reaped_reports_previous_state() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(root.path(), "act", ResourceType::SqsQueue).unwrap();
        ws.transition(WorkspaceState::Failed);

        assert_eq!(mark_reaped(&ws.directory), Some(WorkspaceState::Failed));
        assert_eq!(mark_reaped(&ws.directory), Some(WorkspaceState::Reaped));
        assert_eq!(mark_reaped(root.path()), None);
    }
}
