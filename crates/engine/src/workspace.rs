//! Job workspace module for modplay
//!
//! Scratch directories under the work dir for conversion and transcode jobs.
//! Every workspace is registered as live until its job drops it, so the janitor
//! can tell a running job's directory from one left behind by a crash.

use dashmap::DashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Prefix of job workspace directories under the work dir
pub const WORKSPACE_PREFIX: &str = "job-";

/// Creates job workspaces and tracks the ones still in use
///
/// Cheap to clone; clones share the live set.
#[derive(Debug, Clone)]
pub struct Workspaces {
    work_dir: PathBuf,
    live: Arc<DashSet<PathBuf>>,
}

impl Workspaces {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            live: Arc::new(DashSet::new()),
        }
    }

    /// Parent directory of all workspaces
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Create a fresh workspace and register it as live
    pub async fn create(&self) -> io::Result<Workspace> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let work_dir = self.work_dir.clone();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(WORKSPACE_PREFIX)
                .tempdir_in(&work_dir)
        })
        .await
        .map_err(io::Error::other)??;

        let path = dir.path().to_path_buf();
        self.live.insert(path.clone());
        Ok(Workspace {
            dir: Some(dir),
            path,
            live: self.live.clone(),
        })
    }

    /// Whether a job currently owns `path`
    pub fn is_live(&self, path: &Path) -> bool {
        self.live.contains(path)
    }

    /// Number of workspaces in use
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// A job's scratch directory, removed when dropped
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    live: Arc<DashSet<PathBuf>>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now, reporting failures
    pub fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Delete before unregistering so a sweep never races the removal
        drop(self.dir.take());
        self.live.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspace_is_live_until_dropped() {
        let root = TempDir::new().unwrap();
        let workspaces = Workspaces::new(root.path().join("work"));

        let workspace = workspaces.create().await.unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .starts_with(WORKSPACE_PREFIX));
        assert!(workspaces.is_live(&path));
        assert_eq!(workspaces.live_count(), 1);

        drop(workspace);
        assert!(!path.exists());
        assert!(!workspaces.is_live(&path));
        assert_eq!(workspaces.live_count(), 0);
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let root = TempDir::new().unwrap();
        let workspaces = Workspaces::new(root.path().to_path_buf());

        let workspace = workspaces.create().await.unwrap();
        let path = workspace.path().to_path_buf();
        workspace.close().unwrap();
        assert!(!path.exists());
        assert!(!workspaces.is_live(&path));
    }
}
