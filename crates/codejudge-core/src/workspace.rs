//! Disposable per-execution workspaces.
//!
//! Every request gets its own directory under the workspace root, named by a v4
//! UUID so concurrent requests never collide without any coordination. A
//! [`Workspace`] is an owned handle: [`WorkspaceManager::destroy`] removes it on the
//! normal path, and dropping a handle that was never destroyed (request future
//! cancelled, panic while executing) removes it synchronously.

use crate::errors::WorkspaceError;
use crate::languages::LanguageProfile;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_path(&self, profile: &LanguageProfile) -> PathBuf {
        self.path.join(profile.source_file)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("Removed abandoned workspace {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove workspace {}: {}", self.path.display(), e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Use `root` as the workspace root, creating it if absent
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        let root_error = |source| WorkspaceError::Root {
            path: root.display().to_string(),
            source,
        };
        fs::create_dir_all(&root).await.map_err(root_error)?;
        // bind mounts need an absolute path
        let root = fs::canonicalize(&root).await.map_err(root_error)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create(&self) -> Result<Workspace, WorkspaceError> {
        let id = Uuid::new_v4();
        let path = self.root.join(id.to_string());
        // create_dir, not create_dir_all: an existing directory would mean a collision
        fs::create_dir(&path).await.map_err(WorkspaceError::Create)?;
        log::debug!("Created workspace {}", path.display());
        Ok(Workspace {
            id,
            path,
            released: false,
        })
    }

    /// Write `code` under the profile's source filename and return the file path
    pub async fn write_source(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        code: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let source_path = workspace.source_path(profile);
        let contents = profile.prepare_source(code);

        let mut file = fs::File::create(&source_path)
            .await
            .map_err(WorkspaceError::WriteSource)?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(WorkspaceError::WriteSource)?;
        file.flush().await.map_err(WorkspaceError::WriteSource)?;

        Ok(source_path)
    }

    /// Remove the workspace and everything in it. Already-missing directories are fine.
    pub async fn destroy(&self, mut workspace: Workspace) {
        match fs::remove_dir_all(&workspace.path).await {
            Ok(()) => {
                log::debug!("Removed workspace {}", workspace.path.display());
                workspace.released = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                workspace.released = true;
            }
            Err(e) => {
                // leave the handle armed so Drop gets a second attempt
                log::warn!(
                    "Failed to remove workspace {}: {}",
                    workspace.path.display(),
                    e
                );
            }
        }
    }

    /// Remove workspaces left behind by a previous process. Only UUID-named
    /// directories last modified at least `min_age` ago are touched, so another
    /// process sharing the root keeps its in-flight workspaces. Returns how many
    /// were removed.
    pub async fn sweep_stale(&self, min_age: Duration) -> usize {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot read workspace root {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let is_workspace = name
                .to_str()
                .map(|name| Uuid::parse_str(name).is_ok())
                .unwrap_or(false);
            if !is_workspace {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => metadata,
                _ => continue,
            };
            // a modification time in the future counts as brand new
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age < min_age {
                log::debug!("Keeping recent workspace {}", entry.path().display());
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to sweep {}: {}", entry.path().display(), e),
            }
        }

        if removed > 0 {
            log::info!("Swept {} stale workspace(s) from {}", removed, self.root.display());
        }
        removed
    }
}
