//! Artifact store
//!
//! Owns the scratch directory. Each session writes into its own
//! subdirectory (named by session id), so two sessions submitting the same
//! class name never touch each other's files.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use crate::workspace::naming::{derive_name, is_safe_name};
use crate::types::SessionId;

mod naming;

/// Errors that occur while writing artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unsafe artifact name '{0}'")]
    UnsafeName(String),

    #[error("failed to prepare directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Scratch directory shared by all sessions
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at the given directory
    ///
    /// Relative roots are resolved against the current directory, since
    /// commands run with the session directory as their working directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    /// Get the scratch directory root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the working directory for a session
    pub fn session_dir(&self, session: SessionId) -> PathBuf {
        self.root.join(session.to_string())
    }

    /// Create the scratch directory and remove anything a previous run left
    ///
    /// Returns the number of entries removed. Individual failures are
    /// logged and skipped.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn prepare(&self) -> Result<usize, ArtifactError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| ArtifactError::Prepare {
                path: self.root.clone(),
                source,
            })?;

        let mut entries =
            tokio::fs::read_dir(&self.root)
                .await
                .map_err(|source| ArtifactError::Prepare {
                    path: self.root.clone(),
                    source,
                })?;

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to list scratch directory");
                    break;
                }
            };
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned artifact"),
            }
        }

        debug!(removed, "scratch directory ready");
        Ok(removed)
    }

    /// Write submitted source for one execution attempt
    ///
    /// Any stale artifact carrying the same name in the session directory is
    /// removed first, so an old binary can never be executed by mistake.
    #[instrument(skip(self, source), fields(session = %session))]
    pub async fn write(
        &self,
        session: SessionId,
        name: &str,
        extension: &str,
        source: &str,
    ) -> Result<ArtifactSet, ArtifactError> {
        if !is_safe_name(name) {
            return Err(ArtifactError::UnsafeName(name.to_owned()));
        }

        let dir = self.session_dir(session);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::Prepare {
                path: dir.clone(),
                source,
            })?;

        let stale = sweep_prefix(&dir, name).await;
        if stale > 0 {
            debug!(stale, "removed stale artifacts");
        }

        let source_path = dir.join(format!("{name}.{extension}"));
        if let Err(e) = tokio::fs::write(&source_path, source).await {
            // No ArtifactSet owns the directory yet
            remove_dir(&dir).await;
            return Err(ArtifactError::Write {
                path: source_path,
                source: e,
            });
        }

        debug!(path = %source_path.display(), len = source.len(), "wrote source file");

        Ok(ArtifactSet {
            dir,
            name: name.to_owned(),
            paths: vec![source_path.clone()],
            source_path,
            purged: false,
        })
    }
}

/// Files belonging to one execution attempt
///
/// # Cleanup
///
/// Call [`purge()`](Self::purge) when the attempt ends. It consumes the set,
/// so an attempt cannot be purged twice. Dropping an unpurged set logs a
/// warning and removes the working directory synchronously.
#[derive(Debug)]
pub struct ArtifactSet {
    dir: PathBuf,
    name: String,
    source_path: PathBuf,
    paths: Vec<PathBuf>,
    purged: bool,
}

impl ArtifactSet {
    /// Working directory of the attempt
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Derived name shared by all artifacts of the attempt
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the submitted source file
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// File name of the submitted source (relative to [`dir()`](Self::dir))
    pub fn source_file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Paths recorded for this attempt
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Record every file the compile step left in the working directory
    ///
    /// Returns the number of newly recorded paths.
    pub async fn collect_outputs(&mut self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list compiler outputs");
                return 0;
            }
        };

        let mut added = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !self.paths.contains(&path) {
                self.paths.push(path);
                added += 1;
            }
        }
        added
    }

    /// Delete every artifact of this attempt
    ///
    /// Removes the recorded paths, sweeps the working directory for any
    /// file prefixed by the derived name (compiler outputs such as
    /// `Outer$Inner.class`), then removes the working directory with
    /// whatever else the program left in it. Failures are logged, never
    /// returned.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn purge(mut self) -> usize {
        self.purged = true;

        let mut removed = 0;
        for path in &self.paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
            }
        }
        removed += sweep_prefix(&self.dir, &self.name).await;
        remove_dir(&self.dir).await;

        debug!(removed, "artifacts purged");
        removed
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        if self.purged {
            return;
        }

        warn!(
            name = %self.name,
            dir = %self.dir.display(),
            "ArtifactSet dropped without purge, removing files synchronously"
        );

        if let Err(e) = std::fs::remove_dir_all(&self.dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove working directory");
        }
    }
}

/// Remove an attempt's working directory and everything in it
async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove working directory"),
    }
}

/// Remove every file in `dir` whose name starts with `prefix`
///
/// Best effort: failures are logged and the sweep continues.
async fn sweep_prefix(dir: &Path, prefix: &str) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to list directory for sweep");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "sweep interrupted");
                break;
            }
        };
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
        }
    }
    removed
}
