//! On-disk layout of the keel home directory.
//!
//! ```text
//! ~/.keel/
//!   settings.json
//!   permissions.json            global permission rules
//!   sessions/<id>/              session metadata + message log
//!   checkpoints/<workdir-hash>/ shadow repository + operation log
//! <workdir>/.keel/permissions.json   project override
//! ```

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Environment variable overriding the keel home directory.
pub const HOME_ENV: &str = "KEEL_HOME";

/// Name of the per-project configuration directory.
pub const PROJECT_DIR: &str = ".keel";

/// Resolved locations of keel's persisted state
#[derive(Debug, Clone)]
pub struct KeelPaths {
    home: PathBuf,
}

impl KeelPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `$KEEL_HOME`, or `~/.keel`.
    pub fn from_env() -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(PathBuf::from(home));
        }
        let home = dirs::home_dir()
            .map(|h| h.join(".keel"))
            .unwrap_or_else(|| PathBuf::from(".keel"));
        Self::new(home)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join("settings.json")
    }

    pub fn global_permissions(&self) -> PathBuf {
        self.home.join("permissions.json")
    }

    pub fn project_permissions(workdir: &Path) -> PathBuf {
        workdir.join(PROJECT_DIR).join("permissions.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    /// Checkpoint state for one working directory. Distinct directories
    /// never share a backend.
    pub fn checkpoints_dir(&self, workdir: &Path) -> PathBuf {
        self.home.join("checkpoints").join(workdir_key(workdir))
    }
}

/// Stable short key for a working directory.
pub fn workdir_key(workdir: &Path) -> String {
    let canonical = workdir
        .canonicalize()
        .unwrap_or_else(|_| workdir.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}
