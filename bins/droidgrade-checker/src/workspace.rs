use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

/// Scratch directory for one submission's build, removed on drop so a
/// failed check cannot leak gigabytes of gradle output.
pub struct BuildWorkspace {
    path: PathBuf,
}

impl BuildWorkspace {
    pub fn create() -> io::Result<Self> {
        let path = std::env::temp_dir().join(format!("droidgrade-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildWorkspace {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            debug!(path = %self.path.display(), error = %err, "failed to remove build workspace");
        }
    }
}
