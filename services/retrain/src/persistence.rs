//! Small pieces of on-disk state shared across runs.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Remote object count recorded after the last successful run
#[derive(Debug, Clone)]
pub struct RunCounter {
    path: PathBuf,
}

impl RunCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored count; a missing or unreadable file counts as zero.
    pub fn read(&self) -> u64 {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents.trim().parse().unwrap_or_else(|_| {
                warn!(path = %self.path.display(), "Run counter is not an integer, treating as 0");
                0
            }),
            Err(_) => 0,
        }
    }

    pub fn write(&self, count: u64) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, count.to_string())?;
        debug!(count, path = %self.path.display(), "Updated run counter");
        Ok(())
    }
}

/// First image (by name) in `dir` with one of the given extensions
pub fn find_test_image(dir: &Path, extensions: &[String]) -> Option<PathBuf> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        })
        .collect();

    images.sort();
    let first = images.into_iter().next();
    if first.is_none() {
        warn!(dir = %dir.display(), "No test images found");
    }
    first
}
