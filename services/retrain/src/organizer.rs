//! Reorganizes the mirrored dataset into train/val/test splits and writes the
//! manifest consumed by the training tool.
//!
//! The mirror is expected to look like:
//!
//! ```text
//! raw/
//!   strawberry/
//!     img_001.jpg
//!     labels/img_001.txt
//!   onion/
//!     ...
//! ```
//!
//! and is materialized as `processed/{train,val,test}/{images,labels}/`.
//! Files are copied, never moved, so the mirror stays intact. The split
//! directories are rebuilt on every pass.

use crate::config::{DatasetConfig, ManifestNames, Paths, CLASS_COUNT};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Name of the per-category label directory, never treated as a category
const LABELS_DIR: &str = "labels";

/// Errors that can occur while organizing the dataset
#[derive(Error, Debug)]
pub enum OrganizeError {
    #[error("No category directories found in {0}")]
    NoCategories(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrganizeError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        OrganizeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Dataset partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one organize pass
#[derive(Debug, Clone, Default)]
pub struct OrganizeReport {
    /// Images assigned to each split, per category that had images
    pub categories: BTreeMap<String, BTreeMap<Split, usize>>,
    /// Labels copied alongside the images
    pub labels_copied: usize,
    /// Location of the written manifest
    pub manifest: PathBuf,
}

impl OrganizeReport {
    pub fn total_images(&self) -> usize {
        self.categories.values().flat_map(|c| c.values()).sum()
    }
}

/// Splits mirrored images per category and writes the dataset manifest
pub struct DatasetOrganizer {
    config: DatasetConfig,
    source: PathBuf,
    output: PathBuf,
    manifest: PathBuf,
}

impl DatasetOrganizer {
    pub fn new(config: &DatasetConfig, paths: &Paths) -> Self {
        Self {
            config: config.clone(),
            source: paths.raw_dir.clone(),
            output: paths.processed_dir.clone(),
            manifest: paths.manifest(),
        }
    }

    /// Run a full organize pass.
    ///
    /// Output from earlier passes is cleared first so every image lands in
    /// exactly one split. Categories without images are skipped with a
    /// warning. Files already copied before an error are left in place.
    #[instrument(skip(self), fields(source = %self.source.display()))]
    pub fn organize(&self) -> Result<OrganizeReport, OrganizeError> {
        self.reset_split_directories()?;

        let categories = self.category_dirs()?;
        if categories.is_empty() {
            warn!("No category directories found in source path");
            return Err(OrganizeError::NoCategories(self.source.clone()));
        }

        let mut rng = match self.config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut report = OrganizeReport::default();

        for category in &categories {
            let category_path = self.source.join(category);
            let mut images = self.image_files(&category_path)?;
            if images.is_empty() {
                warn!(category = %category, "No images found in category");
                continue;
            }

            if !self.config.categories.contains(category) {
                warn!(
                    category = %category,
                    "Category is not in the class list, images are copied but get no class name"
                );
            }

            images.shuffle(&mut rng);

            let mut counts = BTreeMap::new();
            for (split, files) in self.partition(images) {
                counts.insert(split, files.len());
                report.labels_copied += self.copy_files(&category_path, &files, split)?;
            }

            debug!(category = %category, counts = ?counts, "Category split");
            metrics::counter!("retrain_images_organized_total").increment(
                counts.values().sum::<usize>() as u64,
            );
            report.categories.insert(category.clone(), counts);
        }

        info!(
            categories = report.categories.len(),
            images = report.total_images(),
            labels = report.labels_copied,
            "Dataset reorganized into train/val/test"
        );

        let present: BTreeSet<String> = report.categories.keys().cloned().collect();
        report.manifest = self.write_manifest(&present)?;

        Ok(report)
    }

    /// Floor-truncated per-split counts in assignment order.
    pub fn split_counts(&self, total: usize) -> Vec<(Split, usize)> {
        self.config
            .split
            .iter()
            .map(|(split, ratio)| (split, (total as f64 * ratio).floor() as usize))
            .collect()
    }

    /// Slice files into splits; leftovers from truncation go to the last split.
    fn partition(&self, files: Vec<String>) -> Vec<(Split, Vec<String>)> {
        let counts = self.split_counts(files.len());
        let mut remaining = files.into_iter();

        let mut assigned: Vec<(Split, Vec<String>)> = counts
            .into_iter()
            .map(|(split, count)| (split, remaining.by_ref().take(count).collect()))
            .collect();

        if let Some((_, last)) = assigned.last_mut() {
            last.extend(remaining);
        }

        assigned
    }

    fn copy_files(
        &self,
        category_path: &Path,
        files: &[String],
        split: Split,
    ) -> Result<usize, OrganizeError> {
        let images_dir = self.output.join(split.as_str()).join("images");
        let labels_dir = self.output.join(split.as_str()).join("labels");
        let mut labels = 0;

        for file in files {
            let src = category_path.join(file);
            let dest = images_dir.join(file);
            std::fs::copy(&src, &dest).map_err(|e| OrganizeError::io(&src, e))?;

            let label_name = Path::new(file).with_extension(&self.config.label_extension);
            let label_src = category_path.join(LABELS_DIR).join(&label_name);
            if label_src.is_file() {
                let label_dest = labels_dir.join(&label_name);
                std::fs::copy(&label_src, &label_dest)
                    .map_err(|e| OrganizeError::io(&label_src, e))?;
                labels += 1;
            }
        }

        Ok(labels)
    }

    /// Write the manifest for the categories present in this snapshot.
    ///
    /// Names keep their global class index and the class count is always the
    /// size of the full class list.
    pub fn write_manifest(&self, present: &BTreeSet<String>) -> Result<PathBuf, OrganizeError> {
        let contents = self.render_manifest(present);
        std::fs::write(&self.manifest, contents)
            .map_err(|e| OrganizeError::io(&self.manifest, e))?;

        info!(path = %self.manifest.display(), "Wrote dataset manifest");
        Ok(self.manifest.clone())
    }

    pub fn render_manifest(&self, present: &BTreeSet<String>) -> String {
        let root = std::fs::canonicalize(&self.output).unwrap_or_else(|_| self.output.clone());

        let mut yaml = String::from("# YOLOv8 dataset configuration\n");
        yaml.push_str(&format!("path: {}\n", root.display()));
        for split in Split::ALL {
            yaml.push_str(&format!("{split}: {split}/images\n"));
        }
        yaml.push('\n');
        yaml.push_str(&format!("nc: {}\n", CLASS_COUNT));

        let names: Vec<(usize, &String)> = self
            .config
            .categories
            .iter()
            .take(CLASS_COUNT)
            .enumerate()
            .filter(|(_, name)| match self.config.manifest_names {
                ManifestNames::Present => present.contains(*name),
                ManifestNames::All => true,
            })
            .collect();

        if names.is_empty() {
            yaml.push_str("names: {}\n");
        } else {
            yaml.push_str("names:\n");
            for (index, name) in names {
                yaml.push_str(&format!("  {index}: {name}\n"));
            }
        }

        yaml
    }

    /// Empty `<output>/<split>/{images,labels}`; the manifest and the mirror
    /// are untouched.
    fn reset_split_directories(&self) -> Result<(), OrganizeError> {
        for split in Split::ALL {
            for kind in ["images", "labels"] {
                let dir = self.output.join(split.as_str()).join(kind);
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => debug!(dir = %dir.display(), "Cleared previous split output"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(OrganizeError::io(&dir, e)),
                }
                std::fs::create_dir_all(&dir).map_err(|e| OrganizeError::io(&dir, e))?;
            }
        }
        Ok(())
    }

    /// Directories directly under the mirror root, sorted
    fn category_dirs(&self) -> Result<Vec<String>, OrganizeError> {
        let entries =
            std::fs::read_dir(&self.source).map_err(|e| OrganizeError::io(&self.source, e))?;

        let mut categories = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| OrganizeError::io(&self.source, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != LABELS_DIR {
                categories.push(name);
            }
        }

        categories.sort();
        Ok(categories)
    }

    /// Image file names directly inside a category directory, sorted
    fn image_files(&self, category_path: &Path) -> Result<Vec<String>, OrganizeError> {
        let entries =
            std::fs::read_dir(category_path).map_err(|e| OrganizeError::io(category_path, e))?;

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| OrganizeError::io(category_path, e))?;
            let path = entry.path();
            if path.is_file() && self.is_image(&path) {
                images.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        images.sort();
        Ok(images)
    }

    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.config
                    .image_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}
