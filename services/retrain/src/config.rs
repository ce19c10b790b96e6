//! Configuration management for the retrain service.
//!
//! Configuration is layered (later sources override earlier):
//! 1. Built-in defaults
//! 2. `config/retrain.toml` and `/etc/harvest/retrain.toml` (optional)
//! 3. An explicit file passed on the command line (optional)
//! 4. Environment variables prefixed with `RETRAIN__`
//!    (e.g. `RETRAIN__STORE__BUCKET` -> `store.bucket`)

use crate::organizer::Split;
use config::{Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of classes the detection model is trained for
pub const CLASS_COUNT: usize = 10;

/// Class labels in class-index order. The position of a name is its class id
/// in every label file.
pub const DEFAULT_CATEGORIES: [&str; CLASS_COUNT] = [
    "feldsalat",
    "weeds",
    "beetroot",
    "coriander",
    "lettuce",
    "rucola",
    "strawberry",
    "chilli",
    "wildsalat",
    "onion",
];

/// Main configuration for the retrain service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote object store configuration
    pub store: StoreConfig,
    /// Dataset layout and split configuration
    #[serde(default)]
    pub dataset: DatasetConfig,
    /// External training tool configuration
    #[serde(default)]
    pub training: TrainingConfig,
    /// Polling monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Local storage locations
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Prometheus exporter port, only used by the monitor
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional file that receives a plain-text copy of the log
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// S3-compatible object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Bucket holding the uploaded dataset
    pub bucket: String,
    /// Key prefix scoping the dataset inside the bucket
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (MinIO, GCS interoperability, LocalStack)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Name of the environment variable pointing at the credentials file
    #[serde(default = "default_credentials_env")]
    pub credentials_env: String,
}

/// Dataset organization configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Ordered class labels
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Split weights
    #[serde(default)]
    pub split: SplitRatios,
    /// File extensions treated as images (case-insensitive, no dot)
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
    /// Extension of the per-image label files
    #[serde(default = "default_label_extension")]
    pub label_extension: String,
    /// Fixed shuffle seed; entropy-seeded when unset
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    /// Which class names the manifest lists
    #[serde(default)]
    pub manifest_names: ManifestNames,
}

/// Class names written to the dataset manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestNames {
    /// Only categories with images in this snapshot, keyed by class index
    #[default]
    Present,
    /// Every class; required by tools that check `len(names) == nc`
    All,
}

/// Proportional split weights, applied in train, val, test order
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SplitRatios {
    #[serde(default = "default_train_ratio")]
    pub train: f64,
    #[serde(default = "default_val_ratio")]
    pub val: f64,
    #[serde(default = "default_test_ratio")]
    pub test: f64,
}

/// External training tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    /// Executable of the training CLI
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments placed before the tool's own (e.g. a script path when the
    /// executable is an interpreter)
    #[serde(default)]
    pub launcher_args: Vec<String>,
    /// Task passed to the tool
    #[serde(default = "default_task")]
    pub task: String,
    /// Base model weights to fine-tune
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_img_size")]
    pub img_size: u32,
    /// GPU device id, or "cpu" to never probe for a GPU
    #[serde(default = "default_device")]
    pub device: String,
    /// Export format (also the exported file extension)
    #[serde(default = "default_export_format")]
    pub export_format: String,
    /// File stem of exported artifacts
    #[serde(default = "default_export_name")]
    pub export_name: String,
}

/// Polling monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between polls
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Minimum number of new remote objects that triggers a run
    #[serde(default = "default_min_new_files")]
    pub min_new_files: usize,
}

/// Local storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root of all local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

// Default value functions
fn default_service_name() -> String {
    "harvest-retrain".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_prefix() -> String {
    "yolo_1/".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_credentials_env() -> String {
    "AWS_SHARED_CREDENTIALS_FILE".to_string()
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_label_extension() -> String {
    "txt".to_string()
}

fn default_train_ratio() -> f64 {
    0.8
}

fn default_val_ratio() -> f64 {
    0.1
}

fn default_test_ratio() -> f64 {
    0.1
}

fn default_executable() -> String {
    "yolo".to_string()
}

fn default_task() -> String {
    "detect".to_string()
}

fn default_model() -> String {
    "yolov8s.pt".to_string()
}

fn default_epochs() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    16
}

fn default_img_size() -> u32 {
    640
}

fn default_device() -> String {
    "0".to_string()
}

fn default_export_format() -> String {
    "torchscript".to_string()
}

fn default_export_name() -> String {
    "yolov8_best".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_min_new_files() -> usize {
    1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data_storage")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            split: SplitRatios::default(),
            image_extensions: default_image_extensions(),
            label_extension: default_label_extension(),
            shuffle_seed: None,
            manifest_names: ManifestNames::default(),
        }
    }
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: default_train_ratio(),
            val: default_val_ratio(),
            test: default_test_ratio(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            launcher_args: Vec::new(),
            task: default_task(),
            model: default_model(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            img_size: default_img_size(),
            device: default_device(),
            export_format: default_export_format(),
            export_name: default_export_name(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            min_new_files: default_min_new_files(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    pub fn load(extra_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("logging.level", default_log_level())?
            .add_source(File::with_name("config/retrain").required(false))
            .add_source(File::with_name("/etc/harvest/retrain").required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // RETRAIN__STORE__BUCKET -> store.bucket
            .add_source(
                Environment::with_prefix("RETRAIN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.store.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("store.bucket".to_string()));
        }

        if self.dataset.categories.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "dataset.categories".to_string(),
            ));
        }
        if self.dataset.categories.len() != CLASS_COUNT {
            return Err(ConfigValidationError::InvalidValue {
                field: "dataset.categories".to_string(),
                message: format!(
                    "Expected {} class names, got {}",
                    CLASS_COUNT,
                    self.dataset.categories.len()
                ),
            });
        }

        let split = &self.dataset.split;
        if split.iter().any(|(_, ratio)| !(0.0..=1.0).contains(&ratio)) {
            return Err(ConfigValidationError::InvalidValue {
                field: "dataset.split".to_string(),
                message: "Each ratio must be within [0, 1]".to_string(),
            });
        }
        if (split.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigValidationError::InvalidValue {
                field: "dataset.split".to_string(),
                message: format!("Ratios must sum to 1.0, got {}", split.total()),
            });
        }

        if self.dataset.image_extensions.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "dataset.image_extensions".to_string(),
            ));
        }

        if self.training.executable.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "training.executable".to_string(),
            ));
        }

        if self.training.export_format.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "training.export_format".to_string(),
            ));
        }

        if self.monitor.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "monitor.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.monitor.min_new_files == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "monitor.min_new_files".to_string(),
                message: "Threshold must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Directory layout derived from `paths.data_dir`
    pub fn paths(&self) -> Paths {
        Paths::new(&self.paths.data_dir)
    }
}

impl SplitRatios {
    /// Ratios in assignment order; the last entry receives the remainder.
    pub fn iter(&self) -> impl Iterator<Item = (Split, f64)> {
        [
            (Split::Train, self.train),
            (Split::Val, self.val),
            (Split::Test, self.test),
        ]
        .into_iter()
    }

    pub fn total(&self) -> f64 {
        self.train + self.val + self.test
    }
}

impl MonitorConfig {
    /// Get poll interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Resolved local directory layout
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    /// Local mirror of the remote prefix
    pub raw_dir: PathBuf,
    /// Organized train/val/test tree
    pub processed_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub predictions_dir: PathBuf,
    /// Project directory handed to the training tool
    pub runs_dir: PathBuf,
    /// In-flight downloads, kept outside the mirror
    pub staging_dir: PathBuf,
    pub counter_file: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            raw_dir: data_dir.join("raw"),
            processed_dir: data_dir.join("processed"),
            exports_dir: data_dir.join("exported_models"),
            predictions_dir: data_dir.join("predictions"),
            runs_dir: data_dir.join("runs"),
            staging_dir: data_dir.join("staging"),
            counter_file: data_dir.join("last_file_count.txt"),
            data_dir,
        }
    }

    pub fn manifest(&self) -> PathBuf {
        self.processed_dir.join("data.yaml")
    }

    /// Weights written by the training stage
    pub fn trained_weights(&self) -> PathBuf {
        self.weights_dir().join("best.pt")
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.runs_dir.join("train").join("weights")
    }

    pub fn split_images(&self, split: Split) -> PathBuf {
        self.processed_dir.join(split.as_str()).join("images")
    }

    pub fn split_labels(&self, split: Split) -> PathBuf {
        self.processed_dir.join(split.as_str()).join("labels")
    }

    /// Create every directory the pipeline writes into.
    pub fn create_directories(&self) -> std::io::Result<()> {
        for split in Split::ALL {
            std::fs::create_dir_all(self.split_images(split))?;
            std::fs::create_dir_all(self.split_labels(split))?;
        }
        std::fs::create_dir_all(&self.raw_dir)?;
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(&self.exports_dir)?;
        std::fs::create_dir_all(&self.predictions_dir)?;
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &Path) -> Config {
    Config {
        service: ServiceConfig::default(),
        logging: LoggingConfig::default(),
        store: StoreConfig {
            bucket: "harvest-test".to_string(),
            prefix: default_prefix(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            credentials_env: default_credentials_env(),
        },
        dataset: DatasetConfig {
            shuffle_seed: Some(7),
            ..DatasetConfig::default()
        },
        training: TrainingConfig::default(),
        monitor: MonitorConfig::default(),
        paths: PathsConfig {
            data_dir: data_dir.to_path_buf(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = test_config(Path::new("/tmp/harvest"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_interval_secs(), 60);
        assert_eq!(default_min_new_files(), 1);
        assert_eq!(default_export_format(), "torchscript");
        assert_eq!(default_categories().len(), 10);
        assert_eq!(default_categories()[6], "strawberry");
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = test_config(Path::new("/tmp/harvest"));
        config.store.bucket = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_split_ratios_must_sum_to_one() {
        let mut config = test_config(Path::new("/tmp/harvest"));
        config.dataset.split.test = 0.3;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_class_list_must_have_ten_names() {
        let mut config = test_config(Path::new("/tmp/harvest"));
        config.dataset.categories.push("kale".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { ref field, .. }) if field == "dataset.categories"
        ));

        config.dataset.categories.truncate(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = test_config(Path::new("/tmp/harvest"));
        config.monitor.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_order_ends_with_test() {
        let order: Vec<Split> = SplitRatios::default().iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec![Split::Train, Split::Val, Split::Test]);
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::new("/srv/harvest");
        assert_eq!(paths.manifest(), PathBuf::from("/srv/harvest/processed/data.yaml"));
        assert_eq!(
            paths.trained_weights(),
            PathBuf::from("/srv/harvest/runs/train/weights/best.pt")
        );
        assert_eq!(
            paths.split_labels(Split::Val),
            PathBuf::from("/srv/harvest/processed/val/labels")
        );
    }

    #[test]
    fn test_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        paths.create_directories().unwrap();

        assert!(paths.raw_dir.is_dir());
        assert!(paths.staging_dir.is_dir());
        assert!(!paths.staging_dir.starts_with(&paths.raw_dir));
        assert!(paths.exports_dir.is_dir());
        assert!(paths.split_images(Split::Test).is_dir());
        assert!(paths.split_labels(Split::Train).is_dir());
    }
}
