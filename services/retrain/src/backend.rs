//! Training, prediction and export through an external detection CLI.
//!
//! The orchestrator only sees the [`TrainingBackend`] trait. [`YoloCliBackend`]
//! implements it by launching the `yolo` command line tool with `key=value`
//! arguments and checking its exit status.

use crate::config::{Paths, TrainingConfig};
use async_trait::async_trait;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

/// Lines of tool stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Errors raised by a training backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{what} not found: {path}")]
    MissingPrecondition { what: &'static str, path: PathBuf },

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} command failed with {status}: {stderr_tail}")]
    ExternalToolFailure {
        stage: &'static str,
        status: String,
        stderr_tail: String,
    },

    #[error("No exported .{format} artifact found in {dir}")]
    ExportArtifactMissing { format: String, dir: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        BackendError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Model lifecycle operations delegated to an external tool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    /// Train on the current dataset manifest
    async fn train(&self) -> Result<(), BackendError>;

    /// Run the trained weights on a single image
    async fn predict(&self, image: &Path) -> Result<(), BackendError>;

    /// Export the trained weights and return the final artifact location
    async fn export(&self, format: &str) -> Result<PathBuf, BackendError>;
}

/// Backend driving the Ultralytics `yolo` CLI
pub struct YoloCliBackend {
    config: TrainingConfig,
    paths: Paths,
}

impl YoloCliBackend {
    pub fn new(config: &TrainingConfig, paths: &Paths) -> Self {
        Self {
            config: config.clone(),
            paths: paths.clone(),
        }
    }

    /// Configured GPU when one is visible, CPU otherwise.
    pub async fn select_device(&self) -> String {
        if self.config.device.eq_ignore_ascii_case("cpu") {
            return "cpu".to_string();
        }

        if gpu_available().await {
            self.config.device.clone()
        } else {
            warn!("CUDA not available, using CPU instead");
            "cpu".to_string()
        }
    }

    fn train_args(&self, device: &str) -> Vec<String> {
        vec![
            format!("task={}", self.config.task),
            "mode=train".to_string(),
            format!("model={}", self.config.model),
            format!("data={}", self.paths.manifest().display()),
            format!("epochs={}", self.config.epochs),
            format!("batch={}", self.config.batch_size),
            format!("imgsz={}", self.config.img_size),
            format!("device={}", device),
            format!("project={}", self.paths.runs_dir.display()),
            "name=train".to_string(),
            "exist_ok=True".to_string(),
        ]
    }

    fn predict_args(&self, image: &Path) -> Vec<String> {
        vec![
            format!("task={}", self.config.task),
            "mode=predict".to_string(),
            format!("model={}", self.paths.trained_weights().display()),
            format!("source={}", image.display()),
            format!("project={}", self.paths.predictions_dir.display()),
            "name=predict".to_string(),
            "exist_ok=True".to_string(),
        ]
    }

    fn export_args(&self, format: &str) -> Vec<String> {
        vec![
            "export".to_string(),
            format!("model={}", self.paths.trained_weights().display()),
            format!("format={}", format),
            format!("imgsz={}", self.config.img_size),
        ]
    }

    fn require(&self, what: &'static str, path: &Path) -> Result<(), BackendError> {
        if path.exists() {
            Ok(())
        } else {
            error!(path = %path.display(), "{} not found", what);
            Err(BackendError::MissingPrecondition {
                what,
                path: path.to_path_buf(),
            })
        }
    }

    /// Launch the tool and wait for it, forwarding its output to the log.
    async fn run_tool(&self, stage: &'static str, args: Vec<String>) -> Result<(), BackendError> {
        let program = &self.config.executable;
        let mut full_args = self.config.launcher_args.clone();
        full_args.extend(args);

        info!(stage, command = %format!("{} {}", program, full_args.join(" ")), "Running command");

        let mut child = Command::new(program)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Launch {
                program: program.clone(),
                source,
            })?;

        let stdout_task = tokio::spawn(forward_lines(child.stdout.take(), stage));
        let stderr_tail = forward_lines(child.stderr.take(), stage).await;
        let _ = stdout_task.await;

        let status = child.wait().await.map_err(|source| BackendError::Launch {
            program: program.clone(),
            source,
        })?;

        if status.success() {
            info!(stage, "Command successful");
            Ok(())
        } else {
            error!(stage, status = %status, "Command failed");
            Err(BackendError::ExternalToolFailure {
                stage,
                status: status.to_string(),
                stderr_tail: stderr_tail.into_iter().collect::<Vec<_>>().join("\n"),
            })
        }
    }
}

#[async_trait]
impl TrainingBackend for YoloCliBackend {
    #[instrument(skip(self))]
    async fn train(&self) -> Result<(), BackendError> {
        self.require("Dataset manifest", &self.paths.manifest())?;

        let device = self.select_device().await;
        info!(device = %device, epochs = self.config.epochs, "Starting model training");
        self.run_tool("train", self.train_args(&device)).await
    }

    #[instrument(skip(self), fields(image = %image.display()))]
    async fn predict(&self, image: &Path) -> Result<(), BackendError> {
        self.require("Trained weights", &self.paths.trained_weights())?;
        self.require("Image", image)?;

        info!("Starting prediction");
        self.run_tool("predict", self.predict_args(image)).await
    }

    #[instrument(skip(self))]
    async fn export(&self, format: &str) -> Result<PathBuf, BackendError> {
        self.require("Trained weights", &self.paths.trained_weights())?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let target = self.paths.exports_dir.join(format!(
            "{}_{}.{}",
            self.config.export_name, timestamp, format
        ));

        info!(format, "Exporting model");
        self.run_tool("export", self.export_args(format)).await?;

        let weights_dir = self.paths.weights_dir();
        let exported = newest_with_extension(&weights_dir, format)?.ok_or_else(|| {
            error!(dir = %weights_dir.display(), "No exported model found");
            BackendError::ExportArtifactMissing {
                format: format.to_string(),
                dir: weights_dir.clone(),
            }
        })?;

        tokio::fs::create_dir_all(&self.paths.exports_dir)
            .await
            .map_err(|e| BackendError::io(&self.paths.exports_dir, e))?;
        move_file(&exported, &target).await?;

        info!(path = %target.display(), "Model saved");
        Ok(target)
    }
}

/// Whether `nvidia-smi` can see at least one GPU
async fn gpu_available() -> bool {
    match Command::new("nvidia-smi").arg("-L").output().await {
        Ok(output) => {
            output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty()
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi probe failed");
            false
        }
    }
}

/// Log every line of a child stream and keep the last few.
async fn forward_lines<R>(reader: Option<R>, stage: &'static str) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let Some(reader) = reader else {
        return tail;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "retrain::tool", stage, "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail
}

/// Most recently created file in `dir` with the given extension
fn newest_with_extension(dir: &Path, extension: &str) -> Result<Option<PathBuf>, BackendError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BackendError::io(dir, e)),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| BackendError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| BackendError::io(&path, e))?;
        if !metadata.is_file() {
            continue;
        }
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(best, _)| created >= *best) {
            newest = Some((created, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Rename, falling back to copy + remove across file systems.
async fn move_file(from: &Path, to: &Path) -> Result<(), BackendError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(from, to)
        .await
        .map_err(|e| BackendError::io(to, e))?;
    tokio::fs::remove_file(from)
        .await
        .map_err(|e| BackendError::io(from, e))
}
