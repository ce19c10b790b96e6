//! Single pipeline run: fetch → organize → train → predict → export.
//!
//! ```text
//! Idle → Fetching → Organizing → Training → Predicting → Exporting → Done
//!                        │            │                       │
//!                        └────────────┴───────────────────────┴──→ Aborted
//! ```
//!
//! Prediction is best-effort and never aborts a run. A fetch that cannot reach
//! the store is returned as an error instead of an aborted outcome.

use crate::backend::TrainingBackend;
use crate::config::{Config, Paths};
use crate::error::PipelineError;
use crate::organizer::{DatasetOrganizer, Split};
use crate::persistence::find_test_image;
use crate::remote_store::{ObjectStore, RemoteStoreClient};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Position of a run in the stage sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Fetching,
    Organizing,
    Training,
    Predicting,
    Exporting,
    Done,
    Aborted,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Fetching => "fetching",
            PipelineStage::Organizing => "organizing",
            PipelineStage::Training => "training",
            PipelineStage::Predicting => "predicting",
            PipelineStage::Exporting => "exporting",
            PipelineStage::Done => "done",
            PipelineStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What happened to the sample prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Terminal state of a run
#[derive(Debug)]
pub enum PipelineOutcome {
    Done {
        exported: PathBuf,
        new_files: usize,
        prediction: PredictionStatus,
    },
    Aborted {
        stage: PipelineStage,
        reason: String,
    },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Done { .. })
    }

    pub fn final_stage(&self) -> PipelineStage {
        match self {
            PipelineOutcome::Done { .. } => PipelineStage::Done,
            PipelineOutcome::Aborted { .. } => PipelineStage::Aborted,
        }
    }
}

/// Sequences the stages of one run
pub struct PipelineOrchestrator {
    store: RemoteStoreClient,
    organizer: DatasetOrganizer,
    backend: Arc<dyn TrainingBackend>,
    paths: Paths,
    export_format: String,
    image_extensions: Vec<String>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        backend: Arc<dyn TrainingBackend>,
    ) -> Self {
        let paths = config.paths();
        Self {
            store: RemoteStoreClient::new(
                store,
                config.store.prefix.clone(),
                paths.raw_dir.clone(),
                paths.staging_dir.clone(),
            ),
            organizer: DatasetOrganizer::new(&config.dataset, &paths),
            backend,
            export_format: config.training.export_format.clone(),
            image_extensions: config.dataset.image_extensions.clone(),
            paths,
        }
    }

    pub fn store(&self) -> &RemoteStoreClient {
        &self.store
    }

    /// Run every stage once.
    ///
    /// `test_image` overrides the sample image; otherwise the first image of
    /// the organized test split is used.
    pub async fn run_pipeline(
        &self,
        test_image: Option<&Path>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", run_id = %run_id);

        let result = self.run_stages(test_image).instrument(span).await;

        let label = match &result {
            Ok(PipelineOutcome::Done { .. }) => "done",
            Ok(PipelineOutcome::Aborted { .. }) => "aborted",
            Err(_) => "error",
        };
        metrics::counter!("retrain_pipeline_runs_total", "outcome" => label).increment(1);

        result
    }

    async fn run_stages(
        &self,
        test_image: Option<&Path>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut stage = PipelineStage::Idle;
        info!("Starting pipeline execution");

        advance(&mut stage, PipelineStage::Fetching);
        info!("Step 1: Fetching data from remote store");
        let fetched = self.store.fetch_new().await?;
        if fetched.count == 0 {
            // Existing data is still re-split and retrained on.
            info!("No new files fetched, continuing with existing data");
        }

        advance(&mut stage, PipelineStage::Organizing);
        info!("Step 2: Organizing dataset");
        if let Err(e) = self.organizer.organize() {
            error!(error = %e, "Failed to organize dataset, pipeline aborted");
            return Ok(abort(stage, e));
        }

        advance(&mut stage, PipelineStage::Training);
        info!("Step 3: Training model");
        if let Err(e) = self.backend.train().await {
            error!(error = %e, "Failed to train model, pipeline aborted");
            return Ok(abort(stage, e));
        }

        advance(&mut stage, PipelineStage::Predicting);
        info!("Step 4: Running prediction");
        let prediction = self.predict(test_image).await;

        advance(&mut stage, PipelineStage::Exporting);
        info!("Step 5: Exporting model");
        let exported = match self.backend.export(&self.export_format).await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "Failed to export model, pipeline aborted");
                return Ok(abort(stage, e));
            }
        };

        advance(&mut stage, PipelineStage::Done);
        info!(
            stage = %stage,
            exported = %exported.display(),
            new_files = fetched.count,
            "Pipeline completed successfully"
        );

        Ok(PipelineOutcome::Done {
            exported,
            new_files: fetched.count,
            prediction,
        })
    }

    async fn predict(&self, test_image: Option<&Path>) -> PredictionStatus {
        let image = match test_image {
            Some(path) => Some(path.to_path_buf()),
            None => find_test_image(
                &self.paths.split_images(Split::Test),
                &self.image_extensions,
            ),
        };

        match image {
            Some(image) if image.exists() => match self.backend.predict(&image).await {
                Ok(()) => PredictionStatus::Succeeded,
                Err(e) => {
                    warn!(error = %e, "Prediction failed, continuing pipeline");
                    PredictionStatus::Failed
                }
            },
            _ => {
                warn!("No test image available for prediction, skipping step");
                PredictionStatus::Skipped
            }
        }
    }
}

fn advance(stage: &mut PipelineStage, next: PipelineStage) {
    debug!(from = %stage, to = %next, "Stage transition");
    *stage = next;
}

fn abort(stage: PipelineStage, reason: impl fmt::Display) -> PipelineOutcome {
    metrics::counter!("retrain_stage_failures_total", "stage" => stage.to_string()).increment(1);
    PipelineOutcome::Aborted {
        stage,
        reason: reason.to_string(),
    }
}
