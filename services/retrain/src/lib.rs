//! Harvest Retrain Service
//!
//! Keeps the crop detection model in step with the images field workers
//! upload. New objects under the dataset prefix are mirrored locally, split
//! into train/val/test, and handed to the external `yolo` CLI for training,
//! a sample prediction and export.
//!
//! ## Architecture
//!
//! ```text
//! Object Store           Local Mirror           Processed Dataset
//! ┌──────────────┐      ┌──────────────┐       ┌──────────────────┐
//! │ yolo_1/      │      │ raw/         │       │ processed/       │
//! │   {category}/│─────▶│   {category}/│──────▶│   {split}/images │
//! └──────────────┘      └──────────────┘       │   {split}/labels │
//!        ▲                                     │   data.yaml      │
//!        │                                     └──────────────────┘
//! ┌──────────────┐      ┌──────────────┐                │
//! │ Monitor      │─────▶│ Pipeline     │                ▼
//! │ (polling)    │      │ Orchestrator │──────▶ ┌──────────────────┐
//! └──────────────┘      └──────────────┘        │ Training Backend │
//!                                               │ train / predict /│
//!                                               │ export           │
//!                                               └──────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod monitor;
pub mod organizer;
pub mod persistence;
pub mod pipeline;
pub mod remote_store;

pub use backend::{BackendError, TrainingBackend, YoloCliBackend};
pub use config::{Config, Paths};
pub use error::PipelineError;
pub use monitor::{Monitor, PollOutcome};
pub use organizer::{DatasetOrganizer, OrganizeError, OrganizeReport, Split};
pub use persistence::{find_test_image, RunCounter};
pub use pipeline::{PipelineOrchestrator, PipelineOutcome, PipelineStage, PredictionStatus};
pub use remote_store::{FetchReport, ObjectStore, RemoteStoreClient, S3ObjectStore, StoreError};
