//! Polling monitor that retrains when enough new remote data shows up.

use crate::config::MonitorConfig;
use crate::error::PipelineError;
use crate::persistence::RunCounter;
use crate::pipeline::{PipelineOrchestrator, PipelineOutcome};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of a single poll
#[derive(Debug)]
pub enum PollOutcome {
    /// Not enough new objects to trigger a run
    BelowThreshold { new_files: usize },
    /// A run was triggered and finished
    Ran {
        outcome: PipelineOutcome,
        remote_total: usize,
    },
}

/// Repeatedly checks the remote prefix and triggers pipeline runs
pub struct Monitor {
    pipeline: PipelineOrchestrator,
    counter: RunCounter,
    interval: Duration,
    threshold: usize,
    test_image: Option<PathBuf>,
}

impl Monitor {
    pub fn new(
        pipeline: PipelineOrchestrator,
        counter: RunCounter,
        config: &MonitorConfig,
        test_image: Option<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            counter,
            interval: config.interval(),
            threshold: config.min_new_files,
            test_image,
        }
    }

    /// Check once and run the pipeline if the threshold is reached.
    ///
    /// The run counter only moves after a successful run.
    pub async fn poll_once(&self) -> Result<PollOutcome, PipelineError> {
        let store = self.pipeline.store();
        let remote = store.list_remote_keys().await?;
        let local = store.list_local_keys()?;
        let new_files = remote.difference(&local).count();

        metrics::gauge!("retrain_pending_objects").set(new_files as f64);
        info!(
            new_files,
            remote_total = remote.len(),
            last_run_total = self.counter.read(),
            "Checking for new files"
        );

        if new_files < self.threshold {
            return Ok(PollOutcome::BelowThreshold { new_files });
        }

        info!(threshold = self.threshold, "New files threshold reached, triggering pipeline");
        let outcome = self
            .pipeline
            .run_pipeline(self.test_image.as_deref())
            .await?;

        if outcome.is_success() {
            self.counter
                .write(remote.len() as u64)
                .map_err(|source| PipelineError::Counter {
                    path: self.counter.path().to_path_buf(),
                    source,
                })?;
        }

        Ok(PollOutcome::Ran {
            outcome,
            remote_total: remote.len(),
        })
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Errors from a poll are logged and the loop carries on after the usual
    /// interval. Cancellation is observed between polls and during the sleep,
    /// never in the middle of a run.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold = self.threshold,
            "Starting remote store monitoring"
        );

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(outcome) => debug!(outcome = ?outcome, "Poll finished"),
                Err(e) => error!(error = %e, "Error in monitoring loop"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MockTrainingBackend};
    use crate::config::test_config;
    use crate::remote_store::testing::MemoryStore;
    use std::path::Path;
    use std::sync::Arc;

    fn monitor(
        dir: &Path,
        store: Arc<MemoryStore>,
        backend: MockTrainingBackend,
        threshold: usize,
    ) -> Monitor {
        let mut config = test_config(dir);
        config.monitor.min_new_files = threshold;
        config.monitor.interval_secs = 3600;
        let paths = config.paths();
        paths.create_directories().unwrap();

        let pipeline = PipelineOrchestrator::new(&config, store, Arc::new(backend));
        Monitor::new(pipeline, RunCounter::new(paths.counter_file), &config.monitor, None)
    }

    fn succeeding_backend() -> MockTrainingBackend {
        let mut backend = MockTrainingBackend::new();
        backend.expect_train().returning(|| Ok(()));
        backend.expect_predict().returning(|_| Ok(()));
        backend
            .expect_export()
            .returning(|_| Ok(PathBuf::from("/exports/model.torchscript")));
        backend
    }

    fn counter_value(dir: &Path) -> u64 {
        RunCounter::new(dir.join("last_file_count.txt")).read()
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/a.jpg", b"a");
        store.put("yolo_1/onion/b.jpg", b"b");

        let mut backend = MockTrainingBackend::new();
        backend.expect_train().times(0);

        let monitor = monitor(dir.path(), store, backend, 3);
        let outcome = monitor.poll_once().await.unwrap();

        assert!(matches!(outcome, PollOutcome::BelowThreshold { new_files: 2 }));
        assert_eq!(counter_value(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_successful_run_updates_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/a.jpg", b"a");
        store.put("yolo_1/onion/b.jpg", b"b");

        let monitor = monitor(dir.path(), store.clone(), succeeding_backend(), 1);
        let outcome = monitor.poll_once().await.unwrap();

        assert!(matches!(outcome, PollOutcome::Ran { remote_total: 2, .. }));
        assert_eq!(counter_value(dir.path()), 2);

        // Nothing new on the next poll
        let outcome = monitor.poll_once().await.unwrap();
        assert!(matches!(outcome, PollOutcome::BelowThreshold { new_files: 0 }));

        // A new upload crosses the threshold again
        store.put("yolo_1/strawberry/c.jpg", b"c");
        monitor.poll_once().await.unwrap();
        assert_eq!(counter_value(dir.path()), 3);
    }

    #[tokio::test]
    async fn test_aborted_run_keeps_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/a.jpg", b"a");

        let mut backend = MockTrainingBackend::new();
        backend.expect_train().returning(|| {
            Err(BackendError::ExternalToolFailure {
                stage: "train",
                status: "exit status: 1".to_string(),
                stderr_tail: String::new(),
            })
        });
        backend.expect_export().times(0);

        let monitor = monitor(dir.path(), store, backend, 1);
        let outcome = monitor.poll_once().await.unwrap();

        match outcome {
            PollOutcome::Ran { outcome, .. } => assert!(!outcome.is_success()),
            other => panic!("expected a run, got {:?}", other),
        }
        assert_eq!(counter_value(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let monitor = monitor(dir.path(), store, MockTrainingBackend::new(), 1);
        let result = monitor.poll_once().await;

        assert!(matches!(result, Err(ref e) if e.is_remote_unavailable()));
    }

    #[tokio::test]
    async fn test_run_survives_errors_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let monitor = monitor(dir.path(), store, MockTrainingBackend::new(), 1);
        let shutdown = CancellationToken::new();

        let canceller = {
            let shutdown = shutdown.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.cancel();
            }
        };

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(monitor.run(shutdown.clone()), canceller);
        })
        .await;

        assert!(finished.is_ok(), "monitor did not stop after cancellation");
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_polls() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/a.jpg", b"a");

        let mut backend = MockTrainingBackend::new();
        backend.expect_train().times(0);

        let monitor = monitor(dir.path(), store, backend, 1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        monitor.run(shutdown).await;
        assert!(!dir.path().join("raw/onion/a.jpg").exists());
    }
}
