use crate::remote_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that escape a pipeline run or a monitor poll.
///
/// Stage failures after fetching are reported as an aborted outcome, not here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to persist run counter at {path}: {source}")]
    Counter {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Whether the remote store could not be reached at all
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, PipelineError::Store(StoreError::RemoteUnavailable(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_outages_are_remote_unavailable() {
        let outage: PipelineError = StoreError::RemoteUnavailable("offline".to_string()).into();
        assert!(outage.is_remote_unavailable());

        let download: PipelineError = StoreError::Download {
            key: "yolo_1/onion/a.jpg".to_string(),
            message: "reset".to_string(),
        }
        .into();
        assert!(!download.is_remote_unavailable());

        let counter = PipelineError::Counter {
            path: PathBuf::from("/data/last_file_count.txt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        };
        assert!(!counter.is_remote_unavailable());
        assert!(counter.to_string().contains("last_file_count.txt"));
    }
}
