//! Runs one pipeline stage under its timeout and classifies how it failed.

use crate::error::{ServiceError, Stage, StageFailure};
use std::future::Future;
use std::time::Duration;

/// Await `fut` for at most `limit`. Stages are never retried; the caller aborts on failure.
pub async fn run_stage<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T, StageFailure>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StageFailure::Service { stage, source }),
        Err(_) => Err(StageFailure::Timeout {
            stage,
            secs: limit.as_secs(),
        }),
    }
}
