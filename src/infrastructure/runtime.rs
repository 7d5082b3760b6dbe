use crate::core::{AppError, AppResult};

/// Run a blocking job (file hashing, directory scans) off the async
/// executor and map join failures onto coded errors.
pub async fn run_blocking<T, F>(label: &'static str, job: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(job);
    match handle.await {
        Ok(result) => result,
        Err(error) => {
            if error.is_cancelled() {
                return Err(
                    AppError::new("BLOCKING_CANCELED", "blocking task canceled").with_detail(label)
                );
            }

            if error.is_panic() {
                return Err(AppError::new("BLOCKING_PANICKED", "blocking task panicked")
                    .with_detail(format!("{label}: {error:?}")));
            }

            Err(AppError::new("BLOCKING_FAILED", "blocking task failed")
                .with_detail(format!("{label}: {error:?}")))
        }
    }
}
