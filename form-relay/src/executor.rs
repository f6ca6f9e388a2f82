//! Executor seam: the blocking call that actually submits a row.

use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::types::JobRecord;

/// Submits one record to the target form.
///
/// Calls are blocking and slow; the bridge runs them on the blocking pool.
/// Implementations should poll `cancel` between steps and return
/// `ExecutorError::Cancelled` when it fires.
pub trait Executor: Send + Sync + 'static {
    /// `Ok(true)` means the form accepted the submission
    fn submit(&self, record: &JobRecord, cancel: &CancellationToken) -> Result<bool, ExecutorError>;
}

/// Adapts a closure into an [`Executor`]
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F>
where
    F: Fn(&JobRecord, &CancellationToken) -> Result<bool, ExecutorError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Executor for FnExecutor<F>
where
    F: Fn(&JobRecord, &CancellationToken) -> Result<bool, ExecutorError> + Send + Sync + 'static,
{
    fn submit(&self, record: &JobRecord, cancel: &CancellationToken) -> Result<bool, ExecutorError> {
        (self.0)(record, cancel)
    }
}

/// Run one submission on the blocking pool.
///
/// `Ok(false)`, an error and a panic all come back as `Err`.
pub async fn run_blocking(
    executor: Arc<dyn Executor>,
    record: JobRecord,
    cancel: CancellationToken,
) -> Result<(), ExecutorError> {
    let outcome = tokio::task::spawn_blocking(move || executor.submit(&record, &cancel)).await;

    match outcome {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(ExecutorError::Rejected),
        Ok(Err(e)) => Err(e),
        Err(join_error) if join_error.is_panic() => Err(ExecutorError::Panicked(panic_message(
            join_error.into_panic(),
        ))),
        Err(join_error) => Err(ExecutorError::Failed(join_error.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
