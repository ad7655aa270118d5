//! Off-thread execution of blocking work
//!
//! Subprocess calls and file I/O block; front-ends run them on the tokio
//! blocking pool so their own loop stays responsive.

use crate::error::TaskError;

/// Run `work` on the blocking thread pool and await its result
pub async fn run_blocking<F, T>(work: F) -> Result<T, TaskError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let value = run_blocking(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_reports_panics() {
        let result = run_blocking(|| -> u32 { panic!("boom") }).await;
        assert!(matches!(result, Err(TaskError::Join(_))));
    }
}
