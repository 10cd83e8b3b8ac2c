//! Bounded workers: start a blocking operation, join it with a timeout and
//! carry on regardless once the timeout expires.

use std::io;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::KillSwitchError;

/// Upper bound for a single inventory or mount-table query.
pub const ENUMERATION_LIMIT: Duration = Duration::from_secs(5);

/// Extra time granted to a host call that enforces its own deadline, so it
/// can kill its child and report before the join gives up on it.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

// Roughly 30 years; stands in for deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `limit` from now, saturating instead of overflowing.
pub fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Run `work` on the blocking pool and wait at most `limit` for it.
///
/// On expiry the worker thread is abandoned: it keeps running until the
/// underlying call returns, but nobody waits for it.
pub async fn bounded<T, F>(operation: &str, limit: Duration, work: F) -> Result<T, KillSwitchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(work);

    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_panic() => Err(KillSwitchError::TaskExecution(format!("{} worker panicked", operation))),
        Ok(Err(e)) => Err(KillSwitchError::TaskExecution(format!("{} worker failed: {}", operation, e))),
        Err(_) => {
            debug!("abandoning {} worker after {:?}", operation, limit);
            Err(KillSwitchError::timeout(operation, limit))
        }
    }
}

/// Like `bounded`, for host calls that receive `limit` themselves and stop
/// their own child process when it elapses. A `TimedOut` I/O error from the
/// call is reported as a task timeout.
pub async fn bounded_io<T, F>(operation: &str, limit: Duration, work: F) -> Result<T, KillSwitchError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match bounded(operation, limit.saturating_add(CANCEL_GRACE), work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Err(KillSwitchError::timeout(operation, limit)),
        Ok(Err(e)) => Err(e.into()),
        Err(KillSwitchError::TaskTimeout { .. }) => Err(KillSwitchError::timeout(operation, limit)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[tokio::test]
    async fn test_bounded_returns_value() {
        let value = bounded("add", Duration::from_secs(1), || 2 + 2).await.unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn test_bounded_gives_up_on_slow_work() {
        let started = std::time::Instant::now();
        let result = bounded("sleep", Duration::from_millis(50), || {
            thread::sleep(Duration::from_millis(400));
        })
        .await;

        assert!(matches!(result, Err(KillSwitchError::TaskTimeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_bounded_reports_panics() {
        let result: Result<(), _> = bounded("boom", Duration::from_secs(1), || panic!("boom")).await;
        match result {
            Err(KillSwitchError::TaskExecution(msg)) => assert_eq!(msg, "boom worker panicked"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deadline_after_saturates() {
        let soon = deadline_after(Duration::from_secs(1));
        assert!(soon > Instant::now());

        let far = deadline_after(Duration::from_secs(u64::MAX));
        assert!(far > soon);
    }

    #[tokio::test]
    async fn test_bounded_io_survives_huge_limits() {
        let value = bounded_io("echo", Duration::MAX, || Ok(7)).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_bounded_io_maps_timed_out_kind() {
        let result: Result<(), _> = bounded_io("cmd", Duration::from_millis(10), || {
            Err(io::Error::new(io::ErrorKind::TimedOut, "killed"))
        })
        .await;
        assert!(result.unwrap_err().is_timeout());

        let result: Result<(), _> = bounded_io("cmd", Duration::from_millis(10), || {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        })
        .await;
        assert!(matches!(result, Err(KillSwitchError::Io(_))));
    }
}
