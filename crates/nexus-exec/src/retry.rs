//! Bounded retries around remote operations
//!
//! Every attempt runs on a fresh channel of the same session under a per-attempt timeout.
//! A non-zero exit status counts as a failure. After the last attempt the last error is
//! returned.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Per-attempt bound on the operation itself
    pub timeout: Duration,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Run `op` up to `policy.attempts` times, returning the first success or the last error
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ExecError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts || !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "remote operation failed, retrying");
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Run `cmd` with retries
pub async fn run(
    session: &dyn RemoteSession,
    cmd: &str,
    policy: &RetryPolicy,
) -> Result<CommandResult, ExecError> {
    with_retry(policy, |attempt| async move {
        debug!(attempt, command = %cmd, "running remote command");
        let result = session.exec(cmd, policy.timeout).await?;
        if !result.success() {
            return Err(ExecError::CommandFailed {
                status: result.status,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    })
    .await
}

/// Upload `contents` to `path` with retries
pub async fn upload(
    session: &dyn RemoteSession,
    path: &str,
    contents: &[u8],
    mode: u32,
    policy: &RetryPolicy,
) -> Result<(), ExecError> {
    with_retry(policy, |attempt| async move {
        debug!(attempt, path, "uploading file");
        tokio::time::timeout(policy.timeout, session.upload(path, contents, mode))
            .await
            .map_err(|_| ExecError::Timeout {
                timeout: policy.timeout,
            })?
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    /// Fails the first `failures` operations, then exits with `status`
    struct CountingSession {
        calls: AtomicU32,
        failures: u32,
        status: i32,
    }

    impl CountingSession {
        fn new(failures: u32, status: i32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                status,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<(), ExecError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(ExecError::IoError(format!("channel refused #{n}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteSession for CountingSession {
        async fn exec(&self, _cmd: &str, _timeout: Duration) -> Result<CommandResult, ExecError> {
            self.next()?;
            Ok(CommandResult {
                status: self.status,
                stdout: String::new(),
                stderr: format!("exit {}", self.status),
                duration: Duration::ZERO,
            })
        }

        async fn upload(&self, _path: &str, _contents: &[u8], _mode: u32) -> Result<(), ExecError> {
            self.next()
        }

        async fn close(&self) {}

        fn session_type(&self) -> &'static str {
            "counting"
        }
    }

    /// Never completes a command
    struct HangingSession;

    #[async_trait]
    impl RemoteSession for HangingSession {
        async fn exec(&self, _cmd: &str, limit: Duration) -> Result<CommandResult, ExecError> {
            tokio::time::sleep(limit).await;
            Err(ExecError::Timeout { timeout: limit })
        }

        async fn upload(&self, _path: &str, _contents: &[u8], _mode: u32) -> Result<(), ExecError> {
            std::future::pending().await
        }

        async fn close(&self) {}

        fn session_type(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_gets_three_attempts() {
        let session = CountingSession::new(u32::MAX, 0);
        let err = run(&session, "true", &RetryPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(session.calls(), 3);
        assert_eq!(err.to_string(), "I/O error: channel refused #3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_is_single_attempt() {
        let session = CountingSession::new(0, 0);
        run(&session, "true", &RetryPolicy::default()).await.unwrap();
        assert_eq!(session.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let session = CountingSession::new(2, 0);
        run(&session, "true", &RetryPolicy::default()).await.unwrap();
        assert_eq!(session.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_retried_then_reported() {
        let session = CountingSession::new(0, 2);
        let err = run(&session, "false", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(session.calls(), 3);
        assert!(matches!(err, ExecError::CommandFailed { status: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_command_times_out_each_attempt() {
        let start = tokio::time::Instant::now();
        let err = run(&HangingSession, "sleep 60", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        // three 10s attempts plus two 1s pauses
        assert_eq!(start.elapsed(), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_upload_is_bounded() {
        let err = upload(&HangingSession, "/tmp/x", b"x", 0o600, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_is_retried() {
        let session = CountingSession::new(u32::MAX, 0);
        upload(&session, "/tmp/x", b"x", 0o600, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(session.calls(), 3);
    }

    #[tokio::test]
    async fn test_key_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), _> = with_retry(&policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecError::SshKeyError("missing".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
