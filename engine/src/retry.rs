//! Bounded retries for per-file operations.

use crate::cancel::CancellationToken;
use crate::config::RetryPolicy;
use crate::error::TransferError;

/// How a retried operation ended.
#[derive(Debug)]
pub enum Outcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// The last error after all attempts, or the first non-retryable one
    Exhausted { error: TransferError, attempts: u32 },
    /// Cancellation was observed before a retry
    Cancelled { attempts: u32 },
}

impl<T> Outcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Succeeded { attempts, .. }
            | Outcome::Exhausted { attempts, .. }
            | Outcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Run `op` up to `policy.max_attempts` times.
///
/// Waits `policy.delay` between attempts. The token is checked before every
/// retry and during the delay; the first attempt always runs. A connection
/// loss ends the loop immediately.
pub fn attempt<T, F>(mut op: F, policy: &RetryPolicy, cancel: &CancellationToken) -> Outcome<T>
where
    F: FnMut(u32) -> Result<T, TransferError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match op(attempts) {
            Ok(value) => return Outcome::Succeeded { value, attempts },
            Err(e) => e,
        };
        if attempts >= max_attempts || !error.is_retryable() {
            return Outcome::Exhausted { error, attempts };
        }
        tracing::warn!(
            "attempt {}/{} failed: {}; retrying",
            attempts,
            max_attempts,
            crate::error::error_chain(&error)
        );
        if cancel.sleep(policy.delay).is_err() {
            return Outcome::Cancelled { attempts };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn write_error(kind: io::ErrorKind) -> TransferError {
        TransferError::Write {
            path: "f".to_string(),
            source: io::Error::new(kind, "boom"),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let token = CancellationToken::new();
        let outcome = attempt(
            |n| {
                if n < 3 {
                    Err(write_error(io::ErrorKind::Other))
                } else {
                    Ok(n)
                }
            },
            &policy(3),
            &token,
        );
        assert!(matches!(outcome, Outcome::Succeeded { value: 3, attempts: 3 }));
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let token = CancellationToken::new();
        let mut calls = 0;
        let outcome: Outcome<()> = attempt(
            |_| {
                calls += 1;
                Err(write_error(io::ErrorKind::Other))
            },
            &policy(4),
            &token,
        );
        assert_eq!(calls, 4);
        assert!(matches!(outcome, Outcome::Exhausted { attempts: 4, .. }));
    }

    #[test]
    fn test_connection_loss_is_not_retried() {
        let token = CancellationToken::new();
        let outcome: Outcome<()> = attempt(
            |_| Err(write_error(io::ErrorKind::ConnectionReset)),
            &policy(5),
            &token,
        );
        assert_eq!(outcome.attempts(), 1);
    }

    #[test]
    fn test_cancel_stops_retries() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let outcome: Outcome<()> = attempt(
            |_| {
                canceller.cancel();
                Err(write_error(io::ErrorKind::Other))
            },
            &policy(5),
            &token,
        );
        assert!(matches!(outcome, Outcome::Cancelled { attempts: 1 }));
    }

    #[test]
    fn test_zero_max_attempts_still_runs_once() {
        let token = CancellationToken::new();
        let outcome = attempt(|_| Ok::<_, TransferError>(()), &policy(0), &token);
        assert_eq!(outcome.attempts(), 1);
    }
}
