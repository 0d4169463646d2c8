//! Deadline racing: a generic "first completion wins" primitive and a deadline
//! wrapper that owns a CancellationToken.
//! When the timer wins, the token is cancelled and the losing future is dropped,
//! which also drops any HTTP request it was awaiting.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures_util::future::select_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A boxed future that can take part in a race.
pub type Contender<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Run all contenders concurrently. Returns the index and output of the first
/// one to complete; the others are dropped. `None` for an empty field.
pub async fn first_completed<'a, T>(contenders: Vec<Contender<'a, T>>) -> Option<(usize, T)> {
    if contenders.is_empty() {
        return None;
    }
    let (output, index, _losers) = select_all(contenders).await;
    Some((index, output))
}

/// The deadline fired before the raced operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineElapsed {
    pub after: Duration,
}

/// A fixed deadline measured from construction.
pub struct Deadline {
    budget: Duration,
    started: Instant,
    expires_at: tokio::time::Instant,
    token: CancellationToken,
}

enum Outcome<T> {
    Done(T),
    Elapsed,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: Instant::now(),
            expires_at: tokio::time::Instant::now() + budget,
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when the deadline fires. Hand child tokens to transports.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Race `operation` against the remaining time.
    pub async fn race<'a, F>(&'a self, operation: F) -> Result<F::Output, DeadlineElapsed>
    where
        F: Future + Send + 'a,
        F::Output: Send + 'a,
    {
        let expires_at = self.expires_at;
        let contenders: Vec<Contender<'a, Outcome<F::Output>>> = vec![
            Box::pin(async move { Outcome::Done(operation.await) }),
            Box::pin(async move {
                tokio::time::sleep_until(expires_at).await;
                Outcome::Elapsed
            }),
        ];

        match first_completed(contenders).await {
            Some((_, Outcome::Done(output))) => Ok(output),
            Some((_, Outcome::Elapsed)) | None => {
                self.token.cancel();
                let after = self.started.elapsed();
                debug!(budget_ms = self.budget.as_millis() as u64, after_ms = after.as_millis() as u64, "deadline_elapsed");
                Err(DeadlineElapsed { after })
            }
        }
    }
}

/// Race `operation` against a fresh deadline of `budget`.
pub async fn with_deadline<F>(budget: Duration, operation: F) -> Result<F::Output, DeadlineElapsed>
where
    F: Future + Send,
    F::Output: Send,
{
    Deadline::new(budget).race(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_completed_picks_fastest() {
        let contenders: Vec<Contender<'_, &str>> = vec![
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "slow"
            }),
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                "fast"
            }),
        ];
        let (index, winner) = first_completed(contenders).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(winner, "fast");
    }

    #[tokio::test]
    async fn first_completed_empty_is_none() {
        let contenders: Vec<Contender<'_, ()>> = Vec::new();
        assert!(first_completed(contenders).await.is_none());
    }

    #[tokio::test]
    async fn deadline_lets_fast_operation_through() {
        let deadline = Deadline::new(Duration::from_millis(500));
        let out = deadline.race(async { 7 }).await;
        assert_eq!(out, Ok(7));
        assert!(!deadline.token().is_cancelled());
    }

    #[tokio::test]
    async fn with_deadline_reports_elapsed() {
        let out = with_deadline(Duration::from_millis(20), tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(out.is_err());
        assert_eq!(with_deadline(Duration::from_secs(1), async { "done" }).await, Ok("done"));
    }

    #[tokio::test]
    async fn deadline_fires_and_cancels_token() {
        let deadline = Deadline::new(Duration::from_millis(30));
        let started = Instant::now();
        let out = deadline
            .race(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                1
            })
            .await;
        let err = out.unwrap_err();
        assert!(err.after >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(deadline.token().is_cancelled());
    }
}
