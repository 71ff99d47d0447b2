//! Exponential backoff under a global time budget.

use std::{fmt::Display, future::Future, time::Duration};

use tokio::time::sleep;

/// Result of one attempt of a retried operation.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Ok(T),
    /// Transient: sleep and try again while budget remains.
    Retryable(E),
    /// Definitive: stop immediately.
    Fatal(E),
}

/// Why a retried operation stopped without a value.
#[derive(Debug)]
pub enum Stop<E> {
    /// The budget ran out. Holds the last retryable error.
    Exhausted(E),
    Fatal(E),
}

/// Retry time shared by every retried call of one poll.
///
/// Each call starts backing off at `initial` and doubles per failure. Before
/// every sleep the cumulative retry time is checked against `ceiling`, so a
/// poll overshoots the ceiling by less than one interval.
#[derive(Debug, Clone)]
pub struct PollBudget {
    initial: Duration,
    ceiling: Duration,
    elapsed: Duration,
}

impl PollBudget {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self { initial: initial.max(Duration::from_millis(1)), ceiling, elapsed: Duration::ZERO }
    }

    /// Total time spent sleeping between attempts so far.
    pub fn elapsed(&self) -> Duration { self.elapsed }

    pub fn ceiling(&self) -> Duration { self.ceiling }

    pub fn is_exhausted(&self) -> bool { self.elapsed >= self.ceiling }

    pub async fn retry<T, E, F, Fut>(&mut self, stage: &str, mut op: F) -> Result<T, Stop<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
        E: Display,
    {
        let mut interval = self.initial;
        loop {
            match op().await {
                Attempt::Ok(value) => return Ok(value),
                Attempt::Fatal(e) => {
                    tracing::error!("{}: {}", stage, e);
                    return Err(Stop::Fatal(e));
                }
                Attempt::Retryable(e) => {
                    if self.is_exhausted() {
                        tracing::warn!(
                            "{}: max timeout reached after {}s: {}",
                            stage,
                            self.elapsed.as_secs(),
                            e
                        );
                        return Err(Stop::Exhausted(e));
                    }
                    tracing::info!("{}: {}, retrying in {}s", stage, e, interval.as_secs_f32());
                    sleep(interval).await;
                    self.elapsed += interval;
                    interval = interval.saturating_mul(2);
                }
            }
        }
    }
}
