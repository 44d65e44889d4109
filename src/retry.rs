use std::time::Duration;
use tokio::time::Instant;

/// Exponential retry delays bounded by a total elapsed time.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Used for writes that must eventually land, like marking a resource failed.
    pub fn long(max_elapsed: Duration) -> Self {
        RetryPolicy {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_elapsed,
            multiplier: 2.0,
        }
    }

    pub fn start(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            started: Instant::now(),
            next: self.initial,
        }
    }
}

pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    started: Instant,
    next: Duration,
}

impl Backoff<'_> {
    /// The delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.policy.max_elapsed {
            return None;
        }
        let delay = self
            .next
            .min(self.policy.max_delay)
            .min(self.policy.max_elapsed - elapsed);
        self.next = self
            .next
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_delay);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delays_grow_until_budget_is_spent() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_elapsed: Duration::from_millis(100),
            multiplier: 2.0,
        };
        let mut backoff = policy.start();
        let mut delays = vec![];
        while let Some(d) = backoff.next_delay() {
            delays.push(d);
            tokio::time::sleep(d).await;
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(30),
            ]
        );
    }
}
