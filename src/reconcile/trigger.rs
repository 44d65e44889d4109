use std::time::Duration;
use tokio::sync::Notify;

/// Wakes the owning loop for an inspection. Triggers coalesce: any number of
/// calls before the loop gets to run results in a single wake-up.
#[derive(Debug, Default)]
pub struct Trigger {
    notify: Notify,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub async fn triggered(&self) {
        self.notify.notified().await
    }
}

/// Result of one inspection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inspection {
    pub has_error: bool,
    /// Requested delay until the next pass, capped at the maximum interval.
    pub next_interval: Option<Duration>,
    /// Set when the resource can never reach its desired state.
    pub fatal: Option<String>,
}

impl Inspection {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error() -> Self {
        Inspection {
            has_error: true,
            ..Self::default()
        }
    }

    pub fn fatal<S: Into<String>>(reason: S) -> Self {
        Inspection {
            has_error: true,
            fatal: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, has_error: bool) -> Self {
        self.has_error |= has_error;
        self
    }

    pub fn next_in(mut self, interval: Duration) -> Self {
        self.next_interval = Some(interval);
        self
    }
}

/// Decides how long the loop sleeps between unsolicited inspections.
#[derive(Clone, Debug)]
pub struct InspectionScheduler {
    interval: Duration,
    min: Duration,
    max: Duration,
    recent_errors: u32,
}

impl InspectionScheduler {
    pub fn new(min: Duration, max: Duration) -> Self {
        InspectionScheduler {
            interval: max,
            min: min.min(max),
            max,
            recent_errors: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The timer fired without any other event.
    pub fn on_timeout(&mut self) {
        self.interval = self.interval.mul_f64(1.5).min(self.max);
    }

    pub fn record(&mut self, inspection: &Inspection) {
        if let Some(next) = inspection.next_interval {
            self.interval = next.min(self.max);
        }
        if inspection.has_error {
            if self.recent_errors == 0 {
                self.interval = self.min;
            }
            self.recent_errors += 1;
        } else {
            self.recent_errors = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn backs_off_up_to_max() {
        let mut s = InspectionScheduler::new(MIN, MAX);
        assert_eq!(s.interval(), MAX);

        s.record(&Inspection::error());
        assert_eq!(s.interval(), MIN);
        s.on_timeout();
        assert_eq!(s.interval(), Duration::from_millis(1500));
        for _ in 0..20 {
            s.on_timeout();
            assert!(s.interval() <= MAX);
        }
        assert_eq!(s.interval(), MAX);
    }

    #[test]
    fn only_first_error_of_streak_resets() {
        let mut s = InspectionScheduler::new(MIN, MAX);
        s.record(&Inspection::error());
        s.on_timeout();
        s.on_timeout();
        let grown = s.interval();
        assert!(grown > MIN);

        s.record(&Inspection::error());
        assert_eq!(s.interval(), grown);

        s.record(&Inspection::ok());
        s.record(&Inspection::error());
        assert_eq!(s.interval(), MIN);
    }

    #[test]
    fn requested_interval_is_capped() {
        let mut s = InspectionScheduler::new(MIN, MAX);
        s.record(&Inspection::ok().next_in(Duration::from_secs(10)));
        assert_eq!(s.interval(), Duration::from_secs(10));
        s.record(&Inspection::ok().next_in(Duration::from_secs(600)));
        assert_eq!(s.interval(), MAX);
    }

    #[tokio::test]
    async fn triggers_coalesce() {
        let t = Trigger::new();
        t.trigger();
        t.trigger();
        t.triggered().await;
        let second = tokio::time::timeout(Duration::from_millis(20), t.triggered()).await;
        assert!(second.is_err());
    }
}
