use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Exp};
use tokio::time::Instant;

/// Strategy for the pause a session takes between task executions.
#[derive(Clone, Debug)]
pub enum WaitTime {
    /// Always the same pause.
    Constant(Duration),
    /// Uniformly random pause in `[min, max]`.
    Between(Duration, Duration),
    /// Pause for whatever remains of the target inter-trigger period after
    /// accounting for the duration of the just-completed task, clamped at
    /// zero. Keeps task *starts* evenly paced no matter how long each task
    /// runs.
    ConstantPacing(Duration),
    /// Exponentially distributed pause with the given mean, yielding
    /// Poisson-arrival task starts.
    Poisson(Duration),
}

impl WaitTime {
    pub fn constant(wait: Duration) -> Self {
        Self::Constant(wait)
    }

    pub fn between(min: Duration, max: Duration) -> Self {
        Self::Between(min, max)
    }

    pub fn constant_pacing(period: Duration) -> Self {
        Self::ConstantPacing(period)
    }

    /// The inverse of [`constant_pacing`](Self::constant_pacing): aim for
    /// `task_runs_per_second` task starts per second.
    pub fn constant_throughput(task_runs_per_second: f64) -> Self {
        Self::ConstantPacing(Duration::from_secs_f64(1.0 / task_runs_per_second))
    }

    pub fn poisson(mean: Duration) -> Self {
        Self::Poisson(mean)
    }

    pub(crate) fn next(&self, state: &mut WaitState) -> Duration {
        match self {
            Self::Constant(wait) => *wait,
            Self::Between(min, max) => {
                let spread = max.saturating_sub(*min);
                *min + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
            }
            Self::ConstantPacing(period) => {
                let now = Instant::now();
                let wait = match state.last_run {
                    // Elapsed time beyond the previous wait was spent running
                    // the task; only sleep the residual of the period.
                    Some(last) => {
                        let run_time = now.duration_since(last).saturating_sub(state.last_wait);
                        period.saturating_sub(run_time)
                    }
                    None => *period,
                };
                state.last_run = Some(now);
                state.last_wait = wait;
                wait
            }
            Self::Poisson(mean) => {
                let mean = mean.as_secs_f64();
                if mean <= 0.0 {
                    return Duration::ZERO;
                }
                let exp = Exp::new(1.0 / mean).expect("rate is positive and finite");
                Duration::from_secs_f64(exp.sample(&mut rand::thread_rng()))
            }
        }
    }
}

/// Per-session pacing bookkeeping, only meaningful for
/// [`WaitTime::ConstantPacing`].
#[derive(Clone, Debug, Default)]
pub(crate) struct WaitState {
    last_run: Option<Instant>,
    last_wait: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_returns_the_configured_wait() {
        let mut state = WaitState::default();
        let wait = WaitTime::constant(Duration::from_millis(250));
        assert_eq!(wait.next(&mut state), Duration::from_millis(250));
    }

    #[test]
    fn between_stays_in_range() {
        let mut state = WaitState::default();
        let wait = WaitTime::between(Duration::from_millis(100), Duration::from_millis(200));
        for _ in 0..100 {
            let d = wait.next(&mut state);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_sleeps_only_the_residual() {
        let mut state = WaitState::default();
        let wait = WaitTime::constant_pacing(Duration::from_secs(10));

        // First trigger has nothing to subtract.
        assert_eq!(wait.next(&mut state), Duration::from_secs(10));
        // The wait itself elapses, then the task runs for 4s.
        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(wait.next(&mut state), Duration::from_secs(6));
        // A task slower than the period clamps the wait to zero.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(wait.next(&mut state), Duration::ZERO);
    }

    #[test]
    fn poisson_mean_is_plausible() {
        let mut state = WaitState::default();
        let wait = WaitTime::poisson(Duration::from_millis(100));
        let n = 2000;
        let total: Duration = (0..n).map(|_| wait.next(&mut state)).sum();
        let mean = total / n;
        assert!(
            mean > Duration::from_millis(50) && mean < Duration::from_millis(200),
            "sample mean was {mean:?}"
        );
    }
}
