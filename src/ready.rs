//! # Ready
//!
//! Waits until the host has finished initializing the code the fixes target.
//! The first readiness probe runs after a fixed delay, later ones back off exponentially until a
//! total time budget is spent.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::settings::StartupConfig;

/// Retry schedule for readiness probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Wait before the first probe
    pub initial: Duration,
    /// Wait before the second probe, doubled after every failure
    pub interval: Duration,
    /// Upper bound for a single wait
    pub max_interval: Duration,
    /// Upper bound for the sum of all waits after the first probe
    pub timeout: Duration,
}

impl From<StartupConfig> for Backoff {
    fn from(config: StartupConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.delay_ms),
            interval: Duration::from_millis(config.retry_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

impl Backoff {
    /// Waits between probes, in order
    pub fn delays(&self) -> Delays {
        Delays {
            next: self.interval,
            max_interval: self.max_interval,
            remaining: self.timeout,
        }
    }
}

/// Iterator over the waits of a [`Backoff`]
#[derive(Debug, Clone)]
pub struct Delays {
    /// Uncapped length of the next wait
    next: Duration,
    /// Cap for a single wait
    max_interval: Duration,
    /// Budget left
    remaining: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let delay = self.next.min(self.max_interval).min(self.remaining);
        if delay.is_zero() {
            return None;
        }
        self.remaining -= delay;
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }
}

/// Outcome of [`wait_until_ready`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The probe succeeded
    Ready {
        /// Probes run, including the successful one
        attempts: u32,
    },
    /// The budget ran out first
    TimedOut {
        /// Probes run
        attempts: u32,
    },
}

/// Sleeps `backoff.initial`, then runs `probe` until it returns true or the backoff is exhausted
pub fn wait_until_ready<P, S>(mut probe: P, backoff: &Backoff, mut sleep: S) -> Readiness
where
    P: FnMut() -> bool,
    S: FnMut(Duration),
{
    sleep(backoff.initial);
    let mut attempts = 1;
    if probe() {
        return Readiness::Ready { attempts };
    }

    for delay in backoff.delays() {
        debug!("Host not ready after {} attempts, retrying in {}ms", attempts, delay.as_millis());
        sleep(delay);
        attempts += 1;
        if probe() {
            info!("Host ready after {} attempts", attempts);
            return Readiness::Ready { attempts };
        }
    }

    warn!("Host not ready after {} attempts, applying fixes anyway", attempts);
    Readiness::TimedOut { attempts }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Millisecond helper
    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    /// The schedule used by the default config
    fn backoff() -> Backoff {
        Backoff::from(StartupConfig::default())
    }

    #[test]
    /// Waits double up to the cap and never exceed the budget in total
    fn test_delays() {
        let delays: Vec<_> = backoff().delays().collect();
        assert_eq!(
            delays,
            [ms(250), ms(500), ms(1000), ms(2000), ms(2000), ms(2000), ms(2000), ms(250)]
        );
        assert_eq!(delays.iter().sum::<Duration>(), ms(10_000));
    }

    #[test]
    fn test_zero_timeout() {
        let backoff = Backoff {
            timeout: Duration::ZERO,
            ..backoff()
        };
        assert_eq!(backoff.delays().count(), 0);
    }

    #[test]
    fn test_ready_immediately() {
        let mut slept = Vec::new();
        let readiness = wait_until_ready(|| true, &backoff(), |d| slept.push(d));
        assert_eq!(readiness, Readiness::Ready { attempts: 1 });
        assert_eq!(slept, [ms(1000)]);
    }

    #[test]
    fn test_ready_after_retries() {
        let mut probes = 0;
        let mut slept = Vec::new();
        let readiness = wait_until_ready(
            || {
                probes += 1;
                probes == 3
            },
            &backoff(),
            |d| slept.push(d),
        );
        assert_eq!(readiness, Readiness::Ready { attempts: 3 });
        assert_eq!(slept, [ms(1000), ms(250), ms(500)]);
    }

    #[test]
    fn test_timed_out() {
        let mut slept = Duration::ZERO;
        let readiness = wait_until_ready(|| false, &backoff(), |d| slept += d);
        assert_eq!(readiness, Readiness::TimedOut { attempts: 9 });
        assert_eq!(slept, ms(11_000));
    }
}
