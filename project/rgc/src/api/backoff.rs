use std::{future::Future, time::Duration};

use rand::{Rng, rng};

use super::store::StoreError;
use crate::protocol::config::RetryConfig;

/// Bounded retry schedule for optimistic-concurrency conflicts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_steps: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_steps: cfg.max_steps.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            factor: cfg.factor,
            jitter: cfg.jitter,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the `step`-th failed attempt (0-based).
    pub fn delay(&self, step: u32) -> Duration {
        let exp = self.factor.powi(step.min(30) as i32);
        let mut delay = self.base_delay.mul_f64(exp).min(self.max_delay);
        if self.jitter > 0.0 {
            let extra = rng().random_range(0.0..=self.jitter);
            delay += delay.mul_f64(extra);
        }
        delay
    }

    /// Runs `f` until it succeeds, fails with anything but `Conflict`, or the
    /// step budget is spent. Exhaustion returns the last conflict.
    pub async fn retry_on_conflict<F, Fut, R>(&self, mut f: F) -> Result<R, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, StoreError>>,
    {
        let mut step = 0;
        loop {
            match f().await {
                Err(e) if e.is_conflict() => {
                    step += 1;
                    if step >= self.max_steps {
                        return Err(e);
                    }
                    log::debug!("conflict on attempt {step}/{}: {e}", self.max_steps);
                    tokio::time::sleep(self.delay(step - 1)).await;
                }
                other => return other,
            }
        }
    }
}
