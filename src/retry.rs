//! Bounded exponential backoff for agent control calls.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    agent::{AgentControl, ControlCall, GatewayError, issue},
    config::Config,
};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.control_max_retries.max(1),
            base: Duration::from_millis(config.control_retry_base_ms),
            max: Duration::from_millis(config.control_retry_max_ms),
        }
    }

    /// Upper bound of the delay after the given (0-indexed) failed attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Full jitter: a uniform delay in `[0, ceiling]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Issues a control call, retrying transient failures. Rejections come back
/// immediately; cancellation abandons the call without another attempt.
pub async fn issue_with_retry(
    agent: &dyn AgentControl,
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    call: ControlCall,
    id: &str,
) -> Result<(), GatewayError> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(GatewayError::Abandoned { call }),
            result = issue(agent, call, id) => result,
        };

        match result {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(call = %call, id, attempt, error = %err, delay_ms = delay.as_millis() as u64, "agent call failed, retrying");
                attempt += 1;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(GatewayError::Abandoned { call }),
                    _ = sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
