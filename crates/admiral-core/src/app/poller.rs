//! Bounded-retry polling of a document until a condition holds.
//!
//! # Algorithm
//! 1. fetch the document
//! 2. condition holds: run `on_success` once
//! 3. otherwise, retries left: re-check after a delay
//! 4. otherwise: log, and run `on_exhausted` only if the shared
//!    [`FailOnce`] latch was not tripped yet
//!
//! A poller issues at most `retries + 1` fetches and never blocks: each
//! re-check is a job handed to the host's scheduler.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};

use super::host::TaskHost;
use super::join::{FailOnce, FanIn};
use crate::config::ProvisioningConfig;
use crate::ports::Job;

pub type Condition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Retry count and delay between re-checks.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub retries: u32,
    /// Delay before the first re-check.
    pub delay: Duration,
    /// 1.0 keeps the delay fixed.
    pub multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::fixed(30, Duration::from_secs(20))
    }
}

impl From<&ProvisioningConfig> for PollerConfig {
    fn from(config: &ProvisioningConfig) -> Self {
        Self::fixed(config.wait_retries, config.wait_delay())
    }
}

impl PollerConfig {
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            multiplier: 1.0,
        }
    }

    /// Delay before re-check number `attempt` (1-indexed):
    /// `delay * multiplier^(attempt - 1)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        Duration::from_secs_f64(self.delay.as_secs_f64() * self.multiplier.powi(exponent))
    }
}

struct PollAttempt {
    link: String,
    retries_left: u32,
    attempt: u32,
    failed_once: Arc<FailOnce>,
    condition: Condition,
    on_success: Box<dyn FnOnce(Value) + Send>,
    on_exhausted: Box<dyn FnOnce(String) + Send>,
}

#[derive(Clone)]
pub struct ResourcePoller {
    host: TaskHost,
    config: PollerConfig,
}

impl ResourcePoller {
    pub fn new(host: TaskHost, config: PollerConfig) -> Self {
        Self { host, config }
    }

    pub fn from_config(host: TaskHost, config: &ProvisioningConfig) -> Self {
        Self::new(host, PollerConfig::from(config))
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll `link` until `condition` holds.
    ///
    /// Pollers that belong together share `failed_once`, so only the first
    /// one to give up runs its `on_exhausted`.
    pub fn get_resource_when_available<S, F>(
        &self,
        link: impl Into<String>,
        failed_once: Arc<FailOnce>,
        condition: Condition,
        on_success: S,
        on_exhausted: F,
    ) where
        S: FnOnce(Value) + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        let attempt = PollAttempt {
            link: link.into(),
            retries_left: self.config.retries,
            attempt: 0,
            failed_once,
            condition,
            on_success: Box::new(on_success),
            on_exhausted: Box::new(on_exhausted),
        };
        tokio::spawn(self.clone().poll(attempt));
    }

    /// Poll every link; run `on_all_ready` once all of them satisfied
    /// `condition`, or `on_failure` once if any of them gave up.
    ///
    /// An empty set is ready immediately.
    pub fn wait_all<S, F>(&self, links: Vec<String>, condition: Condition, on_all_ready: S, on_failure: F)
    where
        S: Fn() + Send + Sync + 'static,
        F: Fn(String) + Send + Sync + 'static,
    {
        if links.is_empty() {
            on_all_ready();
            return;
        }
        let join = Arc::new(FanIn::new(links.len()));
        let failed_once = Arc::new(FailOnce::new());
        let on_all_ready = Arc::new(on_all_ready);
        let on_failure = Arc::new(on_failure);

        for link in links {
            let join = join.clone();
            let on_all_ready = on_all_ready.clone();
            let on_failure = on_failure.clone();
            self.get_resource_when_available(
                link,
                failed_once.clone(),
                condition.clone(),
                move |_| {
                    if join.arrive() {
                        on_all_ready();
                    }
                },
                move |message| on_failure(message),
            );
        }
    }

    fn poll(self, mut attempt: PollAttempt) -> Job {
        Box::pin(async move {
            match self.host.get(&attempt.link).await {
                Ok(value) if (attempt.condition)(&value) => {
                    info!(link = %attempt.link, attempts = attempt.attempt + 1, "resource available");
                    (attempt.on_success)(value);
                    return;
                }
                Ok(_) => debug!(link = %attempt.link, retries_left = attempt.retries_left, "resource not ready"),
                Err(e) => debug!(link = %attempt.link, retries_left = attempt.retries_left, error = %e, "resource not retrievable"),
            }

            if attempt.retries_left > 0 {
                attempt.retries_left -= 1;
                attempt.attempt += 1;
                let delay = self.config.next_delay(attempt.attempt);
                let host = self.host.clone();
                host.schedule(delay, self.poll(attempt));
                return;
            }

            error!(link = %attempt.link, retries = self.config.retries, "resource not available, giving up");
            if attempt.failed_once.trip() {
                (attempt.on_exhausted)(format!(
                    "resource {} not available after {} retries",
                    attempt.link, self.config.retries
                ));
            }
        })
    }
}
