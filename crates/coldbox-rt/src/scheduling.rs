//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Tick pacing and supervision of long-lived tasks."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodic tick source for the control loop.
///
/// A tick that overruns its period is followed by a single immediate tick and then
/// the loop realigns to the original schedule; missed ticks are never replayed.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { period, interval }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    /// Restart the schedule so the next tick lands one full period from now.
    pub fn reset(&mut self) {
        self.interval.reset();
    }
}

/// Named set of spawned tasks that are joined or aborted together.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl TaskGroup {
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        debug!(task = name, "spawning task");
        self.tasks.push((name, tokio::spawn(fut)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, returning the first failure after all have finished.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (name, task) in self.tasks {
            let outcome = task
                .await
                .map_err(|err| anyhow!("task {name} failed to join: {err}"))
                .and_then(|result| result);
            if let Err(err) = outcome {
                warn!(task = name, error = %err, "task ended with an error");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn abort_all(&self) {
        for (name, task) in &self.tasks {
            debug!(task = name, "aborting task");
            task.abort();
        }
    }
}
