//! Convergence scheduling.
//!
//! After a mutating request the host arms a [`ConvergenceScheduler`] with the affected
//! keys. A background task sleeps, asks a [`Probe`] which candidates are still pending
//! and keeps only those, until nothing is left:
//!
//! ```text
//! arm({1, 2, 3}) -> sleep -> probe: {2, 3} -> sleep -> probe: {3} -> sleep -> probe: {} -> done
//! ```
//!
//! The candidate set only ever shrinks: an item that was reported converged once is
//! never checked again, even if a later probe would list it. The loop also stops after
//! `max_rounds` checks.

use crate::config::ConvergenceConfig;
use crate::error::{FleetError, FleetResult};
use crate::fleet::Fleet;
use crate::model::{ConfigurationId, Identifier};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One "is it done yet?" question over a candidate set.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// What the probe tracks: configuration keys or device identifiers.
    type Item: Copy + PartialEq + Debug + Send + Sync + 'static;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// The subset of `candidates` that is still pending.
    async fn pending(&self, candidates: &[Self::Item]) -> Vec<Self::Item>;
}

/// Waits for configuration changes (referencing, homing, settle time) to finish.
#[derive(Debug, Clone)]
pub struct ConfigurationProbe(pub Arc<Fleet>);

#[async_trait]
impl Probe for ConfigurationProbe {
    type Item = ConfigurationId;

    fn name(&self) -> &'static str {
        "configuration"
    }

    async fn pending(&self, candidates: &[ConfigurationId]) -> Vec<ConfigurationId> {
        self.0.is_configuration_configured(candidates).await
    }
}

/// Waits for stages to reach their targets.
#[derive(Debug, Clone)]
pub struct MotionProbe(pub Arc<Fleet>);

#[async_trait]
impl Probe for MotionProbe {
    type Item = Identifier;

    fn name(&self) -> &'static str {
        "motion"
    }

    async fn pending(&self, candidates: &[Identifier]) -> Vec<Identifier> {
        self.0.on_target_pending(candidates).await
    }
}

/// How a convergence loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport<T> {
    /// Checks performed
    pub rounds: u32,
    /// Candidates still pending when the loop stopped; empty unless the round cap was hit
    pub remaining: Vec<T>,
}

impl<T> ConvergenceReport<T> {
    /// True when nothing was left pending.
    pub fn converged(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Handle to an armed convergence loop.
#[derive(Debug)]
pub struct ConvergenceHandle<T> {
    /// `None` when there was nothing to wait for
    task: Option<JoinHandle<ConvergenceReport<T>>>,
}

impl<T> ConvergenceHandle<T> {
    /// Wait for the loop to finish.
    pub async fn wait(self) -> FleetResult<ConvergenceReport<T>> {
        match self.task {
            Some(task) => task
                .await
                .map_err(|e| FleetError::Internal(format!("convergence task failed: {e}"))),
            None => Ok(ConvergenceReport {
                rounds: 0,
                remaining: Vec::new(),
            }),
        }
    }

    /// Stop the loop at its next suspension point.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// True once the loop has stopped, or when nothing was armed.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Re-checks candidates after a fixed delay until none is pending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceScheduler {
    delay: Duration,
    max_rounds: u32,
}

impl Default for ConvergenceScheduler {
    fn default() -> Self {
        Self::from_config(&ConvergenceConfig::default())
    }
}

impl ConvergenceScheduler {
    /// Poll every `delay`, at most `max_rounds` times.
    pub fn new(delay: Duration, max_rounds: u32) -> Self {
        Self { delay, max_rounds }
    }

    /// Scheduler for the `[convergence]` settings.
    pub fn from_config(config: &ConvergenceConfig) -> Self {
        Self::new(config.poll_delay(), config.max_rounds)
    }

    /// Spawn a loop checking `candidates` until all have converged.
    ///
    /// Nothing is spawned for an empty candidate set; the handle resolves at once.
    pub fn arm<P: Probe>(&self, probe: P, candidates: Vec<P::Item>) -> ConvergenceHandle<P::Item> {
        if candidates.is_empty() {
            return ConvergenceHandle { task: None };
        }
        let scheduler = *self;
        ConvergenceHandle {
            task: Some(tokio::spawn(async move { scheduler.run(&probe, candidates).await })),
        }
    }

    /// The convergence loop itself, on the current task.
    pub async fn run<P: Probe>(&self, probe: &P, candidates: Vec<P::Item>) -> ConvergenceReport<P::Item> {
        let mut candidates = candidates;
        dedup(&mut candidates);
        let mut rounds = 0;
        while !candidates.is_empty() {
            if rounds >= self.max_rounds {
                warn!(
                    probe = probe.name(),
                    rounds,
                    remaining = ?candidates,
                    "giving up on convergence"
                );
                break;
            }
            tokio::time::sleep(self.delay).await;
            rounds += 1;
            let pending = probe.pending(&candidates).await;
            candidates.retain(|candidate| pending.contains(candidate));
            debug!(probe = probe.name(), rounds, remaining = ?candidates, "convergence check");
        }
        ConvergenceReport {
            rounds,
            remaining: candidates,
        }
    }
}

fn dedup<T: PartialEq>(items: &mut Vec<T>) {
    let mut index = 0;
    while index < items.len() {
        if items[..index].contains(&items[index]) {
            items.remove(index);
        } else {
            index += 1;
        }
    }
}
