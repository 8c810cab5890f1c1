//! Bounded readiness gate.
//!
//! Before issuing requests a client waits for the server to be both live
//! and ready, then for each model version it intends to use. Both waits
//! probe at a fixed interval and give up after a fixed number of probes.

use std::thread;
use std::time::Duration;
use tracing::info;

use crate::config::HealthConfig;
use crate::error::{InferError, Result};
use crate::server::InferenceServer;
use crate::status::{ModelReadyState, ServerStatus};

/// Outcome of one server health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// Not probed yet. Only ever the starting value; [`ReadinessPoller::probe`]
    /// never returns it.
    #[default]
    Unknown,
    /// Running but not accepting requests.
    LiveNotReady,
    /// Live and ready.
    Ready,
    /// Not live.
    Failed,
}

/// Fixed-interval, bounded-attempt poller.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    max_attempts: u32,
    interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_INTERVAL)
    }
}

impl ReadinessPoller {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

    /// `max_attempts` below one is treated as one.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.interval_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Issue one liveness check and one readiness check.
    pub fn probe<S: InferenceServer + ?Sized>(&self, server: &S) -> Result<Health> {
        let live = server.is_live()?;
        let ready = server.is_ready()?;
        info!("Server Health: live {}, ready {}", live, ready);
        Ok(match (live, ready) {
            (true, true) => Health::Ready,
            (true, false) => Health::LiveNotReady,
            (false, _) => Health::Failed,
        })
    }

    /// Block until the server is live and ready.
    ///
    /// Returns the number of probes used. Errors from the server are
    /// returned immediately; running out of attempts yields
    /// [`InferError::ServerNotReady`].
    pub fn wait_for_server<S: InferenceServer + ?Sized>(&self, server: &S) -> Result<u32> {
        self.poll(|| Ok(self.probe(server)? == Health::Ready))?
            .ok_or(InferError::ServerNotReady {
                attempts: self.max_attempts,
            })
    }

    /// Read the ready state of one model version.
    pub fn model_state<S: InferenceServer + ?Sized>(
        &self,
        server: &S,
        model: &str,
        version: i64,
    ) -> Result<ModelReadyState> {
        let bytes = server.model_status(model)?;
        let status = ServerStatus::from_slice(&bytes)?;
        let state = status.version_state(model, version)?;
        info!("'{}' model is {}", model, state);
        Ok(state)
    }

    /// Block until `version` of `model` reports [`ModelReadyState::Ready`].
    ///
    /// A model or version missing from the status is an immediate error.
    pub fn wait_for_model<S: InferenceServer + ?Sized>(
        &self,
        server: &S,
        model: &str,
        version: i64,
    ) -> Result<u32> {
        self.poll(|| Ok(self.model_state(server, model, version)? == ModelReadyState::Ready))?
            .ok_or_else(|| InferError::ModelNotReady {
                model: model.to_string(),
                version,
                attempts: self.max_attempts,
            })
    }

    /// Run `check` up to `max_attempts` times, sleeping between attempts.
    /// `Some(n)` when the `n`th attempt succeeded, `None` when all failed.
    fn poll<F>(&self, mut check: F) -> Result<Option<u32>>
    where
        F: FnMut() -> Result<bool>,
    {
        for attempt in 1..=self.max_attempts {
            if check()? {
                return Ok(Some(attempt));
            }
            if attempt < self.max_attempts {
                thread::sleep(self.interval);
            }
        }
        Ok(None)
    }
}
