//! Process-wide halt flag
//!
//! Any task may raise it. Only an explicit administrative call clears it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reserve_core::{Error, Event, EventBus, Metrics, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Why and when the halt was raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltState {
    /// Reason given when raised
    pub reason: String,
    /// When raised
    pub raised_at: DateTime<Utc>,
}

/// Global halt switch
#[derive(Debug)]
pub struct HaltSwitch {
    halted: AtomicBool,
    state: Mutex<Option<HaltState>>,
    events: EventBus,
    metrics: Option<Metrics>,
}

impl HaltSwitch {
    /// Create a cleared switch
    pub fn new(events: EventBus) -> Self {
        Self {
            halted: AtomicBool::new(false),
            state: Mutex::new(None),
            events,
            metrics: None,
        }
    }

    /// Mirror the flag into `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Flag is set
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Reject with `Error::Halted` while set
    pub fn ensure_running(&self) -> Result<()> {
        if !self.is_halted() {
            return Ok(());
        }
        let reason = self
            .state
            .lock()
            .as_ref()
            .map(|s| s.reason.clone())
            .unwrap_or_else(|| "halt flag set".to_string());
        Err(Error::Halted(reason))
    }

    /// Set the flag; returns false if it was already set
    pub fn raise(&self, reason: impl Into<String>, at: DateTime<Utc>) -> bool {
        let reason = reason.into();
        let mut state = self.state.lock();
        if self.halted.swap(true, Ordering::SeqCst) {
            return false;
        }
        *state = Some(HaltState {
            reason: reason.clone(),
            raised_at: at,
        });
        drop(state);

        error!(reason = %reason, "Global halt raised");
        if let Some(metrics) = &self.metrics {
            metrics.set_halted(true);
        }
        self.events.publish(Event::HaltRaised { reason, at });
        true
    }

    /// Clear the flag (administrative)
    pub fn clear(&self, cleared_by: &str, at: DateTime<Utc>) -> Result<HaltState> {
        if cleared_by.trim().is_empty() {
            return Err(Error::Validation("clearing a halt requires an operator".into()));
        }
        let mut state = self.state.lock();
        if !self.halted.swap(false, Ordering::SeqCst) {
            return Err(Error::InvalidState("halt flag is not set".into()));
        }
        let previous = state.take().unwrap_or(HaltState {
            reason: "unknown".to_string(),
            raised_at: at,
        });
        drop(state);

        info!(cleared_by, reason = %previous.reason, "Global halt cleared");
        if let Some(metrics) = &self.metrics {
            metrics.set_halted(false);
        }
        self.events.publish(Event::HaltCleared {
            cleared_by: cleared_by.to_string(),
            at,
        });
        Ok(previous)
    }

    /// Current halt details, if set
    pub fn state(&self) -> Option<HaltState> {
        self.state.lock().clone()
    }
}
