//! Scheduling gate: hold back new submissions during a daily maintenance window.
//!
//! The gate is consulted once before each item is submitted. Items already
//! being polled are not interrupted when a window opens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Whether `now_hour` falls inside `[begin, end)`.
///
/// When `begin > end` the window wraps past midnight, i.e.
/// `[begin, 24) ∪ [0, end)`. An empty window (`begin == end`) never pauses.
pub fn should_pause(now_hour: u32, begin: u32, end: u32) -> bool {
    if begin <= end {
        begin <= now_hour && now_hour < end
    } else {
        now_hour >= begin || now_hour < end
    }
}

/// A daily maintenance window in local hours, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    begin: u32,
    end: u32,
}

impl MaintenanceWindow {
    pub fn new(begin: u32, end: u32) -> Result<Self> {
        if begin > 23 || end > 24 {
            return Err(Error::Config(format!(
                "maintenance window {begin}..{end} is out of range (hours are 0..=23, end up to 24)"
            )));
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn contains(&self, hour: u32) -> bool {
        should_pause(hour, self.begin, self.end)
    }
}

/// Source of the current local hour.
pub trait Clock: Send + Sync {
    fn current_hour(&self) -> u32;
}

/// Wall clock in the local timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

/// Shared pause gate. One notice is logged per pause episode, no matter how
/// many workers are waiting on it.
pub struct PauseGate {
    window: Option<MaintenanceWindow>,
    clock: Arc<dyn Clock>,
    paused: AtomicBool,
}

impl PauseGate {
    pub fn new(window: MaintenanceWindow, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: Some(window),
            clock,
            paused: AtomicBool::new(false),
        }
    }

    /// A gate that never pauses.
    pub fn disabled() -> Self {
        Self {
            window: None,
            clock: Arc::new(SystemClock),
            paused: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> Option<MaintenanceWindow> {
        self.window
    }

    pub fn should_pause(&self) -> bool {
        self.window
            .is_some_and(|w| w.contains(self.clock.current_hour()))
    }

    /// Block the calling task until the window is closed, re-checking every
    /// `poll_interval`. Returns whether any waiting happened.
    pub async fn wait_until_clear(&self, poll_interval: Duration) -> bool {
        let mut waited = false;
        while self.should_pause() {
            if !self.paused.swap(true, Ordering::AcqRel) {
                if let Some(w) = self.window {
                    info!(
                        begin = w.begin,
                        end = w.end,
                        "Current time is between {} and {}. Pausing...",
                        w.begin,
                        w.end
                    );
                }
                metrics::gate_pauses().add(1, &[]);
            }
            waited = true;
            tokio::time::sleep(poll_interval).await;
        }
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("maintenance window closed, resuming submissions");
        }
        waited
    }
}
