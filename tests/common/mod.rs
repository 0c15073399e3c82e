//! Shared fixtures: a scripted execution client and fast run settings.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use execq::client::ExecutionClient;
use execq::driver::RunConfig;
use execq::error::{Error, Result};
use execq::model::{ExecutionHandle, ExecutionStatus, Payload};
use serde_json::json;

/// What the fake platform does with one exam.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report `Running` this many times, then `Finished`.
    Finish { running_polls: u32 },
    /// Report this terminal status on the first poll.
    End(&'static str),
    /// `submit` raises.
    SubmitError,
    /// `submit` returns a handle without an id.
    Reject,
    /// Status calls fail this many times in a row, then report `Finished`.
    FlakyStatus { failures: u32 },
    /// Every status call fails.
    StatusDown,
    /// Always `Running`.
    Stuck,
    /// `submit` panics.
    Panic,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub submitted: Vec<String>,
    pub payloads: Vec<Payload>,
    pub status_calls: HashMap<String, u32>,
    pub in_flight: usize,
    pub max_in_flight: usize,
}

/// Fake platform keyed by the payload's `exam` field.
pub struct ScriptedClient {
    scripts: HashMap<String, Script>,
    calls: Mutex<Calls>,
}

impl ScriptedClient {
    pub fn new(scripts: &[(&str, Script)]) -> Self {
        Self {
            scripts: scripts
                .iter()
                .map(|(exam, script)| (exam.to_string(), script.clone()))
                .collect(),
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn submitted(&self) -> Vec<String> {
        self.calls.lock().unwrap().submitted.clone()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.calls.lock().unwrap().payloads.clone()
    }

    pub fn status_calls(&self, exam: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .status_calls
            .get(exam)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_status_calls(&self) -> u32 {
        self.calls.lock().unwrap().status_calls.values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.calls.lock().unwrap().max_in_flight
    }

    fn script(&self, exam: &str) -> Script {
        self.scripts
            .get(exam)
            .cloned()
            .unwrap_or(Script::Finish { running_polls: 0 })
    }
}

#[async_trait]
impl ExecutionClient for ScriptedClient {
    async fn submit(&self, payload: &Payload) -> Result<ExecutionHandle> {
        let exam = payload
            .get("exam")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        {
            let mut calls = self.calls.lock().unwrap();
            calls.submitted.push(exam.clone());
            calls.payloads.push(payload.clone());
        }

        match self.script(&exam) {
            Script::SubmitError => Err(Error::Submission(format!("platform refused {exam}"))),
            Script::Reject => Ok(ExecutionHandle::rejected(
                Some(format!("dataset missing for {exam}")),
                Some("404 Not Found".to_string()),
            )),
            Script::Panic => panic!("client blew up on {exam}"),
            _ => {
                let mut calls = self.calls.lock().unwrap();
                calls.in_flight += 1;
                calls.max_in_flight = calls.max_in_flight.max(calls.in_flight);
                Ok(ExecutionHandle::accepted(
                    format!("exec-{exam}"),
                    format!("mon-{exam}"),
                ))
            }
        }
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let exam = handle
            .status_key()
            .and_then(|key| key.strip_prefix("mon-"))
            .unwrap_or_default()
            .to_string();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.status_calls.entry(exam.clone()).or_default();
            *n += 1;
            *n
        };

        let status = match self.script(&exam) {
            Script::Finish { running_polls } if call <= running_polls => ExecutionStatus::Running,
            Script::Finish { .. } => ExecutionStatus::Finished,
            Script::End(raw) => ExecutionStatus::parse(raw),
            Script::FlakyStatus { failures } if call <= failures => {
                return Err(Error::TransientPolling("connection reset".to_string()));
            }
            Script::FlakyStatus { .. } => ExecutionStatus::Finished,
            Script::StatusDown => {
                return Err(Error::TransientPolling("service unavailable".to_string()));
            }
            Script::Stuck => ExecutionStatus::Running,
            Script::SubmitError | Script::Reject | Script::Panic => {
                unreachable!("no handle was issued for {exam}")
            }
        };

        if status.is_terminal() {
            self.calls.lock().unwrap().in_flight -= 1;
        }
        Ok(status)
    }
}

/// One payload per exam name, each carrying a stale refresh token.
pub fn exams(names: &[&str]) -> Vec<Payload> {
    names
        .iter()
        .map(|name| {
            json!({ "exam": name, "pipeline": "denoise/1.0", "refreshToken": "stale" })
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

/// Millisecond timings so a full run takes well under a second.
pub fn fast_config(max_workers: usize) -> RunConfig {
    RunConfig {
        max_workers,
        poll_interval: Duration::from_millis(2),
        heartbeat_every: 3,
        status_attempts: 5,
        status_retry_delay: Duration::from_millis(1),
        launch_stagger: Duration::ZERO,
        pause_poll_interval: Duration::from_millis(5),
        poll_deadline: None,
    }
}
