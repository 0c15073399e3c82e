//! Per-item processing: gate, submit, poll until terminal.
//!
//! Nothing here returns an error to the pool. Every failure becomes an
//! [`ItemOutcome::Failed`] that the runner finalizes like a success.

use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Span, error, info, warn};

use super::runner::QueueRunner;
use crate::error::{Error, Result};
use crate::model::{ExecutionHandle, ExecutionStatus, ItemOutcome, ItemState, WorkItem};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_remote_status, record_state_transition};
use crate::tracking::{TrackingFields, fields, now_stamp};

impl QueueRunner {
    /// Process one item. Returns the last state reached before the terminal
    /// one, and the outcome.
    pub(super) async fn process_item(&self, item: &WorkItem) -> (ItemState, ItemOutcome) {
        self.gate
            .wait_until_clear(self.config.pause_poll_interval)
            .await;

        let mut state = ItemState::Pending;
        match self.execute(item, &mut state).await {
            Ok(outcome) => (state, outcome),
            Err(e) => {
                error!(
                    identifier = item.identifier,
                    error = %e,
                    "Exception for execution {}",
                    item.identifier
                );
                (state, ItemOutcome::failed(e.to_string()))
            }
        }
    }

    async fn execute(&self, item: &WorkItem, state: &mut ItemState) -> Result<ItemOutcome> {
        let handle = match self.client.submit(&item.payload).await {
            Ok(handle) => handle,
            Err(e) => {
                metrics::items_submitted().add(1, &[KeyValue::new("result", "error")]);
                return Err(e);
            }
        };

        let Some(execution_id) = handle.id.clone() else {
            metrics::items_submitted().add(1, &[KeyValue::new("result", "rejected")]);
            warn!(
                identifier = item.identifier,
                message = handle.message.as_deref().unwrap_or("-"),
                "execution request rejected"
            );
            return Ok(ItemOutcome::Failed {
                status: None,
                reason: handle
                    .message
                    .unwrap_or_else(|| "no execution id returned".to_string()),
                details: handle.details,
            });
        };
        metrics::items_submitted().add(1, &[KeyValue::new("result", "accepted")]);

        advance(state, ItemState::Submitted)?;
        let monitoring_id = handle.status_key().unwrap_or(&execution_id).to_string();

        let mut record = TrackingFields::new();
        record.insert(fields::EXECUTION_REQUESTED.to_string(), "true".to_string());
        record.insert(fields::EXECUTION_ID.to_string(), execution_id.clone());
        record.insert(fields::EXECUTION_WORKFLOW_ID.to_string(), monitoring_id.clone());
        record.insert(fields::EXECUTION_START_TIME.to_string(), now_stamp());
        record.insert(
            fields::EXECUTION_STATUS.to_string(),
            ExecutionStatus::Running.to_string(),
        );
        if let Err(e) = self.tracking.record(item.identifier, record).await {
            warn!(identifier = item.identifier, "could not write tracking record: {e}");
        }
        info!(
            identifier = item.identifier,
            execution_id = %execution_id,
            monitoring_id = %monitoring_id,
            "Execution {}, {} is created.",
            item.identifier,
            monitoring_id
        );

        let started = Instant::now();
        let status = self.poll_until_terminal(item, &handle, &monitoring_id).await?;
        record_remote_status(&Span::current(), status.as_str());

        let label = if status.is_success() { "succeeded" } else { "failed" };
        metrics::item_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("outcome", label)],
        );

        if status.is_success() {
            info!("Success for execution {}, {}", item.identifier, monitoring_id);
            Ok(ItemOutcome::Succeeded { status })
        } else {
            info!(
                status = %status,
                "Failure for execution {}, {}",
                item.identifier,
                monitoring_id
            );
            Ok(ItemOutcome::Failed {
                reason: format!("execution ended with status {status}"),
                status: Some(status),
                details: None,
            })
        }
    }

    /// Poll until the execution leaves `Running`. A heartbeat is logged every
    /// `heartbeat_every` polls.
    async fn poll_until_terminal(
        &self,
        item: &WorkItem,
        handle: &ExecutionHandle,
        monitoring_id: &str,
    ) -> Result<ExecutionStatus> {
        let started = Instant::now();
        let mut polls: u32 = 0;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let status = self.fetch_status(handle).await?;
            if status.is_terminal() {
                return Ok(status);
            }

            polls += 1;
            if self.config.heartbeat_every > 0 && polls % self.config.heartbeat_every == 0 {
                info!(
                    polls,
                    "Status for execution {}, {} is {}",
                    item.identifier,
                    monitoring_id,
                    status
                );
            }

            if let Some(deadline) = self.config.poll_deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(Error::PollDeadline {
                        identifier: item.identifier,
                        elapsed_secs: elapsed.as_secs(),
                    });
                }
            }
        }
    }

    /// One status read, retried on error up to `status_attempts` times.
    async fn fetch_status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let attempts = self.config.status_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.status(handle).await {
                Ok(status) => return Ok(status),
                Err(e) => {
                    metrics::status_poll_errors().add(1, &[]);
                    warn!("Attempt {attempt}/{attempts} failed to get status: {e}");
                    if attempt >= attempts {
                        return Err(Error::Polling {
                            attempts,
                            message: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.config.status_retry_delay).await;
                }
            }
        }
    }
}

fn advance(state: &mut ItemState, to: ItemState) -> Result<()> {
    if !state.can_transition_to(to) {
        return Err(Error::InvalidTransition { from: *state, to });
    }
    record_state_transition(&Span::current(), *state, to);
    *state = to;
    Ok(())
}
