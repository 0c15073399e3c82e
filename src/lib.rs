//! # execq
//!
//! Durable, resumable execution queue for a medical-imaging platform.
//!
//! A list of execution requests is numbered and persisted as a queue file,
//! then driven through the platform REST API under bounded concurrency.
//! Every terminal outcome is written back before the next progress line, so
//! an interrupted run resumes with only the unprocessed items.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod gate;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod tracking;
