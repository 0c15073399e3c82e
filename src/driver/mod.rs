//! Queue driver: load the work-item store, fan items out under bounded
//! concurrency, and record every terminal outcome durably.

pub mod runner;
mod worker;

pub use runner::{QueueRunner, RunConfig, RunSummary};
