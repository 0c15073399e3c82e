//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for API credentials.

pub use secrecy::{ExposeSecret, SecretString};
