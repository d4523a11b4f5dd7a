//! devicetoken core - Shared types for device token authentication
//!
//! This crate provides the identifiers, configuration, clock and error types
//! used across all devicetoken components.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, HeaderNames, SigningAlgorithm};
pub use error::{AuthError, Rejection, Result};
pub use ids::{AccountId, ClientId};
