//! Shared building blocks for the GitHub session core
//!
//! Secrets that redact themselves, the configuration model (TOML plus
//! environment overlay), the common error type, and the injectable clock
//! every retry, throttle and poll loop sleeps through.

pub mod clock;
pub mod config;
mod error;
mod secret;

pub use clock::{Clock, ManualClock, SystemClock, from_unix_seconds, unix_seconds};
pub use config::{ApiConfig, Config, OAuthConfig, StorageBackend, StorageConfig};
pub use error::{Error, Result};
pub use secret::{HINT_LEN, Secret};
