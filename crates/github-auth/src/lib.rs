//! GitHub OAuth authentication library
//!
//! Device-flow login, durable multi-token storage and single-flight token
//! refresh. The crate has no dependency on the binary and can be used and
//! tested on its own.
//!
//! Credential flow:
//! 1. `Authenticator::login()` drives `device_flow::DeviceFlow`: request a
//!    device code, hand the user code to a prompt hook, poll for the token
//! 2. The resulting `TokenRecord` is saved via `TokenStore::save()` and
//!    becomes the active token
//! 3. `GitHubClient` asks the authenticator (a `CredentialProvider`) for the
//!    active token on every request
//! 4. On expiry or 401, `TokenRefreshCoordinator::ensure_fresh()` performs one
//!    refresh for all concurrent callers and installs the replacement with
//!    `TokenStore::replace()`

pub mod authenticator;
pub mod backend;
pub mod constants;
pub mod device_flow;
pub mod error;
mod metrics;
pub mod refresh;
pub mod store;
pub mod token;

pub use authenticator::Authenticator;
#[cfg(feature = "keyring")]
pub use backend::KeyringBackend;
pub use backend::{
    EncryptedFileBackend, MemoryBackend, PlaintextFileBackend, SecretBackend, StoredEntry,
    open_backend,
};
pub use constants::*;
pub use device_flow::{
    DeviceFlow, DeviceFlowAction, DeviceFlowEvent, DeviceFlowSession, DeviceFlowState,
    PollResponse, handle_event,
};
pub use error::{Error, RefreshError, Result};
pub use refresh::TokenRefreshCoordinator;
pub use store::{TokenStore, TokenSummary};
pub use token::{TokenId, TokenRecord, TokenResponse, TokenState, refresh_token};
