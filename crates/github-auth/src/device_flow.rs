//! OAuth 2.0 Device Authorization Grant (RFC 8628)
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `DeviceFlow::run` executes the I/O implied by each action (HTTP calls,
//! sleeping on the injected clock, invoking the prompt hook) and feeds the
//! outcome back as the next event.
//!
//! ```text
//! Idle → CodeRequested → AwaitingUserAuthorization → Polling ⟲
//!                                                       ↓
//!                      Succeeded | Denied | Expired | Failed | Cancelled
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::Clock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_POLL_INTERVAL, DEVICE_CODE_GRANT, OAuthEndpoints, SLOW_DOWN_INCREMENT,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::token::{OAuthError, TokenEndpointResponse, TokenResponse};

/// One login attempt. Lives from the device-code response until a
/// terminal state.
#[derive(Clone)]
pub struct DeviceFlowSession {
    /// Secret; only ever sent back to the token endpoint.
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    /// Current poll spacing; grows on `slow_down`.
    pub interval: Duration,
    pub expires_at: SystemTime,
}

impl fmt::Debug for DeviceFlowSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFlowSession")
            .field("device_code", &"[REDACTED]")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("interval", &self.interval)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Device-code endpoint payload.
#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceCodeEndpointResponse {
    Code(DeviceCodeResponse),
    Error(OAuthError),
}

/// Interpreted token-endpoint response to one poll.
#[derive(Debug)]
pub enum PollResponse {
    Token(TokenResponse),
    Pending,
    SlowDown,
    ExpiredToken,
    AccessDenied,
    /// Unrecognized OAuth error code
    Error(String),
    /// Network failure, timeout, non-2xx or unparsable body
    Transport(String),
}

impl PollResponse {
    fn from_endpoint(response: TokenEndpointResponse) -> Self {
        match response {
            TokenEndpointResponse::Token(token) => PollResponse::Token(token),
            TokenEndpointResponse::Error(err) => match err.error.as_str() {
                "authorization_pending" => PollResponse::Pending,
                "slow_down" => PollResponse::SlowDown,
                "expired_token" => PollResponse::ExpiredToken,
                "access_denied" => PollResponse::AccessDenied,
                _ => PollResponse::Error(err.to_string()),
            },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PollResponse::Token(_) => "token",
            PollResponse::Pending => "pending",
            PollResponse::SlowDown => "slow_down",
            PollResponse::ExpiredToken => "expired",
            PollResponse::AccessDenied => "denied",
            PollResponse::Error(_) => "error",
            PollResponse::Transport(_) => "transport",
        }
    }
}

/// Device flow states.
#[derive(Debug)]
pub enum DeviceFlowState {
    Idle,
    /// Device-code request in flight
    CodeRequested { max_failures: u32 },
    /// Code issued; the user has to enter it at the verification URI
    AwaitingUserAuthorization {
        session: DeviceFlowSession,
        max_failures: u32,
    },
    Polling {
        session: DeviceFlowSession,
        failures: u32,
        max_failures: u32,
    },
    Succeeded(TokenResponse),
    Denied,
    Expired,
    Failed(String),
    Cancelled,
}

impl DeviceFlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceFlowState::Succeeded(_)
                | DeviceFlowState::Denied
                | DeviceFlowState::Expired
                | DeviceFlowState::Failed(_)
                | DeviceFlowState::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceFlowState::Idle => "idle",
            DeviceFlowState::CodeRequested { .. } => "code_requested",
            DeviceFlowState::AwaitingUserAuthorization { .. } => "awaiting_user_authorization",
            DeviceFlowState::Polling { .. } => "polling",
            DeviceFlowState::Succeeded(_) => "succeeded",
            DeviceFlowState::Denied => "denied",
            DeviceFlowState::Expired => "expired",
            DeviceFlowState::Failed(_) => "failed",
            DeviceFlowState::Cancelled => "cancelled",
        }
    }
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum DeviceFlowEvent {
    /// Begin a login; `max_failures` bounds transient poll failures
    Start { max_failures: u32 },
    CodeIssued(DeviceFlowSession),
    CodeRequestFailed(String),
    /// The prompt hook has shown the user code
    UserPrompted,
    /// Poll interval elapsed
    PollDue { now: SystemTime },
    Polled {
        response: PollResponse,
        now: SystemTime,
    },
    Cancelled,
}

/// Actions the driver should execute after a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFlowAction {
    RequestCode,
    /// Show `user_code` and `verification_uri` to the user
    PromptUser,
    Sleep(Duration),
    Poll,
    /// Terminal state reached
    Finish,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: DeviceFlowState,
    event: DeviceFlowEvent,
) -> (DeviceFlowState, DeviceFlowAction) {
    match (state, event) {
        // --- Cancellation from any live state ---
        (state, DeviceFlowEvent::Cancelled) if !state.is_terminal() => {
            (DeviceFlowState::Cancelled, DeviceFlowAction::Finish)
        }

        // --- Idle ---
        (DeviceFlowState::Idle, DeviceFlowEvent::Start { max_failures }) => (
            DeviceFlowState::CodeRequested { max_failures },
            DeviceFlowAction::RequestCode,
        ),

        // --- CodeRequested ---
        (DeviceFlowState::CodeRequested { max_failures }, DeviceFlowEvent::CodeIssued(session)) => (
            DeviceFlowState::AwaitingUserAuthorization {
                session,
                max_failures,
            },
            DeviceFlowAction::PromptUser,
        ),

        (DeviceFlowState::CodeRequested { .. }, DeviceFlowEvent::CodeRequestFailed(e)) => {
            (DeviceFlowState::Failed(e), DeviceFlowAction::Finish)
        }

        // --- AwaitingUserAuthorization ---
        (
            DeviceFlowState::AwaitingUserAuthorization {
                session,
                max_failures,
            },
            DeviceFlowEvent::UserPrompted,
        ) => {
            let interval = session.interval;
            (
                DeviceFlowState::Polling {
                    session,
                    failures: 0,
                    max_failures,
                },
                DeviceFlowAction::Sleep(interval),
            )
        }

        // --- Polling: global timeout ---
        (
            DeviceFlowState::Polling { session, .. },
            DeviceFlowEvent::PollDue { now } | DeviceFlowEvent::Polled { now, .. },
        ) if now > session.expires_at => (DeviceFlowState::Expired, DeviceFlowAction::Finish),

        (state @ DeviceFlowState::Polling { .. }, DeviceFlowEvent::PollDue { .. }) => {
            (state, DeviceFlowAction::Poll)
        }

        (
            DeviceFlowState::Polling {
                mut session,
                failures,
                max_failures,
            },
            DeviceFlowEvent::Polled { response, .. },
        ) => match response {
            PollResponse::Token(token) => (
                DeviceFlowState::Succeeded(token),
                DeviceFlowAction::Finish,
            ),
            PollResponse::Pending => {
                let interval = session.interval;
                (
                    DeviceFlowState::Polling {
                        session,
                        failures,
                        max_failures,
                    },
                    DeviceFlowAction::Sleep(interval),
                )
            }
            PollResponse::SlowDown => {
                session.interval = session.interval.saturating_add(SLOW_DOWN_INCREMENT);
                let interval = session.interval;
                (
                    DeviceFlowState::Polling {
                        session,
                        failures,
                        max_failures,
                    },
                    DeviceFlowAction::Sleep(interval),
                )
            }
            PollResponse::ExpiredToken => (DeviceFlowState::Expired, DeviceFlowAction::Finish),
            PollResponse::AccessDenied => (DeviceFlowState::Denied, DeviceFlowAction::Finish),
            PollResponse::Error(e) | PollResponse::Transport(e) => {
                if failures >= max_failures {
                    (
                        DeviceFlowState::Failed(format!(
                            "giving up after {} failed polls: {e}",
                            failures + 1
                        )),
                        DeviceFlowAction::Finish,
                    )
                } else {
                    let interval = session.interval;
                    (
                        DeviceFlowState::Polling {
                            session,
                            failures: failures + 1,
                            max_failures,
                        },
                        DeviceFlowAction::Sleep(interval),
                    )
                }
            }
        },

        // --- Catch-all: ignore events that don't apply to the current state ---
        (state, event) => {
            warn!(state = state.label(), ?event, "ignoring event in current state");
            let action = if state.is_terminal() {
                DeviceFlowAction::Finish
            } else {
                DeviceFlowAction::Poll
            };
            (state, action)
        }
    }
}

/// Executes the device flow against a GitHub host.
pub struct DeviceFlow {
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
    client_id: String,
    clock: Arc<dyn Clock>,
    max_transient_failures: u32,
}

impl DeviceFlow {
    pub fn new(
        http: reqwest::Client,
        endpoints: OAuthEndpoints,
        client_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            endpoints,
            client_id: client_id.into(),
            clock,
            max_transient_failures: 3,
        }
    }

    pub fn with_max_transient_failures(mut self, max: u32) -> Self {
        self.max_transient_failures = max;
        self
    }

    /// Ask for a device code and user code.
    pub async fn request_code(&self, scopes: &[String]) -> Result<DeviceFlowSession> {
        let scope = scopes.join(" ");
        let response = self
            .http
            .post(&self.endpoints.device_code)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[("client_id", self.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await
            .map_err(|e| Error::Http(format!("device code request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::TokenExchange(format!(
                "device code endpoint returned {status}: {body}"
            )));
        }

        let code = match response
            .json::<DeviceCodeEndpointResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid device code response: {e}")))?
        {
            DeviceCodeEndpointResponse::Code(code) => code,
            DeviceCodeEndpointResponse::Error(err) => {
                return Err(Error::TokenExchange(format!("device code rejected: {err}")));
            }
        };

        let interval = code
            .interval
            .filter(|i| *i > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let expires_at = self
            .clock
            .now()
            .checked_add(Duration::from_secs(code.expires_in))
            .ok_or_else(|| {
                Error::DeviceFlowFailed(format!(
                    "device code lifetime out of range: {}s",
                    code.expires_in
                ))
            })?;
        Ok(DeviceFlowSession {
            device_code: code.device_code,
            user_code: code.user_code,
            verification_uri: code.verification_uri,
            verification_uri_complete: code.verification_uri_complete,
            interval,
            expires_at,
        })
    }

    /// Send one token request for the session's device code.
    pub async fn poll_once(&self, session: &DeviceFlowSession) -> PollResponse {
        let response = match self
            .http
            .post(&self.endpoints.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("device_code", session.device_code.as_str()),
                ("grant_type", DEVICE_CODE_GRANT),
            ])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return PollResponse::Transport(format!("poll request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            return PollResponse::Transport(format!("token endpoint returned {status}"));
        }
        match response.json::<TokenEndpointResponse>().await {
            Ok(parsed) => PollResponse::from_endpoint(parsed),
            Err(e) => PollResponse::Transport(format!("invalid token response: {e}")),
        }
    }

    /// Run a complete login.
    ///
    /// `prompt` is called once with the session so the caller can show the
    /// user code. `cancel` is observed at every step; a cancelled flow
    /// returns `DeviceFlowCancelled` and never yields a token.
    pub async fn run<F>(
        &self,
        scopes: &[String],
        mut prompt: F,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse>
    where
        F: FnMut(&DeviceFlowSession) + Send,
    {
        let mut state = DeviceFlowState::Idle;
        let mut event = DeviceFlowEvent::Start {
            max_failures: self.max_transient_failures,
        };

        loop {
            if cancel.is_cancelled() {
                event = DeviceFlowEvent::Cancelled;
            }
            let (next, action) = handle_event(state, event);
            debug!(state = next.label(), ?action, "device flow transition");
            state = next;

            event = match action {
                DeviceFlowAction::RequestCode => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => DeviceFlowEvent::Cancelled,
                        result = self.request_code(scopes) => match result {
                            Ok(session) => DeviceFlowEvent::CodeIssued(session),
                            Err(e) => DeviceFlowEvent::CodeRequestFailed(e.to_string()),
                        },
                    }
                }
                DeviceFlowAction::PromptUser => {
                    if let DeviceFlowState::AwaitingUserAuthorization { session, .. } = &state {
                        info!(
                            user_code = %session.user_code,
                            verification_uri = %session.verification_uri,
                            "waiting for user authorization"
                        );
                        prompt(session);
                    }
                    DeviceFlowEvent::UserPrompted
                }
                DeviceFlowAction::Sleep(interval) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => DeviceFlowEvent::Cancelled,
                        _ = self.clock.sleep(interval) => DeviceFlowEvent::PollDue {
                            now: self.clock.now(),
                        },
                    }
                }
                DeviceFlowAction::Poll => {
                    let DeviceFlowState::Polling { session, .. } = &state else {
                        break;
                    };
                    let response = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        response = self.poll_once(session) => Some(response),
                    };
                    match response {
                        Some(response) => {
                            metrics::record_poll(response.label());
                            if let PollResponse::Error(e) | PollResponse::Transport(e) = &response {
                                warn!(error = %e, "device flow poll failed");
                            }
                            DeviceFlowEvent::Polled {
                                response,
                                now: self.clock.now(),
                            }
                        }
                        None => DeviceFlowEvent::Cancelled,
                    }
                }
                DeviceFlowAction::Finish => break,
            };
        }

        match state {
            DeviceFlowState::Succeeded(token) if !cancel.is_cancelled() => {
                info!("device flow authorized");
                Ok(token)
            }
            DeviceFlowState::Succeeded(_) | DeviceFlowState::Cancelled => {
                info!("device flow cancelled");
                Err(Error::DeviceFlowCancelled)
            }
            DeviceFlowState::Denied => Err(Error::DeviceFlowDenied),
            DeviceFlowState::Expired => Err(Error::DeviceFlowExpired),
            DeviceFlowState::Failed(e) => Err(Error::DeviceFlowFailed(e)),
            other => Err(Error::DeviceFlowFailed(format!(
                "device flow stopped in state {}",
                other.label()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::clock::from_unix_seconds;

    const NOW: u64 = 1_700_000_000;

    fn session() -> DeviceFlowSession {
        DeviceFlowSession {
            device_code: "dc".into(),
            user_code: "ABCD-1234".into(),
            verification_uri: "https://github.com/login/device".into(),
            verification_uri_complete: None,
            interval: Duration::from_secs(5),
            expires_at: from_unix_seconds(NOW + 900),
        }
    }

    fn polling(failures: u32) -> DeviceFlowState {
        DeviceFlowState::Polling {
            session: session(),
            failures,
            max_failures: 3,
        }
    }

    fn polled(response: PollResponse) -> DeviceFlowEvent {
        DeviceFlowEvent::Polled {
            response,
            now: from_unix_seconds(NOW + 10),
        }
    }

    fn token() -> TokenResponse {
        TokenResponse {
            access_token: "ghu_x".into(),
            token_type: Some("bearer".into()),
            scope: Some("repo".into()),
            refresh_token: None,
            expires_in: None,
            refresh_token_expires_in: None,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let (s, a) = handle_event(
            DeviceFlowState::Idle,
            DeviceFlowEvent::Start { max_failures: 3 },
        );
        assert!(matches!(s, DeviceFlowState::CodeRequested { max_failures: 3 }));
        assert_eq!(a, DeviceFlowAction::RequestCode);

        let (s, a) = handle_event(s, DeviceFlowEvent::CodeIssued(session()));
        assert!(matches!(s, DeviceFlowState::AwaitingUserAuthorization { .. }));
        assert_eq!(a, DeviceFlowAction::PromptUser);

        let (s, a) = handle_event(s, DeviceFlowEvent::UserPrompted);
        assert!(matches!(s, DeviceFlowState::Polling { failures: 0, .. }));
        assert_eq!(a, DeviceFlowAction::Sleep(Duration::from_secs(5)));

        let (s, a) = handle_event(
            s,
            DeviceFlowEvent::PollDue {
                now: from_unix_seconds(NOW + 5),
            },
        );
        assert!(matches!(s, DeviceFlowState::Polling { .. }));
        assert_eq!(a, DeviceFlowAction::Poll);

        let (s, a) = handle_event(s, polled(PollResponse::Token(token())));
        assert!(matches!(s, DeviceFlowState::Succeeded(_)));
        assert_eq!(a, DeviceFlowAction::Finish);
    }

    #[test]
    fn code_request_failure_fails() {
        let (s, a) = handle_event(
            DeviceFlowState::CodeRequested { max_failures: 3 },
            DeviceFlowEvent::CodeRequestFailed("connection refused".into()),
        );
        assert!(matches!(s, DeviceFlowState::Failed(ref e) if e.contains("refused")));
        assert_eq!(a, DeviceFlowAction::Finish);
    }

    #[test]
    fn pending_keeps_polling_at_same_interval() {
        let (s, a) = handle_event(polling(0), polled(PollResponse::Pending));
        assert!(matches!(s, DeviceFlowState::Polling { .. }));
        assert_eq!(a, DeviceFlowAction::Sleep(Duration::from_secs(5)));
    }

    #[test]
    fn slow_down_adds_five_seconds() {
        let (s, a) = handle_event(polling(0), polled(PollResponse::SlowDown));
        assert_eq!(a, DeviceFlowAction::Sleep(Duration::from_secs(10)));
        let (s, a) = handle_event(s, polled(PollResponse::SlowDown));
        assert_eq!(a, DeviceFlowAction::Sleep(Duration::from_secs(15)));
        match s {
            DeviceFlowState::Polling { session, .. } => {
                assert_eq!(session.interval, Duration::from_secs(15))
            }
            other => panic!("expected Polling, got {other:?}"),
        }
    }

    #[test]
    fn terminal_error_codes() {
        let (s, _) = handle_event(polling(0), polled(PollResponse::ExpiredToken));
        assert!(matches!(s, DeviceFlowState::Expired));
        let (s, _) = handle_event(polling(0), polled(PollResponse::AccessDenied));
        assert!(matches!(s, DeviceFlowState::Denied));
    }

    #[test]
    fn transient_failures_are_bounded() {
        let (s, a) = handle_event(polling(0), polled(PollResponse::Transport("reset".into())));
        assert!(matches!(s, DeviceFlowState::Polling { failures: 1, .. }));
        assert_eq!(a, DeviceFlowAction::Sleep(Duration::from_secs(5)));

        let (s, a) = handle_event(
            polling(3),
            polled(PollResponse::Error("unsupported_grant_type".into())),
        );
        assert!(matches!(
            s,
            DeviceFlowState::Failed(ref e) if e.contains("unsupported_grant_type")
        ));
        assert_eq!(a, DeviceFlowAction::Finish);
    }

    #[test]
    fn global_timeout_forces_expired() {
        let late = from_unix_seconds(NOW + 901);
        let (s, a) = handle_event(polling(0), DeviceFlowEvent::PollDue { now: late });
        assert!(matches!(s, DeviceFlowState::Expired));
        assert_eq!(a, DeviceFlowAction::Finish);

        let (s, _) = handle_event(
            polling(0),
            DeviceFlowEvent::Polled {
                response: PollResponse::Pending,
                now: late,
            },
        );
        assert!(matches!(s, DeviceFlowState::Expired));
    }

    #[test]
    fn exactly_at_expiry_still_polls() {
        let (s, a) = handle_event(
            polling(0),
            DeviceFlowEvent::PollDue {
                now: from_unix_seconds(NOW + 900),
            },
        );
        assert!(matches!(s, DeviceFlowState::Polling { .. }));
        assert_eq!(a, DeviceFlowAction::Poll);
    }

    #[test]
    fn cancel_from_any_live_state() {
        for state in [
            DeviceFlowState::Idle,
            DeviceFlowState::CodeRequested { max_failures: 3 },
            polling(1),
        ] {
            let (s, a) = handle_event(state, DeviceFlowEvent::Cancelled);
            assert!(matches!(s, DeviceFlowState::Cancelled));
            assert_eq!(a, DeviceFlowAction::Finish);
        }
    }

    #[test]
    fn terminal_states_stay_terminal() {
        let (s, a) = handle_event(DeviceFlowState::Denied, DeviceFlowEvent::Cancelled);
        assert!(matches!(s, DeviceFlowState::Denied));
        assert_eq!(a, DeviceFlowAction::Finish);
    }

    #[test]
    fn session_debug_hides_device_code() {
        let debug = format!("{:?}", session());
        assert!(!debug.contains("\"dc\""));
        assert!(debug.contains("ABCD-1234"));
    }

    #[test]
    fn poll_response_mapping() {
        let parse = |json: &str| {
            let response = serde_json::from_str::<TokenEndpointResponse>(json).unwrap();
            PollResponse::from_endpoint(response)
        };
        assert!(matches!(parse(r#"{"error":"authorization_pending"}"#), PollResponse::Pending));
        assert!(matches!(parse(r#"{"error":"slow_down","interval":10}"#), PollResponse::SlowDown));
        assert!(matches!(parse(r#"{"error":"expired_token"}"#), PollResponse::ExpiredToken));
        assert!(matches!(parse(r#"{"error":"access_denied"}"#), PollResponse::AccessDenied));
        assert!(matches!(parse(r#"{"error":"incorrect_device_code"}"#), PollResponse::Error(_)));
        assert!(matches!(parse(r#"{"access_token":"ghu_x"}"#), PollResponse::Token(_)));
    }
}
