//! Authentication State Machine
//!
//! Drives sign-in, the auth-code and password challenges, retries, and the
//! reconnection policy.
//!
//! ```text
//! Disconnected ─► Connecting ─► AwaitingAuthCode ─► AwaitingPassword ─► SigningIn
//!                     │                 │                                   ▲  │
//!                     │                 └──────── (no two-factor) ──────────┘  │
//!                     └──────────── check-in (authorized session) ─────────────┘
//!                                                                              ▼
//!                                           Ready ◄── initial sync ◄── Authenticated
//! ```
//!
//! `AuthError` is entered from any of the four pre-authentication states when
//! the protocol rejects an attempt. It resolves immediately: back into the
//! waiting state of the rejected challenge when the error is retryable and the
//! attempt bound allows it, otherwise to a terminal `Disconnected`.
//!
//! The machine only tracks state. Issuing protocol calls and notifying the
//! framework is the caller's job.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::errors::{SessionError, SessionResult};
use crate::protocol::{AuthErrorCode, DropReason};

/// Authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthState {
    Disconnected,
    Connecting,
    AwaitingAuthCode,
    AwaitingPassword,
    SigningIn,
    Authenticated,
    Ready,
    AuthError,
}

impl AuthState {
    fn accepts_auth_error(&self) -> bool {
        matches!(
            self,
            AuthState::Connecting
                | AuthState::AwaitingAuthCode
                | AuthState::AwaitingPassword
                | AuthState::SigningIn
        )
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthState::Disconnected => "disconnected",
            AuthState::Connecting => "connecting",
            AuthState::AwaitingAuthCode => "awaiting auth code",
            AuthState::AwaitingPassword => "awaiting password",
            AuthState::SigningIn => "signing in",
            AuthState::Authenticated => "authenticated",
            AuthState::Ready => "ready",
            AuthState::AuthError => "handling an auth error",
        };
        f.write_str(text)
    }
}

/// Interactive challenge presented to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Challenge {
    AuthCode,
    Password,
}

impl Challenge {
    fn waiting_state(&self) -> AuthState {
        match self {
            Challenge::AuthCode => AuthState::AwaitingAuthCode,
            Challenge::Password => AuthState::AwaitingPassword,
        }
    }
}

/// First-sync milestones required for `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    ContactList,
    Dialogs,
}

/// Resolution of an `AuthError`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorOutcome {
    /// Back in the waiting state; the user may answer `challenge` again
    Retry(Challenge),
    /// No further attempts; the session must be torn down
    Terminal(SessionError),
}

/// Resolution of a transport drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Requested,
    Reconnect { attempt: u32 },
    GiveUp { attempts: u32 },
}

/// Retry bounds, taken from [`SessionConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthLimits {
    pub max_reconnect_attempts: u32,
    pub max_code_attempts: u32,
    pub max_password_attempts: u32,
}

impl From<&SessionConfig> for AuthLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_code_attempts: config.max_code_attempts,
            max_password_attempts: config.max_password_attempts,
        }
    }
}

impl Default for AuthLimits {
    fn default() -> Self {
        AuthLimits::from(&SessionConfig::default())
    }
}

/// Sequential authentication state holder
#[derive(Debug)]
pub struct AuthMachine {
    state: AuthState,
    limits: AuthLimits,
    two_factor: bool,
    in_flight: Option<Challenge>,
    code_attempts: u32,
    password_attempts: u32,
    reconnect_attempts: u32,
    contacts_synced: bool,
    dialogs_synced: bool,
    last_failure: Option<SessionError>,
}

impl AuthMachine {
    pub fn new(limits: AuthLimits) -> Self {
        Self {
            state: AuthState::Disconnected,
            limits,
            two_factor: false,
            in_flight: None,
            code_attempts: 0,
            password_attempts: 0,
            reconnect_attempts: 0,
            contacts_synced: false,
            dialogs_synced: false,
            last_failure: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == AuthState::Ready
    }

    /// Self identity known (`Authenticated` or `Ready`)
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated | AuthState::Ready)
    }

    pub fn two_factor(&self) -> bool {
        self.two_factor
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_failure(&self) -> Option<&SessionError> {
        self.last_failure.as_ref()
    }

    fn transition(&mut self, to: AuthState) {
        debug!(from = %self.state, to = %to, "Auth transition");
        self.state = to;
    }

    fn require(&self, expected: &[AuthState], action: &'static str) -> SessionResult<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::invalid_state(self.state, action))
        }
    }

    fn clear_cycle(&mut self) {
        self.in_flight = None;
        self.code_attempts = 0;
        self.password_attempts = 0;
        self.contacts_synced = false;
        self.dialogs_synced = false;
    }

    /// Disconnected → Connecting
    pub fn start(&mut self) -> SessionResult<()> {
        self.require(&[AuthState::Disconnected], "connect")?;
        self.last_failure = None;
        self.transition(AuthState::Connecting);
        Ok(())
    }

    /// Connecting → SigningIn, resuming an authorized engine session
    pub fn on_check_in(&mut self) -> SessionResult<()> {
        self.require(&[AuthState::Connecting], "check in")?;
        self.transition(AuthState::SigningIn);
        Ok(())
    }

    /// Protocol asks for the phone code
    pub fn on_auth_code_required(&mut self, two_factor: bool) -> SessionResult<()> {
        self.require(
            &[AuthState::Connecting, AuthState::SigningIn, AuthState::AwaitingAuthCode],
            "request an auth code",
        )?;
        self.two_factor = two_factor;
        self.in_flight = None;
        self.transition(AuthState::AwaitingAuthCode);
        Ok(())
    }

    /// AwaitingAuthCode → AwaitingPassword (two-factor) or SigningIn
    pub fn submit_auth_code(&mut self, code: &str) -> SessionResult<AuthState> {
        self.require(&[AuthState::AwaitingAuthCode], "submit an auth code")?;
        if code.trim().is_empty() {
            return Err(SessionError::InvalidArgument("empty auth code".to_string()));
        }

        self.code_attempts += 1;
        self.in_flight = Some(Challenge::AuthCode);
        let next = if self.two_factor {
            AuthState::AwaitingPassword
        } else {
            AuthState::SigningIn
        };
        self.transition(next);
        Ok(next)
    }

    /// Protocol asks for the cloud password
    pub fn on_password_required(&mut self) -> SessionResult<()> {
        self.require(
            &[AuthState::AwaitingAuthCode, AuthState::SigningIn, AuthState::AwaitingPassword],
            "request a password",
        )?;
        self.two_factor = true;
        self.transition(AuthState::AwaitingPassword);
        Ok(())
    }

    /// AwaitingPassword → SigningIn
    pub fn submit_password(&mut self, password: &str) -> SessionResult<()> {
        self.require(&[AuthState::AwaitingPassword], "submit a password")?;
        if password.is_empty() {
            return Err(SessionError::InvalidArgument("empty password".to_string()));
        }

        self.password_attempts += 1;
        self.in_flight = Some(Challenge::Password);
        self.transition(AuthState::SigningIn);
        Ok(())
    }

    /// Protocol rejected an attempt
    pub fn on_auth_error(
        &mut self,
        code: AuthErrorCode,
        message: &str,
    ) -> SessionResult<AuthErrorOutcome> {
        if !self.state.accepts_auth_error() {
            return Err(SessionError::invalid_state(self.state, "handle an auth error"));
        }

        let waiting = match self.state {
            AuthState::AwaitingAuthCode => Some(Challenge::AuthCode),
            AuthState::AwaitingPassword => Some(Challenge::Password),
            _ => None,
        };
        self.transition(AuthState::AuthError);

        let challenge = match code {
            AuthErrorCode::PhoneCodeInvalid => Some(Challenge::AuthCode),
            AuthErrorCode::PasswordHashInvalid => Some(Challenge::Password),
            _ => self.in_flight.or(waiting),
        };

        let failure = SessionError::AuthenticationFailed {
            code,
            message: message.to_string(),
        };

        let retry = match challenge {
            Some(Challenge::AuthCode) => self.code_attempts < self.limits.max_code_attempts,
            Some(Challenge::Password) => self.password_attempts < self.limits.max_password_attempts,
            None => false,
        };

        match challenge {
            Some(challenge) if code.is_retryable() && retry => {
                warn!(%code, ?challenge, "Authentication attempt rejected, retrying");
                self.in_flight = None;
                self.transition(challenge.waiting_state());
                Ok(AuthErrorOutcome::Retry(challenge))
            }
            _ => {
                warn!(%code, message, "Authentication failed permanently");
                self.clear_cycle();
                self.last_failure = Some(failure.clone());
                self.transition(AuthState::Disconnected);
                Ok(AuthErrorOutcome::Terminal(failure))
            }
        }
    }

    /// SigningIn → Authenticated once the self identity is known
    pub fn on_authenticated(&mut self) -> SessionResult<()> {
        self.require(&[AuthState::SigningIn], "complete sign-in")?;
        self.in_flight = None;
        self.code_attempts = 0;
        self.password_attempts = 0;
        self.transition(AuthState::Authenticated);
        Ok(())
    }

    /// Record a first sync; returns `true` when this made the session Ready
    pub fn on_initial_sync(&mut self, kind: SyncKind) -> SessionResult<bool> {
        self.require(&[AuthState::Authenticated, AuthState::Ready], "finish initial sync")?;
        match kind {
            SyncKind::ContactList => self.contacts_synced = true,
            SyncKind::Dialogs => self.dialogs_synced = true,
        }

        if self.state == AuthState::Authenticated && self.contacts_synced && self.dialogs_synced {
            self.reconnect_attempts = 0;
            self.transition(AuthState::Ready);
            info!("Session ready");
            return Ok(true);
        }
        Ok(false)
    }

    /// Any state → Disconnected
    pub fn on_disconnected(&mut self, reason: DropReason) -> DisconnectOutcome {
        self.clear_cycle();
        self.transition(AuthState::Disconnected);

        if reason == DropReason::Requested {
            return DisconnectOutcome::Requested;
        }

        self.reconnect_attempts += 1;
        if self.reconnect_attempts <= self.limits.max_reconnect_attempts {
            DisconnectOutcome::Reconnect { attempt: self.reconnect_attempts }
        } else {
            warn!(attempts = self.reconnect_attempts, "Reconnection bound exhausted");
            DisconnectOutcome::GiveUp { attempts: self.reconnect_attempts }
        }
    }

    /// Back to a fresh Disconnected machine
    pub fn reset(&mut self) {
        self.clear_cycle();
        self.two_factor = false;
        self.reconnect_attempts = 0;
        self.transition(AuthState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AuthLimits {
        AuthLimits {
            max_reconnect_attempts: 2,
            max_code_attempts: 3,
            max_password_attempts: 2,
        }
    }

    fn awaiting_code(two_factor: bool) -> AuthMachine {
        let mut machine = AuthMachine::new(limits());
        machine.start().unwrap();
        machine.on_auth_code_required(two_factor).unwrap();
        machine
    }

    #[test]
    fn test_password_in_code_state_is_rejected() {
        let mut machine = awaiting_code(false);
        let err = machine.submit_password("hunter2").unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidStateTransition {
                state: AuthState::AwaitingAuthCode,
                action: "submit a password",
            }
        );
        assert_eq!(machine.state(), AuthState::AwaitingAuthCode);
    }

    #[test]
    fn test_code_without_two_factor_goes_to_signing_in() {
        let mut machine = awaiting_code(false);
        assert_eq!(machine.submit_auth_code("12345").unwrap(), AuthState::SigningIn);
    }

    #[test]
    fn test_code_with_two_factor_goes_to_password() {
        let mut machine = awaiting_code(true);
        assert_eq!(machine.submit_auth_code("12345").unwrap(), AuthState::AwaitingPassword);
        machine.submit_password("secret").unwrap();
        assert_eq!(machine.state(), AuthState::SigningIn);
    }

    #[test]
    fn test_code_outside_waiting_state() {
        let mut machine = AuthMachine::new(limits());
        assert!(matches!(
            machine.submit_auth_code("1"),
            Err(SessionError::InvalidStateTransition { state: AuthState::Disconnected, .. })
        ));
    }

    #[test]
    fn test_empty_code_is_invalid_argument() {
        let mut machine = awaiting_code(false);
        assert!(matches!(
            machine.submit_auth_code("  "),
            Err(SessionError::InvalidArgument(_))
        ));
        assert_eq!(machine.state(), AuthState::AwaitingAuthCode);
    }

    #[test]
    fn test_full_sign_in_to_ready() {
        let mut machine = awaiting_code(false);
        machine.submit_auth_code("12345").unwrap();
        machine.on_authenticated().unwrap();
        assert!(machine.is_authenticated());

        assert!(!machine.on_initial_sync(SyncKind::Dialogs).unwrap());
        assert!(machine.on_initial_sync(SyncKind::ContactList).unwrap());
        assert!(machine.is_ready());
        // Later syncs do not re-trigger readiness
        assert!(!machine.on_initial_sync(SyncKind::Dialogs).unwrap());
    }

    #[test]
    fn test_invalid_code_is_retried_until_bound() {
        let mut machine = awaiting_code(false);

        for _ in 0..2 {
            machine.submit_auth_code("000").unwrap();
            let outcome = machine
                .on_auth_error(AuthErrorCode::PhoneCodeInvalid, "PHONE_CODE_INVALID")
                .unwrap();
            assert_eq!(outcome, AuthErrorOutcome::Retry(Challenge::AuthCode));
            assert_eq!(machine.state(), AuthState::AwaitingAuthCode);
        }

        machine.submit_auth_code("000").unwrap();
        let outcome = machine
            .on_auth_error(AuthErrorCode::PhoneCodeInvalid, "PHONE_CODE_INVALID")
            .unwrap();
        assert!(matches!(outcome, AuthErrorOutcome::Terminal(_)));
        assert_eq!(machine.state(), AuthState::Disconnected);
        assert!(machine.last_failure().is_some());
    }

    #[test]
    fn test_wrong_code_detected_after_password_prompt() {
        let mut machine = awaiting_code(true);
        machine.submit_auth_code("000").unwrap();
        assert_eq!(machine.state(), AuthState::AwaitingPassword);

        let outcome = machine
            .on_auth_error(AuthErrorCode::PhoneCodeInvalid, "PHONE_CODE_INVALID")
            .unwrap();
        assert_eq!(outcome, AuthErrorOutcome::Retry(Challenge::AuthCode));
        assert_eq!(machine.state(), AuthState::AwaitingAuthCode);
    }

    #[test]
    fn test_too_many_password_failures_is_terminal() {
        let mut machine = awaiting_code(true);
        machine.submit_auth_code("12345").unwrap();

        machine.submit_password("a").unwrap();
        assert_eq!(
            machine.on_auth_error(AuthErrorCode::PasswordHashInvalid, "").unwrap(),
            AuthErrorOutcome::Retry(Challenge::Password)
        );

        machine.submit_password("b").unwrap();
        let outcome = machine.on_auth_error(AuthErrorCode::PasswordHashInvalid, "").unwrap();
        match outcome {
            AuthErrorOutcome::Terminal(SessionError::AuthenticationFailed { code, .. }) => {
                assert_eq!(code, AuthErrorCode::PasswordHashInvalid)
            }
            other => panic!("expected terminal failure, got {:?}", other),
        }
        assert_eq!(machine.state(), AuthState::Disconnected);
        assert!(matches!(
            machine.last_failure(),
            Some(SessionError::AuthenticationFailed { code: AuthErrorCode::PasswordHashInvalid, .. })
        ));
        assert!(machine.submit_password("c").is_err());
    }

    #[test]
    fn test_non_retryable_error_is_terminal() {
        let mut machine = AuthMachine::new(limits());
        machine.start().unwrap();
        let outcome = machine
            .on_auth_error(AuthErrorCode::PhoneNumberUnknown, "PHONE_NUMBER_INVALID")
            .unwrap();
        assert!(matches!(outcome, AuthErrorOutcome::Terminal(_)));
    }

    #[test]
    fn test_auth_error_when_ready_is_invalid() {
        let mut machine = awaiting_code(false);
        machine.submit_auth_code("1").unwrap();
        machine.on_authenticated().unwrap();
        assert!(machine.on_auth_error(AuthErrorCode::Unknown, "").is_err());
    }

    #[test]
    fn test_reconnect_bound() {
        let mut machine = AuthMachine::new(limits());
        machine.start().unwrap();

        assert_eq!(
            machine.on_disconnected(DropReason::NetworkError),
            DisconnectOutcome::Reconnect { attempt: 1 }
        );
        machine.start().unwrap();
        assert_eq!(
            machine.on_disconnected(DropReason::ServerError),
            DisconnectOutcome::Reconnect { attempt: 2 }
        );
        machine.start().unwrap();
        assert_eq!(
            machine.on_disconnected(DropReason::NetworkError),
            DisconnectOutcome::GiveUp { attempts: 3 }
        );
        assert_eq!(machine.state(), AuthState::Disconnected);
    }

    #[test]
    fn test_ready_resets_reconnect_counter() {
        let mut machine = AuthMachine::new(limits());
        machine.start().unwrap();
        machine.on_disconnected(DropReason::NetworkError);

        machine.start().unwrap();
        machine.on_check_in().unwrap();
        machine.on_authenticated().unwrap();
        machine.on_initial_sync(SyncKind::ContactList).unwrap();
        machine.on_initial_sync(SyncKind::Dialogs).unwrap();
        assert_eq!(machine.reconnect_attempts(), 0);
    }

    #[test]
    fn test_requested_disconnect_does_not_count() {
        let mut machine = AuthMachine::new(limits());
        machine.start().unwrap();
        assert_eq!(machine.on_disconnected(DropReason::Requested), DisconnectOutcome::Requested);
        assert_eq!(machine.reconnect_attempts(), 0);
    }
}
