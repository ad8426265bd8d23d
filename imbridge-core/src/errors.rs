//! Error types for session operations

use thiserror::Error;

use crate::auth::AuthState;
use crate::protocol::{AuthErrorCode, ProtocolError};
use crate::state::StateError;
use crate::types::{Handle, HandleType};

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced to the framework side
///
/// Per-request variants (`UnknownHandle`, `InvalidStateTransition`, ...) only
/// fail the request that produced them. `SessionInvalidated` and a terminal
/// `AuthenticationFailed` are session-fatal and come with a full teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Framework referenced a handle that was never allocated
    #[error("Unknown {handle_type} handle: {handle}")]
    UnknownHandle { handle: Handle, handle_type: HandleType },

    /// Request is not valid in the current authentication state
    #[error("Cannot {action} while {state}")]
    InvalidStateTransition { state: AuthState, action: &'static str },

    /// Protocol rejected an authentication attempt
    #[error("Authentication failed ({code}): {message}")]
    AuthenticationFailed { code: AuthErrorCode, message: String },

    /// A pending asynchronous operation exceeded its bound
    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },

    /// Account was invalidated externally
    #[error("Session invalidated for account {account}")]
    SessionInvalidated { account: String },

    /// Identifier text is not a valid peer of the requested kind
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Malformed request argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Data exists conceptually but the protocol has not provided it
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// The session task is gone
    #[error("Session runtime stopped")]
    RuntimeStopped,

    /// Outbound protocol call failed to issue
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Persisted state could not be written
    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl SessionError {
    pub(crate) fn unknown_handle(handle: Handle, handle_type: HandleType) -> Self {
        SessionError::UnknownHandle { handle, handle_type }
    }

    pub(crate) fn invalid_state(state: AuthState, action: &'static str) -> Self {
        SessionError::InvalidStateTransition { state, action }
    }
}
