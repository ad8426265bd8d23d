//! Session and identity bridge between an asynchronous instant-messaging
//! protocol engine and a handle-based IM session framework.
//!
//! The protocol side talks in peers, message ids and asynchronous events; the
//! framework side talks in integer handles, channels and synchronous
//! requests. [`Connection`] translates between the two, and
//! [`SessionRuntime`] runs it as a single task fed by two queues.

pub mod auth;
pub mod avatars;
pub mod channels;
pub mod config;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod errors;
pub mod framework;
pub mod logging;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

pub use auth::{AuthMachine, AuthState, Challenge};
pub use config::Config;
pub use connection::Connection;
pub use context::SessionContext;
pub use errors::{SessionError, SessionResult};
pub use framework::{EventBroadcaster, FrameworkEvent};
pub use logging::{init_logging, LogLevel};
pub use protocol::{ProtocolClient, ProtocolEvent};
pub use registry::HandleRegistry;
pub use runtime::{ProtocolEventSender, SessionHandle, SessionRuntime};
pub use types::{ChannelId, Handle, HandleType, Peer};
