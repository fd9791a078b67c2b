//! Multi-tenant WhatsApp session lifecycle manager.
//!
//! This crate multiplexes many independent per-tenant protocol sessions, each
//! with its own connect/authenticate/reconnect state machine. It owns:
//!
//! - the connection supervisor (connect → QR pairing → open → close policies),
//! - the in-memory session registry (one live handle per session id),
//! - the reconnect scheduler (per-session backoff with duplicate suppression),
//! - the credential store (serialized Signal-session state per session row),
//! - event fan-out to in-process subscribers and real-time clients.
//!
//! The wire protocol itself is external: it is consumed through the opaque
//! [`transport::Transport`] / [`transport::TransportFactory`] seam.

pub mod config;
pub mod creds;
pub mod error;
pub mod fanout;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod version;
pub mod welcome_lock;

pub use config::WbotConfig;
pub use creds::{CredentialStore, CredsPatch, KeyBucket};
pub use error::{StoreError, WbotError};
pub use fanout::{EventBus, EventHandler, RealtimeSink, WbotEvent};
pub use manager::ConnectionManager;
pub use registry::{ConnectionHandle, SessionRegistry};
pub use scheduler::ReconnectScheduler;
pub use store::{SessionStore, SessionUpdate};
pub use types::{ClosePolicy, CloseReason, Session, SessionStatus};
pub use welcome_lock::WelcomeFlowLock;
