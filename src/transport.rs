//! Opaque transport seam. The WhatsApp wire protocol lives behind these
//! traits; this crate only consumes connect/send/receive primitives and the
//! event stream they emit.

use crate::creds::{CredentialStore, CredsPatch};
use crate::types::{CloseReason, Contact, GroupMetadata};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Predicate deciding whether inbound events from a JID should be dropped at
/// the source.
pub type JidFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Browser identification advertised to the protocol server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserIdentity {
    pub device: String,
    pub browser: String,
    pub version: String,
}

impl Default for BrowserIdentity {
    fn default() -> Self {
        Self {
            device: "WBot".to_string(),
            browser: "Chrome".to_string(),
            version: "10.0".to_string(),
        }
    }
}

/// Everything a transport factory needs to build one live connection.
#[derive(Clone)]
pub struct TransportConfig {
    pub version: (u32, u32, u32),
    /// Auth material: `creds` plus the typed key store, both served by the
    /// session's [`CredentialStore`].
    pub auth: Arc<CredentialStore>,
    pub browser: BrowserIdentity,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// JIDs for which inbound events should be dropped at the source.
    pub ignore_jid: Option<JidFilter>,
    /// Host-owned retry cache, carried through untouched; the transport
    /// downcasts it to whatever concrete type the host registered.
    pub message_retry_cache: Option<Arc<dyn Any + Send + Sync>>,
}

/// Protocol-level events delivered serially per connection.
#[derive(Debug)]
pub enum TransportEvent {
    CredsUpdated(CredsPatch),
    ConnectionOpen,
    ConnectionClosed { reason: CloseReason },
    QrIssued { code: String },
    MessageUpsert { payload: Value },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, jid: &str, payload: Value) -> Result<(), anyhow::Error>;
    async fn logout(&self) -> Result<(), anyhow::Error>;
    async fn close(&self) -> Result<(), anyhow::Error>;
    async fn fetch_group_metadata(&self, jid: &str) -> Result<GroupMetadata, anyhow::Error>;
    async fn fetch_contacts(&self) -> Result<Vec<Contact>, anyhow::Error>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: TransportConfig,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// Scripted transport implementations for tests.
pub mod mock {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A transport whose behavior is driven entirely by the test: events are
    /// injected through the paired sender, and outbound calls are recorded.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub logout_calls: AtomicUsize,
        pub close_calls: AtomicUsize,
        pub sent: Mutex<Vec<(String, Value)>>,
        pub contacts: Mutex<Vec<Contact>>,
        pub groups: Mutex<Vec<GroupMetadata>>,
        pub fail_contact_fetch: AtomicBool,
        /// Delay applied to `fetch_contacts`, for exercising suspended side
        /// tasks that outlive the connection.
        pub contact_fetch_delay: Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_message(&self, jid: &str, payload: Value) -> Result<(), anyhow::Error> {
            self.sent.lock().unwrap().push((jid.to_string(), payload));
            Ok(())
        }

        async fn logout(&self) -> Result<(), anyhow::Error> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), anyhow::Error> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_group_metadata(&self, jid: &str) -> Result<GroupMetadata, anyhow::Error> {
            self.groups
                .lock()
                .unwrap()
                .iter()
                .find(|g| g.jid == jid)
                .cloned()
                .ok_or_else(|| anyhow!("unknown group {jid}"))
        }

        async fn fetch_contacts(&self) -> Result<Vec<Contact>, anyhow::Error> {
            let delay = *self.contact_fetch_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_contact_fetch.load(Ordering::SeqCst) {
                return Err(anyhow!("contact fetch failed"));
            }
            Ok(self.contacts.lock().unwrap().clone())
        }
    }

    /// Hands out pre-arranged connections in order. An empty queue simulates
    /// a setup failure (the network being down).
    #[derive(Default)]
    pub struct ScriptedFactory {
        connections: Mutex<VecDeque<(Arc<ScriptedTransport>, mpsc::Receiver<TransportEvent>)>>,
        pub create_calls: AtomicUsize,
        pub seen_configs: Mutex<Vec<TransportConfig>>,
    }

    impl ScriptedFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues one connection and returns the transport plus the sender
        /// the test uses to drive its event stream.
        pub fn push_connection(&self) -> (Arc<ScriptedTransport>, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(32);
            let transport = Arc::new(ScriptedTransport::default());
            self.connections
                .lock()
                .unwrap()
                .push_back((transport.clone(), rx));
            (transport, tx)
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn create(
            &self,
            config: TransportConfig,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_configs.lock().unwrap().push(config.clone());
            let (transport, rx) = self
                .connections
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted connection available"))?;
            Ok((transport as Arc<dyn Transport>, rx))
        }
    }
}
