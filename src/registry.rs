//! Session registry: the single source of truth for which live handle serves
//! which session.

use crate::error::WbotError;
use crate::transport::Transport;
use crate::types::{Contact, GroupMetadata};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use std::sync::Arc;

/// Live, in-memory connection for one session. Never persisted.
pub struct ConnectionHandle {
    pub session_id: i64,
    pub tenant_id: Option<i64>,
    pub transport: Arc<dyn Transport>,
    pub connected_at: DateTime<Utc>,
    /// JID -> contact metadata, filled by the contact-import side task.
    pub contacts: DashMap<String, Contact>,
    groups: DashMap<String, GroupMetadata>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("session_id", &self.session_id)
            .field("tenant_id", &self.tenant_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn new(session_id: i64, tenant_id: Option<i64>, transport: Arc<dyn Transport>) -> Self {
        Self {
            session_id,
            tenant_id,
            transport,
            connected_at: Utc::now(),
            contacts: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    /// Group metadata with read-through caching on the handle.
    pub async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, anyhow::Error> {
        if let Some(cached) = self.groups.get(jid) {
            return Ok(cached.clone());
        }
        let metadata = self.transport.fetch_group_metadata(jid).await?;
        self.groups.insert(jid.to_string(), metadata.clone());
        Ok(metadata)
    }
}

/// At most one handle per session id. Insertion never replaces implicitly;
/// the connection supervisor removes the stale entry first.
#[derive(Default)]
pub struct SessionRegistry {
    handles: DashMap<i64, Arc<ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ConnectionHandle>) -> Result<(), WbotError> {
        match self.handles.entry(handle.session_id) {
            Entry::Occupied(_) => Err(WbotError::AlreadyConnected(handle.session_id)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Looks up the handle, enforcing tenant isolation when a tenant id is
    /// supplied: a mismatch fails the lookup rather than leaking the handle.
    pub fn find(&self, session_id: i64, tenant_id: Option<i64>) -> Option<Arc<ConnectionHandle>> {
        let handle = self.handles.get(&session_id)?.clone();
        if let (Some(expected), Some(actual)) = (tenant_id, handle.tenant_id)
            && expected != actual
        {
            warn!(
                target: "Wbot/Registry",
                "session {session_id}: lookup for tenant {expected} rejected, handle belongs to tenant {actual}"
            );
            return None;
        }
        Some(handle)
    }

    pub fn contains(&self, session_id: i64) -> bool {
        self.handles.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Best-effort teardown: optional logout, then close, then delete from
    /// the table. Each step is fault-isolated so one failure cannot leave the
    /// later steps undone. Removing an absent id is a no-op.
    pub async fn remove(&self, session_id: i64, logout: bool) {
        let Some((_, handle)) = self.handles.remove(&session_id) else {
            debug!(target: "Wbot/Registry", "session {session_id}: remove is a no-op, no live handle");
            return;
        };
        if logout
            && let Err(e) = handle.transport.logout().await
        {
            warn!(target: "Wbot/Registry", "session {session_id}: logout failed: {e}");
        }
        if let Err(e) = handle.transport.close().await {
            warn!(target: "Wbot/Registry", "session {session_id}: transport close failed: {e}");
        }
        debug!(target: "Wbot/Registry", "session {session_id}: handle removed");
    }
}
