//! External session storage seam.
//!
//! The session rows live in the host application's database; this layer only
//! needs point reads, per-tenant listing, and last-write-wins field updates.

use crate::error::StoreError;
use crate::types::{Session, SessionStatus};
use async_trait::async_trait;
use dashmap::DashMap;

/// Partial update applied to a session row. `None` leaves the field alone;
/// the nested `Option` distinguishes "set to NULL" from "keep".
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub credential_blob: Option<Option<String>>,
    pub qr: Option<Option<String>>,
    pub number: Option<Option<String>>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn credential_blob(mut self, blob: Option<String>) -> Self {
        self.credential_blob = Some(blob);
        self
    }

    pub fn qr(mut self, qr: Option<String>) -> Self {
        self.qr = Some(qr);
        self
    }

    pub fn number(mut self, number: Option<String>) -> Self {
        self.number = Some(number);
        self
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Session>, StoreError>;
    async fn list_for_tenant(&self, tenant_id: i64) -> Result<Vec<Session>, StoreError>;
    /// Applies the update with last-write-wins semantics.
    async fn update(&self, id: i64, update: SessionUpdate) -> Result<(), StoreError>;
}

/// In-memory [`SessionStore`] used by tests and single-process deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    rows: DashMap<i64, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        self.rows.insert(session.id, session);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: i64) -> Result<Option<Session>, StoreError> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn list_for_tenant(&self, tenant_id: i64) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn update(&self, id: i64, update: SessionUpdate) -> Result<(), StoreError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id))?;
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(blob) = update.credential_blob {
            row.credential_blob = blob;
        }
        if let Some(qr) = update.qr {
            row.qr = qr;
        }
        if let Some(number) = update.number {
            row.number = number;
        }
        Ok(())
    }
}
