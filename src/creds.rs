//! Credential store: translates between the transport library's typed
//! key-bucket abstraction and the single serialized blob on the session row.
//!
//! The persisted shape is `{ "creds": <object>, "keys": { "<bucket>": { "<id>": <value> } } }`.
//! Byte buffers survive text storage via a reversible marker convention:
//! `{"type":"Buffer","data":"<base64>"}`.

use crate::error::{StoreError, WbotError};
use crate::store::{SessionStore, SessionUpdate};
use crate::types::Session;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Typed bucket names. Using one enum on both the read and the write path
/// makes it impossible to lose data to a misspelled bucket string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyBucket {
    #[serde(rename = "pre-key")]
    PreKey,
    #[serde(rename = "session")]
    Session,
    #[serde(rename = "sender-key")]
    SenderKey,
    #[serde(rename = "app-state-sync-key")]
    AppStateSyncKey,
    #[serde(rename = "app-state-sync-version")]
    AppStateSyncVersion,
    #[serde(rename = "sender-key-memory")]
    SenderKeyMemory,
    #[serde(rename = "device-list")]
    DeviceList,
}

impl KeyBucket {
    pub const ALL: [KeyBucket; 7] = [
        KeyBucket::PreKey,
        KeyBucket::Session,
        KeyBucket::SenderKey,
        KeyBucket::AppStateSyncKey,
        KeyBucket::AppStateSyncVersion,
        KeyBucket::SenderKeyMemory,
        KeyBucket::DeviceList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyBucket::PreKey => "pre-key",
            KeyBucket::Session => "session",
            KeyBucket::SenderKey => "sender-key",
            KeyBucket::AppStateSyncKey => "app-state-sync-key",
            KeyBucket::AppStateSyncVersion => "app-state-sync-version",
            KeyBucket::SenderKeyMemory => "sender-key-memory",
            KeyBucket::DeviceList => "device-list",
        }
    }
}

/// Byte-buffer codec for the blob's JSON representation.
pub mod codec {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{Value, json};

    pub fn bytes_to_value(bytes: &[u8]) -> Value {
        json!({ "type": "Buffer", "data": STANDARD.encode(bytes) })
    }

    /// Decodes any of the buffer shapes we may be handed: canonical base64,
    /// an array of byte numbers, or an index-keyed object. This sanitization
    /// happens only at this boundary, never as a global override.
    pub fn buffer_to_bytes(value: &Value) -> Option<Vec<u8>> {
        let obj = value.as_object()?;
        if obj.get("type")?.as_str()? != "Buffer" {
            return None;
        }
        match obj.get("data")? {
            Value::String(s) => STANDARD.decode(s).ok(),
            Value::Array(items) => items
                .iter()
                .map(|n| n.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect(),
            Value::Object(map) => {
                let mut out = vec![0u8; map.len()];
                for (index, byte) in map {
                    let index: usize = index.parse().ok()?;
                    let byte = byte.as_u64().and_then(|b| u8::try_from(b).ok())?;
                    *out.get_mut(index)? = byte;
                }
                Some(out)
            }
            _ => None,
        }
    }

    /// Rewrites every buffer marker in the tree to the canonical base64 form.
    pub fn normalize_buffers(value: &mut Value) {
        if let Some(bytes) = buffer_to_bytes(value) {
            *value = bytes_to_value(&bytes);
            return;
        }
        match value {
            Value::Array(items) => items.iter_mut().for_each(normalize_buffers),
            Value::Object(map) => map.values_mut().for_each(normalize_buffers),
            _ => {}
        }
    }
}

/// App-state sync keys are the one bucket whose raw value must be re-hydrated
/// into a typed object before being handed back to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AppStateSyncKey {
    pub key_data: Vec<u8>,
    pub fingerprint: Option<Value>,
    pub timestamp: i64,
}

#[derive(Deserialize)]
struct AppStateSyncKeyRecord {
    #[serde(rename = "keyData")]
    key_data: Value,
    fingerprint: Option<Value>,
    #[serde(default)]
    timestamp: i64,
}

impl AppStateSyncKey {
    /// Direct construction from the stored value, falling back to lenient
    /// field-by-field extraction when the strict shape does not match.
    pub fn from_value(value: &Value) -> Option<Self> {
        if let Ok(record) = serde_json::from_value::<AppStateSyncKeyRecord>(value.clone())
            && let Some(key_data) = codec::buffer_to_bytes(&record.key_data)
        {
            return Some(Self {
                key_data,
                fingerprint: record.fingerprint,
                timestamp: record.timestamp,
            });
        }

        let obj = value.as_object()?;
        let key_data = obj.get("keyData").and_then(codec::buffer_to_bytes)?;
        Some(Self {
            key_data,
            fingerprint: obj.get("fingerprint").cloned(),
            timestamp: obj.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

/// Value returned from a bucket read.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketValue {
    Json(Value),
    SyncKey(AppStateSyncKey),
}

/// Full deserialized credential material for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialState {
    pub creds: Value,
    #[serde(default)]
    pub keys: HashMap<KeyBucket, HashMap<String, Value>>,
}

impl CredentialState {
    /// Fresh material for a session that has never paired.
    pub fn fresh() -> Self {
        let registration_id: u32 = rand::random_range(1..=16380);
        Self {
            creds: json!({ "registrationId": registration_id }),
            keys: HashMap::new(),
        }
    }
}

/// Partial credential update emitted by the transport. A `None` entry value
/// deletes the id from its bucket.
#[derive(Debug, Clone, Default)]
pub struct CredsPatch {
    pub creds: Option<Value>,
    pub keys: HashMap<KeyBucket, HashMap<String, Option<Value>>>,
}

impl CredsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creds(mut self, creds: Value) -> Self {
        self.creds = Some(creds);
        self
    }

    pub fn put(mut self, bucket: KeyBucket, id: impl Into<String>, value: Value) -> Self {
        self.keys.entry(bucket).or_default().insert(id.into(), Some(value));
        self
    }

    pub fn delete(mut self, bucket: KeyBucket, id: impl Into<String>) -> Self {
        self.keys.entry(bucket).or_default().insert(id.into(), None);
        self
    }
}

/// Per-session credential store. Mutated only by the owning session's event
/// handlers; persistence is best-effort and never interrupts the lifecycle.
pub struct CredentialStore {
    session_id: i64,
    store: Arc<dyn SessionStore>,
    state: RwLock<CredentialState>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Parses the stored blob, or initializes fresh material when the row has
    /// none. A malformed blob is an unrecoverable setup failure.
    pub async fn load(
        session: &Session,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, WbotError> {
        let state = match session.credential_blob.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                let mut value: Value = serde_json::from_str(raw)
                    .map_err(|e| WbotError::MalformedBlob(session.id, e))?;
                codec::normalize_buffers(&mut value);
                serde_json::from_value(value)
                    .map_err(|e| WbotError::MalformedBlob(session.id, e))?
            }
            _ => {
                debug!(target: "Wbot/Creds", "session {}: no stored blob, initializing fresh credentials", session.id);
                CredentialState::fresh()
            }
        };
        Ok(Self {
            session_id: session.id,
            store,
            state: RwLock::new(state),
        })
    }

    pub async fn creds(&self) -> Value {
        self.state.read().await.creds.clone()
    }

    /// Returns only the entries present in the bucket. App-state sync keys
    /// are re-hydrated into their typed form.
    pub async fn get(&self, bucket: KeyBucket, ids: &[&str]) -> HashMap<String, BucketValue> {
        let state = self.state.read().await;
        let Some(entries) = state.keys.get(&bucket) else {
            return HashMap::new();
        };
        let mut out = HashMap::new();
        for id in ids {
            let Some(value) = entries.get(*id) else {
                continue;
            };
            let bucket_value = if bucket == KeyBucket::AppStateSyncKey {
                match AppStateSyncKey::from_value(value) {
                    Some(key) => BucketValue::SyncKey(key),
                    None => {
                        warn!(target: "Wbot/Creds", "session {}: app-state sync key {id} could not be re-hydrated", self.session_id);
                        BucketValue::Json(value.clone())
                    }
                }
            } else {
                BucketValue::Json(value.clone())
            };
            out.insert((*id).to_string(), bucket_value);
        }
        out
    }

    /// Shallow-merges the patch by id, then persists the whole blob back to
    /// the session row. Persistence failures are logged, not raised; the
    /// in-memory state stays updated and a later persist catches up.
    pub async fn set(&self, patch: CredsPatch) {
        let serialized = {
            let mut state = self.state.write().await;
            if let Some(creds) = patch.creds {
                state.creds = creds;
            }
            for (bucket, entries) in patch.keys {
                let stored = state.keys.entry(bucket).or_default();
                for (id, value) in entries {
                    match value {
                        Some(mut value) => {
                            codec::normalize_buffers(&mut value);
                            stored.insert(id, value);
                        }
                        None => {
                            stored.remove(&id);
                        }
                    }
                }
            }
            serde_json::to_string(&*state)
        };

        match serialized {
            Ok(blob) => self.persist(Some(blob)).await,
            Err(e) => warn!(target: "Wbot/Creds", "session {}: failed to serialize credential blob: {e}", self.session_id),
        }
    }

    /// Drops all in-memory material back to a fresh state. The session row's
    /// blob is cleared by the caller as part of the session reset.
    pub async fn reset(&self) {
        *self.state.write().await = CredentialState::fresh();
    }

    /// Current blob as it would be persisted.
    pub async fn serialized(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&*self.state.read().await)?)
    }

    async fn persist(&self, blob: Option<String>) {
        let update = SessionUpdate::new().credential_blob(blob);
        if let Err(e) = self.store.update(self.session_id, update).await {
            warn!(target: "Wbot/Creds", "session {}: failed to persist credential blob: {e}", self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use async_trait::async_trait;

    fn session_with_blob(blob: Option<&str>) -> Session {
        Session {
            credential_blob: blob.map(str::to_string),
            ..Session::new(1, 1)
        }
    }

    fn store_with(session: &Session) -> Arc<MemorySessionStore> {
        let store = Arc::new(MemorySessionStore::new());
        store.insert(session.clone());
        store
    }

    #[tokio::test]
    async fn test_load_fresh_when_blob_missing() {
        let session = session_with_blob(None);
        let store = store_with(&session);
        let creds = CredentialStore::load(&session, store).await.unwrap();

        let registration_id = creds.creds().await["registrationId"].as_u64().unwrap();
        assert!((1..=16380).contains(&registration_id));
        assert!(creds.get(KeyBucket::PreKey, &["1"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_blob() {
        let session = session_with_blob(Some("{not json"));
        let store = store_with(&session);
        let err = CredentialStore::load(&session, store).await.unwrap_err();
        assert!(matches!(err, WbotError::MalformedBlob(1, _)));
    }

    #[tokio::test]
    async fn test_set_then_load_round_trips_buffers() {
        let session = session_with_blob(None);
        let store = store_with(&session);
        let creds = CredentialStore::load(&session, store.clone()).await.unwrap();

        let key_bytes = vec![0u8, 1, 2, 254, 255];
        creds
            .set(
                CredsPatch::new()
                    .put(KeyBucket::Session, "jid:1", json!({"record": codec::bytes_to_value(&key_bytes)}))
                    .put(KeyBucket::PreKey, "42", json!({"private": codec::bytes_to_value(&[9u8; 32])})),
            )
            .await;

        // Reload from the persisted row, as a process restart would.
        let row = store.get(1).await.unwrap().unwrap();
        assert!(row.credential_blob.is_some());
        let reloaded = CredentialStore::load(&row, store.clone()).await.unwrap();

        let entries = reloaded.get(KeyBucket::Session, &["jid:1"]).await;
        let BucketValue::Json(value) = &entries["jid:1"] else {
            panic!("expected raw json value");
        };
        assert_eq!(codec::buffer_to_bytes(&value["record"]).unwrap(), key_bytes);

        let prekeys = reloaded.get(KeyBucket::PreKey, &["42", "43"]).await;
        assert_eq!(prekeys.len(), 1, "only present ids are returned");
    }

    #[tokio::test]
    async fn test_set_merges_and_deletes_by_id() {
        let session = session_with_blob(None);
        let store = store_with(&session);
        let creds = CredentialStore::load(&session, store).await.unwrap();

        creds
            .set(CredsPatch::new().put(KeyBucket::SenderKey, "a", json!(1)))
            .await;
        creds
            .set(
                CredsPatch::new()
                    .put(KeyBucket::SenderKey, "b", json!(2))
                    .put(KeyBucket::SenderKey, "a", json!(3)),
            )
            .await;
        creds.set(CredsPatch::new().delete(KeyBucket::SenderKey, "b")).await;

        let entries = creds.get(KeyBucket::SenderKey, &["a", "b"]).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["a"], BucketValue::Json(json!(3)));
    }

    #[tokio::test]
    async fn test_sync_key_rehydration_direct_and_fallback() {
        let session = session_with_blob(None);
        let store = store_with(&session);
        let creds = CredentialStore::load(&session, store).await.unwrap();

        // Strict shape plus a legacy array-form buffer that only the lenient
        // path normalizes.
        creds
            .set(
                CredsPatch::new()
                    .put(
                        KeyBucket::AppStateSyncKey,
                        "k1",
                        json!({"keyData": codec::bytes_to_value(&[7u8; 4]), "fingerprint": {"rawId": 3}, "timestamp": 1700000000}),
                    )
                    .put(
                        KeyBucket::AppStateSyncKey,
                        "k2",
                        json!({"keyData": {"type": "Buffer", "data": [1, 2, 3]}}),
                    ),
            )
            .await;

        let entries = creds.get(KeyBucket::AppStateSyncKey, &["k1", "k2"]).await;
        let BucketValue::SyncKey(k1) = &entries["k1"] else {
            panic!("expected typed sync key");
        };
        assert_eq!(k1.key_data, vec![7u8; 4]);
        assert_eq!(k1.timestamp, 1700000000);
        let BucketValue::SyncKey(k2) = &entries["k2"] else {
            panic!("expected typed sync key");
        };
        assert_eq!(k2.key_data, vec![1, 2, 3]);
        assert_eq!(k2.timestamp, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        struct BrokenStore;

        #[async_trait]
        impl SessionStore for BrokenStore {
            async fn get(&self, id: i64) -> Result<Option<Session>, StoreError> {
                Err(StoreError::Unavailable(format!("get {id}")))
            }
            async fn list_for_tenant(&self, _: i64) -> Result<Vec<Session>, StoreError> {
                Err(StoreError::Unavailable("list".into()))
            }
            async fn update(&self, _: i64, _: SessionUpdate) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("update".into()))
            }
        }

        let session = session_with_blob(None);
        let creds = CredentialStore::load(&session, Arc::new(BrokenStore)).await.unwrap();

        // Must not panic or propagate; in-memory state keeps the write.
        creds
            .set(CredsPatch::new().put(KeyBucket::DeviceList, "u1", json!(["d0", "d1"])))
            .await;
        let entries = creds.get(KeyBucket::DeviceList, &["u1"]).await;
        assert_eq!(entries["u1"], BucketValue::Json(json!(["d0", "d1"])));
    }

    #[test]
    fn test_codec_sanitizes_index_map_form() {
        let malformed = json!({"type": "Buffer", "data": {"0": 10, "1": 20, "2": 30}});
        assert_eq!(codec::buffer_to_bytes(&malformed).unwrap(), vec![10, 20, 30]);

        let mut tree = json!({"nested": [{"type": "Buffer", "data": [5, 6]}]});
        codec::normalize_buffers(&mut tree);
        assert_eq!(tree["nested"][0]["data"], json!("BQY="));
    }

    #[test]
    fn test_bucket_names_are_stable() {
        for bucket in KeyBucket::ALL {
            let json = serde_json::to_string(&bucket).unwrap();
            assert_eq!(json, format!("\"{}\"", bucket.as_str()));
            let back: KeyBucket = serde_json::from_str(&json).unwrap();
            assert_eq!(back, bucket);
        }
    }
}
