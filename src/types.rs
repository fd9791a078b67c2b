//! Session data model and close-reason classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted connection state of a session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "QRCODE")]
    Qrcode,
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Qrcode => "QRCODE",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// One tenant-connected WhatsApp account. The row is externally owned; this
/// layer only reads it and writes back status/credential/QR fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub tenant_id: i64,
    pub status: SessionStatus,
    /// Serialized authentication state, opaque except for JSON round-tripping.
    pub credential_blob: Option<String>,
    pub qr: Option<String>,
    pub number: Option<String>,
}

impl Session {
    pub fn new(id: i64, tenant_id: i64) -> Self {
        Self {
            id,
            tenant_id,
            status: SessionStatus::Pending,
            credential_blob: None,
            qr: None,
            number: None,
        }
    }
}

/// Contact metadata cached on a live connection handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub jid: String,
    pub name: Option<String>,
    pub number: Option<String>,
}

/// Group metadata cached on a live connection handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub jid: String,
    pub subject: String,
    pub participants: Vec<String>,
}

/// Reason attached to a transport `ConnectionClosed` event. The numeric code
/// is authoritative where present; the message is matched only as a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: Option<u16>,
    pub message: String,
}

impl CloseReason {
    pub fn new(code: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}: {}", code, self.message),
            None => write!(f, "no code: {}", self.message),
        }
    }
}

/// Recovery policy decided for a connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Another process took over the session. Terminal for this process.
    Replaced,
    /// Operator-initiated logout. Terminal, credentials kept.
    LoggedOutIntentional,
    /// Phone-initiated logout. Credentials wiped, manual re-pairing required.
    LoggedOutRemote,
    /// Local Signal keys are corrupted; wipe and reconnect with a fixed delay.
    KeyIntegrity,
    /// Stream-level restart request; reconnect with linear backoff, keep keys.
    StreamFault,
    /// Rate limited by the server; escalating delay table, then full reset.
    RateLimited,
    /// Anything recoverable; reconnect with exponential backoff.
    Transient,
}

/// Code reserved by the transport for stream-level restarts.
pub const STREAM_FAULT_CODE: u16 = 515;

/// Marker embedded in the close message when the operator requested logout.
pub const INTENTIONAL_LOGOUT_MARKER: &str = "intentional logout";

const KEY_INTEGRITY_PATTERNS: [&str; 4] = ["bad mac", "invalid mac", "hmac", "checksum"];
const TRANSIENT_CODES: [u16; 4] = [408, 428, 500, 503];

/// Classify a close reason into its recovery policy. Rules are evaluated in
/// a fixed order; the first match wins.
pub fn classify(reason: &CloseReason) -> ClosePolicy {
    let message = reason.message.to_ascii_lowercase();

    if reason.code == Some(440) || message.contains("replaced") || message.contains("conflict") {
        return ClosePolicy::Replaced;
    }

    if message.contains(INTENTIONAL_LOGOUT_MARKER) {
        return ClosePolicy::LoggedOutIntentional;
    }

    if reason.code == Some(401) || message.contains("logged out") || message.contains("unauthorized")
    {
        return ClosePolicy::LoggedOutRemote;
    }

    if KEY_INTEGRITY_PATTERNS.iter().any(|p| message.contains(p)) {
        return ClosePolicy::KeyIntegrity;
    }

    match reason.code {
        Some(STREAM_FAULT_CODE) => ClosePolicy::StreamFault,
        Some(403) => ClosePolicy::RateLimited,
        Some(code) if TRANSIENT_CODES.contains(&code) || (500..600).contains(&code) => {
            ClosePolicy::Transient
        }
        // Unknown codes and missing codes are treated as recoverable.
        _ => ClosePolicy::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(code: impl Into<Option<u16>>, message: &str) -> ClosePolicy {
        classify(&CloseReason::new(code, message))
    }

    #[test]
    fn test_replaced_takes_precedence() {
        assert_eq!(policy(440, "Stream Errored"), ClosePolicy::Replaced);
        assert_eq!(policy(None, "connection replaced"), ClosePolicy::Replaced);
        // A conflict message wins even when the code alone would be transient.
        assert_eq!(policy(500, "session conflict"), ClosePolicy::Replaced);
    }

    #[test]
    fn test_logout_intentional_vs_remote() {
        assert_eq!(
            policy(403, "Intentional Logout"),
            ClosePolicy::LoggedOutIntentional
        );
        assert_eq!(policy(401, "Connection Failure"), ClosePolicy::LoggedOutRemote);
        assert_eq!(policy(None, "logged out from phone"), ClosePolicy::LoggedOutRemote);
    }

    #[test]
    fn test_key_integrity_patterns() {
        assert_eq!(policy(None, "Bad MAC Error"), ClosePolicy::KeyIntegrity);
        assert_eq!(policy(None, "invalid mac"), ClosePolicy::KeyIntegrity);
        assert_eq!(policy(None, "hmac mismatch"), ClosePolicy::KeyIntegrity);
        assert_eq!(policy(None, "checksum failed"), ClosePolicy::KeyIntegrity);
    }

    #[test]
    fn test_stream_fault_and_rate_limit() {
        assert_eq!(policy(515, "stream restart required"), ClosePolicy::StreamFault);
        assert_eq!(policy(403, "forbidden"), ClosePolicy::RateLimited);
    }

    #[test]
    fn test_transient_allow_list_and_fallback() {
        for code in [408u16, 428, 500, 503, 502, 599] {
            assert_eq!(policy(code, "whatever"), ClosePolicy::Transient);
        }
        assert_eq!(policy(None, "socket hang up"), ClosePolicy::Transient);
        assert_eq!(policy(499, "unknown"), ClosePolicy::Transient);
    }

    #[test]
    fn test_status_display_matches_storage_strings() {
        assert_eq!(SessionStatus::Pending.to_string(), "PENDING");
        assert_eq!(SessionStatus::Qrcode.to_string(), "QRCODE");
        assert_eq!(SessionStatus::Connected.to_string(), "CONNECTED");
        assert_eq!(SessionStatus::Disconnected.to_string(), "DISCONNECTED");
        let json = serde_json::to_string(&SessionStatus::Qrcode).unwrap();
        assert_eq!(json, "\"QRCODE\"");
    }
}
