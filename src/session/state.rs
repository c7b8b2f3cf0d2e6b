//! Session records, status transitions and partial patches

use crate::error::{TetherError, TetherResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Longest accepted session ID
const MAX_SESSION_ID_LEN: usize = 128;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Init,
    GeneratingQr,
    GeneratingCode,
    Connected,
    Disconnected,
    Deleted,
}

impl SessionStatus {
    /// Wire and storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::GeneratingQr => "GENERATING_QR",
            Self::GeneratingCode => "GENERATING_CODE",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Deleted => "DELETED",
        }
    }

    /// Whether the session is waiting on the user to complete pairing
    pub fn is_pairing(&self) -> bool {
        matches!(self, Self::GeneratingQr | Self::GeneratingCode)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(Self::Init),
            "GENERATING_QR" => Ok(Self::GeneratingQr),
            "GENERATING_CODE" => Ok(Self::GeneratingCode),
            "CONNECTED" => Ok(Self::Connected),
            "DISCONNECTED" => Ok(Self::Disconnected),
            "DELETED" => Ok(Self::Deleted),
            other => Err(format!("unknown session status {other:?}")),
        }
    }
}

/// Tri-state field update: leave the field alone, clear it, or set it.
///
/// Serializes as the value for `Set`, `null` for `Clear`; `Unset` fields are
/// skipped with `skip_serializing_if = "FieldUpdate::is_unset"`. On the way in,
/// a missing field (with `#[serde(default)]`) is `Unset` and an explicit `null`
/// is `Clear`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Unset,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Build from a concrete value: `None` clears, `Some` sets
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Set(v),
            None => Self::Clear,
        }
    }
}

impl<T: Clone> FieldUpdate<T> {
    /// Apply the update to a current value
    pub fn apply(&self, current: &mut Option<T>) {
        match self {
            Self::Unset => {}
            Self::Clear => *current = None,
            Self::Set(v) => *current = Some(v.clone()),
        }
    }
}

impl<T: Serialize> Serialize for FieldUpdate<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Set(v) => serializer.serialize_some(v),
            Self::Unset | Self::Clear => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FieldUpdate<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Self::from_option)
    }
}

/// Session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Caller-assigned session ID
    pub id: String,

    /// Current status
    pub status: SessionStatus,

    /// Free-text diagnostic
    pub detail: Option<String>,

    /// Bearer credential, assigned on first successful pairing
    pub token: Option<String>,

    /// Numeric pairing code (code-mode pairing only)
    pub pairing_code: Option<String>,

    /// QR payload (QR-mode pairing only)
    pub qr: Option<String>,

    /// When session was created
    pub created_at: DateTime<Utc>,

    /// When session was last updated
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session record in `INIT`
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Init,
            detail: None,
            token: None,
            pairing_code: None,
            qr: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// Merge a partial patch the way a real-time consumer does: absent
    /// fields are kept, `null` clears, values overwrite.
    pub fn apply_patch(&mut self, patch: &SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        patch.detail.apply(&mut self.detail);
        patch.qr.apply(&mut self.qr);
        patch.pairing_code.apply(&mut self.pairing_code);
        patch.token.apply(&mut self.token);
    }
}

/// A status transition as written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: SessionStatus,
    pub detail: Option<String>,
    pub pairing_code: FieldUpdate<String>,
    pub qr: FieldUpdate<String>,
    /// `Unset` keeps the token, assigning one on the first `CONNECTED`;
    /// `Clear` revokes it
    pub token: FieldUpdate<String>,
}

impl StatusChange {
    /// Build a change from a status notification `(status, detail, qr_or_code)`.
    ///
    /// The payload lands in `qr` or `pairing_code` depending on the status and
    /// the other pairing field is cleared. Every non-pairing status clears both.
    pub fn new(status: SessionStatus, detail: Option<String>, payload: Option<String>) -> Self {
        let (pairing_code, qr) = match status {
            SessionStatus::GeneratingQr => (
                FieldUpdate::Clear,
                payload.map_or(FieldUpdate::Unset, FieldUpdate::Set),
            ),
            SessionStatus::GeneratingCode => (
                payload.map_or(FieldUpdate::Unset, FieldUpdate::Set),
                FieldUpdate::Clear,
            ),
            _ => (FieldUpdate::Clear, FieldUpdate::Clear),
        };
        Self {
            status,
            detail,
            pairing_code,
            qr,
            token: FieldUpdate::Unset,
        }
    }

    pub fn init() -> Self {
        Self::new(SessionStatus::Init, Some("Initializing...".to_string()), None)
    }

    pub fn qr(data: impl Into<String>) -> Self {
        Self::new(
            SessionStatus::GeneratingQr,
            Some("Scan QR code".to_string()),
            Some(data.into()),
        )
    }

    pub fn pairing_code(code: impl Into<String>) -> Self {
        Self::new(
            SessionStatus::GeneratingCode,
            Some("Pairing code ready".to_string()),
            Some(code.into()),
        )
    }

    pub fn connected(detail: impl Into<String>) -> Self {
        Self::new(SessionStatus::Connected, Some(detail.into()), None)
    }

    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self::new(SessionStatus::Disconnected, Some(detail.into()), None)
    }

    /// Also drop the stored credentials, so the session needs pairing again
    pub fn revoke_credentials(mut self) -> Self {
        self.token = FieldUpdate::Clear;
        self
    }
}

/// Partial session update as broadcast to real-time subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub session_id: String,

    pub is_connected: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,

    #[serde(default, skip_serializing_if = "FieldUpdate::is_unset")]
    pub detail: FieldUpdate<String>,

    #[serde(default, skip_serializing_if = "FieldUpdate::is_unset")]
    pub qr: FieldUpdate<String>,

    #[serde(default, skip_serializing_if = "FieldUpdate::is_unset")]
    pub pairing_code: FieldUpdate<String>,

    #[serde(default, skip_serializing_if = "FieldUpdate::is_unset")]
    pub token: FieldUpdate<String>,
}

impl SessionPatch {
    /// Full view of a session, every field explicit
    pub fn snapshot(session: &Session, is_connected: bool) -> Self {
        Self {
            session_id: session.id.clone(),
            is_connected,
            status: Some(session.status),
            detail: FieldUpdate::from_option(session.detail.clone()),
            qr: FieldUpdate::from_option(session.qr.clone()),
            pairing_code: FieldUpdate::from_option(session.pairing_code.clone()),
            token: FieldUpdate::from_option(session.token.clone()),
        }
    }

    /// Patch carrying only what changed between two versions of a row.
    ///
    /// Returns `None` when nothing changed. A `CONNECTED` row always carries
    /// explicit `qr: null` and `pairingCode: null`.
    pub fn diff(before: Option<&Session>, after: &Session) -> Option<Self> {
        let Some(before) = before else {
            return Some(Self::snapshot(after, after.is_connected()));
        };

        let mut patch = Self {
            session_id: after.id.clone(),
            is_connected: after.is_connected(),
            status: (before.status != after.status).then_some(after.status),
            detail: changed(&before.detail, &after.detail),
            qr: changed(&before.qr, &after.qr),
            pairing_code: changed(&before.pairing_code, &after.pairing_code),
            token: changed(&before.token, &after.token),
        };

        if patch.is_empty() {
            return None;
        }

        if after.is_connected() {
            patch.qr = FieldUpdate::Clear;
            patch.pairing_code = FieldUpdate::Clear;
        }

        Some(patch)
    }

    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.detail.is_unset()
            && self.qr.is_unset()
            && self.pairing_code.is_unset()
            && self.token.is_unset()
    }
}

fn changed(before: &Option<String>, after: &Option<String>) -> FieldUpdate<String> {
    if before == after {
        FieldUpdate::Unset
    } else {
        FieldUpdate::from_option(after.clone())
    }
}

/// Validate a caller-assigned session ID
pub fn validate_session_id(id: &str) -> TetherResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '.' | ':' | ' ' | '-'));

    if valid {
        Ok(())
    } else {
        Err(TetherError::InvalidSessionId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: SessionStatus) -> Session {
        let mut s = Session::new("s1");
        s.status = status;
        s
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            SessionStatus::Init,
            SessionStatus::GeneratingQr,
            SessionStatus::GeneratingCode,
            SessionStatus::Connected,
            SessionStatus::Disconnected,
            SessionStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("CONNECTING".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&SessionStatus::GeneratingQr).unwrap();
        assert_eq!(json, "\"GENERATING_QR\"");
    }

    #[test]
    fn qr_change_clears_pairing_code() {
        let change = StatusChange::qr("data:image/png;base64,AAA");
        assert_eq!(change.qr, FieldUpdate::Set("data:image/png;base64,AAA".into()));
        assert_eq!(change.pairing_code, FieldUpdate::Clear);
    }

    #[test]
    fn code_change_clears_qr() {
        let change = StatusChange::pairing_code("ABCD-1234");
        assert_eq!(change.pairing_code, FieldUpdate::Set("ABCD-1234".into()));
        assert_eq!(change.qr, FieldUpdate::Clear);
    }

    #[test]
    fn connected_change_clears_both() {
        let change = StatusChange::new(SessionStatus::Connected, None, Some("ignored".into()));
        assert_eq!(change.qr, FieldUpdate::Clear);
        assert_eq!(change.pairing_code, FieldUpdate::Clear);
    }

    #[test]
    fn only_explicit_revocation_touches_token() {
        assert!(StatusChange::disconnected("lost").token.is_unset());
        assert!(StatusChange::connected("ok").token.is_unset());
        assert_eq!(
            StatusChange::disconnected("Logged out").revoke_credentials().token,
            FieldUpdate::Clear
        );
        assert!(SessionStatus::GeneratingCode.is_pairing());
        assert!(!SessionStatus::Connected.is_pairing());
    }

    #[test]
    fn patch_serializes_only_present_fields() {
        let mut before = session(SessionStatus::GeneratingQr);
        before.qr = Some("qr".into());
        let mut after = before.clone();
        after.detail = Some("still scanning".into());

        let patch = SessionPatch::diff(Some(&before), &after).unwrap();
        let json = serde_json::to_value(&patch).unwrap();

        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["isConnected"], false);
        assert_eq!(json["detail"], "still scanning");
        assert!(json.get("status").is_none());
        assert!(json.get("qr").is_none());
        assert!(json.get("pairingCode").is_none());
    }

    #[test]
    fn connected_patch_always_nulls_pairing_fields() {
        let before = session(SessionStatus::Disconnected);
        let mut after = session(SessionStatus::Connected);
        after.detail = Some("Connected as Alice".into());

        let patch = SessionPatch::diff(Some(&before), &after).unwrap();
        let json = serde_json::to_value(&patch).unwrap();

        assert_eq!(json["status"], "CONNECTED");
        assert_eq!(json["isConnected"], true);
        assert!(json["qr"].is_null());
        assert!(json.as_object().unwrap().contains_key("qr"));
        assert!(json.as_object().unwrap().contains_key("pairingCode"));
    }

    #[test]
    fn identical_rows_produce_no_patch() {
        let row = session(SessionStatus::Connected);
        assert!(SessionPatch::diff(Some(&row), &row.clone()).is_none());
    }

    #[test]
    fn consumer_merge_distinguishes_null_from_absent() {
        let mut local = session(SessionStatus::GeneratingQr);
        local.qr = Some("old-qr".into());
        local.token = Some("tok".into());

        let patch: SessionPatch = serde_json::from_str(
            r#"{"sessionId":"s1","isConnected":true,"status":"CONNECTED","qr":null}"#,
        )
        .unwrap();
        assert_eq!(patch.qr, FieldUpdate::Clear);
        assert_eq!(patch.token, FieldUpdate::Unset);

        local.apply_patch(&patch);
        assert_eq!(local.status, SessionStatus::Connected);
        assert_eq!(local.qr, None);
        assert_eq!(local.token.as_deref(), Some("tok"));
    }

    #[test]
    fn session_id_validation() {
        assert!(validate_session_id("s1").is_ok());
        assert!(validate_session_id("shop:main@eu-1.prod test").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id(&"x".repeat(129)).is_err());
    }
}
