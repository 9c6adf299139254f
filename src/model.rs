//! # Data Model
//!
//! Identifier kinds, the event records the engine consumes, run edges, and the
//! persisted identity-graph rows (links and merge-log entries).

use crate::config::{
    AD_COOKIE_EDGE_WINDOW_DAYS, CONFIDENCE_AD_COOKIE, CONFIDENCE_DETERMINISTIC,
    CONFIDENCE_SESSION_FINGERPRINT, SESSION_FINGERPRINT_EDGE_GAP_MINUTES,
};
use crate::ordering::canonical_cmp;
use crate::temporal::{Instant, Span, SECONDS_PER_DAY, SECONDS_PER_MINUTE};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The closed set of identifier kinds the graph understands.
///
/// Declaration order doubles as the tie-break when two parallel edges carry
/// the same confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    DeviceId,
    EmailHash,
    PhoneHash,
    ExternalId,
    AdCookie,
    SessionFingerprint,
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 6] = [
        IdentifierKind::DeviceId,
        IdentifierKind::EmailHash,
        IdentifierKind::PhoneHash,
        IdentifierKind::ExternalId,
        IdentifierKind::AdCookie,
        IdentifierKind::SessionFingerprint,
    ];

    pub const SECONDARY: [IdentifierKind; 5] = [
        IdentifierKind::EmailHash,
        IdentifierKind::PhoneHash,
        IdentifierKind::ExternalId,
        IdentifierKind::AdCookie,
        IdentifierKind::SessionFingerprint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierKind::DeviceId => "device_id",
            IdentifierKind::EmailHash => "email_hash",
            IdentifierKind::PhoneHash => "phone_hash",
            IdentifierKind::ExternalId => "external_id",
            IdentifierKind::AdCookie => "ad_cookie",
            IdentifierKind::SessionFingerprint => "session_fingerprint",
        }
    }

    /// Stable one-byte tag used in storage keys.
    pub fn tag(self) -> u8 {
        match self {
            IdentifierKind::DeviceId => 0,
            IdentifierKind::EmailHash => 1,
            IdentifierKind::PhoneHash => 2,
            IdentifierKind::ExternalId => 3,
            IdentifierKind::AdCookie => 4,
            IdentifierKind::SessionFingerprint => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn is_secondary(self) -> bool {
        self != IdentifierKind::DeviceId
    }

    /// Fixed edge confidence for devices sharing an identifier of this kind.
    pub fn confidence(self) -> f64 {
        match self {
            IdentifierKind::DeviceId
            | IdentifierKind::EmailHash
            | IdentifierKind::PhoneHash
            | IdentifierKind::ExternalId => CONFIDENCE_DETERMINISTIC,
            IdentifierKind::AdCookie => CONFIDENCE_AD_COOKIE,
            IdentifierKind::SessionFingerprint => CONFIDENCE_SESSION_FINGERPRINT,
        }
    }

    /// Deterministic kinds link devices regardless of when they were seen.
    pub fn is_deterministic(self) -> bool {
        self.edge_window().is_none()
    }

    /// Maximum seconds between two sightings for them to form an edge.
    pub fn edge_window(self) -> Option<i64> {
        match self {
            IdentifierKind::AdCookie => Some(AD_COOKIE_EDGE_WINDOW_DAYS * SECONDS_PER_DAY),
            IdentifierKind::SessionFingerprint => {
                Some(SESSION_FINGERPRINT_EDGE_GAP_MINUTES * SECONDS_PER_MINUTE)
            }
            _ => None,
        }
    }

    /// Provenance label recorded on links created from this kind.
    pub fn match_source(self) -> MatchSource {
        match self {
            IdentifierKind::DeviceId => MatchSource::DeviceObserved,
            IdentifierKind::EmailHash => MatchSource::EmailMatch,
            IdentifierKind::PhoneHash => MatchSource::PhoneMatch,
            IdentifierKind::ExternalId => MatchSource::ExternalIdMatch,
            IdentifierKind::AdCookie => MatchSource::AdCookieMatch,
            IdentifierKind::SessionFingerprint => MatchSource::SessionFingerprintMatch,
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| anyhow::anyhow!("unknown identifier kind: {raw}"))
    }
}

/// Whether a link rests on a deterministic identifier or a heuristic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Deterministic,
    Probabilistic,
}

impl MatchType {
    pub fn for_confidence(confidence: f64) -> Self {
        if confidence >= CONFIDENCE_DETERMINISTIC {
            MatchType::Deterministic
        } else {
            MatchType::Probabilistic
        }
    }
}

/// Provenance of a link's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    EmailMatch,
    PhoneMatch,
    ExternalIdMatch,
    AdCookieMatch,
    SessionFingerprintMatch,
    /// The canonical device's link to itself.
    CanonicalSelf,
    /// A member device seen again without new edge evidence.
    DeviceObserved,
}

impl MatchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchSource::EmailMatch => "email_match",
            MatchSource::PhoneMatch => "phone_match",
            MatchSource::ExternalIdMatch => "external_id_match",
            MatchSource::AdCookieMatch => "ad_cookie_match",
            MatchSource::SessionFingerprintMatch => "session_fingerprint_match",
            MatchSource::CanonicalSelf => "canonical_self",
            MatchSource::DeviceObserved => "device_observed",
        }
    }
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device identifier: the graph's primary node and the only value that can
/// serve as a canonical id. Ordered by [`canonical_cmp`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The device viewed as a typed identifier.
    pub fn to_identifier(&self) -> Identifier {
        Identifier::new(self.0.clone(), IdentifierKind::DeviceId)
    }
}

impl Ord for DeviceId {
    fn cmp(&self, other: &Self) -> Ordering {
        canonical_cmp(&self.0, &other.0)
    }
}

impl PartialOrd for DeviceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A typed identifier value. Ordered by kind, then by [`canonical_cmp`] on the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub value: String,
    pub kind: IdentifierKind,
}

impl Identifier {
    pub fn new(value: impl Into<String>, kind: IdentifierKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| canonical_cmp(&self.value, &other.value))
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// A tracking event as delivered by the ingestion gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventRecord {
    pub event_id: String,
    pub device_id: Option<String>,
    pub email_hash: Option<String>,
    pub phone_hash: Option<String>,
    pub external_id: Option<String>,
    pub ad_click_cookie: Option<String>,
    pub client_ip_hash: Option<String>,
    pub user_agent: Option<String>,
    pub timezone: Option<String>,
    /// Event time in UTC epoch seconds.
    pub event_time: Instant,
    /// Resolved identity, stamped by the backfiller.
    pub canonical_id: Option<String>,
}

impl EventRecord {
    pub fn new(event_id: impl Into<String>, device_id: impl Into<String>, event_time: Instant) -> Self {
        Self {
            event_id: event_id.into(),
            device_id: Some(device_id.into()),
            event_time,
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email_hash: impl Into<String>) -> Self {
        self.email_hash = Some(email_hash.into());
        self
    }

    pub fn with_phone(mut self, phone_hash: impl Into<String>) -> Self {
        self.phone_hash = Some(phone_hash.into());
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_ad_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.ad_click_cookie = Some(cookie.into());
        self
    }

    pub fn with_session(
        mut self,
        client_ip_hash: impl Into<String>,
        user_agent: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        self.client_ip_hash = Some(client_ip_hash.into());
        self.user_agent = Some(user_agent.into());
        self.timezone = Some(timezone.into());
        self
    }

    /// The device id when present and non-blank.
    pub fn device(&self) -> Option<DeviceId> {
        non_blank(self.device_id.as_deref()).map(DeviceId::new)
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// An undirected device-to-device edge, stored with `device_a < device_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub device_a: DeviceId,
    pub device_b: DeviceId,
    pub shared_kind: IdentifierKind,
    pub confidence: f64,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl Edge {
    pub fn span(&self) -> Span {
        Span {
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// A persisted identity-graph row linking an identifier to its canonical identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub canonical_id: DeviceId,
    pub linked_id: String,
    pub linked_kind: IdentifierKind,
    pub match_confidence: f64,
    pub match_type: MatchType,
    pub match_source: MatchSource,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub link_count: u64,
    pub is_active: bool,
    pub created_at: Instant,
    pub updated_at: Instant,
    /// Start of the processing window that last counted into `link_count`.
    pub last_window: Instant,
}

impl IdentityLink {
    pub fn identifier(&self) -> Identifier {
        Identifier::new(self.linked_id.clone(), self.linked_kind)
    }

    pub fn span(&self) -> Span {
        Span {
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.match_type == MatchType::Deterministic
    }
}

/// Why two canonical identities were merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    /// The run observed evidence joining the two identities directly.
    NewEdge,
    /// The identities were joined through a chain of other merges.
    TransitiveClosure,
}

impl MergeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeReason::NewEdge => "new_edge",
            MergeReason::TransitiveClosure => "transitive_closure",
        }
    }
}

impl fmt::Display for MergeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record of one canonical identity absorbed into another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub merge_id: u64,
    pub source_canonical_id: DeviceId,
    pub target_canonical_id: DeviceId,
    pub reason: MergeReason,
    pub confidence: f64,
    pub identifiers_moved: u64,
    pub triggered_by: String,
    pub merge_time: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in IdentifierKind::ALL {
            assert_eq!(kind.as_str().parse::<IdentifierKind>().unwrap(), kind);
            assert_eq!(IdentifierKind::from_tag(kind.tag()), Some(kind));
        }
        assert!("cookie".parse::<IdentifierKind>().is_err());
        assert_eq!(IdentifierKind::from_tag(42), None);
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&IdentifierKind::SessionFingerprint).unwrap();
        assert_eq!(json, "\"session_fingerprint\"");
        let kind: IdentifierKind = serde_json::from_str("\"email_hash\"").unwrap();
        assert_eq!(kind, IdentifierKind::EmailHash);
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(IdentifierKind::EmailHash.confidence(), 1.0);
        assert_eq!(IdentifierKind::PhoneHash.confidence(), 1.0);
        assert_eq!(IdentifierKind::ExternalId.confidence(), 1.0);
        assert_eq!(IdentifierKind::AdCookie.confidence(), 0.85);
        assert_eq!(IdentifierKind::SessionFingerprint.confidence(), 0.6);
        assert!(IdentifierKind::EmailHash.is_deterministic());
        assert!(!IdentifierKind::AdCookie.is_deterministic());
        assert_eq!(
            IdentifierKind::SessionFingerprint.edge_window(),
            Some(30 * 60)
        );
        assert_eq!(IdentifierKind::AdCookie.edge_window(), Some(90 * 86_400));
    }

    #[test]
    fn test_match_type_from_confidence() {
        assert_eq!(MatchType::for_confidence(1.0), MatchType::Deterministic);
        assert_eq!(MatchType::for_confidence(0.85), MatchType::Probabilistic);
        assert_eq!(MatchType::for_confidence(0.0), MatchType::Probabilistic);
    }

    #[test]
    fn test_device_and_identifier_order() {
        let mut devices = vec![DeviceId::from("d3"), DeviceId::from("d10"), DeviceId::from("d1")];
        devices.sort();
        assert_eq!(devices, vec!["d1".into(), "d10".into(), "d3".into()]);

        let device = Identifier::new("zzz", IdentifierKind::DeviceId);
        let email = Identifier::new("aaa", IdentifierKind::EmailHash);
        assert!(device < email);
        assert!(Identifier::new("a", IdentifierKind::EmailHash) < email);
    }

    #[test]
    fn test_event_device_requires_non_blank() {
        let event = EventRecord::new("e1", "  ", 0);
        assert_eq!(event.device(), None);
        let event = EventRecord::new("e1", " d1 ", 0);
        assert_eq!(event.device(), Some(DeviceId::from("d1")));
    }

    #[test]
    fn test_event_deserializes_with_missing_fields() {
        let event: EventRecord =
            serde_json::from_str(r#"{"event_id":"e1","device_id":"d1","event_time":42}"#).unwrap();
        assert_eq!(event.device_id.as_deref(), Some("d1"));
        assert_eq!(event.email_hash, None);
        assert_eq!(event.event_time, 42);
    }
}
