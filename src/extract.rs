//! # Identifier Extraction
//!
//! Turns the events of a processing window into `(device, secondary identifier)`
//! pairs and per-device sightings. Pure transform: malformed events are
//! skipped and counted, never fatal.

use crate::config::{AD_COOKIE_EXTRACT_DAYS, SESSION_FINGERPRINT_EXTRACT_DAYS};
use crate::model::{non_blank, DeviceId, EventRecord, Identifier, IdentifierKind, MatchSource};
use crate::temporal::{Instant, Interval, Span, SECONDS_PER_DAY};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A secondary identifier observed on a device's event.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierPair {
    pub device_id: DeviceId,
    pub identifier: Identifier,
    pub confidence: f64,
    pub match_source: MatchSource,
    pub event_time: Instant,
}

/// Extraction counters reported in the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub events_scanned: usize,
    pub events_in_window: usize,
    pub events_out_of_window: usize,
    pub malformed_events: usize,
    pub pairs_extracted: usize,
    pub pairs_dropped_stale: usize,
}

/// Everything the rest of the pipeline needs from one window of events.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBatch {
    pub pairs: Vec<IdentifierPair>,
    /// Every admitted device with its sighting span and event count.
    pub devices: BTreeMap<DeviceId, (Span, u64)>,
    pub stats: ExtractionStats,
}

/// Extract identifier pairs from the events that fall inside `window`.
///
/// Processing time is `window.end`; stale ad-cookie and session-fingerprint
/// sightings are dropped relative to it.
pub fn extract_pairs(events: &[EventRecord], window: Interval) -> ExtractedBatch {
    let mut batch = ExtractedBatch::default();
    let processing_time = window.end;

    for event in events {
        batch.stats.events_scanned += 1;
        if !window.contains(event.event_time) {
            batch.stats.events_out_of_window += 1;
            continue;
        }
        batch.stats.events_in_window += 1;

        let Some(device_id) = event.device() else {
            batch.stats.malformed_events += 1;
            continue;
        };

        batch
            .devices
            .entry(device_id.clone())
            .and_modify(|(span, count)| {
                span.observe(event.event_time);
                *count += 1;
            })
            .or_insert((Span::at(event.event_time), 1));

        for identifier in secondary_identifiers(event) {
            if is_stale(identifier.kind, event.event_time, processing_time) {
                batch.stats.pairs_dropped_stale += 1;
                continue;
            }
            batch.pairs.push(IdentifierPair {
                device_id: device_id.clone(),
                confidence: identifier.kind.confidence(),
                match_source: identifier.kind.match_source(),
                identifier,
                event_time: event.event_time,
            });
        }
    }

    batch.stats.pairs_extracted = batch.pairs.len();
    batch
}

/// The non-blank secondary identifiers carried by an event.
pub fn secondary_identifiers(event: &EventRecord) -> Vec<Identifier> {
    let mut identifiers = Vec::with_capacity(5);
    let fields = [
        (event.email_hash.as_deref(), IdentifierKind::EmailHash),
        (event.phone_hash.as_deref(), IdentifierKind::PhoneHash),
        (event.external_id.as_deref(), IdentifierKind::ExternalId),
        (event.ad_click_cookie.as_deref(), IdentifierKind::AdCookie),
    ];
    for (value, kind) in fields {
        if let Some(value) = non_blank(value) {
            identifiers.push(Identifier::new(value, kind));
        }
    }
    if let Some(fingerprint) = session_fingerprint(event) {
        identifiers.push(Identifier::new(fingerprint, IdentifierKind::SessionFingerprint));
    }
    identifiers
}

/// Derive the session fingerprint: hex SHA-256 of `ip_hash|user_agent|timezone`.
///
/// Requires both the client IP hash and the user agent; the timezone may be absent.
pub fn session_fingerprint(event: &EventRecord) -> Option<String> {
    let ip_hash = non_blank(event.client_ip_hash.as_deref())?;
    let user_agent = non_blank(event.user_agent.as_deref())?;
    let timezone = non_blank(event.timezone.as_deref()).unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update(ip_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    hasher.update(b"|");
    hasher.update(timezone.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

fn is_stale(kind: IdentifierKind, event_time: Instant, processing_time: Instant) -> bool {
    let max_age_days = match kind {
        IdentifierKind::AdCookie => AD_COOKIE_EXTRACT_DAYS,
        IdentifierKind::SessionFingerprint => SESSION_FINGERPRINT_EXTRACT_DAYS,
        _ => return false,
    };
    processing_time - event_time > max_age_days * SECONDS_PER_DAY
}
