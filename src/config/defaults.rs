//! Default constants for stitchgraph configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Confidence Tiers
// =============================================================================

/// Confidence of links backed by a deterministic identifier
/// (email hash, phone hash, external id).
pub const CONFIDENCE_DETERMINISTIC: f64 = 1.0;

/// Confidence of links backed by a shared ad-click cookie.
pub const CONFIDENCE_AD_COOKIE: f64 = 0.85;

/// Confidence of links backed by a shared session fingerprint.
pub const CONFIDENCE_SESSION_FINGERPRINT: f64 = 0.6;

/// Confidence recorded for a device re-observed without new edge evidence.
/// Zero so that the max rule never moves a stored confidence through it.
pub const CONFIDENCE_OBSERVATION_ONLY: f64 = 0.0;

// =============================================================================
// Time Windows
// =============================================================================

/// Ad-cookie sightings older than this (relative to processing time) are dropped.
pub const AD_COOKIE_EXTRACT_DAYS: i64 = 90;

/// Two devices sharing an ad cookie form an edge only if their sightings
/// are at most this many days apart.
pub const AD_COOKIE_EDGE_WINDOW_DAYS: i64 = 90;

/// Session-fingerprint sightings older than this (relative to processing time)
/// are dropped.
pub const SESSION_FINGERPRINT_EXTRACT_DAYS: i64 = 7;

/// Two devices sharing a session fingerprint form an edge only if their
/// sightings are at most this many minutes apart.
pub const SESSION_FINGERPRINT_EDGE_GAP_MINUTES: i64 = 30;

/// Lookback used when a run is asked to rebuild from history.
pub const DEFAULT_REBUILD_LOOKBACK_DAYS: u32 = 365;

// =============================================================================
// Convergence
// =============================================================================

/// Hard cap on label-propagation sweeps and merge-closure passes.
/// Reaching it is reported as a warning; the next run continues from the
/// persisted state.
pub const MAX_CONVERGENCE_ITERATIONS: usize = 20;

/// Attempts per store operation before a record is counted as failed.
pub const MAX_STORE_ATTEMPTS: usize = 3;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Number of identity links kept in the persistent store's read cache.
pub const DEFAULT_LINK_CACHE_CAPACITY: usize = 100_000;
