//! # Event Backfiller
//!
//! Stamps resolved canonical ids onto the window's events.

use crate::model::{DeviceId, EventRecord};
use crate::store::{with_retries, GraphStore};
use crate::temporal::Interval;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillStats {
    pub events_stamped: usize,
    /// Window events whose device has no active link.
    pub events_unresolved: usize,
    pub lookup_errors: usize,
}

/// Set `canonical_id` on window events that lack one. Events outside the
/// window, already stamped, or without a device id are left untouched.
pub fn backfill_events(
    store: &dyn GraphStore,
    events: &mut [EventRecord],
    window: Interval,
) -> Result<BackfillStats> {
    let mut stats = BackfillStats::default();
    let mut resolved: BTreeMap<DeviceId, Option<DeviceId>> = BTreeMap::new();

    for event in events.iter_mut() {
        if event.canonical_id.is_some() || !window.contains(event.event_time) {
            continue;
        }
        let Some(device) = event.device() else {
            continue;
        };

        let canonical = match resolved.get(&device).cloned() {
            Some(canonical) => canonical,
            None => {
                let identifier = device.to_identifier();
                match with_retries("link read", || store.get_link(&identifier)) {
                    Ok(link) => {
                        let canonical = link.map(|link| link.canonical_id);
                        resolved.insert(device, canonical.clone());
                        canonical
                    }
                    Err(err) => {
                        warn!(event_id = %event.event_id, error = %err, "canonical lookup failed");
                        stats.lookup_errors += 1;
                        continue;
                    }
                }
            }
        };

        match canonical {
            Some(canonical) => {
                event.canonical_id = Some(canonical.0);
                stats.events_stamped += 1;
            }
            None => stats.events_unresolved += 1,
        }
    }

    debug!(
        stamped = stats.events_stamped,
        unresolved = stats.events_unresolved,
        "events backfilled"
    );
    Ok(stats)
}
