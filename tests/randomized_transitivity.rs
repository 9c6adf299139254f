use anyhow::Result;
use std::collections::BTreeMap;
use stitchgraph::test_support::{generate_events, GeneratorConfig};
use stitchgraph::{
    DeviceId, EventRecord, GraphStore, IdentifierKind, IdentityResolver, Interval, RunParams,
};
use time::macros::date;
use time::{Date, Duration};

fn day(n: i64) -> Date {
    date!(2024 - 05 - 01) + Duration::days(n - 1)
}

/// Union-find over device ids, keyed by string so roots can be compared.
#[derive(Default)]
struct Reference {
    parent: BTreeMap<String, String>,
}

impl Reference {
    fn find(&mut self, device: &str) -> String {
        let parent = self
            .parent
            .entry(device.to_string())
            .or_insert_with(|| device.to_string())
            .clone();
        if parent == device {
            return parent;
        }
        let root = self.find(&parent);
        self.parent.insert(device.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Keep the smaller id as root so the root is the expected canonical.
            let (winner, loser) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(loser, winner);
        }
    }

    fn add_events(&mut self, events: &[EventRecord]) {
        let mut holders: BTreeMap<(&'static str, String), String> = BTreeMap::new();
        for event in events {
            let Some(device) = event.device_id.clone() else {
                continue;
            };
            self.find(&device);
            let keys = [
                ("email", event.email_hash.clone()),
                ("phone", event.phone_hash.clone()),
                ("external", event.external_id.clone()),
            ];
            for (kind, value) in keys {
                let Some(value) = value else { continue };
                match holders.get(&(kind, value.clone())) {
                    Some(first) => {
                        let first = first.clone();
                        self.union(&first, &device);
                    }
                    None => {
                        holders.insert((kind, value), device.clone());
                    }
                }
            }
        }
    }
}

fn config() -> GeneratorConfig {
    GeneratorConfig {
        people: 60,
        collision_probability: 0.05,
        ..GeneratorConfig::default()
    }
}

fn assert_matches_reference(
    resolver: &IdentityResolver,
    reference: &mut Reference,
) -> Result<()> {
    let devices: Vec<String> = reference.parent.keys().cloned().collect();
    for device in devices {
        let expected = reference.find(&device);
        let actual = resolver.lookup(&device, IdentifierKind::DeviceId)?;
        assert_eq!(actual, Some(DeviceId::new(expected)), "device {device}");
    }
    Ok(())
}

#[test]
fn daily_runs_agree_with_union_find() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    let mut reference = Reference::default();
    let mut all_events = Vec::new();

    for n in 1..=4 {
        let dataset = generate_events(Interval::for_day(day(n)), &config(), 1_000 + n as u64);
        let mut events = dataset.events;
        // Identifiers are shared across days, so accumulate the whole history.
        all_events.extend(events.iter().cloned());
        reference.add_events(&all_events);

        let summary = resolver.run(&mut events, &RunParams::daily(day(n)))?;
        assert!(summary.convergence.converged);
        assert_eq!(summary.upsert_errors, 0);
        assert!(events.iter().all(|e| e.canonical_id.is_some()));
    }

    assert_matches_reference(&resolver, &mut reference)?;

    let store = resolver.store();
    let memberships: BTreeMap<DeviceId, DeviceId> = store.device_memberships()?.into_iter().collect();
    for canonical in store.canonical_ids()? {
        // Every canonical is its own member, never filed under another canonical.
        assert_eq!(memberships.get(&canonical), Some(&canonical));
    }
    Ok(())
}

#[test]
fn full_rebuild_matches_incremental_runs() -> Result<()> {
    let mut incremental = IdentityResolver::new();
    let mut history = Vec::new();
    for n in 1..=3 {
        let mut events = generate_events(Interval::for_day(day(n)), &config(), 77 + n as u64).events;
        incremental.run(&mut events, &RunParams::daily(day(n)))?;
        history.extend(events.into_iter().map(|mut e| {
            e.canonical_id = None;
            e
        }));
    }

    let mut rebuilt = IdentityResolver::new();
    let summary = rebuilt.run(&mut history, &RunParams::rebuild(day(3), 3))?;
    assert!(summary.full_rebuild);
    assert_eq!(summary.extraction.events_out_of_window, 0);

    let expected = incremental.store().device_memberships()?;
    assert_eq!(rebuilt.store().device_memberships()?, expected);
    for event in &history {
        let device = event.device_id.as_deref().unwrap_or_default();
        let canonical = incremental.lookup(device, IdentifierKind::DeviceId)?;
        assert_eq!(event.canonical_id.as_deref(), canonical.as_ref().map(|c| c.as_str()));
    }
    Ok(())
}
