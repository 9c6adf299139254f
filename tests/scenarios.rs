use anyhow::Result;
use stitchgraph::model::MatchType;
use stitchgraph::temporal::{start_of_day, SECONDS_PER_MINUTE};
use stitchgraph::{
    DeviceId, EventRecord, GraphStore, IdentifierKind, IdentityResolver, MatchSource, MergeReason,
    RunParams,
};
use time::macros::date;
use time::{Date, Duration};

fn day(n: i64) -> Date {
    date!(2024 - 03 - 01) + Duration::days(n - 1)
}

fn at(n: i64, seconds: i64) -> i64 {
    start_of_day(day(n)) + seconds
}

fn run_day(resolver: &mut IdentityResolver, n: i64, mut events: Vec<EventRecord>) -> Result<(stitchgraph::RunSummary, Vec<EventRecord>)> {
    let summary = resolver.run(&mut events, &RunParams::daily(day(n)))?;
    Ok((summary, events))
}

fn canonical(resolver: &IdentityResolver, device: &str) -> Result<Option<String>> {
    Ok(resolver
        .lookup(device, IdentifierKind::DeviceId)?
        .map(|id| id.0))
}

fn scenario_a(resolver: &mut IdentityResolver) -> Result<()> {
    run_day(
        resolver,
        1,
        vec![
            EventRecord::new("a1", "d2", at(1, 3_600)).with_email("E1"),
            EventRecord::new("a2", "d1", at(1, 7_200)).with_email("E1"),
        ],
    )?;
    Ok(())
}

fn scenario_b(resolver: &mut IdentityResolver) -> Result<()> {
    run_day(
        resolver,
        2,
        vec![
            EventRecord::new("b1", "d1", at(2, 600)).with_session("ip-1", "agent", "Europe/Berlin"),
            EventRecord::new("b2", "d3", at(2, 600 + 10 * SECONDS_PER_MINUTE))
                .with_session("ip-1", "agent", "Europe/Berlin"),
        ],
    )?;
    Ok(())
}

#[test]
fn scenario_a_shared_email_joins_devices() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    let (summary, events) = run_day(
        &mut resolver,
        1,
        vec![
            EventRecord::new("a1", "d2", at(1, 3_600)).with_email("E1"),
            EventRecord::new("a2", "d1", at(1, 7_200)).with_email("E1"),
        ],
    )?;

    assert_eq!(canonical(&resolver, "d1")?.as_deref(), Some("d1"));
    assert_eq!(canonical(&resolver, "d2")?.as_deref(), Some("d1"));
    assert!(events.iter().all(|e| e.canonical_id.as_deref() == Some("d1")));
    assert_eq!(summary.edges_created, 1);
    assert_eq!(summary.events_stamped, 2);
    assert_eq!(summary.total_active_identities, 1);

    let cluster = resolver.summary(&DeviceId::from("d1"))?.expect("summary for d1");
    assert_eq!(cluster.cluster_size, 2);
    assert!(cluster.has_email);
    assert!(cluster.deterministic_links >= 1);
    Ok(())
}

#[test]
fn scenario_b_fingerprint_adds_probabilistic_member() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    scenario_a(&mut resolver)?;
    scenario_b(&mut resolver)?;

    assert_eq!(canonical(&resolver, "d3")?.as_deref(), Some("d1"));
    let link = resolver
        .store()
        .get_link(&DeviceId::from("d3").to_identifier())?
        .expect("link for d3");
    assert_eq!(link.match_confidence, 0.6);
    assert_eq!(link.match_type, MatchType::Probabilistic);
    assert_eq!(link.match_source, MatchSource::SessionFingerprintMatch);

    let cluster = resolver.summary(&DeviceId::from("d1"))?.expect("summary for d1");
    assert_eq!(cluster.cluster_size, 3);
    assert_eq!(cluster.min_confidence, 0.6);
    Ok(())
}

#[test]
fn scenario_c_bridge_merges_two_clusters_once() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    scenario_a(&mut resolver)?;
    scenario_b(&mut resolver)?;
    run_day(
        &mut resolver,
        3,
        vec![
            EventRecord::new("c1", "d4", at(3, 100)).with_phone("P1"),
            EventRecord::new("c2", "d5", at(3, 200)).with_phone("P1"),
        ],
    )?;
    assert_eq!(canonical(&resolver, "d5")?.as_deref(), Some("d4"));
    assert!(resolver.store().merge_log()?.is_empty());

    let (summary, _) = run_day(
        &mut resolver,
        4,
        vec![
            EventRecord::new("c3", "d2", at(4, 100)).with_email("E2"),
            EventRecord::new("c4", "d5", at(4, 900)).with_email("E2"),
        ],
    )?;

    for device in ["d1", "d2", "d3", "d4", "d5"] {
        assert_eq!(canonical(&resolver, device)?.as_deref(), Some("d1"), "{device}");
    }
    let log = resolver.store().merge_log()?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].source_canonical_id, DeviceId::from("d4"));
    assert_eq!(log[0].target_canonical_id, DeviceId::from("d1"));
    assert_eq!(log[0].reason, MergeReason::NewEdge);
    assert_eq!(log[0].triggered_by, "daily:2024-03-04");
    assert_eq!(log[0].identifiers_moved, 3);
    assert_eq!(summary.merges_performed, 1);

    assert!(resolver.summary(&DeviceId::from("d4"))?.is_none());
    assert_eq!(resolver.summary(&DeviceId::from("d1"))?.map(|s| s.cluster_size), Some(5));
    let history = resolver.merge_history(&DeviceId::from("d4"))?;
    assert_eq!(history, log);
    Ok(())
}

#[test]
fn scenario_d_fingerprint_45_minutes_apart_does_not_link() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    let (summary, _) = run_day(
        &mut resolver,
        1,
        vec![
            EventRecord::new("d1", "d1", at(1, 0)).with_session("ip", "agent", "UTC"),
            EventRecord::new("d2", "d2", at(1, 45 * SECONDS_PER_MINUTE)).with_session("ip", "agent", "UTC"),
        ],
    )?;
    assert_eq!(summary.edges_created, 0);
    assert_eq!(canonical(&resolver, "d1")?.as_deref(), Some("d1"));
    assert_eq!(canonical(&resolver, "d2")?.as_deref(), Some("d2"));
    assert_eq!(summary.total_active_identities, 2);
    Ok(())
}

#[test]
fn scenario_e_reobservation_accumulates_one_row() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    run_day(&mut resolver, 1, vec![EventRecord::new("e1", "d1", at(1, 500)).with_email("E1")])?;
    run_day(&mut resolver, 2, vec![EventRecord::new("e2", "d1", at(2, 900)).with_email("E1")])?;

    let email = stitchgraph::Identifier::new("E1", IdentifierKind::EmailHash);
    let link = resolver.store().get_link(&email)?.expect("email link");
    assert_eq!(link.link_count, 2);
    assert_eq!(link.first_seen, at(1, 500));
    assert_eq!(link.last_seen, at(2, 900));
    assert!(resolver.store().link_history(&email)?.is_empty());
    let view = resolver.cluster(&DeviceId::from("d1"))?.expect("cluster d1");
    assert_eq!(view.members[&IdentifierKind::EmailHash].len(), 1);
    Ok(())
}

#[test]
fn rerunning_a_window_changes_nothing() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    scenario_a(&mut resolver)?;
    scenario_b(&mut resolver)?;
    let before_links = resolver.store().links_for_canonical(&DeviceId::from("d1"))?;
    let before_summary = resolver.summary(&DeviceId::from("d1"))?;
    let before_stats = resolver.stats()?;

    scenario_b(&mut resolver)?;

    assert_eq!(resolver.store().links_for_canonical(&DeviceId::from("d1"))?, before_links);
    assert_eq!(resolver.summary(&DeviceId::from("d1"))?, before_summary);
    assert_eq!(resolver.stats()?, before_stats);
    assert!(resolver.store().merge_log()?.is_empty());
    Ok(())
}

#[test]
fn edges_from_different_runs_are_transitive() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    run_day(
        &mut resolver,
        1,
        vec![
            EventRecord::new("t1", "dev-a", at(1, 10)).with_email("E1"),
            EventRecord::new("t2", "dev-b", at(1, 20)).with_email("E1"),
        ],
    )?;
    run_day(
        &mut resolver,
        2,
        vec![
            EventRecord::new("t3", "dev-b", at(2, 10)).with_external_id("crm-7"),
            EventRecord::new("t4", "dev-c", at(2, 20)).with_external_id("crm-7"),
        ],
    )?;
    for device in ["dev-a", "dev-b", "dev-c"] {
        assert_eq!(canonical(&resolver, device)?.as_deref(), Some("dev-a"));
    }
    Ok(())
}

#[test]
fn smaller_newcomer_takes_over_canonical_with_log_entry() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    scenario_a(&mut resolver)?;

    // A larger newcomer leaves the canonical id alone.
    run_day(&mut resolver, 2, vec![EventRecord::new("g1", "d9", at(2, 10)).with_email("E1")])?;
    assert_eq!(canonical(&resolver, "d9")?.as_deref(), Some("d1"));
    assert!(resolver.store().merge_log()?.is_empty());

    // A smaller one becomes canonical and the old id is logged as merged.
    run_day(&mut resolver, 3, vec![EventRecord::new("g2", "d0", at(3, 10)).with_email("E1")])?;
    for device in ["d0", "d1", "d2", "d9"] {
        assert_eq!(canonical(&resolver, device)?.as_deref(), Some("d0"));
    }
    let log = resolver.store().merge_log()?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].source_canonical_id, DeviceId::from("d1"));
    assert_eq!(log[0].target_canonical_id, DeviceId::from("d0"));
    Ok(())
}

#[test]
fn confidence_never_drops_across_runs() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    scenario_a(&mut resolver)?;
    let d2 = DeviceId::from("d2").to_identifier();
    assert_eq!(resolver.store().get_link(&d2)?.map(|l| l.match_confidence), Some(1.0));

    // d2 later only shares a fingerprint with d1.
    run_day(
        &mut resolver,
        2,
        vec![
            EventRecord::new("m1", "d1", at(2, 0)).with_session("ip", "agent", "UTC"),
            EventRecord::new("m2", "d2", at(2, 60)).with_session("ip", "agent", "UTC"),
        ],
    )?;
    let link = resolver.store().get_link(&d2)?.expect("link for d2");
    assert_eq!(link.match_confidence, 1.0);
    assert_eq!(link.match_source, MatchSource::EmailMatch);
    Ok(())
}

#[test]
fn no_canonical_is_left_under_another_canonical() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    scenario_a(&mut resolver)?;
    scenario_b(&mut resolver)?;
    run_day(
        &mut resolver,
        3,
        vec![
            EventRecord::new("o1", "d4", at(3, 100)).with_phone("P1"),
            EventRecord::new("o2", "d5", at(3, 200)).with_phone("P1"),
            EventRecord::new("o3", "d3", at(3, 300)).with_phone("P1"),
        ],
    )?;

    let store = resolver.store();
    let memberships = store.device_memberships()?;
    for canonical in store.canonical_ids()? {
        for (device, holder) in &memberships {
            if device == &canonical {
                assert_eq!(holder, &canonical);
            }
        }
    }
    assert_eq!(store.canonical_ids()?, vec![DeviceId::from("d1")]);
    Ok(())
}

#[test]
fn malformed_and_out_of_window_events_are_counted() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    let mut blank = EventRecord::new("x1", " ", at(1, 10)).with_email("E1");
    blank.device_id = Some(String::new());
    let (summary, events) = run_day(
        &mut resolver,
        1,
        vec![
            blank,
            EventRecord::new("x2", "d1", at(2, 10)).with_email("E1"),
            EventRecord::new("x3", "d1", at(1, 10)),
        ],
    )?;
    assert_eq!(summary.extraction.malformed_events, 1);
    assert_eq!(summary.extraction.events_out_of_window, 1);
    assert_eq!(summary.devices_observed, 1);
    assert_eq!(summary.events_stamped, 1);
    assert_eq!(events[1].canonical_id, None);
    assert!(summary.convergence.converged);
    Ok(())
}

#[test]
fn device_joining_through_yesterdays_fingerprint_is_probabilistic() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    run_day(
        &mut resolver,
        1,
        vec![EventRecord::new("f1", "d1", at(1, 86_400 - 10 * SECONDS_PER_MINUTE))
            .with_session("ip-1", "agent", "UTC")],
    )?;
    let before = resolver.summary(&DeviceId::from("d1"))?.expect("summary for d1");

    run_day(
        &mut resolver,
        2,
        vec![EventRecord::new("f2", "d3", at(2, 5 * SECONDS_PER_MINUTE))
            .with_session("ip-1", "agent", "UTC")],
    )?;

    assert_eq!(canonical(&resolver, "d3")?.as_deref(), Some("d1"));
    let link = resolver
        .store()
        .get_link(&DeviceId::from("d3").to_identifier())?
        .expect("link for d3");
    assert_eq!(link.match_confidence, 0.6);
    assert_eq!(link.match_type, MatchType::Probabilistic);
    assert_eq!(link.match_source, MatchSource::SessionFingerprintMatch);

    let after = resolver.summary(&DeviceId::from("d1"))?.expect("summary for d1");
    assert_eq!(after.cluster_size, 2);
    assert_eq!(after.deterministic_links, before.deterministic_links);
    assert_eq!(after.probabilistic_links, before.probabilistic_links + 1);
    Ok(())
}

#[test]
fn device_joining_through_stored_email_records_email_match() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    run_day(&mut resolver, 1, vec![EventRecord::new("s1", "d1", at(1, 100)).with_email("E1")])?;
    run_day(&mut resolver, 2, vec![EventRecord::new("s2", "d2", at(2, 100)).with_email("E1")])?;

    let store = resolver.store();
    let member = store
        .get_link(&DeviceId::from("d2").to_identifier())?
        .expect("link for d2");
    assert_eq!(member.canonical_id, DeviceId::from("d1"));
    assert_eq!(member.match_confidence, 1.0);
    assert_eq!(member.match_source, MatchSource::EmailMatch);
    let own = store
        .get_link(&DeviceId::from("d1").to_identifier())?
        .expect("link for d1");
    assert_eq!(own.match_source, MatchSource::CanonicalSelf);
    Ok(())
}

#[test]
fn smaller_newcomer_on_a_later_day_demotes_the_old_canonical() -> Result<()> {
    let mut resolver = IdentityResolver::new();
    run_day(&mut resolver, 1, vec![EventRecord::new("n1", "d5", at(1, 100)).with_phone("P1")])?;
    run_day(&mut resolver, 2, vec![EventRecord::new("n2", "d2", at(2, 100)).with_phone("P1")])?;

    assert_eq!(canonical(&resolver, "d5")?.as_deref(), Some("d2"));
    let store = resolver.store();
    let demoted = store
        .get_link(&DeviceId::from("d5").to_identifier())?
        .expect("link for d5");
    assert_eq!(demoted.canonical_id, DeviceId::from("d2"));
    assert_eq!(demoted.match_confidence, 1.0);
    assert_eq!(demoted.match_source, MatchSource::PhoneMatch);
    let own = store
        .get_link(&DeviceId::from("d2").to_identifier())?
        .expect("link for d2");
    assert_eq!(own.match_source, MatchSource::CanonicalSelf);

    let log = store.merge_log()?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].source_canonical_id, DeviceId::from("d5"));
    assert_eq!(log[0].target_canonical_id, DeviceId::from("d2"));
    assert_eq!(log[0].confidence, 1.0);
    assert_eq!(resolver.summary(&DeviceId::from("d2"))?.map(|s| s.cluster_size), Some(2));
    Ok(())
}
