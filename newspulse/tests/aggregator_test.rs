mod support;

use newspulse::aggregator::{fetch_fresh, SourceOutcome};
use newspulse::history::HistoryStore;
use support::{link, StubFeeds};
use tempfile::tempdir;

fn sources(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_batch_fills_from_first_source_and_skips_the_rest() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new()
        .with_feed("A", &["x", "y"])
        .with_failing("B")
        .with_feed("C", &["w"]);

    let report = fetch_fresh(&sources(&["A", "B", "C"]), &feeds, &mut history, 2).await;

    let links: Vec<&str> = report.batch.links().collect();
    assert_eq!(links, vec!["x", "y"]);
    // B would fail if it were contacted; a full batch never reaches it.
    assert_eq!(feeds.calls(), vec!["A".to_string()]);
    assert_eq!(feeds.calls_to("B"), 0);
    assert_eq!(report.failed_sources(), 0);
    assert!(history.contains("x") && history.contains("y"));
    assert!(!history.contains("w"));
    assert_eq!(
        report.outcomes,
        vec![
            SourceOutcome::Fetched { source: "A".into(), items: 2, fresh: 2 },
            SourceOutcome::NotVisited { source: "B".into() },
            SourceOutcome::NotVisited { source: "C".into() },
        ]
    );
}

#[tokio::test]
async fn test_stops_mid_source_at_limit() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new().with_feed("A", &["1", "2", "3", "4", "5"]);

    let report = fetch_fresh(&sources(&["A"]), &feeds, &mut history, 3).await;

    assert_eq!(report.batch.len(), 3);
    assert_eq!(history.len(), 3);
    assert!(!history.contains("4"));
}

#[tokio::test]
async fn test_known_links_are_skipped_and_next_source_is_used() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    history.add("x");
    history.add("y");
    let feeds = StubFeeds::new()
        .with_feed("A", &["x", "y"])
        .with_feed("B", &["z"]);

    let report = fetch_fresh(&sources(&["A", "B"]), &feeds, &mut history, 7).await;

    let links: Vec<&str> = report.batch.links().collect();
    assert_eq!(links, vec!["z"]);
    assert_eq!(feeds.calls_to("B"), 1);
}

#[tokio::test]
async fn test_failed_source_is_recorded_and_skipped() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new()
        .with_failing("A")
        .with_feed("B", &["b1", "b2"])
        .with_failing("C");

    let report = fetch_fresh(&sources(&["A", "B", "C"]), &feeds, &mut history, 7).await;

    assert_eq!(report.batch.len(), 2);
    assert_eq!(report.failed_sources(), 2);
    assert_eq!(report.visited_sources(), 3);
    match &report.outcomes[0] {
        SourceOutcome::Failed { source, error } => {
            assert_eq!(source, "A");
            assert!(error.contains("connection refused"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_all_sources_failing_yields_empty_batch() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new().with_failing("A").with_failing("B");

    let report = fetch_fresh(&sources(&["A", "B"]), &feeds, &mut history, 7).await;

    assert!(report.batch.is_empty());
    assert!(history.is_empty());
    assert_eq!(report.failed_sources(), 2);
}

#[tokio::test]
async fn test_duplicate_link_across_sources_is_selected_once() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new()
        .with_feed("A", &["shared", "a-only"])
        .with_feed("B", &["shared", "b-only"]);

    let report = fetch_fresh(&sources(&["A", "B"]), &feeds, &mut history, 7).await;

    let links: Vec<&str> = report.batch.links().collect();
    assert_eq!(links, vec!["shared", "a-only", "b-only"]);
}

#[tokio::test]
async fn test_consecutive_passes_are_disjoint() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let all: Vec<String> = (1..=10).map(link).collect();
    let all_refs: Vec<&str> = all.iter().map(String::as_str).collect();
    let feeds = StubFeeds::new().with_feed("A", &all_refs);
    let srcs = sources(&["A"]);

    let first = fetch_fresh(&srcs, &feeds, &mut history, 4).await;
    let second = fetch_fresh(&srcs, &feeds, &mut history, 4).await;

    let first_links: Vec<&str> = first.batch.links().collect();
    let second_links: Vec<&str> = second.batch.links().collect();
    assert_eq!(first_links.len(), 4);
    assert_eq!(second_links.len(), 4);
    assert!(first_links.iter().all(|l| !second_links.contains(l)));
    assert_eq!(second_links[0], link(5));
}

#[tokio::test]
async fn test_never_exceeds_limit_and_never_returns_known_links() {
    let dir = tempdir().unwrap();
    let all: Vec<String> = (1..=30).map(link).collect();
    let refs: Vec<&str> = all.iter().map(String::as_str).collect();
    let feeds = StubFeeds::new()
        .with_feed("A", &refs[..12])
        .with_feed("B", &refs[8..20])
        .with_feed("C", &refs[15..]);
    let srcs = sources(&["A", "B", "C"]);

    for limit in [1, 3, 7, 25, 100] {
        let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
        for l in &all[..5] {
            history.add(l.clone());
        }

        let report = fetch_fresh(&srcs, &feeds, &mut history, limit).await;

        assert!(report.batch.len() <= limit);
        for l in report.batch.links() {
            assert!(!all[..5].iter().any(|known| known == l));
        }
        // 25 unknown links in total across the three sources.
        assert_eq!(report.batch.len(), limit.min(25));
    }
}

#[tokio::test]
async fn test_zero_limit_fetches_nothing() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new().with_feed("A", &["x"]);

    let report = fetch_fresh(&sources(&["A"]), &feeds, &mut history, 0).await;

    assert!(report.batch.is_empty());
    assert!(feeds.calls().is_empty());
    assert_eq!(report.outcomes, vec![SourceOutcome::NotVisited { source: "A".into() }]);
}

#[tokio::test]
async fn test_no_sources_yields_empty_report() {
    let dir = tempdir().unwrap();
    let mut history = HistoryStore::new(dir.path().join("h.json"), 500);
    let feeds = StubFeeds::new();

    let report = fetch_fresh(&[], &feeds, &mut history, 7).await;

    assert!(report.batch.is_empty());
    assert!(report.outcomes.is_empty());
}
