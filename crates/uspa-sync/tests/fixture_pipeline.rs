use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::tempdir;
use uspa_adapters::FixtureSourceFactory;
use uspa_core::{CompletedRecord, Lift};
use uspa_storage::{read_dataset, AccumulatorPaths};
use uspa_sync::{canonical_cmp, ScopeConfig, ScrapePipeline, SyncConfig};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn scope() -> ScopeConfig {
    ScopeConfig::from_yaml_str(
        "locations: [ohio, texas]\nstatuses: [drug-tested, non-tested]\nevents: [raw-bench-only, raw-powerlifting]\nworker_count: 3\n",
    )
    .expect("scope")
}

#[tokio::test]
async fn fixture_run_builds_a_complete_ordered_dataset() {
    let dir = tempdir().expect("tempdir");
    let config = SyncConfig::rooted_at(dir.path());
    let factory = Arc::new(FixtureSourceFactory {
        root: fixtures_root(),
    });

    let summary = ScrapePipeline::new(config, scope(), factory)
        .expect("pipeline")
        .run_once()
        .await
        .expect("run");

    assert!(summary.completed);
    assert_eq!(summary.planned_queries, 8);
    assert_eq!(summary.stats.processed_queries, 8);
    assert_eq!(summary.stats.real_rows, 6);
    assert_eq!(summary.stats.dropped_lines, 1);
    assert_eq!(summary.stats.no_data_queries, 5);
    assert_eq!(summary.stats.failed_queries.len(), 1);
    assert_eq!(summary.stats.failed_queries[0].location, "texas");
    assert!(summary.stats.failed_queries[0]
        .message
        .contains("Service Unavailable"));

    let paths = AccumulatorPaths::in_dir(dir.path().join("data"));
    let records: Vec<CompletedRecord> = read_dataset(&paths.dataset)
        .await
        .expect("dataset")
        .iter()
        .map(|row| row.to_record())
        .collect();
    assert_eq!(records.len(), 360 + 1489 + 1800 + 1800 + 1 + 1440);

    let powerlifting: Vec<&CompletedRecord> = records
        .iter()
        .filter(|r| {
            r.location == "ohio" && r.status == "drug-tested" && r.event == "raw-powerlifting"
        })
        .collect();
    assert_eq!(powerlifting.len(), 1489);
    assert!(powerlifting
        .windows(2)
        .all(|w| canonical_cmp(w[0], w[1]) != Ordering::Greater));

    let squat_90: Vec<&&CompletedRecord> = powerlifting
        .iter()
        .filter(|r| {
            r.division.as_deref() == Some("OPEN MEN")
                && r.weight_class.as_deref() == Some("90kg")
                && r.lift == Some(Lift::Squat)
        })
        .collect();
    assert_eq!(squat_90.len(), 2);
    assert!(squat_90.iter().all(|r| r.has_record));
    assert!(squat_90
        .iter()
        .any(|r| r.name.as_deref() == Some("Smith, John")));

    let guest = powerlifting
        .iter()
        .filter(|r| r.division.as_deref() == Some("GUEST MEN"))
        .count();
    assert_eq!(guest, 48);
}

#[tokio::test]
async fn completed_run_starts_fresh_next_time() {
    let dir = tempdir().expect("tempdir");
    let factory = Arc::new(FixtureSourceFactory {
        root: fixtures_root(),
    });

    for _ in 0..2 {
        let summary = ScrapePipeline::new(SyncConfig::rooted_at(dir.path()), scope(), factory.clone())
            .expect("pipeline")
            .run_once()
            .await
            .expect("run");
        assert!(summary.completed);
        assert!(!summary.resumed);
        assert_eq!(summary.skipped_queries, 0);
    }

    let paths = AccumulatorPaths::in_dir(dir.path().join("data"));
    let rows = read_dataset(&paths.dataset).await.expect("dataset");
    assert_eq!(rows.len(), 360 + 1489 + 1800 + 1800 + 1 + 1440);
}
