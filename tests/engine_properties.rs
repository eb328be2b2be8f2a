use std::io::Write;
use std::time::{Duration, Instant};

use sfs3::pipeline::filter::PathFilter;
use sfs3::progress::RateEstimator;
use sfs3::storage::layout::{KeyLayout, normalize_path};
use sfs3::storage::part::{FilePartSource, Part, PartSource};
use sfs3::types::{format_mtime, mtime_from_unix_seconds, parse_mtime};

#[test]
fn glob_semantics() {
    init_dummy_tracing_subscriber();

    let keep_logs = PathFilter::new(&["**.log".to_string()], &[]).unwrap();
    assert!(keep_logs.matches("a/b/c.log"));
    assert!(!keep_logs.matches("a/b/c.txt"));

    let top_level_logs = PathFilter::new(&["*.log".to_string()], &[]).unwrap();
    assert!(top_level_logs.matches("c.log"));
    assert!(!top_level_logs.matches("a/b/c.log"));

    let single_char = PathFilter::new(&["a?c".to_string()], &[]).unwrap();
    assert!(single_char.matches("abc"));
    assert!(!single_char.matches("a/c"));

    let directory_glob = PathFilter::new(&["a/*/b".to_string()], &[]).unwrap();
    assert!(directory_glob.matches("a/x/b"));
    assert!(!directory_glob.matches("a/x/y/b"));
}

#[test]
fn key_mapping_normalizes_repeated_slashes() {
    init_dummy_tracing_subscriber();

    assert_eq!(normalize_path("a//b"), "a/b");

    let layout = KeyLayout::new("");
    assert_eq!(layout.data_key("a//b"), "data/a/b");
    assert_eq!(layout.meta_key("a//b", "md5sum"), "meta/a/b/md5sum");
}

#[test]
fn mtime_header_round_trip() {
    init_dummy_tracing_subscriber();

    // Known fixture values for the Mtime user-metadata header.
    assert_eq!(
        format_mtime(mtime_from_unix_seconds(1380896764)),
        "2013-10-04T14:26:04Z"
    );
    assert_eq!(
        parse_mtime("2013-10-04T17:40:59Z").unwrap().timestamp(),
        1380908459
    );
}

#[tokio::test]
async fn zero_byte_upload_emits_exactly_one_empty_part() {
    init_dummy_tracing_subscriber();

    let file = tempfile::NamedTempFile::new().unwrap();
    let mut source = FilePartSource::new(file.path().to_path_buf(), 1000)
        .await
        .unwrap();

    let first = source.next_part().await.unwrap().unwrap();
    assert!(first.is_empty());
    assert!(source.next_part().await.unwrap().is_none());
}

#[tokio::test]
async fn one_byte_over_part_size_makes_two_parts() {
    init_dummy_tracing_subscriber();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&vec![0u8; 1001]).unwrap();

    let mut source = FilePartSource::new(file.path().to_path_buf(), 1000)
        .await
        .unwrap();

    let mut lengths = Vec::new();
    while let Some(part) = source.next_part().await.unwrap() {
        lengths.push(part.len());
        assert!(matches!(part, Part::Reopenable { .. }));
    }
    assert_eq!(lengths, vec![1000, 1]);
}

#[test]
fn weighted_rate_windows() {
    init_dummy_tracing_subscriber();

    let start = Instant::now();
    let mut estimator = RateEstimator::new(start);

    for second in 1..=30u64 {
        estimator.record(start + Duration::from_secs(second), 0);
    }
    let now = start + Duration::from_secs(31);
    estimator.record(now, 1000);

    // rate = 0.50·Δ1s + 0.30·Δ30s + 0.20·overall
    let expected = 0.5 * 1000.0 + 0.3 * (1000.0 / 30.0) + 0.2 * (1000.0 / 31.0);
    assert!((estimator.rate(now) - expected).abs() < 0.5);
}

fn init_dummy_tracing_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dummy=trace")
        .try_init();
}
