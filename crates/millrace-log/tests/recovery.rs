// Recovery and coordinate resolution over real files.
use std::path::Path;

use millrace_log::layout::{check_and_get_last_file, coord_of_last_record, coord_of_record};
use millrace_log::{HEADER_SIZE, Log, LogConfig};
use millrace_wire::Document;

fn config(dir: &Path, chunk: u64) -> LogConfig {
    LogConfig {
        logs_dir: dir.to_path_buf(),
        max_log_chunk_size: chunk,
        fsync_on_append: false,
    }
}

fn event(n: i64) -> Document {
    Document::new().put("seq", n)
}

#[tokio::test]
async fn reopen_resumes_after_last_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let log = Log::open(config(dir.path(), 64 * 1024), "ch")
            .await
            .expect("open");
        for n in 0..25 {
            log.append(&event(n)).await.expect("append");
        }
    }
    let log = Log::open(config(dir.path(), 64 * 1024), "ch")
        .await
        .expect("reopen");
    assert_eq!(log.tail(), 25);
    let number = log.append(&event(25)).await.expect("append");
    assert_eq!(number, 25);

    let mut cursor = log.cursor_at(0).await.expect("cursor");
    let mut seen = Vec::new();
    while let Some(record) = cursor.next().expect("read") {
        seen.push(record.document.get_i64("seq").expect("seq"));
    }
    assert_eq!(seen, (0..26).collect::<Vec<_>>());
}

#[tokio::test]
async fn coord_of_last_record_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunk = 64 * 1024;
    {
        let log = Log::open(config(dir.path(), chunk), "ch").await.expect("open");
        for n in 0..10 {
            log.append(&event(n)).await.expect("append");
        }
    }
    let head = check_and_get_last_file(dir.path(), "ch", chunk).expect("layout");
    assert_eq!(head, 0);
    let coord = coord_of_last_record(dir.path(), "ch", head).expect("coord");
    assert_eq!(coord.record_number, 9);
    assert!(coord.file_pos >= HEADER_SIZE);

    // The coordinate must point at the start of record 9's framing.
    let resolved = coord_of_record(dir.path(), "ch", 9).expect("resolve");
    assert_eq!(resolved, coord);
}

#[tokio::test]
async fn thousand_records_across_small_chunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunk = 65_536;
    {
        let log = Log::open(config(dir.path(), chunk), "ch").await.expect("open");
        for n in 0..1000 {
            log.append(&event(n)).await.expect("append");
        }
    }
    let head = check_and_get_last_file(dir.path(), "ch", chunk).expect("layout");
    let coord = coord_of_record(dir.path(), "ch", 500).expect("resolve");
    assert_eq!(coord.record_number, 500);
    assert!(coord.is_valid());
    assert!(coord.file_number <= head);

    // Every record resolves to a coordinate a cursor can read it from.
    let log = Log::open(config(dir.path(), chunk), "ch").await.expect("reopen");
    let mut cursor = log.cursor_at(500).await.expect("cursor");
    let record = cursor.next().expect("read").expect("record");
    assert_eq!(record.number, 500);
    assert_eq!(record.document.get_i64("seq"), Some(500));
    assert_eq!(record.file_number, coord.file_number);
    assert_eq!(record.file_pos, coord.file_pos);
}

#[tokio::test]
async fn coord_of_record_clamps_past_the_tail() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let log = Log::open(config(dir.path(), 64 * 1024), "ch").await.expect("open");
        for n in 0..5 {
            log.append(&event(n)).await.expect("append");
        }
    }
    let last = coord_of_last_record(dir.path(), "ch", 0).expect("last");
    let clamped = coord_of_record(dir.path(), "ch", 10_000).expect("resolve");
    assert_eq!(clamped, last);
    assert_eq!(clamped.record_number, 4);
}

#[tokio::test]
async fn coord_of_record_zero_points_after_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let log = Log::open(config(dir.path(), 64 * 1024), "ch").await.expect("open");
        log.append(&event(0)).await.expect("append");
    }
    let coord = coord_of_record(dir.path(), "ch", 0).expect("resolve");
    assert_eq!(coord.file_number, 0);
    assert_eq!(coord.record_number, 0);
    assert_eq!(coord.file_pos, HEADER_SIZE);
}

#[tokio::test]
async fn rolled_channel_has_full_sized_lower_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunk = 512;
    {
        let log = Log::open(config(dir.path(), chunk), "ch").await.expect("open");
        for n in 0..40 {
            log.append(&event(n)).await.expect("append");
        }
    }
    let head = check_and_get_last_file(dir.path(), "ch", chunk).expect("layout");
    assert!(head > 0, "expected the log to roll");
    for number in 0..head {
        let path = dir.path().join(format!("ch-{number:012}.log"));
        assert_eq!(path.metadata().expect("metadata").len(), chunk);
    }
}

#[tokio::test]
async fn truncated_lower_file_fails_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunk = 512;
    {
        let log = Log::open(config(dir.path(), chunk), "ch").await.expect("open");
        for n in 0..40 {
            log.append(&event(n)).await.expect("append");
        }
    }
    let first = dir.path().join("ch-000000000000.log");
    let bytes = std::fs::read(&first).expect("read");
    std::fs::write(&first, &bytes[..bytes.len() - 1]).expect("truncate");
    let err = Log::open(config(dir.path(), chunk), "ch")
        .await
        .expect_err("bad size");
    assert!(matches!(
        err,
        millrace_log::LogError::UnexpectedFileSize { .. }
    ));
}
