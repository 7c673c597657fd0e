use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use vellum_core::format::scan_index_log;
use vellum_core::{IndexRecord, Position, PositionIndex};
use vellum_db::{Store, StoreError, StoreOptions};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(dir: &Path) -> StoreOptions {
    StoreOptions::new(dir, "replay", 4).with_flush_interval(Duration::from_secs(3600))
}

fn replayed(options: &StoreOptions) -> PositionIndex {
    let bytes = std::fs::read(options.index_path()).expect("read index log");
    PositionIndex::replay(&bytes).0
}

fn append_index_bytes(options: &StoreOptions, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(options.index_path())
        .expect("open index log");
    file.write_all(bytes).expect("append to index log");
}

#[test]
fn reopen_reconstructs_identical_index_and_header() {
    let dir = tempdir().expect("tempdir");
    let opts = options(dir.path());

    let (before_header, before_ids) = {
        let store = Store::open(opts.clone()).expect("open store");
        for i in 0..50u64 {
            let collection = ["a", "b", "c"][(i % 3) as usize];
            store
                .append(collection, &format!("entry-{i}"), &[i as f32, 1.0, 0.0, -1.0])
                .expect("append");
        }
        store.remove("b", 2).expect("remove");
        store.remove("c", 3).expect("remove");
        store.flush().expect("flush");
        let ids: Vec<Vec<u64>> = ["a", "b", "c"].iter().map(|c| store.ids(c)).collect();
        let header = store.header();
        store.close().expect("close");
        (header, ids)
    };
    let before_index = replayed(&opts).snapshot();

    let store = Store::open(opts.clone()).expect("reopen");
    assert_eq!(store.header(), before_header);
    let after_ids: Vec<Vec<u64>> = ["a", "b", "c"].iter().map(|c| store.ids(c)).collect();
    assert_eq!(after_ids, before_ids);
    assert!(!store.contains("b", 2));
    assert_eq!(
        store.read_content("a", 1).expect("read").as_deref(),
        Some("entry-0")
    );
    store.close().expect("close");

    // Opening and closing without writes leaves the index log untouched
    assert_eq!(replayed(&opts).snapshot(), before_index);

    let store = Store::open(opts).expect("reopen again");
    let next = store.append("a", "after restart", &[0.0; 4]).expect("append");
    assert_eq!(next, 51);
}

#[test]
fn torn_index_tail_is_ignored_and_cut_off() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let opts = options(dir.path());
    {
        let store = Store::open(opts.clone()).expect("open store");
        store.append("t", "one", &[1.0, 0.0, 0.0, 0.0]).expect("append");
        store.append("t", "two", &[0.0, 1.0, 0.0, 0.0]).expect("append");
        store.close().expect("close");
    }
    let good_len = std::fs::metadata(opts.index_path()).expect("metadata").len();

    // Half of a record, as if the process died mid-write
    let mut torn = Vec::new();
    IndexRecord::upsert(3, "t", Position::default()).encode_into(&mut torn);
    append_index_bytes(&opts, &torn[..torn.len() / 2]);

    {
        let store = Store::open(opts.clone()).expect("reopen with torn tail");
        assert_eq!(store.ids("t"), vec![1, 2]);
        assert_eq!(
            std::fs::metadata(opts.index_path()).expect("metadata").len(),
            good_len
        );
        let id = store.append("t", "three", &[0.0, 0.0, 1.0, 0.0]).expect("append");
        assert_eq!(id, 3);
        store.close().expect("close");
    }

    let scan = scan_index_log(&std::fs::read(opts.index_path()).expect("read"));
    assert!(scan.malformed.is_none());
    assert_eq!(scan.records.len(), 3);

    let store = Store::open(opts).expect("reopen");
    assert_eq!(
        store.read_content("t", 3).expect("read").as_deref(),
        Some("three")
    );
}

#[test]
fn orphaned_index_records_are_skipped_not_repaired() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let opts = options(dir.path());
    {
        let store = Store::open(opts.clone()).expect("open store");
        store.append("o", "kept", &[1.0, 0.0, 0.0, 0.0]).expect("append");
        store.close().expect("close");
    }

    // Files grew but the data pages never made it: zero fill
    let content_len = std::fs::metadata(opts.content_path()).expect("metadata").len();
    let embeddings_len = std::fs::metadata(opts.embeddings_path()).expect("metadata").len();
    for path in [opts.content_path(), opts.embeddings_path()] {
        let mut file = OpenOptions::new().append(true).open(path).expect("open log");
        file.write_all(&[0u8; 64]).expect("zero fill");
    }

    let mut bytes = Vec::new();
    // Points past the end of both logs: content never reached disk
    IndexRecord::upsert(
        2,
        "o",
        Position {
            content_offset: 10_000,
            embedding_offset: 10_000,
            dimensions: 4,
            content_len: 5,
        },
    )
    .encode_into(&mut bytes);
    // Inside the files, but only zero fill where its records should be
    IndexRecord::upsert(
        3,
        "o",
        Position {
            content_offset: content_len,
            embedding_offset: embeddings_len,
            dimensions: 4,
            content_len: 5,
        },
    )
    .encode_into(&mut bytes);
    append_index_bytes(&opts, &bytes);

    let store = Store::open(opts).expect("reopen");
    assert_eq!(store.ids("o"), vec![1]);
    assert_eq!(store.read_content("o", 2).expect("read"), None);
    assert_eq!(store.read_content("o", 3).expect("read"), None);
    let hits = store.search("o", &[1.0, 0.0, 0.0, 0.0], 10).expect("search");
    assert_eq!(hits.len(), 1);

    // Orphan ids still count as used
    let next = store.append("o", "new", &[0.0, 1.0, 0.0, 0.0]).expect("append");
    assert_eq!(next, 4);
    store.flush().expect("flush");
    assert_eq!(
        store.read_content("o", next).expect("read").as_deref(),
        Some("new")
    );
    assert_eq!(
        store.read_content("o", 1).expect("read").as_deref(),
        Some("kept")
    );
}

#[test]
fn malformed_record_mid_log_refuses_open_and_loses_nothing() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let opts = options(dir.path());
    {
        let store = Store::open(opts.clone()).expect("open store");
        for i in 1..=5 {
            store
                .append("m", &format!("doc-{i}"), &[i as f32, 0.0, 0.0, 0.0])
                .expect("append");
        }
        store.close().expect("close");
    }
    let original = std::fs::read(opts.index_path()).expect("read index log");
    let scan = scan_index_log(&original);
    assert_eq!(scan.records.len(), 5);

    // Collection name length of the second record
    let mut damaged = original.clone();
    let at = scan.records[0].encoded_len() + 8;
    damaged[at..at + 4].copy_from_slice(&9999i32.to_le_bytes());
    std::fs::write(opts.index_path(), &damaged).expect("write damaged log");
    let content_before = std::fs::read(opts.content_path()).expect("read content log");

    let err = Store::open(opts.clone()).err().expect("open must fail");
    assert!(matches!(err, StoreError::Format(_)), "unexpected error {err:?}");
    assert_eq!(
        std::fs::read(opts.index_path()).expect("read index log"),
        damaged,
        "records after the damage must not be cut"
    );
    assert_eq!(
        std::fs::read(opts.content_path()).expect("read content log"),
        content_before
    );

    std::fs::write(opts.index_path(), &original).expect("restore log");
    let store = Store::open(opts).expect("reopen repaired log");
    assert_eq!(store.ids("m"), vec![1, 2, 3, 4, 5]);
    assert_eq!(store.append("m", "new", &[0.0; 4]).expect("append"), 6);
    store.flush().expect("flush");
    for i in 1..=5u64 {
        assert_eq!(
            store.read_content("m", i).expect("read"),
            Some(format!("doc-{i}"))
        );
    }
}

#[test]
fn zeroed_index_tail_is_cut_off() {
    let dir = tempdir().expect("tempdir");
    let opts = options(dir.path());
    {
        let store = Store::open(opts.clone()).expect("open store");
        store.append("z", "one", &[1.0, 0.0, 0.0, 0.0]).expect("append");
        store.append("z", "two", &[0.0, 1.0, 0.0, 0.0]).expect("append");
        store.close().expect("close");
    }
    let good_len = std::fs::metadata(opts.index_path()).expect("metadata").len();
    append_index_bytes(&opts, &[0u8; 100]);

    let store = Store::open(opts.clone()).expect("reopen with zeroed tail");
    assert_eq!(store.ids("z"), vec![1, 2]);
    assert_eq!(
        std::fs::metadata(opts.index_path()).expect("metadata").len(),
        good_len
    );
    assert_eq!(store.append("z", "three", &[0.0; 4]).expect("append"), 3);
}

#[test]
fn preallocated_logs_grow_and_reopen_at_the_data_end() {
    let dir = tempdir().expect("tempdir");
    let opts = options(dir.path())
        .with_initial_file_size_hint(1024)
        .with_growth(10, 50);

    {
        let store = Store::open(opts.clone()).expect("open store");
        assert_eq!(
            std::fs::metadata(opts.content_path()).expect("metadata").len(),
            1024
        );

        store.append("p", "early", &[1.0, 0.0, 0.0, 0.0]).expect("append");
        store.save_changes().expect("save changes");
        // Written but unflushed: the zero fill must not look like corruption
        assert!(store.search("p", &[1.0, 0.0, 0.0, 0.0], 5).expect("search").is_empty());

        for i in 0..100 {
            store
                .append("p", &format!("payload number {i:04}"), &[0.0, 1.0, i as f32, 0.0])
                .expect("append");
        }
        store.flush().expect("flush");
        let header = store.header();
        assert!(std::fs::metadata(opts.content_path()).expect("metadata").len() > 1024);
        assert!(
            std::fs::metadata(opts.content_path()).expect("metadata").len()
                >= header.content_write_offset
        );
        store.close().expect("close");
    }

    let store = Store::open(opts).expect("reopen");
    assert_eq!(store.count("p"), 101);
    let id = store.append("p", "after reopen", &[0.0, 0.0, 0.0, 1.0]).expect("append");
    store.flush().expect("flush");
    assert_eq!(
        store.read_content("p", 1).expect("read").as_deref(),
        Some("early")
    );
    assert_eq!(
        store.read_content("p", 101).expect("read").as_deref(),
        Some("payload number 0099")
    );
    assert_eq!(
        store.read_content("p", id).expect("read").as_deref(),
        Some("after reopen")
    );
}
