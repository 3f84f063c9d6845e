//! Trigram index end-to-end: delta buffering, checkpoint flush, bounded
//! decode, intersection, and rebuild.
use decentdb::trigram::postings::intersect;
use decentdb::{Database, Options};
use tempfile::TempDir;

fn setup() -> (TempDir, std::path::PathBuf, Database) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let db = Database::create(&path, Options::default()).unwrap();
    (dir, path, db)
}

fn record(db: &Database, table: &str, row_id: u64, text: &str) {
    let mut txn = db.begin_rw().unwrap();
    txn.trigram_record(table, row_id, text);
    txn.commit().unwrap();
}

#[test]
fn committed_deltas_are_visible_before_checkpoint() {
    let (_dir, _path, db) = setup();
    record(&db, "docs", 1, "hello world");
    record(&db, "docs", 2, "help");

    let mut reader = db.begin_ro();
    let (ids, truncated) = reader.trigram_seek("docs", "HEL", 1024).unwrap();
    assert_eq!(ids, vec![1, 2]);
    assert!(!truncated);

    let (ids, _) = reader.trigram_seek("docs", "WOR", 1024).unwrap();
    assert_eq!(ids, vec![1]);
}

#[test]
fn checkpoint_flushes_deltas_into_paged_postings() {
    let (_dir, path, db) = setup();
    record(&db, "docs", 1, "hello world");
    record(&db, "docs", 2, "help");
    db.checkpoint().unwrap();

    let stats = db.trigram_stats().unwrap();
    assert!(stats.trigrams > 0);
    assert!(stats.row_entries > 0);

    let mut reader = db.begin_ro();
    let (ids, _) = reader.trigram_seek("docs", "HEL", 1024).unwrap();
    assert_eq!(ids, vec![1, 2]);

    // Paged postings survive a crash; the flushed state is durable.
    drop(reader);
    drop(db);
    let db = Database::open(&path, Options::default()).unwrap();
    let mut reader = db.begin_ro();
    let (ids, _) = reader.trigram_seek("docs", "HEL", 1024).unwrap();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn removal_deltas_mask_paged_postings() {
    let (_dir, _path, db) = setup();
    record(&db, "docs", 1, "searchable");
    record(&db, "docs", 2, "searchable");
    db.checkpoint().unwrap();

    let mut txn = db.begin_rw().unwrap();
    txn.trigram_remove("docs", 1, "searchable");
    txn.commit().unwrap();

    // The removal is committed but not flushed; the overlay hides row 1.
    let mut reader = db.begin_ro();
    let (ids, _) = reader.trigram_seek("docs", "SEA", 1024).unwrap();
    assert_eq!(ids, vec![2]);

    // After the flush the paged postings themselves shrink.
    drop(reader);
    db.checkpoint().unwrap();
    let mut reader = db.begin_ro();
    let (ids, _) = reader.trigram_seek("docs", "SEA", 1024).unwrap();
    assert_eq!(ids, vec![2]);
}

#[test]
fn bounded_decode_reports_truncation() {
    let (_dir, _path, db) = setup();
    {
        let mut txn = db.begin_rw().unwrap();
        for row in 0..500u64 {
            txn.trigram_record("docs", row, "the quick fox");
        }
        txn.commit().unwrap();
    }
    db.checkpoint().unwrap();

    let mut reader = db.begin_ro();
    let (ids, truncated) = reader.trigram_seek("docs", "THE", 100).unwrap();
    assert!(truncated, "decode bound must trip");
    assert!(ids.len() >= 100);

    let (all, truncated) = reader.trigram_seek("docs", "THE", 10_000).unwrap();
    assert!(!truncated);
    assert_eq!(all.len(), 500);
    assert!(all.windows(2).all(|w| w[0] < w[1]), "ids stay sorted");
}

#[test]
fn short_inputs_index_nothing() {
    let (_dir, _path, db) = setup();
    record(&db, "docs", 1, "ab");
    let mut reader = db.begin_ro();
    assert!(reader.trigram_seek("docs", "ab", 10).is_err());
    let (ids, _) = reader.trigram_seek("docs", "abc", 10).unwrap();
    assert!(ids.is_empty());
}

#[test]
fn canonicalization_is_case_insensitive() {
    let (_dir, _path, db) = setup();
    record(&db, "docs", 5, "Hello");
    let mut reader = db.begin_ro();
    let (upper, _) = reader.trigram_seek("docs", "HEL", 10).unwrap();
    let (lower, _) = reader.trigram_seek("docs", "hel", 10).unwrap();
    assert_eq!(upper, vec![5]);
    assert_eq!(lower, vec![5]);
}

#[test]
fn intersection_narrows_candidates() {
    let (_dir, _path, db) = setup();
    record(&db, "docs", 1, "hello world");
    record(&db, "docs", 2, "hello there");
    record(&db, "docs", 3, "cruel world");
    db.checkpoint().unwrap();

    let mut reader = db.begin_ro();
    let (hel, _) = reader.trigram_seek("docs", "HEL", 1024).unwrap();
    let (wor, _) = reader.trigram_seek("docs", "WOR", 1024).unwrap();
    assert_eq!(intersect(vec![hel, wor]), vec![1]);
}

#[test]
fn tables_are_separate_namespaces() {
    let (_dir, _path, db) = setup();
    record(&db, "posts", 1, "shared text");
    record(&db, "notes", 2, "shared text");
    db.checkpoint().unwrap();

    let mut reader = db.begin_ro();
    let (posts, _) = reader.trigram_seek("posts", "SHA", 10).unwrap();
    let (notes, _) = reader.trigram_seek("notes", "SHA", 10).unwrap();
    assert_eq!(posts, vec![1]);
    assert_eq!(notes, vec![2]);
}

#[test]
fn rebuild_restores_a_stale_index() {
    let (_dir, _path, db) = setup();
    record(&db, "docs", 1, "alpha beta");
    record(&db, "docs", 2, "beta gamma");
    db.checkpoint().unwrap();

    // Rebuild from a fresh row set, as an operator would after losing
    // unflushed deltas in a crash.
    db.index_rebuild(vec![
        ("docs".to_string(), 1, "alpha beta".to_string()),
        ("docs".to_string(), 2, "beta gamma".to_string()),
        ("docs".to_string(), 3, "delta beta".to_string()),
    ])
    .unwrap();

    let mut reader = db.begin_ro();
    let (ids, _) = reader.trigram_seek("docs", "BET", 1024).unwrap();
    assert_eq!(ids, vec![1, 2, 3]);
    let (ids, _) = reader.trigram_seek("docs", "ALP", 1024).unwrap();
    assert_eq!(ids, vec![1]);
}

#[test]
fn many_rows_spread_across_segments() {
    let (_dir, _path, db) = setup();
    // Enough row ids for one trigram to need several segments.
    {
        let mut txn = db.begin_rw().unwrap();
        for row in 0..5_000u64 {
            txn.trigram_record("docs", row, "the");
        }
        txn.commit().unwrap();
    }
    db.checkpoint().unwrap();
    let stats = db.trigram_stats().unwrap();
    assert_eq!(stats.trigrams, 1);
    assert!(stats.segments > 1, "expected multiple segments, got {:?}", stats);
    assert_eq!(stats.row_entries, 5_000);

    let mut reader = db.begin_ro();
    let (ids, truncated) = reader.trigram_seek("docs", "THE", 10_000).unwrap();
    assert!(!truncated);
    assert_eq!(ids.len(), 5_000);
}
