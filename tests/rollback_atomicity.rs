//! Rollback atomicity: allocations return to the freelist, the cache holds
//! nothing from the failed transaction, trigram deltas vanish.
use decentdb::btree::ops::BTree;
use decentdb::{Database, Options, PageKind, PageStore};
use tempfile::TempDir;

#[test]
fn rollback_returns_allocations_and_drops_trigram_deltas() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let db = Database::create(&path, Options::default()).unwrap();

    let free_before = db.freelist_stats().free_pages;

    let (page_a, page_b) = {
        let mut txn = db.begin_rw().unwrap();
        let a = txn.allocate_page(PageKind::BtreeLeaf).unwrap();
        let b = txn.allocate_page(PageKind::BtreeLeaf).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        txn.write_page(a).unwrap();
        txn.write_page(b).unwrap();
        txn.trigram_record("docs", 7, "HELLO WORLD");
        txn.rollback();
        (a_id, b_id)
    };

    // Both pages are back on the freelist.
    assert_eq!(db.freelist_stats().free_pages, free_before + 2);
    {
        let mut txn = db.begin_rw().unwrap();
        let r1 = txn.allocate_page(PageKind::BtreeLeaf).unwrap().id();
        let r2 = txn.allocate_page(PageKind::BtreeLeaf).unwrap().id();
        let mut reused = [r1, r2];
        reused.sort_unstable();
        let mut rolled = [page_a, page_b];
        rolled.sort_unstable();
        assert_eq!(reused, rolled, "rolled-back allocations are reusable");
        txn.rollback();
    }

    // No trigram hint from the rolled-back transaction.
    let mut reader = db.begin_ro();
    let (ids, truncated) = reader.trigram_seek("docs", "HEL", 1024).unwrap();
    assert!(ids.is_empty());
    assert!(!truncated);
}

#[test]
fn dropping_an_uncommitted_writer_rolls_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let db = Database::create(&path, Options::default()).unwrap();

    {
        let mut txn = db.begin_rw().unwrap();
        let mut tree = BTree::create(&mut txn).unwrap();
        tree.insert(&mut txn, b"ghost", b"1").unwrap();
        txn.set_catalog_root(tree.root_page_id());
        // Dropped without commit.
    }

    // The catalog root reverts; nothing committed.
    let mut reader = db.begin_ro();
    assert_eq!(reader.catalog_root().unwrap(), 0);

    // The writer lock was released: a new writer can proceed.
    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::create(&mut txn).unwrap();
    tree.insert(&mut txn, b"real", b"1").unwrap();
    txn.set_catalog_root(tree.root_page_id());
    txn.commit().unwrap();

    let mut reader = db.begin_ro();
    let root = reader.catalog_root().unwrap();
    assert_eq!(
        BTree::open(root).search(&mut reader, b"real").unwrap(),
        Some(b"1".to_vec())
    );
    assert_eq!(BTree::open(root).search(&mut reader, b"ghost").unwrap(), None);
}

#[test]
fn rollback_does_not_disturb_committed_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let db = Database::create(&path, Options::default()).unwrap();

    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::create(&mut txn).unwrap();
    tree.insert(&mut txn, b"stable", b"yes").unwrap();
    txn.set_catalog_root(tree.root_page_id());
    txn.commit().unwrap();

    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::open(txn.catalog_root());
    tree.insert(&mut txn, b"stable", b"overwritten").unwrap();
    tree.insert(&mut txn, b"extra", b"no").unwrap();
    txn.set_catalog_root(tree.root_page_id());
    txn.rollback();

    let mut reader = db.begin_ro();
    let root = reader.catalog_root().unwrap();
    assert_eq!(
        BTree::open(root).search(&mut reader, b"stable").unwrap(),
        Some(b"yes".to_vec())
    );
    assert_eq!(BTree::open(root).search(&mut reader, b"extra").unwrap(), None);
}
