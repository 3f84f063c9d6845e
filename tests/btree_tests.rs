//! B+Tree behavior through the transaction layer: ordered scans across
//! splits, point lookups, deletes with rebalancing, cursor positioning.
use decentdb::btree::cursor::Cursor;
use decentdb::btree::ops::BTree;
use decentdb::{Database, Options};
use tempfile::TempDir;

fn setup() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::create(&dir.path().join("test.db"), Options::default()).unwrap();
    (dir, db)
}

fn key(i: u32) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

/// Insert `count` keys in the given order and persist the root.
fn build_tree(db: &Database, order: impl Iterator<Item = u32>) -> u32 {
    let mut txn = db.begin_rw().unwrap();
    let root = txn.catalog_root();
    let mut tree = if root == 0 {
        BTree::create(&mut txn).unwrap()
    } else {
        BTree::open(root)
    };
    for i in order {
        tree.insert(&mut txn, &key(i), &value(i)).unwrap();
    }
    txn.set_catalog_root(tree.root_page_id());
    let new_root = tree.root_page_id();
    txn.commit().unwrap();
    new_root
}

#[test]
fn inserts_across_splits_stay_sorted() {
    let (_dir, db) = setup();
    // Enough entries to force several leaf and internal splits.
    build_tree(&db, (0..2_000).rev());

    let mut txn = db.begin_ro();
    let root = txn.catalog_root().unwrap();
    let tree = BTree::open(root);
    let mut cursor = Cursor::new(&tree, &mut txn);
    let mut positioned = cursor.seek_first().unwrap();
    let mut seen = Vec::new();
    let mut last: Option<Vec<u8>> = None;
    while positioned {
        let k = cursor.key().unwrap().to_vec();
        if let Some(prev) = &last {
            assert!(prev < &k, "scan must be strictly increasing");
        }
        last = Some(k.clone());
        seen.push(k);
        positioned = cursor.next().unwrap();
    }
    assert_eq!(seen.len(), 2_000);
    assert_eq!(seen[0], key(0));
    assert_eq!(seen[1999], key(1999));
}

#[test]
fn point_lookups_hit_every_key() {
    let (_dir, db) = setup();
    build_tree(&db, 0..1_000);
    let mut txn = db.begin_ro();
    let root = txn.catalog_root().unwrap();
    let tree = BTree::open(root);
    for i in 0..1_000 {
        assert_eq!(tree.search(&mut txn, &key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(tree.search(&mut txn, b"missing").unwrap(), None);
}

#[test]
fn insert_replaces_existing_value() {
    let (_dir, db) = setup();
    build_tree(&db, 0..10);
    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::open(txn.catalog_root());
    tree.insert(&mut txn, &key(5), b"replaced").unwrap();
    txn.set_catalog_root(tree.root_page_id());
    txn.commit().unwrap();

    let mut txn = db.begin_ro();
    let tree = BTree::open(txn.catalog_root().unwrap());
    assert_eq!(
        tree.search(&mut txn, &key(5)).unwrap(),
        Some(b"replaced".to_vec())
    );
    assert_eq!(tree.search(&mut txn, &key(6)).unwrap(), Some(value(6)));
}

#[test]
fn seek_ge_and_le_position_correctly() {
    let (_dir, db) = setup();
    build_tree(&db, (0..100).map(|i| i * 10)); // key000000, key000010, ...
    let mut txn = db.begin_ro();
    let tree = BTree::open(txn.catalog_root().unwrap());
    let mut cursor = Cursor::new(&tree, &mut txn);

    assert!(cursor.seek_ge(&key(15)).unwrap());
    assert_eq!(cursor.key().unwrap(), key(20).as_slice());

    assert!(cursor.seek_le(&key(15)).unwrap());
    assert_eq!(cursor.key().unwrap(), key(10).as_slice());

    assert!(cursor.seek_ge(&key(20)).unwrap());
    assert_eq!(cursor.key().unwrap(), key(20).as_slice());

    assert!(cursor.seek_le(&key(20)).unwrap());
    assert_eq!(cursor.key().unwrap(), key(20).as_slice());

    // Below the smallest / above the largest.
    assert!(cursor.seek_ge(b"a").unwrap());
    assert_eq!(cursor.key().unwrap(), key(0).as_slice());
    assert!(!cursor.seek_le(b"a").unwrap());
    assert!(!cursor.seek_ge(b"z").unwrap());
    assert!(cursor.seek_le(b"z").unwrap());
    assert_eq!(cursor.key().unwrap(), key(990).as_slice());
}

#[test]
fn cursor_walks_backward_across_leaves() {
    let (_dir, db) = setup();
    build_tree(&db, 0..500);
    let mut txn = db.begin_ro();
    let tree = BTree::open(txn.catalog_root().unwrap());
    let mut cursor = Cursor::new(&tree, &mut txn);

    assert!(cursor.seek_last().unwrap());
    let mut count = 1;
    let mut last = cursor.key().unwrap().to_vec();
    while cursor.prev().unwrap() {
        let k = cursor.key().unwrap().to_vec();
        assert!(k < last, "reverse scan must be strictly decreasing");
        last = k;
        count += 1;
    }
    assert_eq!(count, 500);
    assert_eq!(last, key(0));
}

#[test]
fn deletes_shrink_and_keep_order() {
    let (_dir, db) = setup();
    build_tree(&db, 0..600);

    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::open(txn.catalog_root());
    for i in 0..600 {
        if i % 3 != 0 {
            assert!(tree.delete(&mut txn, &key(i)).unwrap());
        }
    }
    assert!(!tree.delete(&mut txn, b"missing").unwrap());
    txn.set_catalog_root(tree.root_page_id());
    txn.commit().unwrap();

    let mut txn = db.begin_ro();
    let tree = BTree::open(txn.catalog_root().unwrap());
    for i in 0..600 {
        let got = tree.search(&mut txn, &key(i)).unwrap();
        if i % 3 == 0 {
            assert_eq!(got, Some(value(i)), "key {} should remain", i);
        } else {
            assert_eq!(got, None, "key {} should be deleted", i);
        }
    }

    let mut cursor = Cursor::new(&tree, &mut txn);
    let mut positioned = cursor.seek_first().unwrap();
    let mut count = 0;
    while positioned {
        count += 1;
        positioned = cursor.next().unwrap();
    }
    assert_eq!(count, 200);
}

#[test]
fn delete_everything_leaves_an_empty_tree() {
    let (_dir, db) = setup();
    build_tree(&db, 0..300);
    let free_before = db.freelist_stats().free_pages;

    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::open(txn.catalog_root());
    for i in 0..300 {
        assert!(tree.delete(&mut txn, &key(i)).unwrap());
    }
    txn.set_catalog_root(tree.root_page_id());
    txn.commit().unwrap();

    let mut txn = db.begin_ro();
    let tree = BTree::open(txn.catalog_root().unwrap());
    let mut cursor = Cursor::new(&tree, &mut txn);
    assert!(!cursor.seek_first().unwrap());
    assert!(!cursor.seek_last().unwrap());

    // Merges returned node pages to the freelist.
    assert!(db.freelist_stats().free_pages > free_before);
}

#[test]
fn overflow_values_are_freed_with_their_keys() {
    let (_dir, db) = setup();
    let big = vec![0x5Au8; 50_000];
    {
        let mut txn = db.begin_rw().unwrap();
        let mut tree = BTree::create(&mut txn).unwrap();
        tree.insert(&mut txn, b"big", &big).unwrap();
        txn.set_catalog_root(tree.root_page_id());
        txn.commit().unwrap();
    }
    let free_before = db.freelist_stats().free_pages;
    {
        let mut txn = db.begin_rw().unwrap();
        let mut tree = BTree::open(txn.catalog_root());
        assert!(tree.delete(&mut txn, b"big").unwrap());
        txn.set_catalog_root(tree.root_page_id());
        txn.commit().unwrap();
    }
    let freed = db.freelist_stats().free_pages - free_before;
    assert!(
        freed >= (50_000 / db.page_size()) as u64,
        "overflow chain pages must return to the freelist, freed {}",
        freed
    );
}

#[test]
fn oversized_keys_are_rejected() {
    let (_dir, db) = setup();
    let mut txn = db.begin_rw().unwrap();
    let mut tree = BTree::create(&mut txn).unwrap();
    let long_key = vec![b'k'; db.page_size()];
    assert!(tree.insert(&mut txn, &long_key, b"v").is_err());
    assert!(tree.insert(&mut txn, b"", b"v").is_err());
    txn.rollback();
}
