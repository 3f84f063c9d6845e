/// Transactions: a single writer bound to the WAL write lock, unbounded
/// snapshot readers.
///
/// `WriteTxn` owns the WAL writer guard for its whole life, so "at most one
/// writer" and "dirty pages belong to the writer until commit" are both
/// facts of ownership rather than runtime checks. Dirty pages live in the
/// transaction's private buffer and reach the shared cache only as
/// committed versions; dropping an uncommitted `WriteTxn` rolls back.
///
/// `ReadTxn` carries a reader id and snapshot LSN. Every page read routes
/// through the WAL first (`route_read`), which is the single point where
/// reader abortion takes effect and which decides whether the snapshot
/// sees a WAL version or the main file.
use std::collections::HashMap;

use parking_lot::MutexGuard;

use crate::error::{DecentError, Result};
use crate::storage::page::{Page, PageId, PageKind};
use crate::storage::page_store::PageStore;
use crate::storage::pager::HEADER_PAGE_ID;
use crate::trigram::index::{apply_overlay, TrigramDelta, TrigramIndex};
use crate::trigram::tokenizer::{canonical_query_trigram, distinct_trigrams};
use crate::wal::log::WalWriterState;
use crate::wal::{Lsn, ReaderId};
use crate::Database;

/// Snapshot reader.
pub struct ReadTxn<'db> {
    db: &'db Database,
    reader_id: ReaderId,
    snapshot: Lsn,
}

impl<'db> ReadTxn<'db> {
    pub(crate) fn new(db: &'db Database, reader_id: ReaderId, snapshot: Lsn) -> Self {
        ReadTxn {
            db,
            reader_id,
            snapshot,
        }
    }

    pub fn snapshot(&self) -> Lsn {
        self.snapshot
    }

    pub fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    /// Catalog root as of this snapshot.
    pub fn catalog_root(&mut self) -> Result<PageId> {
        Ok(self.snapshot_header()?.catalog_root)
    }

    fn snapshot_header(&mut self) -> Result<crate::storage::pager::DbHeader> {
        let page = self.read_page(HEADER_PAGE_ID)?;
        crate::storage::pager::DbHeader::decode(&page)
    }

    /// Bounded trigram lookup: paged base set up to `max_ids`, overlaid
    /// with the committed-but-unflushed delta. A `true` second component
    /// means the decode bound tripped and the caller must fall back to a
    /// scan with a post-filter.
    pub fn trigram_seek(
        &mut self,
        table: &str,
        trigram: &str,
        max_ids: usize,
    ) -> Result<(Vec<u64>, bool)> {
        let Some(canonical) = canonical_query_trigram(trigram) else {
            return Err(DecentError::Invalid(format!(
                "{:?} does not canonicalize to exactly three code points",
                trigram
            )));
        };
        let root = self.snapshot_header()?.trigram_root;
        let (base, truncated) = if root == 0 {
            (Vec::new(), false)
        } else {
            let index = TrigramIndex::open(root);
            index.seek(self, table, &canonical, max_ids)?
        };
        let delta = {
            let pending = self.db.trigram.lock();
            pending
                .deltas
                .get(&(table.to_string(), canonical))
                .cloned()
        };
        let ids = match delta {
            Some(delta) => apply_overlay(base, &delta),
            None => base,
        };
        Ok((ids, truncated))
    }
}

impl PageStore for ReadTxn<'_> {
    fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        let route = self
            .db
            .wal
            .route_read(page_id, self.snapshot, self.reader_id)?;
        match self.db.read_committed(page_id, route) {
            Ok(page) => Ok(page),
            Err(first) => {
                // A truncating checkpoint may retire a routed WAL offset
                // between the route and the file read; the re-route then
                // lands on the main file. An unchanged route is a real
                // failure.
                let reroute = self
                    .db
                    .wal
                    .route_read(page_id, self.snapshot, self.reader_id)?;
                if reroute == route {
                    self.db.note_error(&first);
                    return Err(first);
                }
                match self.db.read_committed(page_id, reroute) {
                    Ok(page) => Ok(page),
                    Err(e) => {
                        self.db.note_error(&e);
                        Err(e)
                    }
                }
            }
        }
    }

    fn write_page(&mut self, _page: Page) -> Result<()> {
        Err(DecentError::Invalid(
            "write through a read transaction".into(),
        ))
    }

    fn allocate_page(&mut self, _kind: PageKind) -> Result<Page> {
        Err(DecentError::Invalid(
            "allocation through a read transaction".into(),
        ))
    }

    fn free_page(&mut self, _page_id: PageId) -> Result<()> {
        Err(DecentError::Invalid(
            "free through a read transaction".into(),
        ))
    }

    fn page_size(&self) -> usize {
        self.db.pager.page_size()
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.db.wal.end_read(self.reader_id);
    }
}

/// The single writer. Holds the WAL write-lock guard until commit or
/// rollback.
pub struct WriteTxn<'db> {
    db: &'db Database,
    wal_guard: Option<MutexGuard<'db, WalWriterState>>,
    dirty: HashMap<PageId, Page>,
    allocated: Vec<PageId>,
    freed: Vec<PageId>,
    trigram_local: HashMap<(String, String), TrigramDelta>,
    header_at_begin: crate::storage::pager::DbHeader,
    finished: bool,
    auto_checkpoint: bool,
    checkpoint_pending: bool,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(
        db: &'db Database,
        wal_guard: MutexGuard<'db, WalWriterState>,
        auto_checkpoint: bool,
    ) -> Self {
        WriteTxn {
            db,
            wal_guard: Some(wal_guard),
            dirty: HashMap::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            trigram_local: HashMap::new(),
            header_at_begin: db.pager.header(),
            finished: false,
            auto_checkpoint,
            checkpoint_pending: false,
        }
    }

    pub fn catalog_root(&self) -> PageId {
        self.db.pager.header().catalog_root
    }

    /// Point the header at a new catalog root. Durable at commit, when the
    /// header page rides the WAL with the rest of the dirty set.
    pub fn set_catalog_root(&mut self, root: PageId) {
        let mut header = self.db.pager.header();
        header.catalog_root = root;
        self.db.pager.set_header(header);
    }

    pub(crate) fn trigram_root(&self) -> PageId {
        self.db.pager.header().trigram_root
    }

    pub(crate) fn set_trigram_root(&mut self, root: PageId) {
        let mut header = self.db.pager.header();
        header.trigram_root = root;
        self.db.pager.set_header(header);
    }

    /// Buffer trigram additions for `field` under (table, row_id). Applied
    /// to the paged postings at checkpoint, not at commit.
    pub fn trigram_record(&mut self, table: &str, row_id: u64, field: &str) {
        for trigram in distinct_trigrams(field) {
            self.trigram_local
                .entry((table.to_string(), trigram))
                .or_default()
                .record_add(row_id);
        }
    }

    /// Buffer trigram removals for a deleted or rewritten field value.
    pub fn trigram_remove(&mut self, table: &str, row_id: u64, field: &str) {
        for trigram in distinct_trigrams(field) {
            self.trigram_local
                .entry((table.to_string(), trigram))
                .or_default()
                .record_remove(row_id);
        }
    }

    /// Commit: dirty pages (freelist chain and header included) ride the
    /// WAL, the commit marker goes durable, the versions land in the cache,
    /// and only then is the write lock released.
    pub fn commit(mut self) -> Result<Lsn> {
        let lsn = self.commit_inner();
        let db = self.db;
        let run_checkpoint =
            lsn.is_ok() && self.auto_checkpoint && self.checkpoint_pending;
        drop(self);
        if run_checkpoint {
            if let Err(e) = db.checkpoint() {
                tracing::warn!(error = %e, "automatic checkpoint failed");
            }
        }
        lsn
    }

    fn commit_inner(&mut self) -> Result<Lsn> {
        if self.db.is_read_only() {
            self.abort_inner();
            return Err(DecentError::Transaction(
                "database is read-only after a corruption error".into(),
            ));
        }

        // Freed pages join the freelist now, so the chain encoded below
        // already reflects them. The list is kept so a failed commit can
        // un-free them.
        for &page_id in &self.freed {
            self.db.pager.free_page(page_id);
        }

        let chain_pages = match self.db.pager.encode_freelist() {
            Ok(pages) => pages,
            Err(e) => {
                self.abort_inner();
                return Err(e);
            }
        };
        for page in chain_pages {
            self.dirty.insert(page.id(), page);
        }
        let header_page = self.db.pager.header().encode();
        self.dirty.insert(HEADER_PAGE_ID, header_page);

        // Append in page order so identical transactions produce identical
        // logs.
        let mut ids: Vec<PageId> = self.dirty.keys().copied().collect();
        ids.sort_unstable();
        let mut frame_lsns: HashMap<PageId, Lsn> = HashMap::with_capacity(ids.len());
        let appended: Result<()> = {
            let guard = self.wal_guard.as_mut().expect("guard lives until finish");
            let mut result = Ok(());
            for &page_id in &ids {
                let page = self.dirty.get_mut(&page_id).expect("id from key set");
                page.seal();
                match self.db.wal.append_page(guard, page_id, page.as_bytes()) {
                    Ok(lsn) => {
                        frame_lsns.insert(page_id, lsn);
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            result
        };
        if let Err(e) = appended {
            self.abort_inner();
            return Err(e);
        }

        let commit_result = {
            let guard = self.wal_guard.as_mut().expect("guard lives until finish");
            self.db.wal.commit(guard)
        };
        let commit_lsn = match commit_result {
            Ok(lsn) => lsn,
            Err(e) => {
                self.abort_inner();
                return Err(e);
            }
        };

        // Publish committed versions to the cache at their frame LSNs.
        for (page_id, page) in self.dirty.drain() {
            let lsn = frame_lsns[&page_id];
            self.db.pager.cache_install(page, lsn);
        }

        if !self.trigram_local.is_empty() {
            let mut pending = self.db.trigram.lock();
            for (key, delta) in self.trigram_local.drain() {
                pending.deltas.entry(key).or_default().merge(&delta);
            }
            pending.generation += 1;
        }

        self.checkpoint_pending = {
            let guard = self.wal_guard.as_ref().expect("guard lives until finish");
            self.db.wal.checkpoint_due(guard)
        };
        self.finished = true;
        self.wal_guard = None;
        Ok(commit_lsn)
    }

    /// Roll back: discard the WAL tail, return this transaction's
    /// allocations to the freelist, purge every touched cache entry, and
    /// drop trigram deltas, all before the write lock is released.
    pub fn rollback(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if self.finished {
            return;
        }
        if let Some(guard) = self.wal_guard.as_mut() {
            self.db.wal.rollback(guard);
        }
        // If the commit path already applied this transaction's freed set,
        // those pages are still live on disk; take them back out.
        self.db.pager.unfree_pages(&self.freed);
        for &page_id in &self.allocated {
            self.db.pager.free_page(page_id);
        }
        let touched: Vec<PageId> = self
            .dirty
            .keys()
            .copied()
            .chain(self.allocated.iter().copied())
            .collect();
        self.db.pager.cache_invalidate_all(touched);
        self.dirty.clear();
        self.allocated.clear();
        self.freed.clear();
        self.trigram_local.clear();

        // Restore the header fields a rolled-back transaction may have
        // moved. The freelist head/count revert to the last committed
        // chain (a failed commit may have re-carved them in memory); the
        // page count stays grown so extension ids never collide with
        // returned allocations.
        let mut header = self.db.pager.header();
        header.catalog_root = self.header_at_begin.catalog_root;
        header.trigram_root = self.header_at_begin.trigram_root;
        header.freelist_head = self.header_at_begin.freelist_head;
        header.freelist_count = self.header_at_begin.freelist_count;
        self.db.pager.set_header(header);

        self.finished = true;
        self.wal_guard = None;
    }
}

impl PageStore for WriteTxn<'_> {
    /// Writers see their own dirty pages, else the latest committed
    /// version.
    fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        // No re-route needed here: a checkpoint cannot truncate while this
        // transaction holds the write lock.
        let latest = self.db.wal.latest_version(page_id);
        match self.db.read_committed(page_id, latest) {
            Ok(page) => Ok(page),
            Err(e) => {
                self.db.note_error(&e);
                Err(e)
            }
        }
    }

    fn write_page(&mut self, page: Page) -> Result<()> {
        self.dirty.insert(page.id(), page);
        Ok(())
    }

    fn allocate_page(&mut self, kind: PageKind) -> Result<Page> {
        let (page_id, _grew) = self.db.pager.allocate_page()?;
        self.allocated.push(page_id);
        Ok(Page::new(page_id, self.db.pager.page_size(), kind))
    }

    fn free_page(&mut self, page_id: PageId) -> Result<()> {
        self.dirty.remove(&page_id);
        self.freed.push(page_id);
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.db.pager.page_size()
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_inner();
        }
    }
}
