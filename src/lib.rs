//! DecentDB: embedded single-writer/multi-reader relational storage core.
//!
//! A paged main file with a shard-striped clock cache, a write-ahead log
//! with commit markers and checkpointing, snapshot isolation keyed by log
//! sequence numbers, a variable-key B+Tree with overflow chains, and a
//! trigram inverted index for substring search.
//!
//! One `Database` supports one writer at a time (serialized by the WAL
//! write lock, expressed as `WriteTxn` owning the lock guard) and any
//! number of concurrent snapshot readers. A single transaction handle is
//! not meant to be shared across threads; open one per thread.

pub mod btree;
pub mod config;
pub mod error;
pub mod storage;
pub mod trigram;
pub mod tx;
pub mod vfs;
pub mod wal;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;

pub use crate::config::{DurabilityMode, Options};
pub use crate::error::{DecentError, Result};
pub use crate::storage::page::{Page, PageId, PageKind};
pub use crate::storage::page_store::PageStore;
pub use crate::storage::pager::{DbHeader, FreelistStats};
pub use crate::tx::{ReadTxn, WriteTxn};
pub use crate::wal::log::CheckpointOutcome;
pub use crate::wal::Lsn;

use crate::storage::freelist::FreeList;
use crate::storage::page::{PAGE_HEADER_SIZE, PAGE_MAGIC};
use crate::storage::pager::{Pager, HEADER_PAGE_ID};
use crate::trigram::index::{TrigramDelta, TrigramIndex, TrigramStats};
use crate::vfs::{OpenMode, StdVfs, SyncKind, Vfs, VfsFile};
use crate::wal::log::Wal;
use crate::wal::recovery;

/// Trigram deltas committed but not yet flushed into paged postings. The
/// generation counter is the commit-time trigram-change marker; a gap
/// between `generation` and `flushed_generation` after a crash means the
/// index is stale and wants `index_rebuild`.
pub(crate) struct TrigramPending {
    pub(crate) deltas: HashMap<(String, String), TrigramDelta>,
    pub(crate) generation: u64,
    pub(crate) flushed_generation: u64,
}

/// An open database. See the crate docs for the concurrency contract.
pub struct Database {
    pub(crate) pager: Pager,
    pub(crate) wal: Wal,
    pub(crate) trigram: Mutex<TrigramPending>,
    read_only: AtomicBool,
    lock_file: std::fs::File,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

fn wal_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

fn lock_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("lock")
}

/// Acquire the per-database process lock.
fn acquire_lock(db_path: &Path) -> Result<std::fs::File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path(db_path))?;
    file.try_lock_exclusive().map_err(|e| {
        DecentError::Lock(format!(
            "database {} is locked by another process: {}",
            db_path.display(),
            e
        ))
    })?;
    Ok(file)
}

/// Read the page size out of the header page before the pager exists.
fn peek_page_size(file: &dyn VfsFile) -> Result<usize> {
    let mut buf = [0u8; PAGE_HEADER_SIZE + 8];
    file.read_at(0, &mut buf)
        .map_err(|_| DecentError::Corruption("header page is unreadable".into()))?;
    if &buf[0..4] != PAGE_MAGIC || buf[4] != PageKind::Header.as_u8() {
        return Err(DecentError::Corruption(
            "file does not start with a database header page".into(),
        ));
    }
    let page_size = u32::from_le_bytes(
        buf[PAGE_HEADER_SIZE + 4..PAGE_HEADER_SIZE + 8]
            .try_into()
            .unwrap(),
    ) as usize;
    if !page_size.is_power_of_two()
        || page_size < config::MIN_PAGE_SIZE
        || page_size > config::MAX_PAGE_SIZE
    {
        return Err(DecentError::Corruption(format!(
            "header claims page size {}",
            page_size
        )));
    }
    Ok(page_size)
}

impl Database {
    /// Create a new database at `path`.
    pub fn create(path: &Path, opts: Options) -> Result<Self> {
        Self::create_with_vfs(&StdVfs, path, opts)
    }

    /// Open an existing database, running WAL recovery first.
    pub fn open(path: &Path, opts: Options) -> Result<Self> {
        Self::open_with_vfs(&StdVfs, path, opts)
    }

    /// Create against a specific VFS (fault-injection tests).
    pub fn create_with_vfs(vfs: &dyn Vfs, path: &Path, opts: Options) -> Result<Self> {
        opts.validate()?;
        let lock_file = acquire_lock(path)?;

        let main = vfs.open(path, OpenMode::ReadWrite, true)?;
        if main.len()? != 0 {
            return Err(DecentError::Invalid(format!(
                "{} already exists",
                path.display()
            )));
        }
        let pager = Pager::create(main, &opts)?;

        let wal_file = vfs.open(&wal_path(path), OpenMode::ReadWrite, true)?;
        wal_file.truncate(0)?;
        let recovered = recovery::recover(&*wal_file, opts.page_size)?;
        let wal = Wal::new(wal_file, &opts, recovered);

        Ok(Database {
            pager,
            wal,
            trigram: Mutex::new(TrigramPending {
                deltas: HashMap::new(),
                generation: 0,
                flushed_generation: 0,
            }),
            read_only: AtomicBool::new(false),
            lock_file,
            db_path: path.to_path_buf(),
        })
    }

    /// Open against a specific VFS (fault-injection tests).
    pub fn open_with_vfs(vfs: &dyn Vfs, path: &Path, opts: Options) -> Result<Self> {
        opts.validate()?;
        let lock_file = acquire_lock(path)?;

        let main = vfs.open(path, OpenMode::ReadWrite, false)?;
        let page_size = peek_page_size(&*main)?;
        let mut eff_opts = opts;
        eff_opts.page_size = page_size;

        let wal_file = vfs.open(&wal_path(path), OpenMode::ReadWrite, true)?;
        let recovered = recovery::recover(&*wal_file, page_size)?;
        let any_frames = recovered.any_frames;
        let last_complete = recovered.last_checkpoint_complete;
        let pending_checkpoint = recovered.pending_checkpoint;
        let commits = recovered.commits_replayed;
        let wal = Wal::new(wal_file, &eff_opts, recovered);

        // The authoritative header is the latest committed version: the
        // newest WAL image of page 1, else the main file's.
        let header_page = match wal.latest_version(HEADER_PAGE_ID) {
            Some((lsn, offset)) => {
                let image = wal.read_page_frame(HEADER_PAGE_ID, lsn, offset)?;
                Page::from_bytes(HEADER_PAGE_ID, image.into_boxed_slice())?
            }
            None => {
                let mut buf = vec![0u8; page_size];
                main.read_at(0, &mut buf)?;
                Page::from_bytes(HEADER_PAGE_ID, buf.into_boxed_slice())?
            }
        };
        let mut header = DbHeader::decode(&header_page)?;
        if any_frames && header.last_checkpoint_lsn > last_complete {
            return Err(DecentError::Corruption(format!(
                "header claims checkpoint LSN {} but the WAL completes only {}",
                header.last_checkpoint_lsn, last_complete
            )));
        }
        if header.last_checkpoint_lsn < last_complete {
            header.last_checkpoint_lsn = last_complete;
        }

        let pager = Pager::open_with(main, &eff_opts, header, FreeList::new());
        let db = Database {
            pager,
            wal,
            trigram: Mutex::new(TrigramPending {
                deltas: HashMap::new(),
                generation: 0,
                flushed_generation: 0,
            }),
            read_only: AtomicBool::new(false),
            lock_file,
            db_path: path.to_path_buf(),
        };

        // Walk the freelist through the WAL overlay; reconcile the header
        // count against what the chain actually holds.
        let freelist = FreeList::load(header.freelist_head, |id| {
            db.read_committed(id, db.wal.latest_version(id))
        })?;
        if freelist.len() as u64 != header.freelist_count {
            tracing::warn!(
                header = header.freelist_count,
                walked = freelist.len() as u64,
                "freelist count mismatch, repairing header"
            );
            db.pager.install_freelist(freelist);
            db.pager.write_header_to_main()?;
            db.pager.sync_main(SyncKind::Full)?;
        } else {
            db.pager.install_freelist(freelist);
        }

        // The catalog root must decode cleanly before the database opens.
        if header.catalog_root != 0 {
            db.read_committed(
                header.catalog_root,
                db.wal.latest_version(header.catalog_root),
            )?;
        }

        // An intent without a completion means the checkpoint I/O phase
        // must be replayed.
        if pending_checkpoint.is_some() {
            db.wal.checkpoint(&db.pager)?;
        }

        tracing::debug!(
            path = %path.display(),
            commits,
            "database opened"
        );
        Ok(db)
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn note_error(&self, e: &DecentError) {
        if e.is_corruption() {
            self.read_only.store(true, Ordering::Release);
            tracing::warn!(error = %e, "corruption detected, database is now read-only");
        }
    }

    /// Begin a snapshot reader.
    pub fn begin_ro(&self) -> ReadTxn<'_> {
        let (reader_id, snapshot) = self.wal.begin_read();
        ReadTxn::new(self, reader_id, snapshot)
    }

    /// Begin the write transaction. Blocks while another writer is active.
    pub fn begin_rw(&self) -> Result<WriteTxn<'_>> {
        self.begin_rw_with(true)
    }

    fn begin_rw_with(&self, auto_checkpoint: bool) -> Result<WriteTxn<'_>> {
        if self.is_read_only() {
            return Err(DecentError::Transaction(
                "database is read-only after a corruption error".into(),
            ));
        }
        Ok(WriteTxn::new(self, self.wal.begin_write(), auto_checkpoint))
    }

    /// Resolve a page to the given committed version (or the main file)
    /// through the cache. Does not poison the database itself: the caller
    /// decides whether a failure here is final (readers re-route once,
    /// since a truncating checkpoint can retire a routed WAL offset
    /// between the route and the file read).
    pub(crate) fn read_committed(
        &self,
        page_id: PageId,
        version: Option<(Lsn, u64)>,
    ) -> Result<Page> {
        let expected_lsn = version.map(|(lsn, _)| lsn).unwrap_or(0);
        if let Some(pinned) = self.pager.cache_get(page_id, expected_lsn) {
            return Ok(pinned.page().clone());
        }
        let page = match version {
            Some((lsn, offset)) => self
                .wal
                .read_page_frame(page_id, lsn, offset)
                .and_then(|image| Page::from_bytes(page_id, image.into_boxed_slice()))?,
            None => self.pager.read_main(page_id)?,
        };
        self.pager.cache_install(page.clone(), expected_lsn);
        Ok(page)
    }

    /// Flush committed trigram deltas into paged postings, then run the
    /// WAL checkpoint protocol against the main file.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.flush_trigram_deltas()?;
        match self.wal.checkpoint(&self.pager) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    fn flush_trigram_deltas(&self) -> Result<()> {
        let (pending, generation) = {
            let mut state = self.trigram.lock();
            if state.deltas.is_empty() {
                return Ok(());
            }
            (std::mem::take(&mut state.deltas), state.generation)
        };

        let result = (|| -> Result<()> {
            let mut txn = self.begin_rw_with(false)?;
            let root = txn.trigram_root();
            let mut index = if root == 0 {
                TrigramIndex::create(&mut txn)?
            } else {
                TrigramIndex::open(root)
            };
            for ((table, trigram), delta) in &pending {
                index.apply_delta(&mut txn, table, trigram, delta)?;
            }
            txn.set_trigram_root(index.root_page_id());
            txn.commit()?;
            Ok(())
        })();

        let mut state = self.trigram.lock();
        match result {
            Ok(()) => {
                state.flushed_generation = generation;
                Ok(())
            }
            Err(e) => {
                // Put the unflushed deltas back, oldest first, under any
                // deltas committed while the flush ran.
                for (key, old_delta) in pending {
                    match state.deltas.remove(&key) {
                        Some(newer) => {
                            let mut merged = old_delta;
                            merged.merge(&newer);
                            state.deltas.insert(key, merged);
                        }
                        None => {
                            state.deltas.insert(key, old_delta);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Rebuild the trigram index from scratch. `docs` supplies every
    /// indexed (table, row id, field text); pending deltas are superseded.
    pub fn index_rebuild<I>(&self, docs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, u64, String)>,
    {
        {
            let mut state = self.trigram.lock();
            state.deltas.clear();
            state.flushed_generation = state.generation;
        }
        let mut txn = self.begin_rw_with(false)?;
        let old_root = txn.trigram_root();
        if old_root != 0 {
            let old_index = TrigramIndex::open(old_root);
            for page_id in old_index.collect_pages(&mut txn)? {
                txn.free_page(page_id)?;
            }
        }
        let mut index = TrigramIndex::create(&mut txn)?;
        index.rebuild(&mut txn, docs)?;
        txn.set_trigram_root(index.root_page_id());
        txn.commit()?;
        Ok(())
    }

    /// Operator view of the freelist.
    pub fn freelist_stats(&self) -> FreelistStats {
        self.pager.freelist_stats()
    }

    /// Operator view of the trigram index.
    pub fn trigram_stats(&self) -> Result<TrigramStats> {
        let mut txn = self.begin_ro();
        let root = {
            let page = txn.read_page(HEADER_PAGE_ID)?;
            DbHeader::decode(&page)?.trigram_root
        };
        if root == 0 {
            return Ok(TrigramStats::default());
        }
        TrigramIndex::open(root).stats(&mut txn)
    }

    pub fn active_readers(&self) -> usize {
        self.wal.active_readers()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}
