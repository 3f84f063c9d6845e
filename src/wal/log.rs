/// The write-ahead log: append-only page images with commit and checkpoint
/// markers, plus the in-memory routing state for snapshot reads.
///
/// Lock order (total; release in reverse):
///   1. writer lock (`Wal::writer`)
///   2. index lock (`Wal::index`)
///   3. reader lock (`Wal::readers`)
///   4. pager header/freelist lock
///   5. pager shard locks
/// Holding a lower-numbered lock while acquiring a higher-numbered one is
/// fine; the reverse is forbidden. Checkpoint releases the writer lock for
/// its I/O phase and re-validates sampled state when it re-acquires.
///
/// Commit publishes pending index entries *before* the release-store of
/// `wal_end`; readers snapshot `wal_end` with an acquire-load, so a reader
/// that observes commit LSN C always finds C's index entries.
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{DurabilityMode, Options};
use crate::error::{DecentError, Result};
use crate::storage::page::PageId;
use crate::storage::pager::Pager;
use crate::vfs::{SyncKind, VfsFile};
use crate::wal::frame::{Frame, FrameKind, FRAME_HEADER_SIZE, FRAME_TRAILER_SIZE};
use crate::wal::recovery::RecoveredWal;
use crate::wal::{Lsn, ReaderId};

/// Approximate heap cost of one version-index entry / dirty entry, for the
/// memory-pressure checkpoint trigger.
const INDEX_ENTRY_COST: usize = 48;
const DIRTY_ENTRY_COST: usize = 32;

/// State guarded by the writer lock. A `WriteTxn` holds the guard for its
/// whole life, which is what makes the system single-writer.
pub struct WalWriterState {
    /// Next append offset.
    tail_offset: u64,
    /// End of the last commit or checkpoint marker; a rollback rewinds the
    /// tail here so dead bytes get overwritten.
    committed_tail: u64,
    next_lsn: Lsn,
    /// (page id, lsn, frame offset) appended by the open transaction, not
    /// yet published.
    pending: Vec<(PageId, Lsn, u64)>,
    commits_since_sync: u64,
    last_sync_at: Instant,
    last_checkpoint_at: Instant,
}

impl WalWriterState {
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn tail_bytes(&self) -> u64 {
        self.tail_offset
    }
}

struct WalIndex {
    /// page id -> versions sorted ascending by LSN, with frame offsets.
    versions: HashMap<PageId, Vec<(Lsn, u64)>>,
    /// page id -> latest committed version not yet flushed to the main file.
    dirty_since_checkpoint: HashMap<PageId, (Lsn, u64)>,
}

impl WalIndex {
    fn memory_estimate(&self) -> usize {
        let entries: usize = self.versions.values().map(Vec::len).sum();
        entries * INDEX_ENTRY_COST + self.dirty_since_checkpoint.len() * DIRTY_ENTRY_COST
    }
}

struct ReaderInfo {
    snapshot: Lsn,
    started_at: Instant,
    last_seen: Instant,
    warned: bool,
}

struct ReaderRegistry {
    next_id: ReaderId,
    active: HashMap<ReaderId, ReaderInfo>,
    aborted: HashSet<ReaderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOutcome {
    pub safe_lsn: Lsn,
    pub pages_flushed: usize,
    pub truncated: bool,
    pub skipped: bool,
}

pub struct Wal {
    file: Box<dyn VfsFile>,
    page_size: usize,
    durability: DurabilityMode,
    relaxed_commits: u64,
    relaxed_interval: Duration,
    checkpoint_every_bytes: u64,
    checkpoint_every: Duration,
    max_index_memory_bytes: usize,
    reader_warn: Duration,
    reader_timeout: Duration,
    writer: Mutex<WalWriterState>,
    index: Mutex<WalIndex>,
    readers: Mutex<ReaderRegistry>,
    wal_end: AtomicU64,
}

impl Wal {
    pub fn new(file: Box<dyn VfsFile>, opts: &Options, recovered: RecoveredWal) -> Self {
        let now = Instant::now();
        Wal {
            file,
            page_size: opts.page_size,
            durability: opts.durability,
            relaxed_commits: opts.relaxed_commits,
            relaxed_interval: Duration::from_millis(opts.relaxed_interval_ms),
            checkpoint_every_bytes: opts.checkpoint_every_bytes,
            checkpoint_every: Duration::from_millis(opts.checkpoint_every_ms),
            max_index_memory_bytes: opts.max_index_memory_bytes,
            reader_warn: Duration::from_millis(opts.reader_warn_ms),
            reader_timeout: Duration::from_millis(opts.reader_timeout_ms),
            writer: Mutex::new(WalWriterState {
                tail_offset: recovered.tail_offset,
                committed_tail: recovered.tail_offset,
                next_lsn: recovered.next_lsn,
                pending: Vec::new(),
                commits_since_sync: 0,
                last_sync_at: now,
                last_checkpoint_at: now,
            }),
            index: Mutex::new(WalIndex {
                versions: recovered.index,
                dirty_since_checkpoint: recovered.dirty_since_checkpoint,
            }),
            readers: Mutex::new(ReaderRegistry {
                next_id: 1,
                active: HashMap::new(),
                aborted: HashSet::new(),
            }),
            wal_end: AtomicU64::new(recovered.wal_end),
        }
    }

    pub fn wal_end(&self) -> Lsn {
        self.wal_end.load(Ordering::Acquire)
    }

    // --- writer protocol ---

    /// Acquire the write lock. The returned guard is the writer handle;
    /// holding it is what makes the caller the single writer.
    pub fn begin_write(&self) -> MutexGuard<'_, WalWriterState> {
        self.writer.lock()
    }

    /// Append a page image for the open transaction.
    pub fn append_page(
        &self,
        w: &mut WalWriterState,
        page_id: PageId,
        image: &[u8],
    ) -> Result<Lsn> {
        if image.len() != self.page_size {
            return Err(DecentError::Internal(format!(
                "page image of {} octets, page size {}",
                image.len(),
                self.page_size
            )));
        }
        let lsn = w.next_lsn;
        let frame = Frame::page(lsn, page_id, image.to_vec());
        let offset = w.tail_offset;
        self.file.write_at(offset, &frame.encode())?;
        w.next_lsn += 1;
        w.tail_offset += frame.encoded_len() as u64;
        w.pending.push((page_id, lsn, offset));
        Ok(lsn)
    }

    /// Write the commit marker, make it durable, publish the pending
    /// entries, and advance `wal_end`. On a sync failure nothing is
    /// published and `wal_end` does not move.
    pub fn commit(&self, w: &mut WalWriterState) -> Result<Lsn> {
        let commit_lsn = w.next_lsn;
        let frame = Frame::commit(commit_lsn);
        self.file.write_at(w.tail_offset, &frame.encode())?;
        w.next_lsn += 1;
        w.tail_offset += frame.encoded_len() as u64;

        if let Err(e) = self.sync_for_commit(w) {
            self.discard(w);
            return Err(e);
        }

        {
            let mut index = self.index.lock();
            for (page_id, lsn, offset) in w.pending.drain(..) {
                let versions = index.versions.entry(page_id).or_default();
                debug_assert!(versions.last().map_or(true, |&(l, _)| l < lsn));
                versions.push((lsn, offset));
                index.dirty_since_checkpoint.insert(page_id, (lsn, offset));
            }
        }
        // Index must be populated before wal_end advances: readers take
        // snapshots by acquire-loading wal_end.
        self.wal_end.store(commit_lsn, Ordering::Release);
        w.committed_tail = w.tail_offset;

        self.enforce_reader_policy();
        Ok(commit_lsn)
    }

    /// Discard the open transaction's appended frames. Bytes past the last
    /// commit are dead; the tail rewinds so they get overwritten.
    pub fn rollback(&self, w: &mut WalWriterState) {
        self.discard(w);
    }

    fn discard(&self, w: &mut WalWriterState) {
        w.pending.clear();
        if w.tail_offset != w.committed_tail {
            // Dead bytes past the last commit must not be mistaken for a
            // durable commit after a crash; drop them if the OS lets us.
            let _ = self.file.truncate(w.committed_tail);
            w.tail_offset = w.committed_tail;
        }
    }

    fn sync_for_commit(&self, w: &mut WalWriterState) -> Result<()> {
        match self.durability {
            DurabilityMode::Full => self.file.sync(SyncKind::Full)?,
            DurabilityMode::Normal => self.file.sync(SyncKind::DataOnly)?,
            DurabilityMode::Relaxed => {
                w.commits_since_sync += 1;
                if w.commits_since_sync >= self.relaxed_commits
                    || w.last_sync_at.elapsed() >= self.relaxed_interval
                {
                    self.file.sync(SyncKind::DataOnly)?;
                    w.commits_since_sync = 0;
                    w.last_sync_at = Instant::now();
                }
            }
            DurabilityMode::None => {}
        }
        Ok(())
    }

    // --- reader protocol ---

    /// Register a reader and take its snapshot.
    pub fn begin_read(&self) -> (ReaderId, Lsn) {
        let mut readers = self.readers.lock();
        let id = readers.next_id;
        readers.next_id += 1;
        let snapshot = self.wal_end.load(Ordering::Acquire);
        let now = Instant::now();
        readers.active.insert(
            id,
            ReaderInfo {
                snapshot,
                started_at: now,
                last_seen: now,
                warned: false,
            },
        );
        (id, snapshot)
    }

    pub fn end_read(&self, id: ReaderId) {
        let mut readers = self.readers.lock();
        readers.active.remove(&id);
        readers.aborted.remove(&id);
    }

    /// Route a snapshot read: the single point where reader abortion takes
    /// effect. Returns the WAL version the snapshot must observe, or `None`
    /// when the read falls through to the main file. No file I/O.
    pub fn route_read(
        &self,
        page_id: PageId,
        snapshot: Lsn,
        reader_id: ReaderId,
    ) -> Result<Option<(Lsn, u64)>> {
        {
            let mut readers = self.readers.lock();
            if readers.aborted.contains(&reader_id) {
                return Err(DecentError::TransactionAborted(reader_id));
            }
            if let Some(info) = readers.active.get_mut(&reader_id) {
                info.last_seen = Instant::now();
            }
        }
        Ok(self.latest_at_or_before(page_id, snapshot))
    }

    /// Largest (lsn, offset) for `page_id` with lsn <= snapshot.
    pub fn latest_at_or_before(&self, page_id: PageId, snapshot: Lsn) -> Option<(Lsn, u64)> {
        let index = self.index.lock();
        let versions = index.versions.get(&page_id)?;
        let pos = versions.partition_point(|&(lsn, _)| lsn <= snapshot);
        if pos == 0 {
            None
        } else {
            Some(versions[pos - 1])
        }
    }

    /// Latest committed version regardless of snapshot (writer reads).
    pub fn latest_version(&self, page_id: PageId) -> Option<(Lsn, u64)> {
        let index = self.index.lock();
        index.versions.get(&page_id)?.last().copied()
    }

    /// Fetch a page image by (page, lsn, offset) previously routed from the
    /// index. Performed outside the index lock.
    pub fn read_page_frame(&self, page_id: PageId, lsn: Lsn, offset: u64) -> Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_at(offset, &mut header)?;
        let len = u32::from_le_bytes(header[13..17].try_into().unwrap()) as usize;
        if header[0] != 1 || len != self.page_size {
            return Err(DecentError::Wal(format!(
                "frame at offset {} is not a page frame of {} octets",
                offset, self.page_size
            )));
        }
        let got_lsn = u64::from_le_bytes(header[1..9].try_into().unwrap());
        let got_page = u32::from_le_bytes(header[9..13].try_into().unwrap());
        if got_lsn != lsn || got_page != page_id {
            return Err(DecentError::Wal(format!(
                "frame at offset {} carries page {} at LSN {}, expected page {} at LSN {}",
                offset, got_page, got_lsn, page_id, lsn
            )));
        }
        let mut rest = vec![0u8; len + FRAME_TRAILER_SIZE];
        self.file.read_at(offset + FRAME_HEADER_SIZE as u64, &mut rest)?;
        let stored_crc = u32::from_le_bytes(rest[len..].try_into().unwrap());
        let mut crc = crc32c::crc32c(&header);
        crc = crc32c::crc32c_append(crc, &rest[..len]);
        if stored_crc != crc {
            return Err(DecentError::Corruption(format!(
                "WAL frame CRC mismatch for page {} at LSN {}",
                page_id, lsn
            )));
        }
        rest.truncate(len);
        Ok(rest)
    }

    /// `get_page_at_or_before` from the storage contract: route, then read.
    pub fn get_page_at_or_before(
        &self,
        page_id: PageId,
        snapshot: Lsn,
        reader_id: ReaderId,
    ) -> Result<Option<(Lsn, Vec<u8>)>> {
        match self.route_read(page_id, snapshot, reader_id)? {
            None => Ok(None),
            Some((lsn, offset)) => {
                let image = self.read_page_frame(page_id, lsn, offset)?;
                Ok(Some((lsn, image)))
            }
        }
    }

    // --- reader lifetime policy ---

    /// Warn about and abort long-lived readers. Invoked from writer-side
    /// entry points (commit, checkpoint); an idle database ages nobody out,
    /// and sustained write load is exactly when a stuck reader would
    /// otherwise pin the WAL forever.
    pub fn enforce_reader_policy(&self) {
        let now = Instant::now();
        let mut readers = self.readers.lock();
        let mut to_abort = Vec::new();
        for (&id, info) in readers.active.iter_mut() {
            let age = now.duration_since(info.started_at);
            if age >= self.reader_timeout {
                to_abort.push(id);
            } else if age >= self.reader_warn && !info.warned {
                info.warned = true;
                tracing::warn!(reader = id, age_ms = age.as_millis() as u64,
                    "long-running reader");
            }
        }
        for id in to_abort {
            readers.active.remove(&id);
            readers.aborted.insert(id);
            tracing::warn!(reader = id, "reader exceeded lifetime, aborted");
        }
    }

    pub fn active_readers(&self) -> usize {
        self.readers.lock().active.len()
    }

    fn min_active_snapshot(&self) -> Option<Lsn> {
        let readers = self.readers.lock();
        readers.active.values().map(|info| info.snapshot).min()
    }

    // --- checkpoint ---

    /// Should a checkpoint run now? Evaluated by the caller while it still
    /// holds the writer guard.
    pub fn checkpoint_due(&self, w: &WalWriterState) -> bool {
        if w.tail_offset > self.checkpoint_every_bytes {
            return true;
        }
        if w.last_checkpoint_at.elapsed() >= self.checkpoint_every {
            return true;
        }
        self.index.lock().memory_estimate() > self.max_index_memory_bytes
    }

    /// Flush committed WAL page versions up to the safe LSN into the main
    /// file, then truncate or prune.
    ///
    /// Steps: (1) sample wal_end and the oldest reader
    /// snapshot under the write lock; (2) snapshot the flush set from
    /// dirty_since_checkpoint; (3) make a CheckpointIntent durable, release
    /// the write lock; (4) copy each flushed version to its home offset,
    /// invalidating stale cache frames; (5) sync the main file, persist
    /// header.last_checkpoint_lsn, sync again; (6) re-acquire the write
    /// lock, re-validate, truncate if every commit is flushed and every
    /// reader is current, else prune flushed index entries; (7) make a
    /// CheckpointComplete durable.
    pub fn checkpoint(&self, pager: &Pager) -> Result<CheckpointOutcome> {
        // Step 1: sample under the write lock.
        let mut w = self.writer.lock();
        self.enforce_reader_policy();
        let last_commit = self.wal_end.load(Ordering::Acquire);
        let safe_lsn = match self.min_active_snapshot() {
            Some(snapshot) => std::cmp::min(last_commit, snapshot),
            None => last_commit,
        };

        // Step 2: immutable flush snapshot.
        let to_flush: Vec<(PageId, Lsn, u64)> = {
            let index = self.index.lock();
            index
                .dirty_since_checkpoint
                .iter()
                .filter(|&(_, &(lsn, _))| lsn <= safe_lsn)
                .map(|(&page_id, &(lsn, offset))| (page_id, lsn, offset))
                .collect()
        };

        if to_flush.is_empty() {
            // Nothing to copy. Only proceed if the pass could at least
            // truncate; otherwise the markers would just grow the log.
            let all_current = {
                let readers = self.readers.lock();
                readers
                    .active
                    .values()
                    .all(|info| info.snapshot >= last_commit)
            };
            let can_truncate = w.tail_offset > 0 && safe_lsn == last_commit && all_current;
            if !can_truncate {
                return Ok(CheckpointOutcome {
                    safe_lsn,
                    pages_flushed: 0,
                    truncated: false,
                    skipped: true,
                });
            }
        }

        // Step 3: durable intent, then release the write lock for the I/O.
        self.append_marker(&mut w, FrameKind::CheckpointIntent, safe_lsn)?;
        drop(w);

        // Step 4: copy to the main file. WAL reads race only with appends
        // at higher offsets, so the sampled offsets stay valid.
        for &(page_id, lsn, offset) in &to_flush {
            let image = self.read_page_frame(page_id, lsn, offset)?;
            pager.write_main_bytes(page_id, &image)?;
            pager.cache_invalidate(page_id);
        }

        // Step 5: main file durable, then the header, then durable again.
        pager.sync_main(SyncKind::Full)?;
        let mut header = pager.header();
        header.last_checkpoint_lsn = safe_lsn;
        pager.set_header(header);
        pager.write_header_to_main()?;
        pager.cache_invalidate(crate::storage::pager::HEADER_PAGE_ID);
        pager.sync_main(SyncKind::Full)?;

        // Step 6: re-acquire and re-validate against current state.
        let mut w = self.writer.lock();
        let wal_end_now = self.wal_end.load(Ordering::Acquire);
        let all_readers_current = {
            let readers = self.readers.lock();
            readers
                .active
                .values()
                .all(|info| info.snapshot >= wal_end_now)
        };
        let everything_flushed = wal_end_now == safe_lsn;
        let truncated = if everything_flushed && all_readers_current {
            let mut index = self.index.lock();
            index.versions.clear();
            index.dirty_since_checkpoint.clear();
            drop(index);
            self.file.truncate(0)?;
            w.tail_offset = 0;
            w.committed_tail = 0;
            true
        } else {
            // Leave the WAL bytes intact for readers still on older
            // snapshots; prune only what was flushed.
            let mut index = self.index.lock();
            for &(page_id, _, _) in &to_flush {
                if let Some(versions) = index.versions.get_mut(&page_id) {
                    versions.retain(|&(lsn, _)| lsn > safe_lsn);
                }
                if index.versions.get(&page_id).is_some_and(Vec::is_empty) {
                    index.versions.remove(&page_id);
                }
            }
            index
                .dirty_since_checkpoint
                .retain(|_, &mut (lsn, _)| lsn > safe_lsn);
            false
        };

        // Step 7: durable completion marker.
        self.append_marker(&mut w, FrameKind::CheckpointComplete, safe_lsn)?;
        w.last_checkpoint_at = Instant::now();
        tracing::debug!(
            safe_lsn,
            pages = to_flush.len(),
            truncated,
            "checkpoint complete"
        );
        Ok(CheckpointOutcome {
            safe_lsn,
            pages_flushed: to_flush.len(),
            truncated,
            skipped: false,
        })
    }

    fn append_marker(&self, w: &mut WalWriterState, kind: FrameKind, safe_lsn: Lsn) -> Result<()> {
        let lsn = w.next_lsn;
        let frame = match kind {
            FrameKind::CheckpointIntent => Frame::checkpoint_intent(lsn, safe_lsn),
            FrameKind::CheckpointComplete => Frame::checkpoint_complete(lsn, safe_lsn),
            _ => return Err(DecentError::Internal("not a checkpoint marker".into())),
        };
        self.file.write_at(w.tail_offset, &frame.encode())?;
        self.file.sync(SyncKind::DataOnly)?;
        w.next_lsn += 1;
        w.tail_offset += frame.encoded_len() as u64;
        // Markers are anchored: a later rollback must not rewind past them.
        w.committed_tail = w.tail_offset;
        Ok(())
    }
}
