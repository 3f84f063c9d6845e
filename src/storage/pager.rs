/// Pager: the main database file plus a shard-striped page cache with
/// clock eviction.
///
/// The cache only ever holds committed page versions, each frame tagged
/// with the LSN of the version it caches (0 for the main-file image). The
/// active writer's dirty pages live in its transaction buffer, never here,
/// so eviction can only drop clean committed copies and the main file is
/// never touched outside the checkpoint path.
///
/// Lock order within this module: meta (header/freelist) before any shard
/// lock. Shard locks are held only for map/ring operations; frame contents
/// are immutable once installed (a newer version replaces the frame, it is
/// never patched in place), so no content lock is required and pinned
/// readers keep the old frame alive through its `Arc`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Options;
use crate::error::{DecentError, Result};
use crate::storage::freelist::FreeList;
use crate::storage::page::{Page, PageId, PageKind, NIL_PAGE};
use crate::vfs::{SyncKind, VfsFile};
use crate::wal::Lsn;

pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_PAGE_ID: PageId = 1;

/// Database header, stored in page 1's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub format_version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub catalog_root: PageId,
    pub freelist_head: PageId,
    pub freelist_count: u64,
    pub last_checkpoint_lsn: Lsn,
    pub trigram_root: PageId,
}

impl DbHeader {
    pub fn new(page_size: u32) -> Self {
        DbHeader {
            format_version: FORMAT_VERSION,
            page_size,
            page_count: 1,
            catalog_root: NIL_PAGE,
            freelist_head: NIL_PAGE,
            freelist_count: 0,
            last_checkpoint_lsn: 0,
            trigram_root: NIL_PAGE,
        }
    }

    pub fn encode(&self) -> Page {
        let mut page = Page::new(HEADER_PAGE_ID, self.page_size as usize, PageKind::Header);
        let payload = page.payload_mut();
        payload[0..4].copy_from_slice(&self.format_version.to_le_bytes());
        payload[4..8].copy_from_slice(&self.page_size.to_le_bytes());
        payload[8..12].copy_from_slice(&self.page_count.to_le_bytes());
        payload[12..16].copy_from_slice(&self.catalog_root.to_le_bytes());
        payload[16..20].copy_from_slice(&self.freelist_head.to_le_bytes());
        payload[20..28].copy_from_slice(&self.freelist_count.to_le_bytes());
        payload[28..36].copy_from_slice(&self.last_checkpoint_lsn.to_le_bytes());
        payload[36..40].copy_from_slice(&self.trigram_root.to_le_bytes());
        page.seal();
        page
    }

    pub fn decode(page: &Page) -> Result<Self> {
        if page.kind() != PageKind::Header {
            return Err(DecentError::Corruption(format!(
                "page 1 has kind {:?}, expected header",
                page.kind()
            )));
        }
        let payload = page.payload();
        let header = DbHeader {
            format_version: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            page_size: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
            page_count: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
            catalog_root: u32::from_le_bytes(payload[12..16].try_into().unwrap()),
            freelist_head: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
            freelist_count: u64::from_le_bytes(payload[20..28].try_into().unwrap()),
            last_checkpoint_lsn: u64::from_le_bytes(payload[28..36].try_into().unwrap()),
            trigram_root: u32::from_le_bytes(payload[36..40].try_into().unwrap()),
        };
        if header.format_version != FORMAT_VERSION {
            return Err(DecentError::Corruption(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        if header.page_size as usize != page.page_size() {
            return Err(DecentError::Corruption(format!(
                "header page size {} does not match file page size {}",
                header.page_size,
                page.page_size()
            )));
        }
        if header.page_count == 0 {
            return Err(DecentError::Corruption("header page_count is zero".into()));
        }
        Ok(header)
    }
}

/// A committed page version resident in the cache.
pub struct Frame {
    page_id: PageId,
    /// LSN of the version this frame caches; 0 means the main-file image.
    lsn: Lsn,
    pins: AtomicU32,
    referenced: AtomicBool,
    data: Page,
}

impl Frame {
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }
}

/// Pin guard. The frame cannot be dropped out from under the holder; clock
/// eviction skips pinned frames.
pub struct PinnedPage {
    frame: Arc<Frame>,
}

impl PinnedPage {
    pub fn page(&self) -> &Page {
        &self.frame.data
    }

    pub fn lsn(&self) -> Lsn {
        self.frame.lsn
    }
}

impl std::ops::Deref for PinnedPage {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.frame.data
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::Release);
    }
}

struct Shard {
    map: HashMap<PageId, usize>,
    ring: Vec<Option<Arc<Frame>>>,
    hand: usize,
    tombstones: usize,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Shard {
            map: HashMap::new(),
            ring: Vec::with_capacity(capacity),
            hand: 0,
            tombstones: 0,
            capacity,
        }
    }

    fn live(&self) -> usize {
        self.ring.len() - self.tombstones
    }

    fn pin(frame: &Arc<Frame>) -> PinnedPage {
        frame.pins.fetch_add(1, Ordering::Acquire);
        frame.referenced.store(true, Ordering::Relaxed);
        PinnedPage {
            frame: Arc::clone(frame),
        }
    }

    fn get(&mut self, page_id: PageId) -> Option<&Arc<Frame>> {
        let slot = *self.map.get(&page_id)?;
        self.ring[slot].as_ref()
    }

    /// Advance the clock hand, skipping pinned frames and clearing
    /// reference bits, until a victim is tombstoned. Gives up after two
    /// full sweeps (everything pinned), in which case the ring is allowed
    /// to overshoot its capacity by one.
    fn evict_one(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        let mut steps = 0;
        let limit = self.ring.len() * 2;
        while steps < limit {
            let slot = self.hand;
            self.hand = (self.hand + 1) % self.ring.len();
            steps += 1;

            let Some(frame) = self.ring[slot].as_ref() else {
                continue;
            };
            if frame.pins.load(Ordering::Acquire) > 0 {
                continue;
            }
            if frame.referenced.swap(false, Ordering::Relaxed) {
                continue;
            }
            self.map.remove(&frame.page_id);
            self.ring[slot] = None;
            self.tombstones += 1;
            return;
        }
    }

    /// Tombstone the entry for `page_id` if present.
    fn invalidate(&mut self, page_id: PageId) {
        if let Some(slot) = self.map.remove(&page_id) {
            self.ring[slot] = None;
            self.tombstones += 1;
        }
    }

    fn install(&mut self, frame: Arc<Frame>) -> PinnedPage {
        let pinned = Self::pin(&frame);
        // Replace an existing entry for the page in place.
        if let Some(&slot) = self.map.get(&frame.page_id) {
            self.ring[slot] = Some(frame);
            return pinned;
        }
        if self.live() >= self.capacity {
            self.evict_one();
        }
        // Reuse a tombstone slot when available.
        let slot = if self.tombstones > 0 {
            let slot = self
                .ring
                .iter()
                .position(|f| f.is_none())
                .expect("tombstone count tracks empty slots");
            self.tombstones -= 1;
            slot
        } else {
            self.ring.push(None);
            self.ring.len() - 1
        };
        self.map.insert(frame.page_id, slot);
        self.ring[slot] = Some(frame);
        self.maybe_compact();
        pinned
    }

    /// Compact out tombstones once they exceed a quarter of the ring.
    fn maybe_compact(&mut self) {
        if self.tombstones <= self.ring.len() / 4 {
            return;
        }
        let mut new_ring = Vec::with_capacity(self.live());
        for frame in self.ring.drain(..).flatten() {
            new_ring.push(Some(frame));
        }
        self.map.clear();
        for (slot, frame) in new_ring.iter().enumerate() {
            let frame = frame.as_ref().expect("compacted ring has no holes");
            self.map.insert(frame.page_id, slot);
        }
        self.ring = new_ring;
        self.tombstones = 0;
        self.hand = 0;
    }
}

struct Meta {
    header: DbHeader,
    freelist: FreeList,
}

/// Snapshot of freelist state for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreelistStats {
    pub free_pages: u64,
    pub chain_pages: u64,
    pub head: PageId,
}

pub struct Pager {
    file: Box<dyn VfsFile>,
    page_size: usize,
    shards: Vec<Mutex<Shard>>,
    shard_mask: u64,
    meta: Mutex<Meta>,
}

/// SplitMix64 finalizer; mixes page-id bits so sequential hot ranges spread
/// across shards.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

impl Pager {
    /// Initialize a brand-new main file: write the header page and sync.
    pub fn create(file: Box<dyn VfsFile>, opts: &Options) -> Result<Self> {
        let header = DbHeader::new(opts.page_size as u32);
        let page = header.encode();
        file.write_at(0, page.as_bytes())?;
        file.sync(SyncKind::Full)?;
        Ok(Self::assemble(file, opts, header, FreeList::new()))
    }

    /// Build a pager around an already-recovered header and freelist. The
    /// caller (database open) resolves both through the WAL overlay first.
    pub fn open_with(
        file: Box<dyn VfsFile>,
        opts: &Options,
        header: DbHeader,
        freelist: FreeList,
    ) -> Self {
        Self::assemble(file, opts, header, freelist)
    }

    fn assemble(
        file: Box<dyn VfsFile>,
        opts: &Options,
        header: DbHeader,
        freelist: FreeList,
    ) -> Self {
        let shard_count = opts.cache_shards;
        let per_shard = std::cmp::max(1, opts.cache_pages / shard_count);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        Pager {
            file,
            page_size: header.page_size as usize,
            shards,
            shard_mask: (shard_count - 1) as u64,
            meta: Mutex::new(Meta { header, freelist }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn shard_for(&self, page_id: PageId) -> &Mutex<Shard> {
        let idx = (splitmix64(page_id as u64) & self.shard_mask) as usize;
        &self.shards[idx]
    }

    // --- cache ---

    /// Cache hit only when the resident frame caches exactly the version
    /// the caller's snapshot routes to. A stale or newer frame is a miss.
    pub fn cache_get(&self, page_id: PageId, expected_lsn: Lsn) -> Option<PinnedPage> {
        let mut shard = self.shard_for(page_id).lock();
        let frame = shard.get(page_id)?;
        if frame.lsn != expected_lsn {
            return None;
        }
        Some(Shard::pin(frame))
    }

    /// Install a committed page version, evicting per the clock if the
    /// shard is at capacity.
    pub fn cache_install(&self, page: Page, lsn: Lsn) -> PinnedPage {
        let frame = Arc::new(Frame {
            page_id: page.id(),
            lsn,
            pins: AtomicU32::new(0),
            referenced: AtomicBool::new(true),
            data: page,
        });
        let mut shard = self.shard_for(frame.page_id).lock();
        shard.install(frame)
    }

    pub fn cache_invalidate(&self, page_id: PageId) {
        self.shard_for(page_id).lock().invalidate(page_id);
    }

    /// Drop every cached frame for the given pages. Used by rollback so no
    /// later reader can be served from a frame the failed transaction
    /// installed, and by checkpoint after rewriting a page's home location.
    pub fn cache_invalidate_all<I: IntoIterator<Item = PageId>>(&self, pages: I) {
        for page_id in pages {
            self.cache_invalidate(page_id);
        }
    }

    #[cfg(test)]
    fn cache_resident(&self, page_id: PageId) -> bool {
        self.shard_for(page_id).lock().get(page_id).is_some()
    }

    // --- main file I/O (checkpoint and overlay fall-through only) ---

    pub fn read_main(&self, page_id: PageId) -> Result<Page> {
        if page_id == NIL_PAGE {
            return Err(DecentError::Internal("read of nil page".into()));
        }
        let offset = (page_id as u64 - 1) * self.page_size as u64;
        let mut buf = vec![0u8; self.page_size];
        self.file.read_at(offset, &mut buf)?;
        Page::from_bytes(page_id, buf.into_boxed_slice())
    }

    /// Write raw page bytes to their home offset. Checkpoint path only.
    pub fn write_main_bytes(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size {
            return Err(DecentError::Internal(format!(
                "page write of {} bytes, page size {}",
                bytes.len(),
                self.page_size
            )));
        }
        let offset = (page_id as u64 - 1) * self.page_size as u64;
        self.file.write_at(offset, bytes)
    }

    pub fn sync_main(&self, kind: SyncKind) -> Result<()> {
        self.file.sync(kind)
    }

    // --- header and freelist ---

    pub fn header(&self) -> DbHeader {
        self.meta.lock().header
    }

    pub fn set_header(&self, header: DbHeader) {
        self.meta.lock().header = header;
    }

    /// Persist the current header directly to the main file. Only the
    /// checkpoint path and open-time self-repair may call this; everywhere
    /// else the header page rides the WAL like any other dirty page.
    pub fn write_header_to_main(&self) -> Result<()> {
        let page = self.meta.lock().header.encode();
        self.write_main_bytes(HEADER_PAGE_ID, page.as_bytes())?;
        Ok(())
    }

    /// Pop a free page, or extend the file by one page. Returns the id and
    /// whether the file grew.
    pub fn allocate_page(&self) -> Result<(PageId, bool)> {
        let mut meta = self.meta.lock();
        if let Some(id) = meta.freelist.allocate() {
            meta.header.freelist_count = meta.freelist.len() as u64;
            return Ok((id, false));
        }
        let id = meta.header.page_count + 1;
        meta.header.page_count = id;
        Ok((id, true))
    }

    pub fn free_page(&self, page_id: PageId) {
        let mut meta = self.meta.lock();
        meta.freelist.free(page_id);
        meta.header.freelist_count = meta.freelist.len() as u64;
    }

    /// Undo `free_page` calls from a commit that failed after applying its
    /// freed set: the pages are still live on disk.
    pub fn unfree_pages(&self, ids: &[PageId]) {
        let mut meta = self.meta.lock();
        meta.freelist.remove(ids);
        meta.header.freelist_count = meta.freelist.len() as u64;
    }

    /// Serialize the freelist into its page chain and update the header to
    /// match. Returns the chain pages for the committing transaction to
    /// dirty.
    pub fn encode_freelist(&self) -> Result<Vec<Page>> {
        let mut meta = self.meta.lock();
        let Meta { header, freelist } = &mut *meta;
        let (head, pages) = freelist.encode_chain(header.page_size as usize)?;
        header.freelist_head = head;
        header.freelist_count = freelist.len() as u64;
        Ok(pages)
    }

    /// Replace the in-memory freelist. Used once at open, after the chain
    /// has been walked through the WAL overlay.
    pub fn install_freelist(&self, freelist: FreeList) {
        let mut meta = self.meta.lock();
        meta.header.freelist_count = freelist.len() as u64;
        meta.freelist = freelist;
    }

    pub fn freelist_stats(&self) -> FreelistStats {
        let meta = self.meta.lock();
        FreelistStats {
            free_pages: meta.freelist.len() as u64,
            chain_pages: meta.freelist.chain_pages().len() as u64,
            head: meta.header.freelist_head,
        }
    }

    pub fn freelist_contains(&self, page_id: PageId) -> bool {
        self.meta.lock().freelist.contains(page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{OpenMode, StdVfs, Vfs};
    use tempfile::TempDir;

    fn test_pager(cache_pages: usize, shards: usize) -> (Pager, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let file = StdVfs.open(&path, OpenMode::ReadWrite, true).unwrap();
        let mut opts = Options::default();
        opts.cache_pages = cache_pages;
        opts.cache_shards = shards;
        let pager = Pager::create(file, &opts).unwrap();
        (pager, dir)
    }

    fn sealed_page(id: PageId, marker: u8) -> Page {
        let mut page = Page::new(id, 4096, PageKind::BtreeLeaf);
        page.push_cell(&[marker; 8]).unwrap();
        page.seal();
        page
    }

    #[test]
    fn create_writes_readable_header() {
        let (pager, _dir) = test_pager(64, 4);
        let page = pager.read_main(HEADER_PAGE_ID).unwrap();
        let header = DbHeader::decode(&page).unwrap();
        assert_eq!(header.page_count, 1);
        assert_eq!(header.freelist_head, NIL_PAGE);
        assert_eq!(header.last_checkpoint_lsn, 0);
    }

    #[test]
    fn cache_hit_requires_matching_lsn() {
        let (pager, _dir) = test_pager(64, 4);
        let page = sealed_page(5, 0xAA);
        pager.cache_install(page, 10);

        assert!(pager.cache_get(5, 10).is_some());
        assert!(pager.cache_get(5, 7).is_none());
        assert!(pager.cache_get(5, 11).is_none());
        assert!(pager.cache_get(6, 10).is_none());
    }

    #[test]
    fn newer_version_replaces_frame() {
        let (pager, _dir) = test_pager(64, 4);
        pager.cache_install(sealed_page(5, 0xAA), 10);
        let old = pager.cache_get(5, 10).unwrap();

        pager.cache_install(sealed_page(5, 0xBB), 20);
        assert!(pager.cache_get(5, 10).is_none());
        let new = pager.cache_get(5, 20).unwrap();
        // The pinned old frame still serves its original bytes.
        assert_eq!(old.cell(0), Some([0xAA; 8].as_slice()));
        assert_eq!(new.cell(0), Some([0xBB; 8].as_slice()));
    }

    #[test]
    fn clock_evicts_unpinned_unreferenced() {
        let (pager, _dir) = test_pager(4, 1);
        for id in 2..=6u32 {
            pager.cache_install(sealed_page(id, id as u8), 1);
        }
        // Five installs into a 4-slot shard: something was evicted.
        let resident = (2..=6u32).filter(|&id| pager.cache_resident(id)).count();
        assert!(resident <= 4);
    }

    #[test]
    fn pinned_frames_survive_eviction_pressure() {
        let (pager, _dir) = test_pager(4, 1);
        let pinned = pager.cache_install(sealed_page(2, 2), 1);
        for id in 3..=20u32 {
            pager.cache_install(sealed_page(id, id as u8), 1);
        }
        assert!(pager.cache_resident(2), "pinned frame must not be evicted");
        drop(pinned);
    }

    #[test]
    fn invalidate_removes_entry() {
        let (pager, _dir) = test_pager(64, 4);
        pager.cache_install(sealed_page(5, 1), 10);
        pager.cache_invalidate(5);
        assert!(pager.cache_get(5, 10).is_none());
    }

    #[test]
    fn allocate_extends_then_reuses_freed() {
        let (pager, _dir) = test_pager(64, 4);
        let (id_a, grew_a) = pager.allocate_page().unwrap();
        assert_eq!(id_a, 2);
        assert!(grew_a);
        let (id_b, _) = pager.allocate_page().unwrap();
        assert_eq!(id_b, 3);

        pager.free_page(id_a);
        let (id_c, grew_c) = pager.allocate_page().unwrap();
        assert_eq!(id_c, id_a);
        assert!(!grew_c);
        assert_eq!(pager.header().page_count, 3);
    }

    #[test]
    fn header_roundtrip_through_main_file() {
        let (pager, _dir) = test_pager(64, 4);
        let mut header = pager.header();
        header.catalog_root = 9;
        header.last_checkpoint_lsn = 77;
        pager.set_header(header);
        pager.write_header_to_main().unwrap();

        let decoded = DbHeader::decode(&pager.read_main(HEADER_PAGE_ID).unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn splitmix_spreads_sequential_ids() {
        let shards = 16u64;
        let mut counts = [0usize; 16];
        for id in 0..1600u64 {
            counts[(splitmix64(id) & (shards - 1)) as usize] += 1;
        }
        for &c in &counts {
            assert!(c > 50, "sequential ids skewed a shard: {:?}", counts);
        }
    }
}
