use crate::error::{DecentError, Result};

/// How hard commits push bytes toward stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync (data + metadata) on every commit.
    Full,
    /// fdatasync on every commit.
    Normal,
    /// Sync once every `relaxed_commits` commits or `relaxed_interval_ms`,
    /// whichever trips first.
    Relaxed,
    /// Never sync. Testing only.
    None,
}

/// Database open/create options.
///
/// `page_size` is fixed at creation and immutable afterwards; on open the
/// value stored in the header wins over whatever the options carry.
#[derive(Debug, Clone)]
pub struct Options {
    /// Page size in octets. Power of two, 4096 or 8192.
    pub page_size: usize,
    /// Upper bound on buffer-pool residency, in pages.
    pub cache_pages: usize,
    /// Shard count for the page cache. Power of two.
    pub cache_shards: usize,
    pub durability: DurabilityMode,
    /// Commits between syncs in `Relaxed` mode.
    pub relaxed_commits: u64,
    /// Milliseconds between syncs in `Relaxed` mode.
    pub relaxed_interval_ms: u64,
    /// Checkpoint when the WAL file exceeds this many bytes.
    pub checkpoint_every_bytes: u64,
    /// Checkpoint when this much time has passed since the last one.
    pub checkpoint_every_ms: u64,
    /// Checkpoint when the WAL index memory estimate exceeds this.
    pub max_index_memory_bytes: usize,
    /// Warn about readers older than this.
    pub reader_warn_ms: u64,
    /// Abort readers older than this.
    pub reader_timeout_ms: u64,
}

pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 8192;

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: MIN_PAGE_SIZE,
            cache_pages: 1024,
            cache_shards: 16,
            durability: DurabilityMode::Full,
            relaxed_commits: 32,
            relaxed_interval_ms: 200,
            checkpoint_every_bytes: 16 * 1024 * 1024,
            checkpoint_every_ms: 60_000,
            max_index_memory_bytes: 8 * 1024 * 1024,
            reader_warn_ms: 10_000,
            reader_timeout_ms: 60_000,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(DecentError::Invalid(format!(
                "page_size must be a power of two in [{}, {}], got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if !self.cache_shards.is_power_of_two() || self.cache_shards == 0 {
            return Err(DecentError::Invalid(format!(
                "cache_shards must be a non-zero power of two, got {}",
                self.cache_shards
            )));
        }
        if self.cache_pages < self.cache_shards {
            return Err(DecentError::Invalid(format!(
                "cache_pages ({}) must be at least cache_shards ({})",
                self.cache_pages, self.cache_shards
            )));
        }
        if self.reader_warn_ms > self.reader_timeout_ms {
            return Err(DecentError::Invalid(
                "reader_warn_ms must not exceed reader_timeout_ms".into(),
            ));
        }
        Ok(())
    }
}
