/// Crash recovery: rebuild the WAL's in-memory state from the log file.
///
/// Frames are scanned from offset 0. Page frames buffer as pending until a
/// Commit frame publishes them; a torn or garbage tail ends the scan (the
/// frame reader reports mid-log corruption as a hard error so committed
/// frames are never silently dropped). Running recovery twice over the same
/// file produces identical state.
use std::collections::HashMap;

use crate::error::{DecentError, Result};
use crate::storage::page::PageId;
use crate::vfs::VfsFile;
use crate::wal::frame::{FrameKind, FrameReader};
use crate::wal::Lsn;

/// In-memory WAL state reconstructed from the log.
#[derive(Debug, Default)]
pub struct RecoveredWal {
    /// page id -> versions sorted by LSN, with their file offsets.
    pub index: HashMap<PageId, Vec<(Lsn, u64)>>,
    /// page id -> latest committed version not yet flushed to the main file.
    pub dirty_since_checkpoint: HashMap<PageId, (Lsn, u64)>,
    /// Last committed LSN; 0 when the log holds no commit.
    pub wal_end: Lsn,
    /// Next LSN to assign. Exceeds every LSN seen, committed or not.
    pub next_lsn: Lsn,
    /// End of the last anchored frame (commit or checkpoint marker); bytes
    /// past this point are dead and will be overwritten.
    pub tail_offset: u64,
    /// Highest CheckpointComplete safe LSN, 0 if none.
    pub last_checkpoint_complete: Lsn,
    /// A CheckpointIntent without a matching Complete: the checkpoint must
    /// be replayed from its I/O step.
    pub pending_checkpoint: Option<Lsn>,
    /// True when the scan saw at least one frame.
    pub any_frames: bool,
    pub commits_replayed: u64,
}

pub fn recover(file: &dyn VfsFile, page_size: usize) -> Result<RecoveredWal> {
    let mut reader = FrameReader::new(file, page_size)?;
    let mut out = RecoveredWal {
        next_lsn: 1,
        ..RecoveredWal::default()
    };
    let mut pending: Vec<(PageId, Lsn, u64)> = Vec::new();
    let mut frame_start = reader.offset();

    while let Some(frame) = reader.next()? {
        out.any_frames = true;
        if frame.lsn >= out.next_lsn {
            out.next_lsn = frame.lsn + 1;
        }
        match frame.kind {
            FrameKind::Page => {
                if frame.payload.len() != page_size {
                    return Err(DecentError::Wal(format!(
                        "page frame at LSN {} carries {} octets, page size is {}",
                        frame.lsn,
                        frame.payload.len(),
                        page_size
                    )));
                }
                pending.push((frame.page_id, frame.lsn, frame_start));
            }
            FrameKind::Commit => {
                for (page_id, lsn, offset) in pending.drain(..) {
                    let versions = out.index.entry(page_id).or_default();
                    debug_assert!(versions.last().map_or(true, |&(l, _)| l < lsn));
                    versions.push((lsn, offset));
                    out.dirty_since_checkpoint.insert(page_id, (lsn, offset));
                }
                out.wal_end = frame.lsn;
                out.tail_offset = reader.offset();
                out.commits_replayed += 1;
            }
            FrameKind::CheckpointIntent => {
                out.pending_checkpoint = Some(frame.safe_lsn()?);
                out.tail_offset = reader.offset();
            }
            FrameKind::Checkpoint | FrameKind::CheckpointComplete => {
                let safe_lsn = frame.safe_lsn()?;
                apply_checkpoint_complete(&mut out, safe_lsn);
                out.tail_offset = reader.offset();
            }
        }
        frame_start = reader.offset();
    }

    // Uncommitted page frames at the tail are dead; their offsets sit past
    // tail_offset and will be overwritten by the next append.
    if !pending.is_empty() {
        tracing::debug!(
            frames = pending.len(),
            "discarding uncommitted page frames at WAL tail"
        );
    }

    tracing::debug!(
        wal_end = out.wal_end,
        commits = out.commits_replayed,
        pages = out.index.len(),
        checkpoint = out.last_checkpoint_complete,
        "WAL recovery complete"
    );
    Ok(out)
}

fn apply_checkpoint_complete(out: &mut RecoveredWal, safe_lsn: Lsn) {
    if safe_lsn > out.last_checkpoint_complete {
        out.last_checkpoint_complete = safe_lsn;
    }
    if out
        .pending_checkpoint
        .is_some_and(|intent| intent <= safe_lsn)
    {
        out.pending_checkpoint = None;
    }
    // Pages whose latest committed version is at or below the safe LSN are
    // known to live on the main file; their WAL versions are obsolete.
    out.index.retain(|page_id, versions| {
        let latest = versions.last().map(|&(l, _)| l).unwrap_or(0);
        if latest <= safe_lsn {
            out.dirty_since_checkpoint.remove(page_id);
            return false;
        }
        versions.retain(|&(l, _)| l > safe_lsn);
        true
    });
    out.dirty_since_checkpoint
        .retain(|_, &mut (lsn, _)| lsn > safe_lsn);
}
