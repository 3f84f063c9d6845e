/// WAL frame codec.
///
/// Frame layout on disk:
///   [type: u8] [lsn: u64 LE] [page_id: u32 LE] [len: u32 LE] [payload] [crc32c: u32 LE]
///
/// The CRC covers everything before it. `Commit` carries an empty payload;
/// the checkpoint frames carry the safe LSN as 8 octets; `Page` carries a
/// full page image. `page_id` is zero for non-page frames.
///
/// Decoding distinguishes a torn tail (crash mid-append: tolerated, ends
/// the log) from mid-log corruption (a corrupt frame with valid frames
/// after it: hard error), following the scan-ahead discipline of the
/// recovery path.
use crate::error::{DecentError, Result};
use crate::storage::page::PageId;
use crate::vfs::VfsFile;
use crate::wal::Lsn;

pub const FRAME_HEADER_SIZE: usize = 17;
pub const FRAME_TRAILER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Page,
    Commit,
    /// Legacy alias of `CheckpointComplete`; accepted on read, never written.
    Checkpoint,
    CheckpointIntent,
    CheckpointComplete,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Page => 1,
            FrameKind::Commit => 2,
            FrameKind::Checkpoint => 3,
            FrameKind::CheckpointIntent => 4,
            FrameKind::CheckpointComplete => 5,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FrameKind::Page),
            2 => Some(FrameKind::Commit),
            3 => Some(FrameKind::Checkpoint),
            4 => Some(FrameKind::CheckpointIntent),
            5 => Some(FrameKind::CheckpointComplete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub lsn: Lsn,
    pub page_id: PageId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn page(lsn: Lsn, page_id: PageId, image: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Page,
            lsn,
            page_id,
            payload: image,
        }
    }

    pub fn commit(lsn: Lsn) -> Self {
        Frame {
            kind: FrameKind::Commit,
            lsn,
            page_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn checkpoint_intent(lsn: Lsn, safe_lsn: Lsn) -> Self {
        Frame {
            kind: FrameKind::CheckpointIntent,
            lsn,
            page_id: 0,
            payload: safe_lsn.to_le_bytes().to_vec(),
        }
    }

    pub fn checkpoint_complete(lsn: Lsn, safe_lsn: Lsn) -> Self {
        Frame {
            kind: FrameKind::CheckpointComplete,
            lsn,
            page_id: 0,
            payload: safe_lsn.to_le_bytes().to_vec(),
        }
    }

    /// Safe LSN carried by checkpoint frames.
    pub fn safe_lsn(&self) -> Result<Lsn> {
        if self.payload.len() != 8 {
            return Err(DecentError::Wal(format!(
                "checkpoint frame at LSN {} has payload of {} octets",
                self.lsn,
                self.payload.len()
            )));
        }
        Ok(u64::from_le_bytes(self.payload[..].try_into().unwrap()))
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + FRAME_TRAILER_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind.as_u8());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.page_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// What a single decode attempt found.
enum Decoded {
    Frame(Frame, u64),
    /// Structurally impossible to continue (tail reached).
    Tail,
    /// CRC/kind/shape failure where the frame boundary is still known.
    Corrupt { next_offset: u64, reason: String },
    /// Length field itself is implausible; the next boundary is unknown.
    Unbounded { reason: String },
}

/// Sequential frame reader over a WAL file with torn-tail tolerance.
pub struct FrameReader<'a> {
    file: &'a dyn VfsFile,
    offset: u64,
    file_len: u64,
    max_payload: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(file: &'a dyn VfsFile, max_payload: usize) -> Result<Self> {
        let file_len = file.len()?;
        Ok(FrameReader {
            file,
            offset: 0,
            file_len,
            max_payload,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn decode_at(&self, offset: u64) -> Result<Decoded> {
        let remaining = self.file_len.saturating_sub(offset);
        if remaining < (FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as u64 {
            return Ok(Decoded::Tail);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_at(offset, &mut header)?;
        let kind_raw = header[0];
        let lsn = u64::from_le_bytes(header[1..9].try_into().unwrap());
        let page_id = u32::from_le_bytes(header[9..13].try_into().unwrap());
        let len = u32::from_le_bytes(header[13..17].try_into().unwrap()) as usize;

        if len > self.max_payload {
            // The length field itself may be the corrupt octets, so the real
            // next-frame boundary is unknown. Tolerated only when the claim
            // occupies the exact file tail.
            if (FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE) as u64 == remaining {
                return Ok(Decoded::Tail);
            }
            return Ok(Decoded::Unbounded {
                reason: format!(
                    "frame length {} exceeds max {} at offset {}",
                    len, self.max_payload, offset
                ),
            });
        }
        let total = (FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE) as u64;
        if total > remaining {
            // Torn append.
            return Ok(Decoded::Tail);
        }

        let mut rest = vec![0u8; len + FRAME_TRAILER_SIZE];
        self.file
            .read_at(offset + FRAME_HEADER_SIZE as u64, &mut rest)?;
        let stored_crc = u32::from_le_bytes(rest[len..].try_into().unwrap());
        let mut crc = crc32c::crc32c(&header);
        crc = crc32c::crc32c_append(crc, &rest[..len]);
        let next_offset = offset + total;
        if stored_crc != crc {
            return Ok(Decoded::Corrupt {
                next_offset,
                reason: format!("frame CRC mismatch at offset {}", offset),
            });
        }
        let Some(kind) = FrameKind::from_u8(kind_raw) else {
            return Ok(Decoded::Corrupt {
                next_offset,
                reason: format!("unknown frame type {} at offset {}", kind_raw, offset),
            });
        };
        rest.truncate(len);
        Ok(Decoded::Frame(
            Frame {
                kind,
                lsn,
                page_id,
                payload: rest,
            },
            next_offset,
        ))
    }

    /// Probe forward from `offset` for any frame that fully validates.
    /// Distinguishes frame-shaped tail garbage from mid-log corruption.
    fn valid_frame_ahead(&self, mut offset: u64) -> Result<bool> {
        loop {
            match self.decode_at(offset)? {
                Decoded::Frame(..) => return Ok(true),
                Decoded::Tail | Decoded::Unbounded { .. } => return Ok(false),
                Decoded::Corrupt { next_offset, .. } => offset = next_offset,
            }
        }
    }

    /// Read the next frame. `Ok(None)` ends the log: clean EOF or a torn/
    /// garbage tail. Mid-log corruption is a hard error so committed frames
    /// are never silently dropped.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Frame>> {
        match self.decode_at(self.offset)? {
            Decoded::Frame(frame, next_offset) => {
                self.offset = next_offset;
                Ok(Some(frame))
            }
            Decoded::Tail => Ok(None),
            Decoded::Corrupt {
                next_offset,
                reason,
            } => {
                if self.valid_frame_ahead(next_offset)? {
                    Err(DecentError::Wal(format!("{} (mid-log corruption)", reason)))
                } else {
                    Ok(None)
                }
            }
            Decoded::Unbounded { reason } => {
                // Cannot establish the next boundary; a scan-ahead would
                // start inside the payload and miss real frames, so report.
                Err(DecentError::Wal(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{OpenMode, StdVfs, SyncKind, Vfs};
    use tempfile::TempDir;

    const MAX_PAYLOAD: usize = 4096;

    fn wal_file(dir: &TempDir) -> Box<dyn VfsFile> {
        StdVfs
            .open(&dir.path().join("test.wal"), OpenMode::ReadWrite, true)
            .unwrap()
    }

    fn append(file: &dyn VfsFile, frames: &[Frame]) -> u64 {
        let mut offset = file.len().unwrap();
        for frame in frames {
            let bytes = frame.encode();
            file.write_at(offset, &bytes).unwrap();
            offset += bytes.len() as u64;
        }
        file.sync(SyncKind::Full).unwrap();
        offset
    }

    #[test]
    fn encode_decode_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        append(
            &*file,
            &[
                Frame::page(1, 42, vec![0xAB; 128]),
                Frame::commit(2),
                Frame::checkpoint_intent(3, 2),
                Frame::checkpoint_complete(4, 2),
            ],
        );

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        let f1 = reader.next().unwrap().unwrap();
        assert_eq!(f1.kind, FrameKind::Page);
        assert_eq!(f1.lsn, 1);
        assert_eq!(f1.page_id, 42);
        assert_eq!(f1.payload, vec![0xAB; 128]);

        let f2 = reader.next().unwrap().unwrap();
        assert_eq!(f2.kind, FrameKind::Commit);
        assert!(f2.payload.is_empty());

        let f3 = reader.next().unwrap().unwrap();
        assert_eq!(f3.kind, FrameKind::CheckpointIntent);
        assert_eq!(f3.safe_lsn().unwrap(), 2);

        let f4 = reader.next().unwrap().unwrap();
        assert_eq!(f4.kind, FrameKind::CheckpointComplete);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn truncated_tail_frame_tolerated() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let end = append(&*file, &[Frame::commit(1)]);
        // Header claiming 500 payload octets, only 10 written.
        let mut torn = Frame::page(2, 7, vec![0u8; 500]).encode();
        torn.truncate(FRAME_HEADER_SIZE + 10);
        file.write_at(end, &torn).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn garbage_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let end = append(&*file, &[Frame::commit(1)]);
        let garbage: Vec<u8> = (0..64).map(|i| (i * 7 + 13) as u8).collect();
        file.write_at(end, &garbage).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn zero_filled_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let end = append(&*file, &[Frame::commit(1)]);
        file.write_at(end, &[0u8; 256]).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn mid_log_corruption_is_error() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let frame_a = Frame::page(1, 5, vec![0x11; 64]);
        let a_len = frame_a.encode().len() as u64;
        append(&*file, &[frame_a, Frame::commit(2), Frame::commit(3)]);

        // Flip a payload byte inside the first frame.
        let mut byte = [0u8; 1];
        let victim = a_len / 2;
        file.read_at(victim, &mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.write_at(victim, &byte).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().is_err());
    }

    #[test]
    fn corrupt_frame_with_only_garbage_after_is_tail() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let end = append(&*file, &[Frame::commit(1)]);

        // Frame-shaped garbage: plausible header, bogus payload, then more
        // frame-shaped garbage chained after it.
        let mut fake = Vec::new();
        fake.push(1u8); // Page kind
        fake.extend_from_slice(&9u64.to_le_bytes());
        fake.extend_from_slice(&3u32.to_le_bytes());
        fake.extend_from_slice(&40u32.to_le_bytes());
        fake.extend_from_slice(&[0xCA; 44]); // payload + wrong crc
        fake.push(2u8);
        fake.extend_from_slice(&10u64.to_le_bytes());
        fake.extend_from_slice(&0u32.to_le_bytes());
        fake.extend_from_slice(&16u32.to_le_bytes());
        fake.extend_from_slice(&[0xFE; 20]);
        file.write_at(end, &fake).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn oversized_length_at_exact_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let end = append(&*file, &[Frame::commit(1)]);

        let oversized = MAX_PAYLOAD as u32 + 1;
        let mut fake = Vec::new();
        fake.push(1u8);
        fake.extend_from_slice(&2u64.to_le_bytes());
        fake.extend_from_slice(&0u32.to_le_bytes());
        fake.extend_from_slice(&oversized.to_le_bytes());
        fake.extend_from_slice(&vec![0xEE; oversized as usize + FRAME_TRAILER_SIZE]);
        file.write_at(end, &fake).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn oversized_length_mid_log_is_error() {
        let dir = TempDir::new().unwrap();
        let file = wal_file(&dir);
        let frame_a = Frame::commit(1);
        let a_len = frame_a.encode().len() as u64;
        append(
            &*file,
            &[
                frame_a,
                Frame::page(2, 1, vec![0xAA; 4096]),
                Frame::page(3, 2, vec![0xBB; 4096]),
            ],
        );

        // Corrupt frame B's length field to an oversized value that still
        // fits inside the file, so the boundary of frame C is lost.
        let oversized = (MAX_PAYLOAD as u32) + 100;
        file.write_at(a_len + 13, &oversized.to_le_bytes()).unwrap();

        let mut reader = FrameReader::new(&*file, MAX_PAYLOAD).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().is_err());
    }
}
