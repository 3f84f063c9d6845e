/// Synchronous file primitives behind a trait so fault injection can wrap
/// the real filesystem.
///
/// Positional reads are safe to invoke concurrently with other reads on the
/// same file. Writes and syncs require serialization at a higher layer: the
/// WAL owns its file's write lock, the pager owns the main file's.
pub mod faulty;

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{DecentError, Result};

/// Which OS primitive a sync should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Data and metadata (fsync).
    Full,
    /// Data only (fdatasync).
    DataOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An open file handle with positional I/O.
pub trait VfsFile: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    /// Flush process-level buffers, then force data to stable storage.
    /// Reporting success without the OS call is a durability violation.
    fn sync(&self, kind: SyncKind) -> Result<()>;
    fn truncate(&self, size: u64) -> Result<()>;
    fn len(&self) -> Result<u64>;
    /// Optional writable memory map. Nothing in the core requires it.
    fn mmap_writable(&self, _len: usize) -> Result<*mut u8> {
        Err(DecentError::Invalid("mmap not supported by this vfs".into()))
    }
}

/// A filesystem namespace.
pub trait Vfs: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode, create: bool) -> Result<Box<dyn VfsFile>>;
    fn exists(&self, path: &Path) -> bool;
    fn remove(&self, path: &Path) -> Result<()>;
}

/// The real filesystem.
pub struct StdVfs;

impl Vfs for StdVfs {
    fn open(&self, path: &Path, mode: OpenMode, create: bool) -> Result<Box<dyn VfsFile>> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if mode == OpenMode::ReadWrite {
            opts.write(true);
        }
        if create {
            opts.create(true);
        }
        let file = opts.open(path)?;
        Ok(Box::new(StdFile { file }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

pub struct StdFile {
    file: File,
}

impl VfsFile for StdFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(DecentError::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            read += n;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = self
                .file
                .seek_write(&buf[written..], offset + written as u64)?;
            written += n;
        }
        Ok(())
    }

    fn sync(&self, kind: SyncKind) -> Result<()> {
        match kind {
            SyncKind::Full => self.file.sync_all()?,
            SyncKind::DataOnly => self.file.sync_data()?,
        }
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn positional_read_write_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let vfs = StdVfs;
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();

        file.write_at(0, b"hello").unwrap();
        file.write_at(100, b"world").unwrap();
        file.sync(SyncKind::Full).unwrap();

        let mut buf = [0u8; 5];
        file.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(file.len().unwrap(), 105);
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let vfs = StdVfs;
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();
        file.write_at(0, &[0xAB; 256]).unwrap();
        file.truncate(16).unwrap();
        assert_eq!(file.len().unwrap(), 16);

        let mut buf = [0u8; 32];
        assert!(file.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn short_read_past_eof_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let vfs = StdVfs;
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();
        file.write_at(0, b"abc").unwrap();
        let mut buf = [0u8; 8];
        assert!(file.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn mmap_is_unsupported_by_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let vfs = StdVfs;
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();
        assert!(file.mmap_writable(4096).is_err());
    }
}
