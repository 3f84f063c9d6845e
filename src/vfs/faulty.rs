/// Fault-injecting VFS wrapper for crash and failpoint tests.
///
/// Rules are keyed by an operation label (e.g. "wal", "main") plus the
/// operation kind, each with a countdown of how many matching calls pass
/// before the fault fires and how many times it fires. Every operation is
/// recorded in a log: op, label, action taken, requested/applied bytes,
/// resulting error kind.
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DecentError, Result};
use crate::vfs::{OpenMode, SyncKind, Vfs, VfsFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Read,
    Write,
    Sync,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Return an I/O error.
    Error,
    /// Apply only the first N octets of the write, then return an error.
    ShortWrite(usize),
    /// Report success without reaching the OS sync primitive.
    DropSync,
}

#[derive(Debug, Clone)]
struct FaultRule {
    label: String,
    op: FaultOp,
    action: FaultAction,
    /// Matching calls to let through before the fault fires.
    skip: u64,
    /// Remaining firings; the rule is inert at zero.
    remaining: u64,
}

#[derive(Debug, Clone)]
pub struct FaultLogEntry {
    pub op: FaultOp,
    pub label: String,
    pub action: Option<FaultAction>,
    pub requested_bytes: usize,
    pub applied_bytes: usize,
    pub error: Option<String>,
}

#[derive(Default)]
struct FaultState {
    rules: Vec<FaultRule>,
    log: Vec<FaultLogEntry>,
}

impl FaultState {
    /// Find the first live rule for (label, op), advance its counters, and
    /// return the action if it fires this call.
    fn hit(&mut self, label: &str, op: FaultOp) -> Option<FaultAction> {
        for rule in &mut self.rules {
            if rule.label != label || rule.op != op || rule.remaining == 0 {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                return None;
            }
            rule.remaining -= 1;
            return Some(rule.action);
        }
        None
    }
}

/// Shared fault plan, handed to every file opened through the wrapping VFS.
#[derive(Clone, Default)]
pub struct FaultPlan {
    state: Arc<Mutex<FaultState>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule: after `skip` matching operations, apply `action` for the
    /// next `count` matching operations.
    pub fn add_rule(&self, label: &str, op: FaultOp, action: FaultAction, skip: u64, count: u64) {
        self.state.lock().rules.push(FaultRule {
            label: label.to_string(),
            op,
            action,
            skip,
            remaining: count,
        });
    }

    pub fn take_log(&self) -> Vec<FaultLogEntry> {
        std::mem::take(&mut self.state.lock().log)
    }

    fn record(&self, entry: FaultLogEntry) {
        self.state.lock().log.push(entry);
    }
}

/// VFS that labels each opened file and applies the shared fault plan.
pub struct FaultyVfs<V: Vfs> {
    inner: V,
    plan: FaultPlan,
    /// Label applied to the next open; defaults to the file stem.
    label_fn: fn(&Path) -> String,
}

fn default_label(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("db")
        .to_string()
}

impl<V: Vfs> FaultyVfs<V> {
    pub fn new(inner: V, plan: FaultPlan) -> Self {
        FaultyVfs {
            inner,
            plan,
            label_fn: default_label,
        }
    }

    pub fn plan(&self) -> &FaultPlan {
        &self.plan
    }
}

impl<V: Vfs> Vfs for FaultyVfs<V> {
    fn open(&self, path: &Path, mode: OpenMode, create: bool) -> Result<Box<dyn VfsFile>> {
        let file = self.inner.open(path, mode, create)?;
        Ok(Box::new(FaultyFile {
            inner: file,
            label: (self.label_fn)(path),
            plan: self.plan.clone(),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.inner.remove(path)
    }
}

pub struct FaultyFile {
    inner: Box<dyn VfsFile>,
    label: String,
    plan: FaultPlan,
}

impl FaultyFile {
    fn fault_error(&self, op: FaultOp, requested: usize, applied: usize) -> DecentError {
        let err = std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {:?} fault on '{}'", op, self.label),
        );
        self.plan.record(FaultLogEntry {
            op,
            label: self.label.clone(),
            action: Some(FaultAction::Error),
            requested_bytes: requested,
            applied_bytes: applied,
            error: Some(format!("{}", err)),
        });
        DecentError::Io(err)
    }

    fn log_ok(&self, op: FaultOp, action: Option<FaultAction>, requested: usize, applied: usize) {
        self.plan.record(FaultLogEntry {
            op,
            label: self.label.clone(),
            action,
            requested_bytes: requested,
            applied_bytes: applied,
            error: None,
        });
    }
}

impl VfsFile for FaultyFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let hit = self.plan.state.lock().hit(&self.label, FaultOp::Read);
        if hit.is_some() {
            return Err(self.fault_error(FaultOp::Read, buf.len(), 0));
        }
        self.inner.read_at(offset, buf)?;
        self.log_ok(FaultOp::Read, None, buf.len(), buf.len());
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let hit = self.plan.state.lock().hit(&self.label, FaultOp::Write);
        match hit {
            Some(FaultAction::ShortWrite(n)) => {
                let n = n.min(buf.len());
                self.inner.write_at(offset, &buf[..n])?;
                tracing::debug!(label = %self.label, requested = buf.len(), applied = n,
                    "injected short write");
                self.plan.record(FaultLogEntry {
                    op: FaultOp::Write,
                    label: self.label.clone(),
                    action: Some(FaultAction::ShortWrite(n)),
                    requested_bytes: buf.len(),
                    applied_bytes: n,
                    error: Some("short write".into()),
                });
                Err(DecentError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("injected short write on '{}'", self.label),
                )))
            }
            Some(_) => Err(self.fault_error(FaultOp::Write, buf.len(), 0)),
            None => {
                self.inner.write_at(offset, buf)?;
                self.log_ok(FaultOp::Write, None, buf.len(), buf.len());
                Ok(())
            }
        }
    }

    fn sync(&self, kind: SyncKind) -> Result<()> {
        let hit = self.plan.state.lock().hit(&self.label, FaultOp::Sync);
        match hit {
            Some(FaultAction::DropSync) => {
                tracing::debug!(label = %self.label, "injected dropped sync");
                self.log_ok(FaultOp::Sync, Some(FaultAction::DropSync), 0, 0);
                Ok(())
            }
            Some(_) => Err(self.fault_error(FaultOp::Sync, 0, 0)),
            None => {
                self.inner.sync(kind)?;
                self.log_ok(FaultOp::Sync, None, 0, 0);
                Ok(())
            }
        }
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let hit = self.plan.state.lock().hit(&self.label, FaultOp::Truncate);
        if hit.is_some() {
            return Err(self.fault_error(FaultOp::Truncate, 0, 0));
        }
        self.inner.truncate(size)?;
        self.log_ok(FaultOp::Truncate, None, 0, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::StdVfs;
    use tempfile::TempDir;

    #[test]
    fn error_rule_fires_after_skip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.wal");
        let plan = FaultPlan::new();
        plan.add_rule("wal", FaultOp::Write, FaultAction::Error, 1, 1);

        let vfs = FaultyVfs::new(StdVfs, plan.clone());
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();

        file.write_at(0, b"first").unwrap(); // skipped
        assert!(file.write_at(5, b"second").is_err()); // fires
        file.write_at(5, b"third").unwrap(); // rule exhausted
    }

    #[test]
    fn short_write_applies_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.wal");
        let plan = FaultPlan::new();
        plan.add_rule("wal", FaultOp::Write, FaultAction::ShortWrite(3), 0, 1);

        let vfs = FaultyVfs::new(StdVfs, plan.clone());
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();
        assert!(file.write_at(0, b"abcdef").is_err());
        assert_eq!(file.len().unwrap(), 3);

        let log = plan.take_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].requested_bytes, 6);
        assert_eq!(log[0].applied_bytes, 3);
    }

    #[test]
    fn dropped_sync_reports_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.wal");
        let plan = FaultPlan::new();
        plan.add_rule("wal", FaultOp::Sync, FaultAction::DropSync, 0, 1);

        let vfs = FaultyVfs::new(StdVfs, plan.clone());
        let file = vfs.open(&path, OpenMode::ReadWrite, true).unwrap();
        file.sync(SyncKind::Full).unwrap();

        let log = plan.take_log();
        assert_eq!(log[0].action, Some(FaultAction::DropSync));
        assert!(log[0].error.is_none());
    }
}
