//! Process-wide "a training job is running" flag.
//!
//! The gate is not scoped to a resource class: while it is held no second job
//! is admitted on any lane.

use kiln_training::TrainingResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

const RUNNING: &str = "Running";
const IDLE: &str = "Idle";

pub trait ProcessGate: Send + Sync {
    fn is_running(&self) -> bool;

    fn set_running(&self, running: bool) -> TrainingResult<()>;

    /// Sets the gate if it is idle. Returns `false` when it was already held.
    ///
    /// The default is a plain check followed by a set; callers that need it
    /// atomic must serialize around it.
    fn try_acquire(&self) -> TrainingResult<bool> {
        if self.is_running() {
            return Ok(false);
        }
        self.set_running(true)?;
        Ok(true)
    }
}

/// Gate persisted as a sentinel file holding `Running` or `Idle`.
#[derive(Debug)]
pub struct FileProcessGate {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProcessGate {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_flag(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match content.trim() {
                RUNNING => true,
                IDLE | "" => false,
                other => {
                    warn!(path = %self.path.display(), content = other, "Unrecognized gate content, treating as idle");
                    false
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Gate file unreadable, treating as idle");
                false
            }
        }
    }

    fn write_flag(&self, running: bool) -> TrainingResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, if running { RUNNING } else { IDLE })?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), running, "Gate updated");
        Ok(())
    }
}

impl ProcessGate for FileProcessGate {
    fn is_running(&self) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_flag()
    }

    fn set_running(&self, running: bool) -> TrainingResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_flag(running)
    }

    fn try_acquire(&self) -> TrainingResult<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.read_flag() {
            return Ok(false);
        }
        self.write_flag(true)?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryProcessGate {
    running: AtomicBool,
}

impl MemoryProcessGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessGate for MemoryProcessGate {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) -> TrainingResult<()> {
        self.running.store(running, Ordering::SeqCst);
        Ok(())
    }

    fn try_acquire(&self) -> TrainingResult<bool> {
        Ok(self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok())
    }
}

/// Holds the gate for one job and clears it exactly once, on [`release`](Self::release)
/// or when dropped.
pub struct GateLease {
    gate: Arc<dyn ProcessGate>,
    released: bool,
}

impl GateLease {
    /// Acquires the gate, or returns `None` when another job holds it.
    pub fn acquire(gate: Arc<dyn ProcessGate>) -> TrainingResult<Option<Self>> {
        if gate.try_acquire()? {
            Ok(Some(Self { gate, released: false }))
        } else {
            Ok(None)
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Err(e) = self.gate.set_running(false) {
            warn!(error = %e, "Failed to release process gate");
        }
    }
}

impl Drop for GateLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for GateLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateLease").field("released", &self.released).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[test]
    fn test_file_gate_round_trips_sentinel() {
        let temp = TempDir::new().unwrap();
        let gate = FileProcessGate::new(temp.path().join("state").join("gate"));

        assert!(!gate.is_running());
        gate.set_running(true).unwrap();
        assert_eq!(std::fs::read_to_string(gate.path()).unwrap(), "Running");
        assert!(gate.is_running());
        gate.set_running(false).unwrap();
        assert_eq!(std::fs::read_to_string(gate.path()).unwrap(), "Idle");
    }

    #[test]
    fn test_file_gate_garbage_reads_idle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gate");
        std::fs::write(&path, "maybe").unwrap();
        assert!(!FileProcessGate::new(&path).is_running());
    }

    #[test]
    fn test_try_acquire_only_once() {
        let gate = MemoryProcessGate::new();
        assert!(gate.try_acquire().unwrap());
        assert!(!gate.try_acquire().unwrap());
    }

    struct CountingGate {
        inner: MemoryProcessGate,
        releases: AtomicUsize,
    }

    impl ProcessGate for CountingGate {
        fn is_running(&self) -> bool {
            self.inner.is_running()
        }

        fn set_running(&self, running: bool) -> TrainingResult<()> {
            if !running {
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.set_running(running)
        }
    }

    #[test]
    fn test_lease_releases_exactly_once() {
        let gate = Arc::new(CountingGate { inner: MemoryProcessGate::new(), releases: AtomicUsize::new(0) });

        let mut lease = GateLease::acquire(gate.clone()).unwrap().unwrap();
        assert!(gate.is_running());
        assert!(GateLease::acquire(gate.clone()).unwrap().is_none());
        assert!(!lease.is_released());

        lease.release();
        assert!(lease.is_released());
        lease.release();
        drop(lease);

        assert!(!gate.is_running());
        assert_eq!(gate.releases.load(Ordering::SeqCst), 1);
    }
}
