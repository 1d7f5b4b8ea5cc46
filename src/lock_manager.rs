//! Named, optionally cross-process mutexes keyed by `(MutexKind,
//! Option<device-id>)` (spec §4.K).
//!
//! In-process exclusion is a ticket lock in the same shape as the
//! reference codebase's busy-wait `Spinlock` (fair, cheap, no syscall on the
//! uncontended path); cross-process exclusion layers an advisory `flock(2)`
//! on top, since that's the idiomatic way for cooperating Linux processes to
//! share a named lock without a kernel IPC object. `flock` is released by the
//! kernel when the holding process exits or its file descriptor is closed for
//! any reason, including a crash — so a prior holder that died mid-critical-
//! section cannot wedge the next acquirer. That auto-release is this crate's
//! robust-mutex recovery strategy (spec §4.K, design note).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{DriverError, Result};

/// The resources the ARC messenger, I/O engine, and TLB manager coordinate
/// across threads and processes (spec §4.K).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexKind {
    ArcMessage,
    RemoteArcMessage,
    MemBarrier,
    ChipInUse,
    Noc0TlbCache,
    Noc1TlbCache,
    PcieDmaTlbCache,
}

impl MutexKind {
    fn file_stem(self) -> &'static str {
        match self {
            MutexKind::ArcMessage => "arc_message",
            MutexKind::RemoteArcMessage => "remote_arc_message",
            MutexKind::MemBarrier => "mem_barrier",
            MutexKind::ChipInUse => "chip_in_use",
            MutexKind::Noc0TlbCache => "noc0_tlb_cache",
            MutexKind::Noc1TlbCache => "noc1_tlb_cache",
            MutexKind::PcieDmaTlbCache => "pcie_dma_tlb_cache",
        }
    }
}

struct TicketLock {
    queue: CachePadded<AtomicUsize>,
    dequeue: CachePadded<AtomicUsize>,
}

impl TicketLock {
    fn new() -> Self {
        TicketLock {
            queue: CachePadded::new(AtomicUsize::new(0)),
            dequeue: CachePadded::new(AtomicUsize::new(1)),
        }
    }

    fn acquire(&self) {
        let backoff = Backoff::new();
        let ticket = self.queue.fetch_add(1, Ordering::Relaxed) + 1;
        while self.dequeue.load(Ordering::Acquire) != ticket {
            backoff.spin();
        }
    }

    fn release(&self) {
        self.dequeue.fetch_add(1, Ordering::Release);
    }
}

/// A held lock; releases the in-process ticket and, if this key is
/// cross-process, unlocks and drops the backing file.
pub struct LockGuard {
    ticket: Arc<TicketLock>,
    file: Option<File>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            // Safety: `file`'s fd is valid for the duration of this call.
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        self.ticket.release();
    }
}

/// Owns every named lock this chip (or cluster) hands out. Each distinct
/// `(MutexKind, device id)` gets its own ticket lock and, lazily, its own
/// lock file.
pub struct LockManager {
    directory: PathBuf,
    tickets: Mutex<HashMap<(MutexKind, Option<u32>), Arc<TicketLock>>>,
}

impl LockManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        LockManager {
            directory: directory.into(),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    fn ticket_for(&self, key: (MutexKind, Option<u32>)) -> Arc<TicketLock> {
        self.tickets
            .lock()
            .expect("lock manager ticket-table mutex poisoned")
            .entry(key)
            .or_insert_with(|| Arc::new(TicketLock::new()))
            .clone()
    }

    fn lock_file_path(&self, kind: MutexKind, device_id: Option<u32>) -> PathBuf {
        match device_id {
            Some(id) => self.directory.join(format!("{}_{id}.lock", kind.file_stem())),
            None => self.directory.join(format!("{}.lock", kind.file_stem())),
        }
    }

    /// Acquires the named lock, blocking until it is free. Creates the
    /// backing lock directory and file on first use.
    pub fn acquire(&self, kind: MutexKind, device_id: Option<u32>) -> Result<LockGuard> {
        let ticket = self.ticket_for((kind, device_id));
        ticket.acquire();

        let path = self.lock_file_path(kind, device_id);
        match self.open_and_flock(&path) {
            Ok(file) => Ok(LockGuard { ticket, file: Some(file) }),
            Err(e) => {
                ticket.release();
                Err(e)
            }
        }
    }

    fn open_and_flock(&self, path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        // Safety: `file`'s fd is valid; `flock` blocks until the exclusive
        // lock is available or returns an error.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(DriverError::Io(std::io::Error::last_os_error()));
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_serializes_across_threads() {
        let dir = std::env::temp_dir().join(format!("tt-umd-core-lock-test-{:p}", &0u8));
        let manager = Arc::new(LockManager::new(dir));
        let counter = Arc::new(Mutex::new(0u32));
        let mut threads = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            threads.push(std::thread::spawn(move || {
                let _guard = manager.acquire(MutexKind::ArcMessage, Some(0)).unwrap();
                let mut c = counter.lock().unwrap();
                let before = *c;
                *c += 1;
                assert_eq!(*c, before + 1);
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }

    #[test]
    fn distinct_device_ids_do_not_share_a_lock() {
        let dir = std::env::temp_dir().join(format!("tt-umd-core-lock-test2-{:p}", &0u8));
        let manager = LockManager::new(dir);
        let a = manager.acquire(MutexKind::ChipInUse, Some(0)).unwrap();
        let b = manager.acquire(MutexKind::ChipInUse, Some(1)).unwrap();
        drop(a);
        drop(b);
    }
}
