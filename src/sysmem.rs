//! Host-pinned system-memory buffers used as DMA bounce buffers and as the
//! completion-word target for generation B's DMA engine (SPEC_FULL.md §B.2,
//! grounded in the kernel-driver contract's `map_for_dma`/hugepage surface,
//! spec §6).
//!
//! Actually pinning hugepages and walking the hugepage filesystem is out of
//! scope (spec §1); this module models the buffer *handles* a chip needs
//! once a collaborator has done that pinning and handed back virtual/IO
//! address pairs.

use std::sync::Mutex;

use crate::error::{DriverError, Result};

/// One pinned host buffer: usable from the host at `virtual_address` and
/// from the device's DMA engine at `device_io_address`.
#[derive(Debug, Clone, Copy)]
pub struct SysmemBuffer {
    pub virtual_address: u64,
    pub device_io_address: u64,
    pub size: u64,
}

impl SysmemBuffer {
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.size)
    }
}

/// Per-chip pool of sysmem buffers: one DMA bounce buffer plus one
/// completion-word buffer per generation B's DMA engine (spec §4.F), and any
/// number of caller-requested read/write buffers.
pub struct SysmemManager {
    buffers: Mutex<Vec<SysmemBuffer>>,
    dma_bounce_index: Option<usize>,
    completion_index: Option<usize>,
}

impl SysmemManager {
    pub fn new() -> Self {
        SysmemManager {
            buffers: Mutex::new(Vec::new()),
            dma_bounce_index: None,
            completion_index: None,
        }
    }

    /// Registers a buffer a collaborator has already pinned and mapped.
    pub fn register(&mut self, buffer: SysmemBuffer) -> usize {
        let mut buffers = self.buffers.lock().expect("sysmem manager mutex poisoned");
        buffers.push(buffer);
        buffers.len() - 1
    }

    pub fn set_dma_bounce_buffer(&mut self, index: usize) {
        self.dma_bounce_index = Some(index);
    }

    pub fn set_completion_buffer(&mut self, index: usize) {
        self.completion_index = Some(index);
    }

    pub fn get(&self, index: usize) -> Result<SysmemBuffer> {
        self.buffers
            .lock()
            .expect("sysmem manager mutex poisoned")
            .get(index)
            .copied()
            .ok_or(DriverError::Unsupported { what: "sysmem buffer index" })
    }

    pub fn dma_bounce_buffer(&self) -> Result<SysmemBuffer> {
        let index = self.dma_bounce_index.ok_or(DriverError::Unsupported {
            what: "no DMA bounce buffer registered",
        })?;
        self.get(index)
    }

    pub fn completion_buffer(&self) -> Result<SysmemBuffer> {
        let index = self.completion_index.ok_or(DriverError::Unsupported {
            what: "no DMA completion buffer registered",
        })?;
        self.get(index)
    }
}

impl Default for SysmemManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_buffer_is_retrievable() {
        let mut mgr = SysmemManager::new();
        let idx = mgr.register(SysmemBuffer {
            virtual_address: 0x1000,
            device_io_address: 0x2000,
            size: 4096,
        });
        let buf = mgr.get(idx).unwrap();
        assert_eq!(buf.virtual_address, 0x1000);
        assert!(buf.contains(0, 4096));
        assert!(!buf.contains(4000, 200));
    }

    #[test]
    fn missing_dma_buffer_is_unsupported() {
        let mgr = SysmemManager::new();
        assert!(mgr.dma_bounce_buffer().is_err());
    }
}
