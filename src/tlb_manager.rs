//! Per-chip pool of TLB indices across the architecture's size classes
//! (spec §4.D).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::arch::{ArchImplementation, BarRegion, Ordering as NocOrdering, TlbSizeClass};
use crate::error::{DriverError, Result};
use crate::tlb::{MappingKind, TlbConfig, TlbHandle, TlbWindow};
use crate::transport::Transport;

struct Pool {
    base_index: u32,
    count: u32,
    bar: BarRegion,
    bar_offset: u64,
    cfg_bar_offset: u64,
    register_size_bytes: u64,
    free: Arc<Mutex<Vec<u32>>>,
}

impl Pool {
    fn contains(&self, index: u32) -> bool {
        index >= self.base_index && index < self.base_index + self.count
    }
}

/// Owns every TLB index available on one chip, grouped by size class, plus
/// the cache of statically-mapped `(core, window)` pairs callers pre-map for
/// hot cores.
pub struct TlbManager {
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    pools: HashMap<TlbSizeClass, Pool>,
    static_mappings: Mutex<HashMap<(u32, u32), (u64, u64, Arc<TlbWindow>)>>,
}

const ALL_SIZE_CLASSES: [TlbSizeClass; 4] = [
    TlbSizeClass::Size1M,
    TlbSizeClass::Size2M,
    TlbSizeClass::Size16M,
    TlbSizeClass::Size4G,
];

impl TlbManager {
    pub fn new(arch: Arc<dyn ArchImplementation>, transport: Arc<dyn Transport>) -> Self {
        let mut pools = HashMap::new();
        for &class in &ALL_SIZE_CLASSES {
            let (Ok(layout), Ok(offsets)) = (arch.tlb_pool_layout(class), arch.tlb_offsets(class)) else {
                continue;
            };
            pools.insert(
                class,
                Pool {
                    base_index: layout.base_index,
                    count: layout.count,
                    bar: layout.bar,
                    bar_offset: layout.bar_offset,
                    cfg_bar_offset: layout.cfg_bar_offset,
                    register_size_bytes: offsets.register_size_bytes as u64,
                    free: Arc::new(Mutex::new((layout.base_index..layout.base_index + layout.count).collect())),
                },
            );
        }
        let manager = TlbManager {
            arch: arch.clone(),
            transport,
            pools,
            static_mappings: Mutex::new(HashMap::new()),
        };
        // Pre-reserved indices (REG_TLB, MEM_LARGE_WRITE_TLB, ...) are handed
        // out only through `open_static_handle`, never by ordinary
        // allocation (spec §6 "Static TLB reservations").
        let statics = arch.static_tlb_indices();
        for index in [statics.reg_tlb, statics.mem_large_write_tlb, statics.mem_large_read_tlb, statics.mem_small_rw_tlb] {
            if let Some((_, pool)) = manager.pool_for_index(index) {
                pool.free.lock().expect("tlb manager free-list mutex poisoned").retain(|&i| i != index);
            }
        }
        manager
    }

    /// Opens one of the architecture's pre-reserved static indices directly,
    /// bypassing the free-list (spec §6). Callers are expected to hold this
    /// handle for the chip's lifetime rather than reallocate it per access.
    pub fn open_static_handle(&self, index: u32, mapping_kind: MappingKind) -> Result<TlbHandle> {
        let (&class, _) = self.pool_for_index(index).ok_or(DriverError::Unsupported {
            what: "static TLB index does not belong to any pool",
        })?;
        Ok(self.make_handle(class, index, mapping_kind))
    }

    /// If `core` has a pre-mapped static window covering `[addr, addr+size)`,
    /// returns it together with the in-window byte offset to use.
    pub fn static_window_offset(&self, core: (u32, u32), addr: u64, size: u64) -> Option<(Arc<TlbWindow>, u64)> {
        let mappings = self.static_mappings.lock().expect("tlb manager static-mapping mutex poisoned");
        let (base, len, window) = mappings.get(&core)?;
        if addr >= *base && addr + size <= base + len {
            Some((window.clone(), addr - base))
        } else {
            None
        }
    }

    fn ordered_size_classes(&self) -> Vec<TlbSizeClass> {
        let mut classes: Vec<TlbSizeClass> = self.pools.keys().copied().collect();
        classes.sort_by_key(|c| c.bytes());
        classes
    }

    fn pool_for_index(&self, index: u32) -> Option<(&TlbSizeClass, &Pool)> {
        self.pools.iter().find(|(_, pool)| pool.contains(index))
    }

    /// Thread-safe via the per-pool free-list mutex (spec §4.D).
    pub fn allocate_tlb_index(&self, size_class: TlbSizeClass) -> Result<u32> {
        let pool = self.pools.get(&size_class).ok_or(DriverError::Unsupported {
            what: "this TLB size class on this architecture",
        })?;
        pool.free
            .lock()
            .expect("tlb manager free-list mutex poisoned")
            .pop()
            .ok_or(DriverError::Exhausted { what: "TLB index" })
    }

    pub fn deallocate_tlb_index(&self, index: u32) {
        if let Some((_, pool)) = self.pool_for_index(index) {
            let mut free = pool.free.lock().expect("tlb manager free-list mutex poisoned");
            if !free.contains(&index) {
                free.push(index);
            }
        }
    }

    pub fn get_tlb_size_from_index(&self, index: u32) -> Result<u64> {
        let (class, _) = self.pool_for_index(index).ok_or(DriverError::Unsupported {
            what: "TLB index does not belong to any pool",
        })?;
        Ok(class.bytes())
    }

    pub fn get_tlb_address_from_index(&self, index: u32) -> Result<(BarRegion, u64)> {
        let (_, pool) = self.pool_for_index(index).ok_or(DriverError::Unsupported {
            what: "TLB index does not belong to any pool",
        })?;
        let class_bytes = self.get_tlb_size_from_index(index)?;
        let offset = pool.bar_offset + u64::from(index - pool.base_index) * class_bytes;
        Ok((pool.bar, offset))
    }

    fn make_handle(&self, size_class: TlbSizeClass, index: u32, mapping_kind: MappingKind) -> TlbHandle {
        let pool = &self.pools[&size_class];
        let class_bytes = size_class.bytes();
        let data_offset = pool.bar_offset + u64::from(index - pool.base_index) * class_bytes;
        let cfg_offset = pool.cfg_bar_offset + u64::from(index - pool.base_index) * pool.register_size_bytes;
        let free = pool.free.clone();
        TlbHandle::new(
            index,
            size_class,
            mapping_kind,
            pool.bar,
            data_offset,
            cfg_offset,
            self.arch.clone(),
            self.transport.clone(),
            Box::new(move |id| free.lock().expect("tlb manager free-list mutex poisoned").push(id)),
        )
    }

    /// Allocates the smallest size class (or the caller's forced
    /// `size_class`) whose window, aligned down from `addr`, still has room
    /// for `access_size` bytes past the residue, configures it to point at
    /// `(core, addr)`, and returns the resulting window.
    pub fn allocate_tlb_window(
        &self,
        core: (u32, u32),
        addr: u64,
        access_size: u64,
        mapping_kind: MappingKind,
        noc_sel: u8,
        ordering: NocOrdering,
        size_class: Option<TlbSizeClass>,
    ) -> Result<TlbWindow> {
        let candidates = match size_class {
            Some(c) => vec![c],
            None => self.ordered_size_classes(),
        };
        for class in candidates {
            let bytes = class.bytes();
            let local_offset = addr & !(bytes - 1);
            let residue = addr - local_offset;
            if residue + access_size > bytes {
                continue;
            }
            let Ok(index) = self.allocate_tlb_index(class) else {
                continue;
            };
            let handle = self.make_handle(class, index, mapping_kind);
            if let Err(e) = handle.configure(TlbConfig::point(local_offset, core, noc_sel, ordering)) {
                self.deallocate_tlb_index(index);
                return Err(e);
            }
            return Ok(TlbWindow::new(handle, residue));
        }
        Err(DriverError::Exhausted {
            what: "TLB window of a suitable size class",
        })
    }

    /// Registers a pre-mapped static window for `core`, so `write_to_device`
    /// and friends can skip reconfiguration entirely (spec §4.F).
    pub fn register_static_mapping(&self, core: (u32, u32), addr_base: u64, len: u64, window: Arc<TlbWindow>) {
        self.static_mappings
            .lock()
            .expect("tlb manager static-mapping mutex poisoned")
            .insert(core, (addr_base, len, window));
    }

    pub fn is_tlb_mapped(&self, core: (u32, u32), addr: u64, size: u64) -> bool {
        self.static_window_offset(core, addr, size).is_some()
    }

    pub fn get_tlb_window(&self, core: (u32, u32)) -> Option<Arc<TlbWindow>> {
        self.static_mappings
            .lock()
            .expect("tlb manager static-mapping mutex poisoned")
            .get(&core)
            .map(|(_, _, window)| window.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::gen_b::GenerationB;
    use crate::transport::SimulationBackend;

    fn manager() -> TlbManager {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        TlbManager::new(arch, transport)
    }

    #[test]
    fn exhaustion_and_recovery_on_generation_b_2mib_pool() {
        let mgr = manager();
        let mut handles = Vec::new();
        for _ in 0..202 {
            handles.push(mgr.allocate_tlb_index(TlbSizeClass::Size2M).unwrap());
        }
        assert!(matches!(
            mgr.allocate_tlb_index(TlbSizeClass::Size2M),
            Err(DriverError::Exhausted { .. })
        ));
        let freed = handles.pop().unwrap();
        mgr.deallocate_tlb_index(freed);
        assert!(mgr.allocate_tlb_index(TlbSizeClass::Size2M).is_ok());
    }

    #[test]
    fn freed_index_is_reusable() {
        let mgr = manager();
        let idx = mgr.allocate_tlb_index(TlbSizeClass::Size2M).unwrap();
        mgr.deallocate_tlb_index(idx);
        let idx2 = mgr.allocate_tlb_index(TlbSizeClass::Size2M).unwrap();
        assert_eq!(idx, idx2);
    }

    #[test]
    fn allocate_tlb_window_picks_a_class_that_fits_the_residue() {
        let mgr = manager();
        let window = mgr
            .allocate_tlb_window((1, 1), 10, 4, MappingKind::WriteCombine, 0, NocOrdering::Relaxed, None)
            .unwrap();
        assert!(window.handle().get_size() >= 14);
    }

    #[test]
    fn address_from_index_lands_in_the_right_pool() {
        let mgr = manager();
        let idx = mgr.allocate_tlb_index(TlbSizeClass::Size4G).unwrap();
        let (bar, _offset) = mgr.get_tlb_address_from_index(idx).unwrap();
        assert_eq!(bar, BarRegion::Bar4);
        assert_eq!(mgr.get_tlb_size_from_index(idx).unwrap(), TlbSizeClass::Size4G.bytes());
    }
}
