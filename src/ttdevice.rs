//! Per-chip I/O engine: read/write/reg-access/multicast, DMA, ARC access
//! wrappers, clock/power/reset control, training waits, hang detection
//! (spec §4.F).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::arc_messenger::{ArcMessenger, TelemetryReader};
use crate::arch::{soft_reset_bit, ArchImplementation, BarRegion, Ordering as NocOrdering, RiscType, HANG_READ_VALUE};
use crate::config::DriverConfig;
use crate::coord::CoreType;
use crate::error::{DriverError, Result};
use crate::lock_manager::{LockManager, MutexKind};
use crate::sysmem::SysmemManager;
use crate::tlb::MappingKind;
use crate::tlb_manager::TlbManager;
use crate::transport::Transport;

/// Whether a chip should be driven towards its idle or busy operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Idle,
    Busy,
}

/// The per-chip engine that turns `(core, addr)` requests into TLB-backed
/// MMIO traffic, ARC messages, and DMA transfers.
pub struct TTDevice {
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    tlb_manager: Arc<TlbManager>,
    arc_messenger: Arc<dyn ArcMessenger>,
    telemetry: Option<TelemetryReader>,
    locks: Arc<LockManager>,
    config: DriverConfig,
    device_id: u32,

    wc_cache: Mutex<Option<(u32, u32, crate::tlb::TlbWindow)>>,
    uc_cache: Mutex<Option<crate::tlb::TlbWindow>>,
    dma_mutex: Mutex<()>,
}

impl TTDevice {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arch: Arc<dyn ArchImplementation>,
        transport: Arc<dyn Transport>,
        tlb_manager: Arc<TlbManager>,
        arc_messenger: Arc<dyn ArcMessenger>,
        telemetry: Option<TelemetryReader>,
        locks: Arc<LockManager>,
        config: DriverConfig,
        device_id: u32,
    ) -> Self {
        TTDevice {
            arch,
            transport,
            tlb_manager,
            arc_messenger,
            telemetry,
            locks,
            config,
            device_id,
            wc_cache: Mutex::new(None),
            uc_cache: Mutex::new(None),
            dma_mutex: Mutex::new(()),
        }
    }

    // -- Memory I/O -----------------------------------------------------

    pub fn write_to_device(&self, data: &[u8], core: (u32, u32), addr: u64) -> Result<()> {
        if let Some((window, offset)) = self.tlb_manager.static_window_offset(core, addr, data.len() as u64) {
            return window.write_block(offset, data);
        }
        let _guard = self.locks.acquire(MutexKind::Noc0TlbCache, Some(self.device_id))?;
        let mut cache = self.wc_cache.lock().expect("wc tlb cache mutex poisoned");
        let window = self.wc_window(&mut cache)?;
        window.write_block_reconfigure(core, addr, data, 0, NocOrdering::Relaxed)
    }

    pub fn read_from_device(&self, buf: &mut [u8], core: (u32, u32), addr: u64) -> Result<()> {
        if let Some((window, offset)) = self.tlb_manager.static_window_offset(core, addr, buf.len() as u64) {
            return window.read_block(offset, buf);
        }
        let _guard = self.locks.acquire(MutexKind::Noc0TlbCache, Some(self.device_id))?;
        let mut cache = self.wc_cache.lock().expect("wc tlb cache mutex poisoned");
        let window = self.wc_window(&mut cache)?;
        window.read_block_reconfigure(core, addr, buf, 0, NocOrdering::Relaxed)
    }

    /// `fn(&mut Option<(u32, u32, TlbWindow)>) -> &TlbWindow`, lazily
    /// allocating the cached write-combine window on first use (spec §4.F:
    /// "take the per-chip write-combine TLB cache lock").
    fn wc_window<'a>(&self, cache: &'a mut Option<(u32, u32, crate::tlb::TlbWindow)>) -> Result<&'a crate::tlb::TlbWindow> {
        if cache.is_none() {
            let window = self.tlb_manager.allocate_tlb_window((0, 0), 0, 4, MappingKind::WriteCombine, 0, NocOrdering::Relaxed, None)?;
            *cache = Some((0, 0, window));
        }
        Ok(&cache.as_ref().unwrap().2)
    }

    /// Register access: 4-byte aligned, 4-byte multiple, through the
    /// uncached TLB cache with Strict ordering (spec §4.F).
    pub fn write_to_device_reg(&self, value: u32, core: (u32, u32), addr: u64) -> Result<()> {
        if addr % 4 != 0 {
            return Err(DriverError::Alignment { offset: addr, size: 4 });
        }
        let _guard = self.locks.acquire(MutexKind::Noc1TlbCache, Some(self.device_id))?;
        let mut cache = self.uc_cache.lock().expect("uc tlb cache mutex poisoned");
        if cache.is_none() {
            *cache = Some(self.tlb_manager.allocate_tlb_window((0, 0), 0, 4, MappingKind::Uncached, 0, NocOrdering::Strict, None)?);
        }
        let window = cache.as_ref().unwrap();
        window.write_block_reconfigure(core, addr, &value.to_le_bytes(), 0, NocOrdering::Strict)
    }

    pub fn read_from_device_reg(&self, core: (u32, u32), addr: u64) -> Result<u32> {
        if addr % 4 != 0 {
            return Err(DriverError::Alignment { offset: addr, size: 4 });
        }
        let _guard = self.locks.acquire(MutexKind::Noc1TlbCache, Some(self.device_id))?;
        let mut cache = self.uc_cache.lock().expect("uc tlb cache mutex poisoned");
        if cache.is_none() {
            *cache = Some(self.tlb_manager.allocate_tlb_window((0, 0), 0, 4, MappingKind::Uncached, 0, NocOrdering::Strict, None)?);
        }
        let window = cache.as_ref().unwrap();
        let mut buf = [0u8; 4];
        window.read_block_reconfigure(core, addr, &mut buf, 0, NocOrdering::Strict)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Multicast write to every Tensix core in the inclusive rectangle
    /// `[core_start, core_end]` (spec §4.F). `core_type` identifies what
    /// `core_start`/`core_end` name; only Tensix may be multicast.
    pub fn noc_multicast_write(&self, data: &[u8], core_type: CoreType, core_start: (u32, u32), core_end: (u32, u32), addr: u64) -> Result<()> {
        if core_type != CoreType::Tensix {
            return Err(DriverError::UnsupportedCoreType { core_type });
        }
        let _guard = self.locks.acquire(MutexKind::Noc0TlbCache, Some(self.device_id))?;
        let mut cache = self.wc_cache.lock().expect("wc tlb cache mutex poisoned");
        let window = self.wc_window(&mut cache)?;
        window.noc_multicast_write_reconfigure(core_start, core_end, addr, data, 0, NocOrdering::Relaxed)
    }

    // -- ARC access wrappers ----------------------------------------------

    pub fn read_from_arc_apb(&self, offset: u32) -> Result<u32> {
        self.transport.read32(BarRegion::Bar0, self.arch.arc_apb_bar_offset() + u64::from(offset))
    }

    pub fn write_to_arc_apb(&self, offset: u32, value: u32) -> Result<()> {
        self.transport.write32(BarRegion::Bar0, self.arch.arc_apb_bar_offset() + u64::from(offset), value)
    }

    pub fn read_from_arc_csm(&self, offset: u32) -> Result<u32> {
        self.transport.read32(BarRegion::Bar0, self.arch.arc_csm_bar_offset() + u64::from(offset))
    }

    pub fn write_to_arc_csm(&self, offset: u32, value: u32) -> Result<()> {
        self.transport.write32(BarRegion::Bar0, self.arch.arc_csm_bar_offset() + u64::from(offset), value)
    }

    pub fn arc_msg(&self, msg_code: u32, args: &[u32], timeout: Duration) -> Result<crate::arc_messenger::ArcMessageResponse> {
        self.arc_messenger.send_message(msg_code, args, timeout)
    }

    // -- Clock, power, reset ------------------------------------------------

    pub fn get_min_clock_freq(&self) -> u32 {
        self.arch.min_clock_mhz()
    }

    pub fn get_max_clock_freq(&self) -> u32 {
        self.arch.max_clock_mhz()
    }

    /// AICLK via ARC mailbox on generation A, via telemetry on generation B.
    pub fn get_clock(&self) -> Result<u32> {
        if let Some(telemetry) = &self.telemetry {
            telemetry.get_clock()
        } else {
            let codes = self.arch.arc_message_codes();
            let response = self.arc_msg(codes.get_aiclk, &[], self.config.arc_message_timeout)?;
            response.values.first().copied().ok_or(DriverError::ProtocolError("GET_AICLK returned no value".into()))
        }
    }

    pub fn wait_for_aiclk_value(&self, state: PowerState, timeout: Duration) -> Result<()> {
        let target = match state {
            PowerState::Idle => self.arch.idle_clock_mhz(),
            PowerState::Busy => self.arch.max_clock_mhz(),
        };
        let start = Instant::now();
        loop {
            let clock = self.get_clock()?;
            let reached = match state {
                PowerState::Idle => clock <= target,
                PowerState::Busy => clock >= target,
            };
            if reached {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                warn!("wait_for_aiclk_value timed out waiting for {state:?} (last reading {clock} MHz)");
                return Ok(());
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    pub fn set_risc_reset_state(&self, core: (u32, u32), mask: u32) -> Result<()> {
        self.write_to_device_reg(mask, core, self.arch.tensix_soft_reset_addr())
    }

    pub fn get_risc_reset_state(&self, core: (u32, u32)) -> Result<u32> {
        self.read_from_device_reg(core, self.arch.tensix_soft_reset_addr())
    }

    pub fn assert_risc_reset(&self, core: (u32, u32), which: RiscType) -> Result<()> {
        let bit = soft_reset_bit(which);
        let current = self.get_risc_reset_state(core)?;
        self.set_risc_reset_state(core, current | bit)
    }

    pub fn deassert_risc_reset(&self, core: (u32, u32), which: RiscType, staggered: bool) -> Result<()> {
        let bit = soft_reset_bit(which);
        let current = self.get_risc_reset_state(core)?;
        let mut next = current & !bit;
        if staggered {
            next |= crate::arch::SOFT_RESET_STAGGERED_START;
        }
        self.set_risc_reset_state(core, next)
    }

    pub fn wait_arc_core_start(&self, timeout: Duration) -> Result<()> {
        const NO_ACCESS: u32 = 0xffff_ffff;
        const WATCHDOG_TRIGGERED: u32 = 0xdead_dead;
        const INIT_DONE: u32 = 0x1;
        let start = Instant::now();
        loop {
            let status = self.read_from_arc_apb(self.arch.arc_scratch_status_offset())?;
            match status {
                INIT_DONE => return Ok(()),
                WATCHDOG_TRIGGERED => return Err(DriverError::HardwareHung),
                NO_ACCESS => {}
                _ => debug!("wait_arc_core_start: status 0x{status:x}, still queued/handling"),
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(timeout));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    pub fn wait_eth_core_training(&self, eth_core: (u32, u32), timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.read_from_device_reg(eth_core, 0)?;
            if status != 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                warn!("Ethernet core {eth_core:?} did not finish training within {timeout:?}; some boards are known to be flaky");
                return Ok(());
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    pub fn wait_dram_channel_training(&self, channel: u32, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.read_from_device_reg((channel, 0), 0)?;
            if status != 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(timeout));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    // -- Hang detection -----------------------------------------------------

    pub fn is_hardware_hung(&self) -> Result<bool> {
        let value = self.read_from_arc_apb(self.arch.arc_scratch_status_offset())?;
        Ok(value == HANG_READ_VALUE)
    }

    /// Advisory only (design note, spec §9 open question): the hang sentinel
    /// alone does not corroborate a real hang, so callers should combine
    /// this with `is_hardware_hung`'s scratch-register read before acting.
    pub fn detect_hang_read(&self, last_value: u32) -> bool {
        last_value == HANG_READ_VALUE
    }

    // -- DMA ------------------------------------------------------------

    pub fn dma_h2d(&self, dev_axi_addr: u64, src: &[u8], timeout: Duration) -> Result<()> {
        self.check_dma_supported()?;
        if dev_axi_addr % 4 != 0 || src.len() % 4 != 0 {
            return Err(DriverError::Alignment { offset: dev_axi_addr, size: src.len() as u64 });
        }
        let _dma = self.dma_mutex.lock().expect("dma mutex poisoned");
        let _tlb_guard = self.locks.acquire(MutexKind::PcieDmaTlbCache, Some(self.device_id))?;
        self.transport.write_block(BarRegion::Bar2, dev_axi_addr, src)?;
        self.poll_dma_completion(timeout)
    }

    pub fn dma_d2h(&self, dst: &mut [u8], dev_axi_addr: u64, timeout: Duration) -> Result<()> {
        self.check_dma_supported()?;
        if dev_axi_addr % 4 != 0 || dst.len() % 4 != 0 {
            return Err(DriverError::Alignment { offset: dev_axi_addr, size: dst.len() as u64 });
        }
        let _dma = self.dma_mutex.lock().expect("dma mutex poisoned");
        let _tlb_guard = self.locks.acquire(MutexKind::PcieDmaTlbCache, Some(self.device_id))?;
        self.transport.read_block(BarRegion::Bar2, dev_axi_addr, dst)?;
        self.poll_dma_completion(timeout)
    }

    fn check_dma_supported(&self) -> Result<()> {
        if !self.arch.supports_host_dma() {
            return Err(DriverError::Unsupported { what: "host DMA on this architecture" });
        }
        Ok(())
    }

    fn poll_dma_completion(&self, timeout: Duration) -> Result<()> {
        const COMPLETION_WORD_OFFSET: u64 = 0;
        let start = Instant::now();
        loop {
            let word = self.transport.read32(BarRegion::Bar2, COMPLETION_WORD_OFFSET)?;
            if word == self.arch.dma_completion_magic() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::DmaTimeout(timeout));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Higher-level helper: programs a cached TLB into the DMA window at the
    /// right AXI base plus the low bits of `addr`, chunked at
    /// `min(remaining, tlb_size, dma_buffer_size)` (spec §4.F).
    pub fn dma_write_to_device(&self, data: &[u8], core: (u32, u32), addr: u64, sysmem: &SysmemManager) -> Result<()> {
        let _ = sysmem;
        let mut sent = 0u64;
        let total = data.len() as u64;
        while sent < total {
            let remaining = total - sent;
            let hint = remaining.min(self.arch.dma_buffer_size() as u64).max(1);
            let window = self.tlb_manager.allocate_tlb_window(core, addr + sent, hint, MappingKind::WriteCombine, 0, NocOrdering::Relaxed, None)?;
            let chunk = remaining.min(window.usable_size()).min(self.arch.dma_buffer_size() as u64);
            let (_, axi_addr) = window.axi_base();
            self.dma_h2d(axi_addr, &data[sent as usize..(sent + chunk) as usize], self.config.dma_timeout)?;
            sent += chunk;
        }
        Ok(())
    }

    pub fn dma_read_from_device(&self, buf: &mut [u8], core: (u32, u32), addr: u64, sysmem: &SysmemManager) -> Result<()> {
        let _ = sysmem;
        let mut received = 0u64;
        let total = buf.len() as u64;
        while received < total {
            let remaining = total - received;
            let hint = remaining.min(self.arch.dma_buffer_size() as u64).max(1);
            let window = self.tlb_manager.allocate_tlb_window(core, addr + received, hint, MappingKind::WriteCombine, 0, NocOrdering::Relaxed, None)?;
            let chunk = remaining.min(window.usable_size()).min(self.arch.dma_buffer_size() as u64);
            let (_, axi_addr) = window.axi_base();
            self.dma_d2h(&mut buf[received as usize..(received + chunk) as usize], axi_addr, self.config.dma_timeout)?;
            received += chunk;
        }
        Ok(())
    }

    // -- IATU -------------------------------------------------------------

    /// Programs a peer-to-peer IATU region when the kernel driver hasn't
    /// already done so (SPEC_FULL.md §B.3). `region_size` must be a multiple
    /// of the architecture's granularity and at most its max region size
    /// (spec §8 boundary behavior).
    pub fn configure_iatu_region(&self, region_index: u32, region_size: u64, target_addr: u64) -> Result<()> {
        let granularity = self.arch.iatu_region_granularity_bytes();
        if region_size == 0 || region_size % granularity != 0 || region_size > self.arch.iatu_region_max_bytes() {
            return Err(DriverError::Unsupported {
                what: "IATU region size must be a multiple of the granularity and within the max region size",
            });
        }
        let codes = self.arch.arc_message_codes();
        self.arc_msg(codes.setup_iatu_for_peer_to_peer, &[region_index, (target_addr & 0xffff_ffff) as u32], self.config.arc_message_timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arc_messenger::MailboxArcMessenger;
    use crate::arch::gen_a::GenerationA;
    use crate::arch::gen_b::GenerationB;
    use crate::transport::SimulationBackend;

    fn device_gen_b() -> TTDevice {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let tlb_manager = Arc::new(TlbManager::new(arch.clone(), transport.clone()));
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-ttdevice-test")));
        let messenger: Arc<dyn ArcMessenger> = Arc::new(MailboxArcMessenger::new(arch.clone(), transport.clone(), locks.clone(), DriverConfig::default(), 0));
        TTDevice::new(arch, transport, tlb_manager, messenger, None, locks, DriverConfig::default(), 0)
    }

    #[test]
    fn write_then_read_round_trips_through_the_wc_cache() {
        let device = device_gen_b();
        let data = (1u32..=10).flat_map(u32::to_le_bytes).collect::<Vec<u8>>();
        device.write_to_device(&data, (1, 1), 0).unwrap();
        let mut buf = vec![0u8; data.len()];
        device.read_from_device(&mut buf, (1, 1), 0).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn reg_write_rejects_misaligned_address() {
        let device = device_gen_b();
        assert!(matches!(device.write_to_device_reg(1, (1, 1), 3), Err(DriverError::Alignment { .. })));
        assert!(device.write_to_device_reg(1, (1, 1), 4).is_ok());
    }

    #[test]
    fn multicast_rejects_non_tensix_targets() {
        let device = device_gen_b();
        let result = device.noc_multicast_write(&[0u8; 4], CoreType::Dram, (0, 0), (1, 1), 0);
        assert!(matches!(result, Err(DriverError::UnsupportedCoreType { .. })));
    }

    #[test]
    fn dma_unsupported_on_generation_a() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationA::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let tlb_manager = Arc::new(TlbManager::new(arch.clone(), transport.clone()));
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-ttdevice-test-a")));
        let messenger: Arc<dyn ArcMessenger> = Arc::new(MailboxArcMessenger::new(arch.clone(), transport.clone(), locks.clone(), DriverConfig::default(), 1));
        let device = TTDevice::new(arch, transport, tlb_manager, messenger, None, locks, DriverConfig::default(), 1);
        assert!(matches!(device.dma_h2d(0, &[0, 0, 0, 0], Duration::from_millis(10)), Err(DriverError::Unsupported { .. })));
    }

    #[test]
    fn iatu_region_size_must_be_a_multiple_of_granularity() {
        let device = device_gen_b();
        assert!(device.configure_iatu_region(0, 1 << 30, 0).is_ok());
        assert!(device.configure_iatu_region(0, 3 << 30, 0).is_err());
    }
}
