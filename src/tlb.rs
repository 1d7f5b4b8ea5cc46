//! TLB handle and TLB window: a single programmable address window into a
//! PCI BAR (spec §4.C).
//!
//! A [`TlbHandle`] owns one TLB index; configuring it repoints the window at
//! a different `(core, on-chip address)` pair. A [`TlbWindow`] wraps a handle
//! together with the residue left over when the caller's address wasn't
//! aligned to the TLB's size class.

use std::sync::{Arc, Mutex};

use crate::arch::{ArchImplementation, BarRegion, BitRange, Ordering as NocOrdering, TlbOffsets, TlbSizeClass};
use crate::error::{DriverError, Result};
use crate::signal_safety::execute_safe;
use crate::transport::Transport;

/// Fixed at allocation time; never changes for the lifetime of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    WriteCombine,
    Uncached,
}

/// The logical contents of a TLB's control register (spec §3 "TLB
/// configuration"). `x_start`/`y_start` equal `x_end`/`y_end` for a
/// point (non-multicast) mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbConfig {
    pub local_offset: u64,
    pub x_end: u32,
    pub y_end: u32,
    pub x_start: u32,
    pub y_start: u32,
    pub noc_sel: u8,
    pub mcast: bool,
    pub ordering: NocOrdering,
    pub linked: bool,
    pub static_vc: u8,
}

impl TlbConfig {
    pub fn point(local_offset: u64, core: (u32, u32), noc_sel: u8, ordering: NocOrdering) -> Self {
        TlbConfig {
            local_offset,
            x_end: core.0,
            y_end: core.1,
            x_start: core.0,
            y_start: core.1,
            noc_sel,
            mcast: false,
            ordering,
            linked: false,
            static_vc: 0,
        }
    }

    pub fn multicast(local_offset: u64, start: (u32, u32), end: (u32, u32), noc_sel: u8, ordering: NocOrdering) -> Self {
        TlbConfig {
            local_offset,
            x_end: end.0,
            y_end: end.1,
            x_start: start.0,
            y_start: start.1,
            noc_sel,
            mcast: true,
            ordering,
            linked: false,
            static_vc: 0,
        }
    }

    /// Packs this config into `offsets.register_size_bytes` little-endian
    /// bytes, per `offsets`' bit layout.
    pub fn encode(&self, offsets: &TlbOffsets) -> Vec<u8> {
        let mut reg: u128 = 0;
        set_bits(&mut reg, offsets.local_offset, self.local_offset as u128);
        set_bits(&mut reg, offsets.x_end, self.x_end as u128);
        set_bits(&mut reg, offsets.y_end, self.y_end as u128);
        set_bits(&mut reg, offsets.x_start, self.x_start as u128);
        set_bits(&mut reg, offsets.y_start, self.y_start as u128);
        set_bits(&mut reg, offsets.noc_sel, self.noc_sel as u128);
        set_bits(&mut reg, offsets.mcast, self.mcast as u128);
        set_bits(&mut reg, offsets.ordering, self.ordering as u128);
        set_bits(&mut reg, offsets.linked, self.linked as u128);
        set_bits(&mut reg, offsets.static_vc, self.static_vc as u128);
        reg.to_le_bytes()[..offsets.register_size_bytes].to_vec()
    }
}

fn set_bits(reg: &mut u128, range: BitRange, value: u128) {
    let (lo, hi) = range;
    let width = hi - lo + 1;
    let mask = if width >= 128 { u128::MAX } else { (1u128 << width) - 1 };
    *reg |= (value & mask) << lo;
}

/// Ownership of one TLB index. Configuring it repoints the mapped window;
/// dropping it returns the index to the owning `TlbManager`'s pool exactly
/// once (spec §4.C).
pub struct TlbHandle {
    tlb_id: u32,
    size_class: TlbSizeClass,
    mapping_kind: MappingKind,
    bar: BarRegion,
    /// BAR offset of this index's data window.
    data_offset: u64,
    /// BAR0 offset of this index's control register.
    cfg_offset: u64,
    config: Mutex<Option<TlbConfig>>,
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    release: Mutex<Option<Box<dyn FnOnce(u32) + Send>>>,
}

impl TlbHandle {
    /// Constructed by the `TlbManager`; not meant to be built directly by
    /// callers. `release` is invoked exactly once, on drop, with `tlb_id`.
    pub(crate) fn new(
        tlb_id: u32,
        size_class: TlbSizeClass,
        mapping_kind: MappingKind,
        bar: BarRegion,
        data_offset: u64,
        cfg_offset: u64,
        arch: Arc<dyn ArchImplementation>,
        transport: Arc<dyn Transport>,
        release: Box<dyn FnOnce(u32) + Send>,
    ) -> Self {
        TlbHandle {
            tlb_id,
            size_class,
            mapping_kind,
            bar,
            data_offset,
            cfg_offset,
            config: Mutex::new(None),
            arch,
            transport,
            release: Mutex::new(Some(release)),
        }
    }

    /// Writes the generation-specific encoding of `config` to the control
    /// register, with a fence on either side (handled by
    /// [`Transport::configure`]) so data accesses after this call observe
    /// the new routing.
    pub fn configure(&self, config: TlbConfig) -> Result<()> {
        let offsets = self.arch.tlb_offsets(self.size_class)?;
        let bytes = config.encode(&offsets);
        self.transport.configure(BarRegion::Bar0, self.cfg_offset, &bytes)?;
        *self.config.lock().expect("tlb handle config mutex poisoned") = Some(config);
        Ok(())
    }

    /// Logical base of this handle's mapped window: which BAR, and the byte
    /// offset within it.
    pub fn get_base(&self) -> (BarRegion, u64) {
        (self.bar, self.data_offset)
    }

    pub fn get_size(&self) -> u64 {
        self.size_class.bytes()
    }

    pub fn get_config(&self) -> Option<TlbConfig> {
        *self.config.lock().expect("tlb handle config mutex poisoned")
    }

    pub fn get_mapping(&self) -> MappingKind {
        self.mapping_kind
    }

    pub fn get_tlb_id(&self) -> u32 {
        self.tlb_id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn arch(&self) -> &Arc<dyn ArchImplementation> {
        &self.arch
    }

    fn device_read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let addr = self.data_offset + offset;
        if self.arch.requires_word_granular_device_memcpy() {
            word_granular_read(self.transport.as_ref(), self.bar, addr, buf)
        } else {
            self.transport.read_block(self.bar, addr, buf)
        }
    }

    fn device_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let addr = self.data_offset + offset;
        if self.arch.requires_word_granular_device_memcpy() {
            word_granular_write(self.transport.as_ref(), self.bar, addr, data)
        } else {
            self.transport.write_block(self.bar, addr, data)
        }
    }
}

impl Drop for TlbHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.lock().expect("tlb handle release mutex poisoned").take() {
            release(self.tlb_id);
        }
    }
}

/// Generation A hazard (spec §4.C): device memory must only ever see 4-byte
/// aligned loads/stores. A misaligned leading or trailing byte range is
/// handled with read-modify-write through the device; the host-side buffer
/// may be misaligned freely.
fn word_granular_read(transport: &dyn Transport, bar: BarRegion, addr: u64, buf: &mut [u8]) -> Result<()> {
    let mut pos = 0usize;
    let mut addr = addr;
    while pos < buf.len() {
        let word_addr = addr - (addr % 4);
        let word = transport.read32(bar, word_addr)?.to_le_bytes();
        let start_in_word = (addr % 4) as usize;
        let take = (4 - start_in_word).min(buf.len() - pos);
        buf[pos..pos + take].copy_from_slice(&word[start_in_word..start_in_word + take]);
        pos += take;
        addr += take as u64;
    }
    Ok(())
}

fn word_granular_write(transport: &dyn Transport, bar: BarRegion, addr: u64, data: &[u8]) -> Result<()> {
    let mut pos = 0usize;
    let mut addr = addr;
    while pos < data.len() {
        let word_addr = addr - (addr % 4);
        let start_in_word = (addr % 4) as usize;
        let take = (4 - start_in_word).min(data.len() - pos);
        let mut word = if start_in_word == 0 && take == 4 {
            [0u8; 4]
        } else {
            transport.read32(bar, word_addr)?.to_le_bytes()
        };
        word[start_in_word..start_in_word + take].copy_from_slice(&data[pos..pos + take]);
        transport.write32(bar, word_addr, u32::from_le_bytes(word))?;
        pos += take;
        addr += take as u64;
    }
    Ok(())
}

/// A handle plus the residue left over from aligning a caller's requested
/// address down to the TLB's size class (spec §3 "TLB window").
pub struct TlbWindow {
    handle: TlbHandle,
    offset_from_aligned_addr: u64,
}

impl TlbWindow {
    pub fn new(handle: TlbHandle, offset_from_aligned_addr: u64) -> Self {
        TlbWindow {
            handle,
            offset_from_aligned_addr,
        }
    }

    /// Bytes remaining in this window from its current configured position
    /// to the end of its size class (spec §4.F DMA chunking: `min(remaining,
    /// tlb_size, dma_buffer_size)`).
    pub fn usable_size(&self) -> u64 {
        self.handle.get_size() - self.offset_from_aligned_addr
    }

    /// The BAR and absolute byte offset this window is currently configured
    /// to point at — the "AXI base" a DMA transfer through this window reads
    /// from or writes to (spec §4.F `dma_write_to_device`/
    /// `dma_read_from_device`: "program a cached TLB into the DMA window at
    /// the right AXI base plus the low bits of `addr`").
    pub fn axi_base(&self) -> (BarRegion, u64) {
        let (bar, data_offset) = self.handle.get_base();
        (bar, data_offset + self.offset_from_aligned_addr)
    }

    fn check_bounds(&self, offset: u64, size: u64) -> Result<()> {
        let usable_size = self.usable_size();
        if offset + size > usable_size {
            return Err(DriverError::OutOfBounds { offset, size, usable_size });
        }
        Ok(())
    }

    fn absolute(&self, offset: u64) -> u64 {
        offset + self.offset_from_aligned_addr
    }

    pub fn handle(&self) -> &TlbHandle {
        &self.handle
    }

    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.write_register(offset, value)
    }

    pub fn read32(&self, offset: u64) -> Result<u32> {
        self.read_register(offset)
    }

    /// 4-byte granular register access: volatile word read/write, rejecting
    /// misalignment (spec §4.C, §4.F, §8 boundary behaviors).
    pub fn write_register(&self, offset: u64, value: u32) -> Result<()> {
        if offset % 4 != 0 {
            return Err(DriverError::Alignment { offset, size: 4 });
        }
        self.check_bounds(offset, 4)?;
        self.handle.transport().write32(self.handle.bar, self.absolute(offset), value)
    }

    pub fn read_register(&self, offset: u64) -> Result<u32> {
        if offset % 4 != 0 {
            return Err(DriverError::Alignment { offset, size: 4 });
        }
        self.check_bounds(offset, 4)?;
        self.handle.transport().read32(self.handle.bar, self.absolute(offset))
    }

    pub fn write_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len() as u64)?;
        self.handle.device_write(self.absolute(offset), data)
    }

    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        self.handle.device_read(self.absolute(offset), buf)
    }

    /// Streams `data` into `(core, addr)`, reconfiguring this window onto
    /// successive chunks no larger than the TLB's size (spec §4.C).
    pub fn write_block_reconfigure(&self, core: (u32, u32), addr: u64, data: &[u8], noc_sel: u8, ordering: NocOrdering) -> Result<()> {
        let chunk_size = self.handle.get_size();
        let mut remaining = data;
        let mut addr = addr;
        while !remaining.is_empty() {
            let local_offset = addr & !(chunk_size - 1);
            let residue = addr - local_offset;
            let take = (chunk_size - residue).min(remaining.len() as u64) as usize;
            self.handle.configure(TlbConfig::point(local_offset, core, noc_sel, ordering))?;
            self.handle.device_write(residue, &remaining[..take])?;
            remaining = &remaining[take..];
            addr += take as u64;
        }
        Ok(())
    }

    pub fn read_block_reconfigure(&self, core: (u32, u32), addr: u64, buf: &mut [u8], noc_sel: u8, ordering: NocOrdering) -> Result<()> {
        let chunk_size = self.handle.get_size();
        let mut pos = 0usize;
        let mut addr = addr;
        while pos < buf.len() {
            let local_offset = addr & !(chunk_size - 1);
            let residue = addr - local_offset;
            let take = (chunk_size - residue).min((buf.len() - pos) as u64) as usize;
            self.handle.configure(TlbConfig::point(local_offset, core, noc_sel, ordering))?;
            self.handle.device_read(residue, &mut buf[pos..pos + take])?;
            pos += take;
            addr += take as u64;
        }
        Ok(())
    }

    /// Multicast write to every Tensix core in the inclusive rectangle
    /// `[start, end]` (spec §4.C, §4.F). Caller is responsible for verifying
    /// both endpoints are Tensix cores before calling this.
    pub fn noc_multicast_write_reconfigure(
        &self,
        start: (u32, u32),
        end: (u32, u32),
        addr: u64,
        data: &[u8],
        noc_sel: u8,
        ordering: NocOrdering,
    ) -> Result<()> {
        let chunk_size = self.handle.get_size();
        let mut remaining = data;
        let mut addr = addr;
        while !remaining.is_empty() {
            let local_offset = addr & !(chunk_size - 1);
            let residue = addr - local_offset;
            let take = (chunk_size - residue).min(remaining.len() as u64) as usize;
            self.handle
                .configure(TlbConfig::multicast(local_offset, start, end, noc_sel, ordering))?;
            self.handle.device_write(residue, &remaining[..take])?;
            remaining = &remaining[take..];
            addr += take as u64;
        }
        Ok(())
    }

    /// Signal-safe variant of [`Self::write32`]: a SIGBUS raised while the
    /// store is in flight (a hung or just-reset device) comes back as
    /// [`DriverError::BusError`] instead of terminating the process (spec
    /// §4.C, §5).
    pub fn safe_write32(&self, offset: u64, value: u32) -> Result<()> {
        execute_safe(|| self.write32(offset, value))
    }

    pub fn safe_read32(&self, offset: u64) -> Result<u32> {
        execute_safe(|| self.read32(offset))
    }

    pub fn safe_write_register(&self, offset: u64, value: u32) -> Result<()> {
        execute_safe(|| self.write_register(offset, value))
    }

    pub fn safe_read_register(&self, offset: u64) -> Result<u32> {
        execute_safe(|| self.read_register(offset))
    }

    pub fn safe_write_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        execute_safe(|| self.write_block(offset, data))
    }

    pub fn safe_read_block(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        execute_safe(|| self.read_block(offset, buf))
    }

    pub fn safe_write_block_reconfigure(&self, core: (u32, u32), addr: u64, data: &[u8], noc_sel: u8, ordering: NocOrdering) -> Result<()> {
        execute_safe(|| self.write_block_reconfigure(core, addr, data, noc_sel, ordering))
    }

    pub fn safe_read_block_reconfigure(&self, core: (u32, u32), addr: u64, buf: &mut [u8], noc_sel: u8, ordering: NocOrdering) -> Result<()> {
        execute_safe(|| self.read_block_reconfigure(core, addr, buf, noc_sel, ordering))
    }

    pub fn safe_noc_multicast_write_reconfigure(
        &self,
        start: (u32, u32),
        end: (u32, u32),
        addr: u64,
        data: &[u8],
        noc_sel: u8,
        ordering: NocOrdering,
    ) -> Result<()> {
        execute_safe(|| self.noc_multicast_write_reconfigure(start, end, addr, data, noc_sel, ordering))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::gen_a::GenerationA;
    use crate::arch::gen_b::GenerationB;
    use crate::transport::SimulationBackend;

    fn handle(arch: Arc<dyn ArchImplementation>, size_class: TlbSizeClass, bar: BarRegion, data_offset: u64, cfg_offset: u64) -> TlbHandle {
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        TlbHandle::new(0, size_class, MappingKind::WriteCombine, bar, data_offset, cfg_offset, arch, transport, Box::new(|_| {}))
    }

    #[test]
    fn write_block_then_read_block_round_trips() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let h = handle(arch, TlbSizeClass::Size2M, BarRegion::Bar0, 0, 0);
        let window = TlbWindow::new(h, 0);
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        window.write_block(0, &data).unwrap();
        let mut buf = [0u8; 10];
        window.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn out_of_bounds_access_rejected() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let h = handle(arch, TlbSizeClass::Size2M, BarRegion::Bar0, 0, 0);
        let usable = h.get_size();
        let window = TlbWindow::new(h, 0);
        let buf = vec![0u8; 4];
        assert!(window.write_block(usable - 3, &buf).is_err());
        assert!(window.write_block(usable - 4, &buf).is_ok());
    }

    #[test]
    fn register_write_rejects_misalignment() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let h = handle(arch, TlbSizeClass::Size2M, BarRegion::Bar0, 0, 0);
        let window = TlbWindow::new(h, 0);
        assert!(matches!(window.write_register(3, 0), Err(DriverError::Alignment { .. })));
        assert!(window.write_register(4, 0xaa).is_ok());
    }

    #[test]
    fn residue_reduces_usable_size() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let h = handle(arch, TlbSizeClass::Size2M, BarRegion::Bar0, 0, 0);
        let size = h.get_size();
        let window = TlbWindow::new(h, 16);
        assert_eq!(window.usable_size(), size - 16);
    }

    #[test]
    fn word_granular_write_read_round_trips_with_misaligned_ends() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationA::new());
        assert!(arch.requires_word_granular_device_memcpy());
        let h = handle(arch, TlbSizeClass::Size1M, BarRegion::Bar0, 0, 0);
        let window = TlbWindow::new(h, 0);
        let data = [1u8, 2, 3, 4, 5, 6, 7];
        window.write_block(1, &data).unwrap();
        let mut buf = [0u8; 7];
        window.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn safe_write_then_safe_read_round_trips_when_nothing_faults() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let h = handle(arch, TlbSizeClass::Size2M, BarRegion::Bar0, 0, 0);
        let window = TlbWindow::new(h, 0);
        window.safe_write_register(0, 0xdead_beef).unwrap();
        assert_eq!(window.safe_read_register(0).unwrap(), 0xdead_beef);
    }

    #[test]
    fn drop_releases_tlb_id_exactly_once() {
        use std::sync::atomic::{AtomicU32, Ordering as AtomicOrd};
        let released = Arc::new(AtomicU32::new(0));
        let released_clone = released.clone();
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let h = TlbHandle::new(
            7,
            TlbSizeClass::Size2M,
            MappingKind::Uncached,
            BarRegion::Bar0,
            0,
            0,
            arch,
            transport,
            Box::new(move |id| {
                released_clone.fetch_add(1, AtomicOrd::SeqCst);
                assert_eq!(id, 7);
            }),
        );
        drop(h);
        assert_eq!(released.load(AtomicOrd::SeqCst), 1);
    }
}
