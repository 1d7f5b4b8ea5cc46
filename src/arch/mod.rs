//! Per-generation architecture constants (spec §4.A).
//!
//! Two chip generations share every behavioral algorithm in this crate
//! (coordinate construction, TLB window arithmetic, reset sequencing); what
//! differs is a table of integers and bit layouts. `ArchImplementation`
//! collects that table behind one trait object per chip so the rest of the
//! crate never matches on a generation tag.

pub mod gen_a;
pub mod gen_b;

use crate::error::{DriverError, Result};

/// Which RISC-V core within a Tensix tile a soft-reset bit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiscType {
    Brisc,
    Trisc0,
    Trisc1,
    Trisc2,
    Ncrisc,
}

pub const SOFT_RESET_BRISC: u32 = 1 << 11;
pub const SOFT_RESET_TRISC0: u32 = 1 << 12;
pub const SOFT_RESET_TRISC1: u32 = 1 << 13;
pub const SOFT_RESET_TRISC2: u32 = 1 << 14;
pub const SOFT_RESET_NCRISC: u32 = 1 << 18;
pub const SOFT_RESET_STAGGERED_START: u32 = 1 << 31;

pub fn soft_reset_bit(risc: RiscType) -> u32 {
    match risc {
        RiscType::Brisc => SOFT_RESET_BRISC,
        RiscType::Trisc0 => SOFT_RESET_TRISC0,
        RiscType::Trisc1 => SOFT_RESET_TRISC1,
        RiscType::Trisc2 => SOFT_RESET_TRISC2,
        RiscType::Ncrisc => SOFT_RESET_NCRISC,
    }
}

/// The hang-detection sentinel read back from a dead register (§5, §9 open
/// question): advisory only, never sufficient on its own to declare a chip
/// hung.
pub const HANG_READ_VALUE: u32 = 0xFFFF_FFFF;

pub const MEMBAR_SET: u8 = 0xAA;
pub const MEMBAR_RESET: u8 = 0x00;

/// TLB size classes across both generations. Not every class exists on every
/// generation; `ArchImplementation::tlb_layout` returns `Unsupported` for the
/// ones that don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbSizeClass {
    Size1M,
    Size2M,
    Size16M,
    Size4G,
}

impl TlbSizeClass {
    pub const fn bytes(self) -> u64 {
        match self {
            TlbSizeClass::Size1M => 1 << 20,
            TlbSizeClass::Size2M => 1 << 21,
            TlbSizeClass::Size16M => 1 << 24,
            TlbSizeClass::Size4G => 1 << 32,
        }
    }
}

/// Ordering mode a TLB window is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Relaxed,
    Strict,
    Posted,
}

/// A bit-range `[lo, hi]` (inclusive) within a TLB's control register.
pub type BitRange = (u32, u32);

/// The bit layout of one TLB size class's control register, bit-exact per
/// spec §6.
#[derive(Debug, Clone, Copy)]
pub struct TlbOffsets {
    pub local_offset: BitRange,
    pub x_end: BitRange,
    pub y_end: BitRange,
    pub x_start: BitRange,
    pub y_start: BitRange,
    pub noc_sel: BitRange,
    pub mcast: BitRange,
    pub ordering: BitRange,
    pub linked: BitRange,
    pub static_vc: BitRange,
    /// Size of the control register itself, in bytes (8 on generation A's 1
    /// MiB class, 12 on generation B's 2 MiB class, etc).
    pub register_size_bytes: usize,
}

/// A PCI BAR region a TLB pool is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarRegion {
    Bar0,
    Bar2,
    Bar4,
}

/// Where one TLB size class's pool lives: the base index assigned to
/// `size_class`, how many TLBs of that size exist, which BAR, and the BAR
/// offset of index 0.
#[derive(Debug, Clone, Copy)]
pub struct TlbPoolLayout {
    pub base_index: u32,
    pub count: u32,
    pub bar: BarRegion,
    /// BAR offset of index 0's *data window* (what a caller reads/writes).
    pub bar_offset: u64,
    /// BAR0 offset of index 0's *control register* (`STATIC_TLB_CFG_ADDR`-
    /// style array), always in BAR0 regardless of which BAR the data window
    /// lives in.
    pub cfg_bar_offset: u64,
}

/// Static (pre-reserved) TLB indices, named by the role they serve in the
/// per-chip I/O engine's caches (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct StaticTlbIndices {
    pub reg_tlb: u32,
    pub mem_large_write_tlb: u32,
    pub mem_large_read_tlb: u32,
    pub mem_small_rw_tlb: u32,
}

/// ARC mailbox/queue message codes common to both generations (spec §6);
/// generation A additionally ORs `ARC_MSG_COMMON_PREFIX` into the code.
#[derive(Debug, Clone, Copy)]
pub struct ArcMessageCodes {
    pub nop: u32,
    pub get_aiclk: u32,
    pub arc_go_busy: u32,
    pub arc_go_short_idle: u32,
    pub arc_go_long_idle: u32,
    pub arc_get_harvesting: u32,
    pub test: u32,
    pub setup_iatu_for_peer_to_peer: u32,
    pub deassert_riscv_reset: u32,
}

/// Every generation-dependent constant and layout used elsewhere in the
/// crate. Two concrete tables implement this (`gen_a::GenerationA`,
/// `gen_b::GenerationB`); behavior stays in the generic algorithms that take
/// `&dyn ArchImplementation`.
pub trait ArchImplementation: Send + Sync {
    fn name(&self) -> &'static str;

    fn grid_size_x(&self) -> u32;
    fn grid_size_y(&self) -> u32;
    fn num_eth_channels(&self) -> u32;

    fn arc_message_codes(&self) -> ArcMessageCodes;
    /// `Some(prefix)` on generation A (mailbox protocol validates
    /// `msg_code & 0xff00 == prefix`); `None` on generation B.
    fn arc_message_common_prefix(&self) -> Option<u32>;
    fn arc_message_get_smbus_telemetry_addr(&self) -> Result<u32> {
        Err(DriverError::Unsupported { what: "GET_SMBUS_TELEMETRY_ADDR" })
    }

    fn arc_misc_cntl_offset(&self) -> u32;
    fn arc_scratch_data_offset(&self) -> u32;
    fn arc_scratch_status_offset(&self) -> u32;
    fn arc_scratch_result1_offset(&self) -> u32;
    fn arc_apb_bar_offset(&self) -> u64;
    fn arc_csm_bar_offset(&self) -> u64;
    /// Fixed scratch register firmware publishes the ARC queue-protocol
    /// control block base at (generation B only).
    fn arc_queue_scratch_pointer_offset(&self) -> Result<u32> {
        Err(DriverError::Unsupported { what: "ARC queue protocol" })
    }

    fn tensix_soft_reset_addr(&self) -> u64;
    fn debug_reg_addr(&self) -> u64;
    fn read_checking_offset(&self) -> Option<u64> {
        None
    }

    fn l1_membar_addr(&self) -> u64;
    fn eth_membar_addr(&self) -> u64;
    fn dram_membar_addr(&self) -> u64;

    /// `true` if this generation always routes through the Translated
    /// coordinate system regardless of the runtime NOC-translation flag
    /// (generation B); `false` if the flag chooses between NOC1 and
    /// Translated (generation A) (spec §4.H "Memory I/O").
    fn always_routes_translated(&self) -> bool {
        false
    }

    fn min_clock_mhz(&self) -> u32;
    fn max_clock_mhz(&self) -> u32;
    fn idle_clock_mhz(&self) -> u32;

    /// Bit position within `harvesting_noc_locations`'s domain that
    /// firmware's physical harvesting-mask bit `k` maps to in NOC0 row
    /// order.
    fn harvesting_noc_locations(&self) -> Vec<u32>;

    /// NOC0-to-NOC1 permutation vectors; empty if the generation doesn't
    /// expose a NOC1 grid distinct from NOC0.
    fn noc0_to_noc1_x(&self) -> Vec<u32>;
    fn noc0_to_noc1_y(&self) -> Vec<u32>;

    /// Generation A's Tensix translated-coordinate hook (spec §4.B step 7):
    /// unharvested rows start at `(tensix_translated_origin_x,
    /// tensix_translated_origin_y)`, harvested rows are appended after.
    /// Returns `(noc0, translated)` pairs for every Tensix core.
    fn translate_tensix(&self, grid: crate::coord::GridSize, tensix_mask: u32) -> Vec<((u32, u32), (u32, u32))>;

    /// Generation B's DRAM translated-coordinate hook: permutes banks so a
    /// harvested bank moves to the back. Returns `(noc0, translated)` pairs.
    fn translate_dram(
        &self,
        grid: crate::coord::GridSize,
        dram_mask: u32,
        dram_cores_noc0: &[Vec<(u32, u32)>],
    ) -> Vec<((u32, u32), (u32, u32))>;

    fn translate_eth(&self, eth_cores_noc0: &[(u32, u32)], eth_mask: u32) -> Vec<((u32, u32), (u32, u32))> {
        let _ = eth_mask;
        eth_cores_noc0.iter().map(|&c| (c, c)).collect()
    }

    fn tlb_pool_layout(&self, size_class: TlbSizeClass) -> Result<TlbPoolLayout>;
    fn tlb_offsets(&self, size_class: TlbSizeClass) -> Result<TlbOffsets>;
    fn static_tlb_indices(&self) -> StaticTlbIndices;
    /// Index into the TLB pool reserved for broadcast writes to all Tensix
    /// cores, if this generation pre-reserves one.
    fn broadcast_tlb_index(&self) -> Option<u32> {
        None
    }

    /// Whether host DMA to/from device memory is supported at all.
    fn supports_host_dma(&self) -> bool;
    fn dma_buffer_size(&self) -> usize;
    fn dma_completion_magic(&self) -> u32 {
        0xFACA
    }

    /// `true` if register accesses must go through a custom word-at-a-time
    /// copy rather than a plain memcpy (generation A hazard, spec §4.C).
    fn requires_word_granular_device_memcpy(&self) -> bool;

    /// Whether this generation's TLB configuration is a single 64-bit store
    /// or a split 8+4 byte pair.
    fn tlb_config_is_split_store(&self) -> bool;

    fn iatu_region_granularity_bytes(&self) -> u64 {
        1 << 30
    }
    fn iatu_region_max_bytes(&self) -> u64 {
        4 << 30
    }
}
