//! Generation-A architecture constants: mailbox ARC protocol, {1, 2, 16} MiB
//! TLB classes, a 64-bit single-store TLB configuration write.

use super::*;
use crate::coord::GridSize;
use crate::error::{DriverError, Result};

pub const ARC_MSG_COMMON_PREFIX: u32 = 0xAA00;

/// Origin of the unharvested-row block in Translated-coordinate space (spec
/// §4.B step 7). Harvested rows are appended immediately after.
const TENSIX_TRANSLATED_ORIGIN_X: u32 = 18;
const TENSIX_TRANSLATED_ORIGIN_Y: u32 = 18;

pub struct GenerationA {
    grid: GridSize,
}

impl GenerationA {
    pub fn new() -> Self {
        GenerationA {
            grid: GridSize { x: 8, y: 10 },
        }
    }
}

impl Default for GenerationA {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchImplementation for GenerationA {
    fn name(&self) -> &'static str {
        "generation-a"
    }

    fn grid_size_x(&self) -> u32 {
        self.grid.x
    }

    fn grid_size_y(&self) -> u32 {
        self.grid.y
    }

    fn num_eth_channels(&self) -> u32 {
        16
    }

    fn arc_message_codes(&self) -> ArcMessageCodes {
        ArcMessageCodes {
            nop: 0x11,
            get_aiclk: 0x34,
            arc_go_busy: 0x52,
            arc_go_short_idle: 0x53,
            arc_go_long_idle: 0x54,
            arc_get_harvesting: 0x57,
            test: 0x90,
            setup_iatu_for_peer_to_peer: 0x97,
            deassert_riscv_reset: 0xBA,
        }
    }

    fn arc_message_common_prefix(&self) -> Option<u32> {
        Some(ARC_MSG_COMMON_PREFIX)
    }

    fn arc_message_get_smbus_telemetry_addr(&self) -> Result<u32> {
        Ok(0x2C)
    }

    fn arc_misc_cntl_offset(&self) -> u32 {
        0x100
    }

    fn arc_scratch_data_offset(&self) -> u32 {
        0x60
    }

    fn arc_scratch_status_offset(&self) -> u32 {
        0x6c
    }

    fn arc_scratch_result1_offset(&self) -> u32 {
        0x64
    }

    fn arc_apb_bar_offset(&self) -> u64 {
        0x1FF0_0000
    }

    fn arc_csm_bar_offset(&self) -> u64 {
        0x1FE0_0000
    }

    fn tensix_soft_reset_addr(&self) -> u64 {
        0xFFB1_2100
    }

    fn debug_reg_addr(&self) -> u64 {
        0xFFB1_2104
    }

    fn read_checking_offset(&self) -> Option<u64> {
        Some(0xFFB1_2108)
    }

    fn l1_membar_addr(&self) -> u64 {
        0
    }

    fn eth_membar_addr(&self) -> u64 {
        0
    }

    fn dram_membar_addr(&self) -> u64 {
        0
    }

    fn min_clock_mhz(&self) -> u32 {
        500
    }

    fn max_clock_mhz(&self) -> u32 {
        1202
    }

    fn idle_clock_mhz(&self) -> u32 {
        500
    }

    fn harvesting_noc_locations(&self) -> Vec<u32> {
        // Zig-zag fuse ordering: spreads harvested rows evenly across the
        // grid instead of clustering them at one edge.
        vec![0, 9, 1, 8, 2, 7, 3, 6, 4, 5]
    }

    fn noc0_to_noc1_x(&self) -> Vec<u32> {
        (0..self.grid.x + 2).rev().collect()
    }

    fn noc0_to_noc1_y(&self) -> Vec<u32> {
        (0..self.grid.y + 2).rev().collect()
    }

    fn translate_tensix(&self, grid: GridSize, tensix_mask: u32) -> Vec<((u32, u32), (u32, u32))> {
        let mut out = Vec::new();
        let mut harvested_rows = Vec::new();
        let mut translated_y = TENSIX_TRANSLATED_ORIGIN_Y;
        for y in 0..grid.y {
            if tensix_mask & (1 << y) != 0 {
                harvested_rows.push(y);
                continue;
            }
            for x in 0..grid.x {
                out.push(((x, y), (TENSIX_TRANSLATED_ORIGIN_X + x, translated_y)));
            }
            translated_y += 1;
        }
        for y in harvested_rows {
            for x in 0..grid.x {
                out.push(((x, y), (TENSIX_TRANSLATED_ORIGIN_X + x, translated_y)));
            }
            translated_y += 1;
        }
        out
    }

    fn translate_dram(&self, grid: GridSize, _dram_mask: u32, dram_cores_noc0: &[Vec<(u32, u32)>]) -> Vec<((u32, u32), (u32, u32))> {
        // Generation A's DRAM reordering rule (spec §4.B step 7): channels
        // aligned with a harvested Tensix row move to the tail of the
        // Translated-y ordering; this generic implementation identity-maps,
        // since the bank/row alignment table is chip-specific and not named
        // in spec §6. See DESIGN.md.
        let mut out = Vec::new();
        for bank in 0..grid.x {
            for port in 0..grid.y {
                let noc0 = dram_cores_noc0[bank as usize][port as usize];
                out.push((noc0, noc0));
            }
        }
        out
    }

    fn tlb_pool_layout(&self, size_class: TlbSizeClass) -> Result<TlbPoolLayout> {
        const STATIC_TLB_CFG_ADDR: u64 = 0x1FC0_0000;
        let reg_size = self.tlb_offsets(size_class)?.register_size_bytes as u64;
        match size_class {
            TlbSizeClass::Size1M => Ok(TlbPoolLayout {
                base_index: 0,
                count: 156,
                bar: BarRegion::Bar0,
                bar_offset: 0,
                cfg_bar_offset: STATIC_TLB_CFG_ADDR,
            }),
            TlbSizeClass::Size2M => Ok(TlbPoolLayout {
                base_index: 156,
                count: 10,
                bar: BarRegion::Bar0,
                bar_offset: 156 * (1 << 20),
                cfg_bar_offset: STATIC_TLB_CFG_ADDR + 156 * reg_size,
            }),
            TlbSizeClass::Size16M => Ok(TlbPoolLayout {
                base_index: 166,
                count: 20,
                bar: BarRegion::Bar0,
                bar_offset: 156 * (1 << 20) + 20 * (1 << 20),
                cfg_bar_offset: STATIC_TLB_CFG_ADDR + 166 * reg_size,
            }),
            TlbSizeClass::Size4G => Err(DriverError::Unsupported { what: "4 GiB TLBs" }),
        }
    }

    fn tlb_offsets(&self, size_class: TlbSizeClass) -> Result<TlbOffsets> {
        match size_class {
            TlbSizeClass::Size1M => Ok(TlbOffsets {
                local_offset: (0, 15),
                x_end: (16, 21),
                y_end: (22, 27),
                x_start: (28, 33),
                y_start: (34, 39),
                noc_sel: (40, 40),
                mcast: (41, 41),
                ordering: (42, 43),
                linked: (44, 44),
                static_vc: (45, 46),
                register_size_bytes: 8,
            }),
            TlbSizeClass::Size2M => Ok(TlbOffsets {
                local_offset: (0, 14),
                x_end: (15, 20),
                y_end: (21, 26),
                x_start: (27, 32),
                y_start: (33, 38),
                noc_sel: (39, 39),
                mcast: (40, 40),
                ordering: (41, 42),
                linked: (43, 43),
                static_vc: (44, 45),
                register_size_bytes: 8,
            }),
            TlbSizeClass::Size16M => Ok(TlbOffsets {
                local_offset: (0, 23),
                x_end: (24, 29),
                y_end: (30, 35),
                x_start: (36, 41),
                y_start: (42, 47),
                noc_sel: (48, 48),
                mcast: (49, 49),
                ordering: (50, 51),
                linked: (52, 52),
                static_vc: (53, 54),
                register_size_bytes: 8,
            }),
            TlbSizeClass::Size4G => Err(DriverError::Unsupported { what: "4 GiB TLBs" }),
        }
    }

    fn static_tlb_indices(&self) -> StaticTlbIndices {
        let base_16m = 166;
        let base_2m = 156;
        StaticTlbIndices {
            reg_tlb: base_16m + 18,
            mem_large_write_tlb: base_16m + 17,
            mem_large_read_tlb: base_16m,
            mem_small_rw_tlb: base_2m + 1,
        }
    }

    fn supports_host_dma(&self) -> bool {
        false
    }

    fn dma_buffer_size(&self) -> usize {
        0
    }

    fn requires_word_granular_device_memcpy(&self) -> bool {
        true
    }

    fn tlb_config_is_split_store(&self) -> bool {
        false
    }
}
