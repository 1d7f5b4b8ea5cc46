//! Generation-B architecture constants: queue ARC protocol, {2 MiB, 4 GiB}
//! TLB classes, host DMA, and a split 8+4 byte TLB configuration write.

use super::*;
use crate::coord::GridSize;
use crate::error::{DriverError, Result};

const DRAM_TRANSLATED_ORIGIN_X: u32 = 0;

pub struct GenerationB {
    grid: GridSize,
}

impl GenerationB {
    pub fn new() -> Self {
        GenerationB {
            grid: GridSize { x: 8, y: 8 },
        }
    }
}

impl Default for GenerationB {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchImplementation for GenerationB {
    fn name(&self) -> &'static str {
        "generation-b"
    }

    fn grid_size_x(&self) -> u32 {
        self.grid.x
    }

    fn grid_size_y(&self) -> u32 {
        self.grid.y
    }

    fn num_eth_channels(&self) -> u32 {
        14
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
        None
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

    fn arc_queue_scratch_pointer_offset(&self) -> Result<u32> {
        // SCRATCH_RAM_11 (spec §4.E "Discovery of the queue base").
        Ok(0x2c)
    }

    fn tensix_soft_reset_addr(&self) -> u64 {
        0xFFB1_2100
    }

    fn debug_reg_addr(&self) -> u64 {
        0xFFB1_2104
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

    fn always_routes_translated(&self) -> bool {
        true
    }

    fn min_clock_mhz(&self) -> u32 {
        800
    }

    fn max_clock_mhz(&self) -> u32 {
        1350
    }

    fn idle_clock_mhz(&self) -> u32 {
        800
    }

    fn harvesting_noc_locations(&self) -> Vec<u32> {
        vec![0, 7, 1, 6, 2, 5, 3, 4]
    }

    fn noc0_to_noc1_x(&self) -> Vec<u32> {
        (0..self.grid.x + 2).rev().collect()
    }

    fn noc0_to_noc1_y(&self) -> Vec<u32> {
        (0..self.grid.y + 2).rev().collect()
    }

    fn translate_tensix(&self, grid: GridSize, _tensix_mask: u32) -> Vec<((u32, u32), (u32, u32))> {
        // Generation B's hook generalizes to Tensix as identity; the named
        // redesign in spec §4.B step 7 is DRAM-specific for this generation.
        let mut out = Vec::new();
        for y in 0..grid.y {
            for x in 0..grid.x {
                out.push(((x, y), (x, y)));
            }
        }
        out
    }

    fn translate_dram(&self, grid: GridSize, dram_mask: u32, dram_cores_noc0: &[Vec<(u32, u32)>]) -> Vec<((u32, u32), (u32, u32))> {
        // Permute banks so the harvested bank moves to the back of the
        // Translated-x ordering (spec §4.B step 7).
        let mut order: Vec<u32> = (0..grid.x).filter(|b| dram_mask & (1 << b) == 0).collect();
        order.extend((0..grid.x).filter(|b| dram_mask & (1 << b) != 0));

        let mut out = Vec::new();
        for (translated_bank, &bank) in order.iter().enumerate() {
            for port in 0..grid.y {
                let noc0 = dram_cores_noc0[bank as usize][port as usize];
                out.push((noc0, (DRAM_TRANSLATED_ORIGIN_X + translated_bank as u32, port)));
            }
        }
        out
    }

    fn tlb_pool_layout(&self, size_class: TlbSizeClass) -> Result<TlbPoolLayout> {
        const STATIC_TLB_CFG_ADDR: u64 = 0x1FC0_0000;
        let reg_size = self.tlb_offsets(size_class).map(|o| o.register_size_bytes as u64).unwrap_or(12);
        match size_class {
            TlbSizeClass::Size2M => Ok(TlbPoolLayout {
                base_index: 0,
                count: 202,
                bar: BarRegion::Bar0,
                bar_offset: 0,
                cfg_bar_offset: STATIC_TLB_CFG_ADDR,
            }),
            TlbSizeClass::Size4G => Ok(TlbPoolLayout {
                base_index: 202,
                count: 8,
                bar: BarRegion::Bar4,
                bar_offset: 0,
                cfg_bar_offset: STATIC_TLB_CFG_ADDR + 202 * reg_size,
            }),
            TlbSizeClass::Size1M | TlbSizeClass::Size16M => Err(DriverError::Unsupported {
                what: "1 MiB/16 MiB TLBs on generation B",
            }),
        }
    }

    fn tlb_offsets(&self, size_class: TlbSizeClass) -> Result<TlbOffsets> {
        match size_class {
            TlbSizeClass::Size2M => Ok(TlbOffsets {
                local_offset: (0, 14),
                x_end: (43, 49),
                y_end: (50, 55),
                x_start: (55, 60),
                y_start: (61, 66),
                noc_sel: (67, 67),
                mcast: (68, 68),
                ordering: (69, 70),
                linked: (71, 71),
                static_vc: (72, 74),
                register_size_bytes: 12,
            }),
            TlbSizeClass::Size4G => Ok(TlbOffsets {
                local_offset: (0, 31),
                x_end: (43, 49),
                y_end: (50, 55),
                x_start: (55, 60),
                y_start: (61, 66),
                noc_sel: (67, 67),
                mcast: (68, 68),
                ordering: (69, 70),
                linked: (71, 71),
                static_vc: (72, 74),
                register_size_bytes: 12,
            }),
            TlbSizeClass::Size1M | TlbSizeClass::Size16M => Err(DriverError::Unsupported {
                what: "1 MiB/16 MiB TLBs on generation B",
            }),
        }
    }

    fn static_tlb_indices(&self) -> StaticTlbIndices {
        let base_2m = 0;
        StaticTlbIndices {
            reg_tlb: base_2m + 191,
            mem_large_write_tlb: base_2m + 181,
            mem_large_read_tlb: base_2m + 182,
            mem_small_rw_tlb: base_2m + 183,
        }
    }

    fn supports_host_dma(&self) -> bool {
        true
    }

    fn dma_buffer_size(&self) -> usize {
        4 << 20
    }

    fn requires_word_granular_device_memcpy(&self) -> bool {
        false
    }

    fn tlb_config_is_split_store(&self) -> bool {
        true
    }
}
