//! Cluster façade: owns every chip, brings the topology up and down, and
//! exposes cluster-wide operations that forward to or fan out across
//! per-chip ones (spec §4.I, §3 "Cluster").
//!
//! Building the chip map from a live machine requires resources this crate
//! deliberately does not open itself (spec §1 non-goal: kernel driver
//! probing, BAR mapping): a collaborator opens each MMIO-capable chip's
//! [`Transport`] and hands the result to [`Cluster::new`] alongside an
//! already-verified [`ClusterDescriptor`], the same pattern the descriptor
//! itself uses for topology data. Grounded in `cluster.cpp`'s constructor
//! (enumerate → construct local chips → construct remote chips over the
//! descriptor's `closest_mmio_chip_of` → `start_device` leaves-first) and
//! its destructor (`close_device` in reverse order).

use std::collections::HashMap;
use std::sync::Arc;

use crate::arc_messenger::{ArcMessenger, MailboxArcMessenger, QueueArcMessenger, TelemetryReader};
use crate::arch::gen_a::GenerationA;
use crate::arch::gen_b::GenerationB;
use crate::arch::{ArchImplementation, RiscType};
use crate::chip::Chip;
use crate::cluster_descriptor::{ChipArchitecture, ChipId, ClusterDescriptor};
use crate::config::DriverConfig;
use crate::coord::CoordinateManager;
use crate::coord::CoordinateManagerInputs;
use crate::error::{DriverError, Result};
use crate::lock_manager::LockManager;
use crate::remote::RemoteCommunication;
use crate::sysmem::SysmemManager;
use crate::tlb_manager::TlbManager;
use crate::transport::Transport;
use crate::ttdevice::TTDevice;

/// Resources a collaborator has already opened for one MMIO-capable chip:
/// its transport over PCI BARs, and, if firmware publishes one, the
/// CSM-relative offset of its telemetry table (spec §4.F `get_clock`,
/// SPEC_FULL.md §B.4). Discovering the offset is a firmware/sysfs concern
/// this crate does not model, the same way BAR mapping itself isn't.
pub struct LocalChipResources {
    pub transport: Arc<dyn Transport>,
    pub telemetry_table_offset: Option<u64>,
}

/// Supplies the architecture-fixed core-grid layout a chip's
/// `CoordinateManager` is built from (spec §3 "SocDescriptor"). The layout
/// is identical for every chip of a given architecture — only harvesting and
/// the NOC-translation flag vary per chip, and those already live in
/// [`ClusterDescriptor`] — so this is keyed by architecture rather than by
/// chip id.
pub trait SocDescriptorSource: Send + Sync {
    fn coordinate_inputs(&self, arch: ChipArchitecture) -> CoordinateManagerInputs;
}

fn arch_impl(arch: ChipArchitecture) -> Arc<dyn ArchImplementation> {
    match arch {
        ChipArchitecture::GenerationA => Arc::new(GenerationA::new()),
        ChipArchitecture::GenerationB => Arc::new(GenerationB::new()),
    }
}

fn arc_messenger_for(
    arch_kind: ChipArchitecture,
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    locks: Arc<LockManager>,
    config: DriverConfig,
    chip_id: ChipId,
) -> Arc<dyn ArcMessenger> {
    match arch_kind {
        ChipArchitecture::GenerationA => Arc::new(MailboxArcMessenger::new(arch, transport, locks, config, chip_id)),
        ChipArchitecture::GenerationB => Arc::new(QueueArcMessenger::new(arch, transport, locks, config, chip_id)),
    }
}

/// Owns the immutable topology plus every live chip (spec §3 "Cluster").
pub struct Cluster {
    descriptor: ClusterDescriptor,
    chips: HashMap<ChipId, Chip>,
}

impl Cluster {
    /// Builds every chip the descriptor describes and brings the cluster up
    /// (spec §4.I steps 1-3).
    ///
    /// `local_resources` must carry one entry for every chip
    /// `descriptor.chips_with_mmio()` names; chips not marked MMIO-capable
    /// are constructed as remote chips routed through the local chip their
    /// descriptor's `closest_mmio_chip_of` names, so no entry is needed (or
    /// consulted) for them.
    pub fn new(
        mut descriptor: ClusterDescriptor,
        mut local_resources: HashMap<ChipId, LocalChipResources>,
        soc: &dyn SocDescriptorSource,
        config: DriverConfig,
    ) -> Result<Self> {
        let locks = Arc::new(LockManager::new(config.lock_directory.clone()));
        let mut chips = HashMap::new();

        for chip_id in descriptor.chips_with_mmio().collect::<Vec<_>>() {
            let record = descriptor.chip_record(chip_id)?.clone();
            let resources = local_resources
                .remove(&chip_id)
                .ok_or_else(|| DriverError::Verification(format!("chip {chip_id} is MMIO-capable but has no opened transport")))?;

            let arch = arch_impl(record.arch);
            let coord_mgr = CoordinateManager::new(arch.as_ref(), record.noc_translation_enabled, record.harvesting, soc.coordinate_inputs(record.arch));
            let tlb_manager = Arc::new(TlbManager::new(arch.clone(), resources.transport.clone()));
            let messenger = arc_messenger_for(record.arch, arch.clone(), resources.transport.clone(), locks.clone(), config.clone(), chip_id);
            let telemetry = resources
                .telemetry_table_offset
                .map(|offset| TelemetryReader::new(arch.clone(), resources.transport.clone(), offset));
            let device = TTDevice::new(
                arch.clone(),
                resources.transport.clone(),
                tlb_manager.clone(),
                messenger,
                telemetry,
                locks.clone(),
                config.clone(),
                chip_id,
            );
            let remote = Arc::new(RemoteCommunication::new(arch.clone(), resources.transport.clone()));
            let chip = Chip::new_local(chip_id, arch, coord_mgr, device, tlb_manager, SysmemManager::new(), remote, locks.clone());
            chips.insert(chip_id, chip);
        }

        let non_mmio: Vec<ChipId> = descriptor.all_chips().filter(|id| !descriptor.is_chip_mmio_capable(*id)).collect();
        for chip_id in non_mmio {
            let closest = descriptor.get_closest_mmio_capable_chip(chip_id)?;
            let remote = chips
                .get(&closest)
                .ok_or_else(|| DriverError::Verification(format!("closest mmio chip {closest} for chip {chip_id} was not constructed")))?
                .remote_communication();

            let record = descriptor.chip_record(chip_id)?.clone();
            let arch = arch_impl(record.arch);
            let coord_mgr = CoordinateManager::new(arch.as_ref(), record.noc_translation_enabled, record.harvesting, soc.coordinate_inputs(record.arch));
            let chip = Chip::new_remote(chip_id, arch, coord_mgr, record.location, remote, locks.clone());
            chips.insert(chip_id, chip);
        }

        let cluster = Cluster { descriptor, chips };
        cluster.start_all()?;
        Ok(cluster)
    }

    pub fn chip(&self, chip_id: ChipId) -> Result<&Chip> {
        self.chips.get(&chip_id).ok_or_else(|| DriverError::Verification(format!("no such chip {chip_id}")))
    }

    pub fn chip_ids(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.chips.keys().copied()
    }

    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    /// Starts every remote (leaf) chip before the local (MMIO-capable) chips
    /// that carry their Ethernet traffic, then every local chip (spec §4.I
    /// step 3 "leaves-first order").
    fn start_all(&self) -> Result<()> {
        for chip_id in self.descriptor.all_chips().filter(|id| !self.descriptor.is_chip_mmio_capable(*id)) {
            self.chips[&chip_id].start_device()?;
        }
        for chip_id in self.descriptor.chips_with_mmio() {
            self.chips[&chip_id].start_device()?;
        }
        Ok(())
    }

    /// Closes every local chip, then every remote chip: the reverse of
    /// `start_all`'s order (spec §4.I "Teardown: `close_device` ... in
    /// reverse order").
    pub fn close(&self) -> Result<()> {
        for chip_id in self.descriptor.chips_with_mmio() {
            self.chips[&chip_id].close_device()?;
        }
        for chip_id in self.descriptor.all_chips().filter(|id| !self.descriptor.is_chip_mmio_capable(*id)) {
            self.chips[&chip_id].close_device()?;
        }
        Ok(())
    }

    /// Broadcasts a write to every Tensix core that survives the chip,
    /// row, and column filters (spec §4.I "broadcast writes to a
    /// filter-selected subset of chips/rows/columns"). Rows and columns are
    /// Logical coordinates; hardware NoC multicast stays scoped to a single
    /// chip (spec §4.H `noc_multicast_write`), so across-chip fan-out here
    /// is a plain per-core loop.
    pub fn broadcast_write(&self, chip_filter: impl Fn(ChipId) -> bool, rows: Option<&[u32]>, cols: Option<&[u32]>, addr: u64, data: &[u8]) -> Result<()> {
        for (&chip_id, chip) in &self.chips {
            if !chip.is_local() || !chip_filter(chip_id) {
                continue;
            }
            for core in chip.tensix_cores() {
                if rows.is_some_and(|rows| !rows.contains(&core.y)) {
                    continue;
                }
                if cols.is_some_and(|cols| !cols.contains(&core.x)) {
                    continue;
                }
                chip.write_to_device(core, addr, data)?;
            }
        }
        Ok(())
    }

    /// Drains outstanding Ethernet traffic on every chip (spec §4.I "global
    /// `wait_for_non_mmio_flush`").
    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        for chip in self.chips.values() {
            chip.wait_for_non_mmio_flush()?;
        }
        Ok(())
    }

    /// Deasserts `which`'s soft-reset bit on every Tensix core of every
    /// local chip (spec §4.I "global `deassert_risc_reset`").
    pub fn deassert_risc_reset_all(&self, which: RiscType, staggered: bool) -> Result<()> {
        for chip in self.chips.values() {
            if chip.is_local() {
                chip.deassert_risc_reset_all_tensix(which, staggered)?;
            }
        }
        Ok(())
    }

    /// Current AICLK of every local chip, keyed by chip id (spec §4.I
    /// "cluster-wide clock map"). A chip whose clock can't be read is
    /// omitted rather than failing the whole call, consistent with this
    /// crate's treatment of per-chip telemetry as best-effort (spec §4.F
    /// `get_clock`).
    pub fn clock_map(&self) -> HashMap<ChipId, u32> {
        self.chips
            .iter()
            .filter(|(_, chip)| chip.is_local())
            .filter_map(|(&id, chip)| chip.get_clock().ok().map(|clock| (id, clock)))
            .collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("cluster teardown did not complete cleanly: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{CoreCoord, CoreType, GridSize, HarvestingMasks};
    use crate::transport::SimulationBackend;
    use std::collections::HashSet;

    struct FixedSocDescriptors;

    impl SocDescriptorSource for FixedSocDescriptors {
        fn coordinate_inputs(&self, _arch: ChipArchitecture) -> CoordinateManagerInputs {
            let mut tensix_cores = Vec::new();
            for y in 0..4 {
                for x in 0..4 {
                    tensix_cores.push((x + 1, y + 1));
                }
            }
            CoordinateManagerInputs {
                tensix_grid: GridSize { x: 4, y: 4 },
                tensix_cores_noc0: tensix_cores,
                dram_grid: GridSize { x: 1, y: 1 },
                dram_cores_noc0: vec![vec![(0, 0)]],
                eth_cores_noc0: vec![(9, 0), (9, 1)],
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
    }

    fn chip_record(arch: ChipArchitecture) -> crate::cluster_descriptor::ChipRecord {
        crate::cluster_descriptor::ChipRecord {
            arch,
            board_type: crate::cluster_descriptor::BoardType::Default,
            board_id: Some(1),
            harvesting: HarvestingMasks::default(),
            noc_translation_enabled: true,
            pci_bdf: Some("0000:01:00.0".into()),
            unique_id: 0,
            location: Default::default(),
            asic_location: 0,
            bus_id: 0,
        }
    }

    fn single_mmio_chip_cluster() -> Cluster {
        let mut chips = HashMap::new();
        chips.insert(0, chip_record(ChipArchitecture::GenerationB));
        let descriptor = ClusterDescriptor::new(chips, HashMap::new(), HashSet::from([0])).unwrap();

        let mut resources = HashMap::new();
        resources.insert(
            0,
            LocalChipResources {
                transport: Arc::new(SimulationBackend::new()),
                telemetry_table_offset: None,
            },
        );

        Cluster::new(descriptor, resources, &FixedSocDescriptors, DriverConfig::default()).unwrap()
    }

    #[test]
    fn construction_starts_every_chip() {
        let cluster = single_mmio_chip_cluster();
        assert_eq!(cluster.chip_ids().count(), 1);
        cluster.chip(0).unwrap().start_device().unwrap();
    }

    #[test]
    fn missing_transport_for_an_mmio_chip_is_an_error() {
        let mut chips = HashMap::new();
        chips.insert(0, chip_record(ChipArchitecture::GenerationB));
        let descriptor = ClusterDescriptor::new(chips, HashMap::new(), HashSet::from([0])).unwrap();
        let result = Cluster::new(descriptor, HashMap::new(), &FixedSocDescriptors, DriverConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn broadcast_write_reaches_every_selected_core() {
        let cluster = single_mmio_chip_cluster();
        let data = vec![0xAAu8; 4];
        cluster.broadcast_write(|_| true, Some(&[0]), None, 0x100, &data).unwrap();
        let chip = cluster.chip(0).unwrap();
        let core = CoreCoord::new(0, 0, CoreType::Tensix, crate::coord::CoordSystem::Logical);
        let mut buf = vec![0u8; data.len()];
        chip.read_from_device(core, 0x100, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn clock_map_reports_every_local_chip() {
        let cluster = single_mmio_chip_cluster();
        let map = cluster.clock_map();
        assert_eq!(map.len(), 1);
    }
}
