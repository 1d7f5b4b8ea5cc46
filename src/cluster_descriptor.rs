//! Immutable cluster topology: which chips exist, how they're wired by
//! Ethernet, which are MMIO-capable, and their harvesting/board metadata
//! (spec §4.J).
//!
//! Building one from a YAML cluster-connectivity file is out of scope (spec
//! §1); callers hand in the parsed fields directly via [`ClusterDescriptor::new`]
//! and this module only validates and serves them. Grounded in
//! `new_device/cluster_descriptor.h` and the verification behavior of
//! `device/cluster_descriptor.cpp`.

use std::collections::{HashMap, HashSet};

use num_enum::TryFromPrimitive;

use crate::coord::HarvestingMasks;
use crate::error::{DriverError, Result};

pub type ChipId = u32;
pub type EthChannel = u32;

/// A chip's position in the galaxy-style rack/shelf/x/y addressing scheme
/// (spec §3 "location (rack/shelf/x/y)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EthCoord {
    pub rack: u32,
    pub shelf: u32,
    pub x: u32,
    pub y: u32,
}

/// Board SKUs a chip can sit on (spec §3 glossary "Board type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum BoardType {
    N150 = 0,
    N300 = 1,
    Galaxy = 2,
    Default = 3,
}

impl BoardType {
    /// Expected harvested-unit count for a well-formed board of this type;
    /// `None` means "no expectation", used for `Default`.
    fn expected_harvested_tensix_rows(self) -> Option<u32> {
        match self {
            BoardType::N150 | BoardType::N300 => Some(1),
            BoardType::Galaxy => Some(0),
            BoardType::Default => None,
        }
    }
}

/// Which chip generation this entry describes. Kept separate from
/// `ArchImplementation` so the descriptor stays plain data with no trait
/// objects (spec §4.J "Pure data plus typed accessors").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipArchitecture {
    GenerationA,
    GenerationB,
}

/// Everything the descriptor knows about one chip, independent of whether a
/// live `Chip` has been constructed for it.
#[derive(Debug, Clone)]
pub struct ChipRecord {
    pub arch: ChipArchitecture,
    pub board_type: BoardType,
    pub board_id: Option<u64>,
    pub harvesting: HarvestingMasks,
    pub noc_translation_enabled: bool,
    pub pci_bdf: Option<String>,
    pub unique_id: u64,
    pub location: EthCoord,
    pub asic_location: u32,
    pub bus_id: u32,
}

/// Pure topology data handed in by a collaborator (spec §4.J). Once built and
/// verified, nothing in this crate mutates it.
pub struct ClusterDescriptor {
    chips: HashMap<ChipId, ChipRecord>,
    /// `chip -> channel -> (remote chip, remote channel)`.
    ethernet_connections: HashMap<ChipId, HashMap<EthChannel, (ChipId, EthChannel)>>,
    mmio_capable: HashSet<ChipId>,
    closest_mmio_chip_cache: HashMap<ChipId, ChipId>,
}

impl ClusterDescriptor {
    /// Builds a descriptor from already-parsed fields and runs its
    /// verification pass (spec §4.J). Mixed architectures and asymmetric
    /// Ethernet links are fatal; harvesting-count mismatches only warn.
    pub fn new(
        chips: HashMap<ChipId, ChipRecord>,
        ethernet_connections: HashMap<ChipId, HashMap<EthChannel, (ChipId, EthChannel)>>,
        mmio_capable: HashSet<ChipId>,
    ) -> Result<Self> {
        let descriptor = ClusterDescriptor {
            chips,
            ethernet_connections,
            mmio_capable,
            closest_mmio_chip_cache: HashMap::new(),
        };
        descriptor.verify()?;
        Ok(descriptor)
    }

    fn verify(&self) -> Result<()> {
        let mut archs = self.chips.values().map(|c| c.arch);
        if let Some(first) = archs.next() {
            if archs.any(|a| a != first) {
                return Err(DriverError::Verification("cluster contains chips of more than one architecture".into()));
            }
        }

        for (&chip, channels) in &self.ethernet_connections {
            for (&channel, &(remote_chip, remote_channel)) in channels {
                let reflected = self
                    .ethernet_connections
                    .get(&remote_chip)
                    .and_then(|m| m.get(&remote_channel))
                    .copied();
                if reflected != Some((chip, channel)) {
                    return Err(DriverError::Verification(format!(
                        "ethernet connection {chip}:{channel} -> {remote_chip}:{remote_channel} is not symmetric"
                    )));
                }
            }
        }

        for (&chip, record) in &self.chips {
            if let Some(expected) = record.board_type.expected_harvested_tensix_rows() {
                let reported = record.harvesting.tensix.count_ones();
                if reported != expected {
                    log::warn!(
                        "chip {chip} on board {:?} reports {reported} harvested tensix row(s), expected {expected}",
                        record.board_type
                    );
                }
            }
            if record.board_id.is_none() {
                log::warn!("chip {chip} does not have a board ID assigned");
            }
            if self.mmio_capable.contains(&chip) && record.pci_bdf.is_none() {
                log::warn!("chip {chip} is marked MMIO-capable but has no PCI BDF recorded");
            }
        }

        for &chip in self.mmio_capable.iter() {
            if !self.chips.contains_key(&chip) {
                return Err(DriverError::Verification(format!("chip {chip} is marked MMIO-capable but is not a known chip")));
            }
        }

        Ok(())
    }

    pub fn all_chips(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.chips.keys().copied()
    }

    pub fn get_number_of_chips(&self) -> usize {
        self.chips.len()
    }

    pub fn chip_record(&self, chip: ChipId) -> Result<&ChipRecord> {
        self.chips.get(&chip).ok_or(DriverError::Verification(format!("no such chip {chip}")))
    }

    pub fn is_chip_mmio_capable(&self, chip: ChipId) -> bool {
        self.mmio_capable.contains(&chip)
    }

    pub fn chips_with_mmio(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.mmio_capable.iter().copied()
    }

    pub fn get_board_type(&self, chip: ChipId) -> Result<BoardType> {
        Ok(self.chip_record(chip)?.board_type)
    }

    pub fn get_harvesting_info(&self, chip: ChipId) -> Result<HarvestingMasks> {
        Ok(self.chip_record(chip)?.harvesting)
    }

    pub fn get_noc_translation_enabled(&self, chip: ChipId) -> Result<bool> {
        Ok(self.chip_record(chip)?.noc_translation_enabled)
    }

    pub fn get_chip_location(&self, chip: ChipId) -> Result<EthCoord> {
        Ok(self.chip_record(chip)?.location)
    }

    pub fn ethernet_connections(&self) -> &HashMap<ChipId, HashMap<EthChannel, (ChipId, EthChannel)>> {
        &self.ethernet_connections
    }

    pub fn ethernet_core_has_active_link(&self, chip: ChipId, channel: EthChannel) -> bool {
        self.ethernet_connections.get(&chip).is_some_and(|m| m.contains_key(&channel))
    }

    pub fn get_chip_and_channel_of_remote_ethernet_core(&self, chip: ChipId, channel: EthChannel) -> Option<(ChipId, EthChannel)> {
        self.ethernet_connections.get(&chip)?.get(&channel).copied()
    }

    /// Breadth-first search over the Ethernet graph restricted to
    /// MMIO-capable chips, caching the result per source chip (spec §4.I
    /// "closest_mmio_chip_of").
    pub fn get_closest_mmio_capable_chip(&mut self, chip: ChipId) -> Result<ChipId> {
        if self.mmio_capable.contains(&chip) {
            return Ok(chip);
        }
        if let Some(&cached) = self.closest_mmio_chip_cache.get(&chip) {
            return Ok(cached);
        }

        let mut visited = HashSet::new();
        let mut frontier = vec![chip];
        visited.insert(chip);
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node in frontier {
                let Some(channels) = self.ethernet_connections.get(&node) else {
                    continue;
                };
                for &(remote, _) in channels.values() {
                    if !visited.insert(remote) {
                        continue;
                    }
                    if self.mmio_capable.contains(&remote) {
                        self.closest_mmio_chip_cache.insert(chip, remote);
                        return Ok(remote);
                    }
                    next.push(remote);
                }
            }
            frontier = next;
        }

        Err(DriverError::Verification(format!("closest mmio capable chip not found for chip {chip}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(arch: ChipArchitecture, board: BoardType) -> ChipRecord {
        ChipRecord {
            arch,
            board_type: board,
            board_id: Some(1),
            harvesting: HarvestingMasks::default(),
            noc_translation_enabled: false,
            pci_bdf: Some("0000:01:00.0".into()),
            unique_id: 0,
            location: EthCoord::default(),
            asic_location: 0,
            bus_id: 0,
        }
    }

    #[test]
    fn mixed_architectures_are_fatal() {
        let mut chips = HashMap::new();
        chips.insert(0, record(ChipArchitecture::GenerationA, BoardType::Default));
        chips.insert(1, record(ChipArchitecture::GenerationB, BoardType::Default));
        let result = ClusterDescriptor::new(chips, HashMap::new(), HashSet::from([0, 1]));
        assert!(matches!(result, Err(DriverError::Verification(_))));
    }

    #[test]
    fn asymmetric_ethernet_link_is_fatal() {
        let mut chips = HashMap::new();
        chips.insert(0, record(ChipArchitecture::GenerationB, BoardType::Default));
        chips.insert(1, record(ChipArchitecture::GenerationB, BoardType::Default));
        let mut eth = HashMap::new();
        eth.insert(0, HashMap::from([(0, (1, 0))]));
        // Chip 1 does not reflect the connection back.
        let result = ClusterDescriptor::new(chips, eth, HashSet::from([0, 1]));
        assert!(matches!(result, Err(DriverError::Verification(_))));
    }

    #[test]
    fn symmetric_topology_verifies_cleanly() {
        let mut chips = HashMap::new();
        chips.insert(0, record(ChipArchitecture::GenerationB, BoardType::Default));
        chips.insert(1, record(ChipArchitecture::GenerationB, BoardType::Default));
        let mut eth = HashMap::new();
        eth.insert(0, HashMap::from([(0, (1, 0))]));
        eth.insert(1, HashMap::from([(0, (0, 0))]));
        let descriptor = ClusterDescriptor::new(chips, eth, HashSet::from([0]));
        assert!(descriptor.is_ok());
    }

    #[test]
    fn closest_mmio_chip_is_found_across_two_hops() {
        let mut chips = HashMap::new();
        for id in 0..3 {
            chips.insert(id, record(ChipArchitecture::GenerationB, BoardType::Default));
        }
        let mut eth = HashMap::new();
        eth.insert(0, HashMap::from([(0, (1, 0))]));
        eth.insert(1, HashMap::from([(0, (0, 0)), (1, (2, 0))]));
        eth.insert(2, HashMap::from([(0, (1, 1))]));
        let mut descriptor = ClusterDescriptor::new(chips, eth, HashSet::from([0])).unwrap();
        assert_eq!(descriptor.get_closest_mmio_capable_chip(2).unwrap(), 0);
    }

    #[test]
    fn unreachable_chip_reports_verification_error() {
        let mut chips = HashMap::new();
        chips.insert(0, record(ChipArchitecture::GenerationB, BoardType::Default));
        chips.insert(1, record(ChipArchitecture::GenerationB, BoardType::Default));
        let mut descriptor = ClusterDescriptor::new(chips, HashMap::new(), HashSet::from([0])).unwrap();
        assert!(descriptor.get_closest_mmio_capable_chip(1).is_err());
    }
}
