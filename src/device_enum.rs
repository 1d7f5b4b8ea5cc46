//! Enumeration of local PCI-attached chips (SPEC_FULL.md §B.1).
//!
//! Walking `/sys/bus/pci/devices` and opening the kernel driver's device
//! nodes is a collaborator's concern (spec §1 "command-line front-ends ...
//! out of scope"); this module only defines the typed record a
//! [`DeviceEnumerator`] hands back and a couple of architecture-id constants
//! grounded in `ideal_device/pci/pci_device.h`'s `PCIDevice` fields.

use pci_types::{DeviceId, PciAddress, VendorId};

use crate::cluster_descriptor::ChipArchitecture;
use crate::error::Result;

/// Tenstorrent's PCI vendor ID, used to recognize a device as belonging to
/// this family before dispatching on its device ID.
pub const TENSTORRENT_VENDOR_ID: VendorId = 0x1e52;

pub fn architecture_for_device_id(device_id: DeviceId) -> Option<ChipArchitecture> {
    match device_id {
        0x401e => Some(ChipArchitecture::GenerationA),
        0xb140 => Some(ChipArchitecture::GenerationB),
        _ => None,
    }
}

/// Everything known about one local chip before a `Chip` is constructed for
/// it: its PCI location, architecture, NUMA affinity, and the logical index
/// the kernel driver assigned it.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    pub address: PciAddress,
    pub device_id: DeviceId,
    pub arch: ChipArchitecture,
    pub logical_id: u32,
    pub numa_node: Option<u32>,
    pub revision_id: u8,
}

/// Discovers local chips. Implemented by a collaborator that walks sysfs or
/// talks to the kernel driver directly; this crate only needs the resulting
/// records (spec §1 non-goal "command-line front-ends").
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<PciDeviceInfo>>;
}

/// An enumerator fed a fixed list, for tests and for embedding applications
/// that already know their topology.
pub struct StaticDeviceEnumerator {
    devices: Vec<PciDeviceInfo>,
}

impl StaticDeviceEnumerator {
    pub fn new(devices: Vec<PciDeviceInfo>) -> Self {
        StaticDeviceEnumerator { devices }
    }
}

impl DeviceEnumerator for StaticDeviceEnumerator {
    fn enumerate(&self) -> Result<Vec<PciDeviceInfo>> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_both_generations_by_device_id() {
        assert_eq!(architecture_for_device_id(0x401e), Some(ChipArchitecture::GenerationA));
        assert_eq!(architecture_for_device_id(0xb140), Some(ChipArchitecture::GenerationB));
        assert_eq!(architecture_for_device_id(0x0), None);
    }

    #[test]
    fn static_enumerator_returns_what_it_was_given() {
        let info = PciDeviceInfo {
            address: PciAddress::new(0, 1, 0, 0),
            device_id: 0xb140,
            arch: ChipArchitecture::GenerationB,
            logical_id: 0,
            numa_node: Some(0),
            revision_id: 1,
        };
        let enumerator = StaticDeviceEnumerator::new(vec![info]);
        let devices = enumerator.enumerate().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].logical_id, 0);
    }
}
