// Results handed to the descriptor by the probing collaborators

use serde::{Deserialize, Serialize};

/// Bus-level identity of a GPU as reported by PCI enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciProbeResult {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciProbeResult {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
        }
    }

    // Split the combined 32 bit id used by NVML, the vendor
    // lives in the low half and the device in the high half
    pub fn from_pci_device_id(pci_device_id: u32) -> Self {
        Self {
            vendor_id: (pci_device_id & 0xffff) as u16,
            device_id: (pci_device_id >> 16) as u16,
        }
    }
}

/// What one compute backend (CUDA, HIP, OpenCL, NVML) reported for a device.
///
/// Every field is optional from the backend's point of view: a backend can
/// know the vendor without being usable, or be usable without knowing the
/// device name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDeviceProbeResult {
    pub vendor_id: Option<u16>,

    pub name: Option<String>,
    pub uuid: Option<String>,

    pub platform_index: Option<u32>,
    pub device_index: Option<u32>,

    pub compute_version: String,
    pub driver_version: String,
}

impl ComputeDeviceProbeResult {
    // A backend is usable only once it has located the device
    pub fn is_valid(&self) -> bool {
        self.platform_index.is_some() && self.device_index.is_some()
    }

    // Name and UUID only count when they carry text
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref().filter(|uuid| !uuid.is_empty())
    }
}
