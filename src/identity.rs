use serde::{Deserialize, Serialize};

use crate::{
    probe::{ComputeDeviceProbeResult, PciProbeResult},
    vendor::GpuVendor,
};

/// Identity fields of a GPU, filled from bus and compute probes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<u16>,
    // Lowercase vendor name
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Where identity data comes from, in decreasing order of authority.
#[derive(Debug, Clone, Copy)]
pub enum IdentitySource<'a> {
    Pci(&'a PciProbeResult),
    Compute(&'a ComputeDeviceProbeResult),
}

impl Identity {
    /// Merge data from one probe into the identity.
    ///
    /// The bus probe owns `vendor`, `device` and `type` and always
    /// overwrites them. Compute probes only fill fields nobody has set yet,
    /// so whatever order the probes report in, the bus data ends up on top.
    /// `description` and `uuid` go to the first source that supplies them.
    pub fn merge(&mut self, source: IdentitySource<'_>) {
        match source {
            IdentitySource::Pci(pci) => {
                self.vendor = Some(pci.vendor_id);
                self.device = Some(pci.device_id);
                self.kind = Some(vendor_name(pci.vendor_id));
            }
            IdentitySource::Compute(probe) => {
                if let Some(vendor_id) = probe.vendor_id {
                    self.vendor.get_or_insert(vendor_id);
                    self.kind.get_or_insert_with(|| vendor_name(vendor_id));
                }

                if let Some(name) = probe.name() {
                    self.description.get_or_insert_with(|| name.to_string());
                }
                if let Some(uuid) = probe.uuid() {
                    self.uuid.get_or_insert_with(|| uuid.to_string());
                }
            }
        }
    }
}

fn vendor_name(vendor_id: u16) -> String {
    GpuVendor::from_vendor_id(vendor_id).name().to_string()
}
