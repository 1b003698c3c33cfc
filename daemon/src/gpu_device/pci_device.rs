use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use gpures::{PciProbeResult, TelemetryError, TelemetrySample};
use tracing::{debug, warn};

use crate::gpu_device::{GpuProbe, ProbedGpu, normalize_bus_id};

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

// Base class of display controllers (VGA, XGA, 3D and others)
const DISPLAY_CLASS: u32 = 0x03;

// Bus enumeration through sysfs, sees every GPU whatever the vendor
pub struct PciDevice {
    root: PathBuf,
}

impl PciDevice {
    pub fn new() -> Self {
        Self::with_root(Path::new(SYSFS_PCI_DEVICES))
    }

    pub fn with_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    // Return the GPU at the given sysfs device directory,
    // None if the function is not a display controller
    fn probe_slot(&self, path: &Path) -> Result<Option<ProbedGpu>> {
        let class = read_hex(&path.join("class"))?;

        if class >> 16 != DISPLAY_CLASS {
            return Ok(None);
        }

        let vendor_id = read_hex(&path.join("vendor"))?;
        let device_id = read_hex(&path.join("device"))?;

        let slot = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("Invalid PCI slot name {path:?}"))?;

        let mut gpu = ProbedGpu::new(&normalize_bus_id(slot));
        gpu.pci = Some(PciProbeResult::new(vendor_id as u16, device_id as u16));

        Ok(Some(gpu))
    }
}

impl Default for PciDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for PciDevice {
    fn name(&self) -> &'static str {
        "pci"
    }

    fn discover(&self) -> Result<Vec<ProbedGpu>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list PCI devices in {:?}", self.root))?;

        let mut gpus = Vec::new();

        for entry in entries {
            let path = entry?.path();

            // One unreadable function should not hide the others
            match self.probe_slot(&path) {
                Ok(Some(gpu)) => {
                    debug!("Found PCI display controller: \"{}\"", gpu.id);
                    gpus.push(gpu);
                }
                Ok(None) => {}
                Err(err) => warn!("Skipping PCI device {path:?}: {err:#}"),
            }
        }

        gpus.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(gpus)
    }

    fn read_telemetry(&self, id: &str) -> Result<TelemetrySample, TelemetryError> {
        Err(TelemetryError::Unavailable(id.to_string()))
    }
}

// sysfs exposes ids as "0x10de\n"
fn read_hex(path: &Path) -> Result<u32> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {path:?}"))?;
    let value = content.trim();

    u32::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex value \"{value}\" in {path:?}"))
}
