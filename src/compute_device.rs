use std::fmt;

use serde::{Deserialize, Serialize};

use crate::probe::ComputeDeviceProbeResult;

/// Compute backends a descriptor keeps a record for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    Cuda,
    Hip,
    OpenCl,
    // Management library data, kept for local inspection only
    Nvml,
}

impl ComputeBackend {
    /// Backends that can appear in a request, in wire order.
    pub const REPORTED: [ComputeBackend; 3] = [Self::Cuda, Self::Hip, Self::OpenCl];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Hip => "hip",
            Self::OpenCl => "opencl",
            Self::Nvml => "nvml",
        }
    }

}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability of one compute backend on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDeviceRecord {
    pub platform: u32,
    pub device: u32,
    pub compute: String,
    pub driver: String,

    #[serde(rename = "UUID", default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl ComputeDeviceRecord {
    // Build the record a valid probe result stands for,
    // returns None when the backend did not locate the device
    pub fn from_probe(
        backend: ComputeBackend,
        probe: &ComputeDeviceProbeResult,
    ) -> Option<Self> {
        let (platform, device) = (probe.platform_index?, probe.device_index?);

        // Only the management library record carries the device UUID
        let uuid = match backend {
            ComputeBackend::Nvml => probe.uuid().map(str::to_string),
            _ => None,
        };

        Some(Self {
            platform,
            device,
            compute: probe.compute_version.clone(),
            driver: probe.driver_version.clone(),
            uuid,
        })
    }
}

/// One slot per known backend, an occupied slot means the
/// backend last reported the device as valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backends {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda: Option<ComputeDeviceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hip: Option<ComputeDeviceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opencl: Option<ComputeDeviceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvml: Option<ComputeDeviceRecord>,
}

impl Backends {
    pub fn get(&self, backend: ComputeBackend) -> Option<&ComputeDeviceRecord> {
        self.slot(backend).as_ref()
    }

    pub fn contains(&self, backend: ComputeBackend) -> bool {
        self.slot(backend).is_some()
    }

    // Replace the content of a slot, returns the previous record
    pub fn replace(
        &mut self,
        backend: ComputeBackend,
        record: Option<ComputeDeviceRecord>,
    ) -> Option<ComputeDeviceRecord> {
        std::mem::replace(self.slot_mut(backend), record)
    }

    fn slot(&self, backend: ComputeBackend) -> &Option<ComputeDeviceRecord> {
        match backend {
            ComputeBackend::Cuda => &self.cuda,
            ComputeBackend::Hip => &self.hip,
            ComputeBackend::OpenCl => &self.opencl,
            ComputeBackend::Nvml => &self.nvml,
        }
    }

    fn slot_mut(
        &mut self,
        backend: ComputeBackend,
    ) -> &mut Option<ComputeDeviceRecord> {
        match backend {
            ComputeBackend::Cuda => &mut self.cuda,
            ComputeBackend::Hip => &mut self.hip,
            ComputeBackend::OpenCl => &mut self.opencl,
            ComputeBackend::Nvml => &mut self.nvml,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_probe() -> ComputeDeviceProbeResult {
        ComputeDeviceProbeResult {
            vendor_id: Some(0x10de),
            name: Some("NVIDIA GeForce RTX 3090".to_string()),
            uuid: Some("GPU-8f6a1b2c".to_string()),
            platform_index: Some(0),
            device_index: Some(1),
            compute_version: "8.6".to_string(),
            driver_version: "535.54".to_string(),
        }
    }

    #[test]
    fn test_backend_names_match_serde() {
        for backend in [
            ComputeBackend::Cuda,
            ComputeBackend::Hip,
            ComputeBackend::OpenCl,
            ComputeBackend::Nvml,
        ] {
            assert_eq!(
                serde_json::to_value(backend).unwrap(),
                serde_json::Value::from(backend.name())
            );
        }
    }

    #[test]
    fn test_nvml_is_never_reported() {
        assert!(!ComputeBackend::REPORTED.contains(&ComputeBackend::Nvml));
    }

    #[test]
    fn test_record_from_invalid_probe() {
        let probe = ComputeDeviceProbeResult {
            device_index: None,
            ..valid_probe()
        };

        assert_eq!(ComputeDeviceRecord::from_probe(ComputeBackend::Cuda, &probe), None);
    }

    #[test]
    fn test_only_nvml_record_carries_uuid() {
        let probe = valid_probe();

        let cuda = ComputeDeviceRecord::from_probe(ComputeBackend::Cuda, &probe);
        let nvml = ComputeDeviceRecord::from_probe(ComputeBackend::Nvml, &probe);

        assert_eq!(cuda.and_then(|r| r.uuid), None);
        assert_eq!(nvml.and_then(|r| r.uuid).as_deref(), Some("GPU-8f6a1b2c"));
    }

    #[test]
    fn test_record_wire_shape() {
        let record = ComputeDeviceRecord::from_probe(ComputeBackend::Cuda, &valid_probe());
        let json = serde_json::to_string(&record).unwrap();

        assert_eq!(
            json,
            r#"{"platform":0,"device":1,"compute":"8.6","driver":"535.54"}"#
        );
    }

    #[test]
    fn test_replace_slot() {
        let mut backends = Backends::default();
        let record = ComputeDeviceRecord::from_probe(ComputeBackend::Hip, &valid_probe());

        assert_eq!(backends.replace(ComputeBackend::Hip, record.clone()), None);
        assert!(backends.contains(ComputeBackend::Hip));
        assert!(!backends.contains(ComputeBackend::Cuda));

        assert_eq!(backends.replace(ComputeBackend::Hip, None), record);
        assert_eq!(backends.get(ComputeBackend::Hip), None);
    }
}
