use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{
    compute_device::{ComputeBackend, ComputeDeviceRecord},
    errors::DescriptorError,
};

/// The part of a descriptor the dispatch service gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequest {
    pub gpu: String,
    pub vendor: u16,
    pub device: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda: Option<ComputeDeviceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hip: Option<ComputeDeviceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opencl: Option<ComputeDeviceRecord>,
}

impl GpuRequest {
    pub fn new(gpu: &str, vendor: u16, device: u16) -> Self {
        Self {
            gpu: gpu.to_string(),
            vendor,
            device,
            cuda: None,
            hip: None,
            opencl: None,
        }
    }

    // Attach a backend record, management data has no place in a request
    pub fn insert(&mut self, backend: ComputeBackend, record: ComputeDeviceRecord) {
        let record = ComputeDeviceRecord {
            uuid: None,
            ..record
        };

        match backend {
            ComputeBackend::Cuda => self.cuda = Some(record),
            ComputeBackend::Hip => self.hip = Some(record),
            ComputeBackend::OpenCl => self.opencl = Some(record),
            ComputeBackend::Nvml => {}
        }
    }

    pub fn write_to<W: Write>(&self, sink: W) -> Result<(), DescriptorError> {
        serde_json::to_writer(sink, self)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ComputeDeviceRecord {
        ComputeDeviceRecord {
            platform: 0,
            device: 0,
            compute: "8.6".to_string(),
            driver: "535.54".to_string(),
            uuid: Some("GPU-0001".to_string()),
        }
    }

    #[test]
    fn test_key_order_and_absent_backends() {
        let mut request = GpuRequest::new("nvidia", 0x10de, 0x2204);
        request.insert(ComputeBackend::OpenCl, record());

        let mut json = Vec::new();
        request.write_to(&mut json).unwrap();

        assert_eq!(
            String::from_utf8(json).unwrap(),
            r#"{"gpu":"nvidia","vendor":4318,"device":8708,"opencl":{"platform":0,"device":0,"compute":"8.6","driver":"535.54"}}"#
        );
    }

    #[test]
    fn test_nvml_is_dropped() {
        let mut request = GpuRequest::new("nvidia", 0x10de, 0x2204);
        request.insert(ComputeBackend::Nvml, record());
        request.insert(ComputeBackend::Cuda, record());

        assert!(request.cuda.is_some());
        assert_eq!(
            serde_json::to_value(&request).unwrap().as_object().map(|o| o.len()),
            Some(4)
        );
    }
}
