use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Operator visibility policy consulted before anything is disclosed.
pub trait PolicyProvider {
    fn is_gpu_enabled(&self, id: &str) -> bool;
    fn is_compute_device_enabled(&self, name: &str) -> bool;
}

impl<P: PolicyProvider + ?Sized> PolicyProvider for &P {
    fn is_gpu_enabled(&self, id: &str) -> bool {
        (**self).is_gpu_enabled(id)
    }

    fn is_compute_device_enabled(&self, name: &str) -> bool {
        (**self).is_compute_device_enabled(name)
    }
}

impl<P: PolicyProvider + ?Sized> PolicyProvider for std::sync::Arc<P> {
    fn is_gpu_enabled(&self, id: &str) -> bool {
        (**self).is_gpu_enabled(id)
    }

    fn is_compute_device_enabled(&self, name: &str) -> bool {
        (**self).is_compute_device_enabled(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct GpuPolicy {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ComputePolicy {
    #[serde(default = "enabled")]
    pub cuda: bool,
    #[serde(default = "enabled")]
    pub hip: bool,
    #[serde(default = "enabled")]
    pub opencl: bool,
}

/// Policy as written in the daemon configuration.
///
/// GPUs are hidden unless the operator enabled them by id. Compute
/// backends are shared unless switched off, names without a switch
/// are never shared.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    #[serde(default)]
    pub gpus: HashMap<String, GpuPolicy>,
    #[serde(default)]
    pub compute: ComputePolicy,
}

impl Policy {
    pub fn enable_gpu(&mut self, id: &str, enabled: bool) {
        self.gpus.insert(id.to_string(), GpuPolicy { enabled });
    }
}

impl PolicyProvider for Policy {
    fn is_gpu_enabled(&self, id: &str) -> bool {
        self.gpus.get(id).is_some_and(|gpu| gpu.enabled)
    }

    fn is_compute_device_enabled(&self, name: &str) -> bool {
        match name {
            "cuda" => self.compute.cuda,
            "hip" => self.compute.hip,
            "opencl" => self.compute.opencl,
            _ => false,
        }
    }
}

impl Default for ComputePolicy {
    fn default() -> Self {
        Self {
            cuda: true,
            hip: true,
            opencl: true,
        }
    }
}

fn enabled() -> bool {
    true
}
