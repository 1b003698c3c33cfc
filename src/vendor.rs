use std::fmt;

use serde::{Deserialize, Serialize};

// PCI-SIG vendor identifiers of the GPU vendors we know by name
pub const NVIDIA_VENDOR_ID: u16 = 0x10de;
pub const AMD_VENDOR_ID: u16 = 0x1002;
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// GPU vendor derived from a PCI vendor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Unknown(u16),
}

impl GpuVendor {
    pub const fn from_vendor_id(id: u16) -> Self {
        match id {
            NVIDIA_VENDOR_ID => Self::Nvidia,
            AMD_VENDOR_ID => Self::Amd,
            INTEL_VENDOR_ID => Self::Intel,
            _ => Self::Unknown(id),
        }
    }

    // Lowercase name used as the "gpu" field of the request
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Nvidia => "nvidia",
            Self::Amd => "amd",
            Self::Intel => "intel",
            Self::Unknown(_) => "unknown",
        }
    }

    pub const fn vendor_id(&self) -> u16 {
        match self {
            Self::Nvidia => NVIDIA_VENDOR_ID,
            Self::Amd => AMD_VENDOR_ID,
            Self::Intel => INTEL_VENDOR_ID,
            Self::Unknown(id) => *id,
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "unknown (0x{id:04x})"),
            _ => f.write_str(self.name()),
        }
    }
}

impl From<u16> for GpuVendor {
    fn from(id: u16) -> Self {
        Self::from_vendor_id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vendor_names() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE).name(), "nvidia");
        assert_eq!(GpuVendor::from_vendor_id(0x1002).name(), "amd");
        assert_eq!(GpuVendor::from_vendor_id(0x8086).name(), "intel");
    }

    #[test]
    fn test_unknown_vendor_keeps_id() {
        let vendor = GpuVendor::from(0x1234);

        assert_eq!(vendor, GpuVendor::Unknown(0x1234));
        assert_eq!(vendor.name(), "unknown");
        assert_eq!(vendor.vendor_id(), 0x1234);
        assert_eq!(vendor.to_string(), "unknown (0x1234)");
    }
}
