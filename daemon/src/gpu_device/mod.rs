use anyhow::Result;
use gpures::{
    ComputeBackend, ComputeDeviceProbeResult, PciProbeResult, TelemetryError,
    TelemetryReader, TelemetrySample,
};

pub mod nvidia_device;
pub mod pci_device;

// Everything one probe found out about one GPU
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedGpu {
    // Normalised PCI slot name, shared by every probe
    pub id: String,

    pub pci: Option<PciProbeResult>,
    pub compute: Vec<(ComputeBackend, ComputeDeviceProbeResult)>,

    // True if the probe can read telemetry for this GPU
    pub telemetry: bool,
}

impl ProbedGpu {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            pci: None,
            compute: Vec::new(),
            telemetry: false,
        }
    }
}

// GPU probe trait, one implementation per driver library
pub trait GpuProbe {
    // Name used in logs
    fn name(&self) -> &'static str;

    // Enumerate the GPUs the probe can see
    fn discover(&self) -> Result<Vec<ProbedGpu>>;

    // Read one telemetry sample for the given GPU
    fn read_telemetry(&self, id: &str) -> Result<TelemetrySample, TelemetryError>;
}

// Telemetry reader reading a GPU through its probe
pub struct ProbeTelemetry<'a> {
    probe: &'a dyn GpuProbe,
    id: &'a str,
}

impl<'a> ProbeTelemetry<'a> {
    pub fn new(probe: &'a dyn GpuProbe, id: &'a str) -> Self {
        Self { probe, id }
    }
}

impl TelemetryReader for ProbeTelemetry<'_> {
    fn read_sample(&self) -> Result<TelemetrySample, TelemetryError> {
        self.probe.read_telemetry(self.id)
    }
}

// Normalise a PCI bus id to the sysfs slot form "dddd:bb:dd.f".
// NVML uses an eight digit domain and upper case hex digits
pub fn normalize_bus_id(bus_id: &str) -> String {
    let bus_id = bus_id.trim().to_lowercase();

    // Bus ids come as either "domain:bus:device.function" or "bus:device.function"
    match bus_id.split_once(':') {
        Some((domain, rest)) if rest.contains(':') => {
            match u32::from_str_radix(domain, 16) {
                Ok(domain) => format!("{domain:04x}:{rest}"),
                Err(_) => bus_id,
            }
        }
        _ => format!("0000:{bus_id}"),
    }
}
