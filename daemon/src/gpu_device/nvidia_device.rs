use std::sync::Arc;

use anyhow::{Context, Result};
use gpures::{
    ComputeBackend, ComputeDeviceProbeResult, PciProbeResult, TelemetryError,
    TelemetrySample, telemetry::MAX_FANS, vendor::NVIDIA_VENDOR_ID,
};
use nvml_wrapper::{
    Device, Nvml, cuda_driver_version_major, cuda_driver_version_minor,
    enum_wrappers::device::{Clock, ClockId, PerformanceState, TemperatureSensor},
    enums::device::PcieLinkMaxSpeed,
    error::NvmlError,
};
use tracing::debug;

use crate::gpu_device::{GpuProbe, ProbedGpu, normalize_bus_id};

// Driver versions shared by every device of the system
struct DriverVersions {
    system: String,
    cuda: Option<String>,
}

pub struct NvidiaDevice {
    // NVML is thread-safe so it is safe to make
    // simultaneous NVML calls from multiple threads.
    // We can therefore simply wrap it in a Arc with no Mutex
    nvml: Arc<Nvml>,
}

impl NvidiaDevice {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }

    // Load the NVML library, fails on systems without the Nvidia driver
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().with_context(|| "Failed to load NVML library")?;

        Ok(Self::new(Arc::new(nvml)))
    }

    // Return a NVML device handle from the normalised bus id
    fn get<'a>(&'a self, id: &str) -> Result<Device<'a>, NvmlError> {
        self.nvml.device_by_pci_bus_id(id)
    }

    fn driver_versions(&self) -> Result<DriverVersions> {
        let system = self
            .nvml
            .sys_driver_version()
            .with_context(|| "Failed to retrive the driver version")?;

        // The CUDA driver version is encoded as 1000 * major + 10 * minor
        let cuda = match self.nvml.sys_cuda_driver_version() {
            Ok(version) => Some(format!(
                "{}.{}",
                cuda_driver_version_major(version),
                cuda_driver_version_minor(version)
            )),
            Err(err) => {
                debug!("No CUDA driver version: {err}");
                None
            }
        };

        Ok(DriverVersions { system, cuda })
    }

    fn probe_device(
        &self,
        index: u32,
        drivers: &DriverVersions,
    ) -> Result<ProbedGpu> {
        let device = self.nvml.device_by_index(index)?;
        let pci_info = device
            .pci_info()
            .with_context(|| format!("Failed to retrive PCI info of GPU {index}"))?;

        let mut gpu = ProbedGpu::new(&normalize_bus_id(&pci_info.bus_id));
        gpu.pci = Some(PciProbeResult::from_pci_device_id(pci_info.pci_device_id));
        gpu.telemetry = true;

        let name = device.name().ok();
        let uuid = device.uuid().ok();

        // Devices without compute capability are still managed by NVML
        let capability = match device.cuda_compute_capability() {
            Ok(capability) => {
                Some(format!("{}.{}", capability.major, capability.minor))
            }
            Err(err) => {
                debug!("No compute capability for GPU {}: {err}", gpu.id);
                None
            }
        };

        gpu.compute.push((
            ComputeBackend::Nvml,
            ComputeDeviceProbeResult {
                vendor_id: Some(NVIDIA_VENDOR_ID),
                name: name.clone(),
                uuid: uuid.clone(),
                platform_index: Some(0),
                device_index: Some(index),
                compute_version: capability.clone().unwrap_or_default(),
                driver_version: drivers.system.clone(),
            },
        ));

        // NVML enumerates in bus order, which is the CUDA device
        // order when CUDA_DEVICE_ORDER=PCI_BUS_ID
        let cuda_usable = capability.is_some() && drivers.cuda.is_some();

        gpu.compute.push((
            ComputeBackend::Cuda,
            ComputeDeviceProbeResult {
                vendor_id: Some(NVIDIA_VENDOR_ID),
                name,
                uuid,
                platform_index: cuda_usable.then_some(0),
                device_index: cuda_usable.then_some(index),
                compute_version: capability.unwrap_or_default(),
                driver_version: drivers.cuda.clone().unwrap_or_default(),
            },
        ));

        Ok(gpu)
    }
}

impl GpuProbe for NvidiaDevice {
    fn name(&self) -> &'static str {
        "nvml"
    }

    fn discover(&self) -> Result<Vec<ProbedGpu>> {
        let drivers = self.driver_versions()?;
        let device_count = self.nvml.device_count()?;

        let mut gpus = Vec::with_capacity(device_count as usize);

        for index in 0..device_count {
            let gpu = self.probe_device(index, &drivers)?;

            debug!("Found Nvidia device: \"{}\"", gpu.id);

            gpus.push(gpu);
        }

        Ok(gpus)
    }

    fn read_telemetry(&self, id: &str) -> Result<TelemetrySample, TelemetryError> {
        let device = read("device handle", self.get(id))?;

        let max_gen = narrow(
            "max PCIe link generation",
            read("max PCIe link generation", device.max_pcie_link_gen())?,
        )?;

        // Without the device link speed, assume the device matches the link
        let max_gen_device = read_or(
            "max PCIe link speed",
            device.max_pcie_link_speed().map(pcie_generation),
            None,
        )?
        .unwrap_or(max_gen);

        // Passively cooled boards have no fan to report
        let fan_count = read_or("fan count", device.num_fans(), 0)?;

        let mut fan_speed_pct = [0.; MAX_FANS];

        for (i, speed) in fan_speed_pct
            .iter_mut()
            .enumerate()
            .take(fan_count as usize)
        {
            *speed = read_or("fan speed", device.fan_speed(i as u32), 0)? as f64;
        }

        Ok(TelemetrySample {
            max_pcie_link_gen_device: max_gen_device,
            max_pcie_link_gen: max_gen,
            max_pcie_link_width: narrow(
                "max PCIe link width",
                read("max PCIe link width", device.max_pcie_link_width())?,
            )?,
            curr_pcie_link_gen: narrow(
                "PCIe link generation",
                read("PCIe link generation", device.current_pcie_link_gen())?,
            )?,
            curr_pcie_link_width: narrow(
                "PCIe link width",
                read("PCIe link width", device.current_pcie_link_width())?,
            )?,

            gpu_freq_limit_mhz: read(
                "max graphics clock",
                device.max_clock_info(Clock::Graphics),
            )?,
            mem_freq_limit_mhz: read(
                "max memory clock",
                device.max_clock_info(Clock::Memory),
            )?,
            gpu_freq_mhz: read(
                "graphics clock",
                device.clock(Clock::Graphics, ClockId::Current),
            )?,
            mem_freq_mhz: read(
                "memory clock",
                device.clock(Clock::Memory, ClockId::Current),
            )?,

            gpu_temp_c: read(
                "temperature",
                device.temperature(TemperatureSensor::Gpu),
            )? as i32,
            pstate: performance_state(read(
                "performance state",
                device.performance_state(),
            )?)?,

            // NVML reports milliwatts, boards without power
            // sensors (mostly laptops) report zero
            curr_power_watts: read_or("power usage", device.power_usage(), 0)? as f64
                / 1000.,
            max_power_watts: read_or(
                "power limit",
                device.enforced_power_limit(),
                0,
            )? as f64
                / 1000.,

            fan_count,
            fan_speed_pct,
        })
    }
}

fn read_error(field: &'static str, err: NvmlError) -> TelemetryError {
    TelemetryError::Read {
        field,
        reason: err.to_string(),
    }
}

fn read<T>(field: &'static str, result: Result<T, NvmlError>) -> Result<T, TelemetryError> {
    result.map_err(|err| read_error(field, err))
}

// Like read, but a sensor the board does not have reads as the fallback
fn read_or<T>(
    field: &'static str,
    result: Result<T, NvmlError>,
    fallback: T,
) -> Result<T, TelemetryError> {
    match result {
        Err(NvmlError::NotSupported) => Ok(fallback),
        result => read(field, result),
    }
}

fn narrow(field: &'static str, value: u32) -> Result<u8, TelemetryError> {
    u8::try_from(value).map_err(|_| TelemetryError::Read {
        field,
        reason: format!("value {value} out of range"),
    })
}

fn pcie_generation(speed: PcieLinkMaxSpeed) -> Option<u8> {
    match speed {
        PcieLinkMaxSpeed::MegaTransfersPerSecond2500 => Some(1),
        PcieLinkMaxSpeed::MegaTransfersPerSecond5000 => Some(2),
        PcieLinkMaxSpeed::MegaTransfersPerSecond8000 => Some(3),
        PcieLinkMaxSpeed::MegaTransfersPerSecond16000 => Some(4),
        PcieLinkMaxSpeed::MegaTransfersPerSecond32000 => Some(5),
        PcieLinkMaxSpeed::Invalid => None,
    }
}

fn performance_state(state: PerformanceState) -> Result<u8, TelemetryError> {
    let state = match state {
        PerformanceState::Zero => 0,
        PerformanceState::One => 1,
        PerformanceState::Two => 2,
        PerformanceState::Three => 3,
        PerformanceState::Four => 4,
        PerformanceState::Five => 5,
        PerformanceState::Six => 6,
        PerformanceState::Seven => 7,
        PerformanceState::Eight => 8,
        PerformanceState::Nine => 9,
        PerformanceState::Ten => 10,
        PerformanceState::Eleven => 11,
        PerformanceState::Twelve => 12,
        PerformanceState::Thirteen => 13,
        PerformanceState::Fourteen => 14,
        PerformanceState::Fifteen => 15,
        PerformanceState::Unknown => {
            return Err(TelemetryError::Read {
                field: "performance state",
                reason: "unknown performance state".to_string(),
            });
        }
    };

    Ok(state)
}
