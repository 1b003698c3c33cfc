pub mod compute_device;
pub mod descriptor;
pub mod errors;
pub mod identity;
pub mod policy;
pub mod probe;
pub mod report;
pub mod telemetry;
pub mod vendor;

pub use compute_device::{ComputeBackend, ComputeDeviceRecord};
pub use descriptor::{ChangeKind, DescriptorChange, DescriptorState, GpuDescriptor};
pub use errors::DescriptorError;
pub use policy::{Policy, PolicyProvider};
pub use probe::{ComputeDeviceProbeResult, PciProbeResult};
pub use report::GpuRequest;
pub use telemetry::{TelemetryError, TelemetryReader, TelemetrySample};
