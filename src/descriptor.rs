use std::{
    io::Write,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::{
    compute_device::{Backends, ComputeBackend, ComputeDeviceRecord},
    errors::DescriptorError,
    identity::{Identity, IdentitySource},
    policy::PolicyProvider,
    probe::{ComputeDeviceProbeResult, PciProbeResult},
    report::GpuRequest,
    telemetry::{Telemetry, TelemetryError, TelemetryReader},
};

// Slow subscribers lose the oldest notifications past this
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Which part of a descriptor a committed mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Identity,
    Backend(ComputeBackend),
    Telemetry,
    Supported,
}

/// Sent once for every mutation that changed the descriptor, after the
/// new state became visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DescriptorChange {
    pub revision: u64,
    pub kind: ChangeKind,
}

/// Everything a descriptor knows about its GPU.
///
/// Serializing a state gives the full local view, including backends and
/// GPUs the policy would never let into a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DescriptorState {
    pub id: String,

    #[serde(flatten)]
    pub identity: Identity,

    // Set by the detection collaborator
    pub supported: bool,

    #[serde(flatten)]
    pub backends: Backends,

    #[serde(flatten)]
    pub telemetry: Option<Telemetry>,
}

impl DescriptorState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_compute_device_supported<P: PolicyProvider + ?Sized>(
        &self,
        backend: ComputeBackend,
        policy: &P,
    ) -> bool {
        self.backends.contains(backend)
            && policy.is_compute_device_enabled(backend.name())
    }

    pub fn is_supported<P: PolicyProvider + ?Sized>(&self, policy: &P) -> bool {
        self.supported
            && policy.is_gpu_enabled(&self.id)
            && ComputeBackend::REPORTED
                .iter()
                .any(|backend| self.is_compute_device_supported(*backend, policy))
    }

    /// Build the request for this state, leaving out every backend the
    /// policy does not enable.
    pub fn request<P: PolicyProvider + ?Sized>(
        &self,
        policy: &P,
    ) -> Result<GpuRequest, DescriptorError> {
        let gpu = self.identity.kind.as_deref().ok_or_else(|| {
            self.incomplete("type")
        })?;
        let vendor = self.identity.vendor.ok_or_else(|| self.incomplete("vendor"))?;
        let device = self.identity.device.ok_or_else(|| self.incomplete("device"))?;

        let mut request = GpuRequest::new(gpu, vendor, device);

        for backend in ComputeBackend::REPORTED {
            if !self.is_compute_device_supported(backend, policy) {
                continue;
            }

            if let Some(record) = self.backends.get(backend) {
                request.insert(backend, record.clone());
            }
        }

        Ok(request)
    }

    fn incomplete(&self, field: &'static str) -> DescriptorError {
        DescriptorError::IncompleteIdentity {
            id: self.id.clone(),
            field,
        }
    }
}

/// Shared record of one GPU, written by the probes and read by the
/// reporting path.
///
/// Writers build the next state on a copy of the current one and publish
/// it with a single pointer swap, readers always get a complete state.
pub struct GpuDescriptor {
    id: String,

    state: RwLock<Arc<DescriptorState>>,

    // Only one writer at a time, guards the revision of the published state
    writer: Mutex<u64>,

    changes: broadcast::Sender<DescriptorChange>,
}

impl GpuDescriptor {
    pub fn new(id: &str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            id: id.to_string(),
            state: RwLock::new(Arc::new(DescriptorState::new(id))),
            writer: Mutex::new(0),
            changes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // Return the last committed state
    pub fn snapshot(&self) -> Arc<DescriptorState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn revision(&self) -> u64 {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DescriptorChange> {
        self.changes.subscribe()
    }

    /// Record the bus identity of the device. Bus data is authoritative
    /// for `vendor`, `device` and `type`.
    pub fn set_pci(&self, pci: &PciProbeResult) {
        self.commit(ChangeKind::Identity, |state| {
            state.identity.merge(IdentitySource::Pci(pci));
        });
    }

    /// Record what a compute backend reported. An invalid report retracts
    /// whatever the backend reported before.
    pub fn set_compute_backend(
        &self,
        backend: ComputeBackend,
        probe: &ComputeDeviceProbeResult,
    ) {
        let record = ComputeDeviceRecord::from_probe(backend, probe);

        if record.is_none() {
            debug!(gpu = %self.id, "{backend} did not report a usable device");
        }

        self.commit(ChangeKind::Backend(backend), |state| {
            state.identity.merge(IdentitySource::Compute(probe));
            state.backends.replace(backend, record);
        });
    }

    /// Read one telemetry sample and replace every telemetry field with it.
    ///
    /// On failure the error is logged and returned and the previous
    /// telemetry stays untouched.
    pub fn set_telemetry<R: TelemetryReader + ?Sized>(
        &self,
        reader: &R,
    ) -> Result<(), TelemetryError> {
        let telemetry = Telemetry::from_reader(reader).inspect_err(|err| {
            warn!(gpu = %self.id, "Failed to update telemetry: {err}");
        })?;

        self.commit(ChangeKind::Telemetry, |state| {
            state.telemetry = Some(telemetry);
        });

        Ok(())
    }

    pub fn set_supported(&self, supported: bool) {
        self.commit(ChangeKind::Supported, |state| {
            state.supported = supported;
        });
    }

    pub fn is_compute_device_supported<P: PolicyProvider + ?Sized>(
        &self,
        backend: ComputeBackend,
        policy: &P,
    ) -> bool {
        self.snapshot().is_compute_device_supported(backend, policy)
    }

    pub fn is_supported<P: PolicyProvider + ?Sized>(&self, policy: &P) -> bool {
        self.snapshot().is_supported(policy)
    }

    pub fn request<P: PolicyProvider + ?Sized>(
        &self,
        policy: &P,
    ) -> Result<GpuRequest, DescriptorError> {
        self.snapshot().request(policy)
    }

    /// Serialize the request for this GPU as JSON into `sink`.
    pub fn write_request<W: Write, P: PolicyProvider + ?Sized>(
        &self,
        sink: W,
        policy: &P,
    ) -> Result<(), DescriptorError> {
        self.request(policy)?.write_to(sink)
    }

    // Apply an update to a copy of the current state and publish it,
    // returns false when the update changed nothing
    fn commit<F>(&self, kind: ChangeKind, update: F) -> bool
    where
        F: FnOnce(&mut DescriptorState),
    {
        let mut revision =
            self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot();
        let mut next = DescriptorState::clone(&current);
        update(&mut next);

        if next == *current {
            return false;
        }

        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(next);
        *revision += 1;

        trace!(gpu = %self.id, revision = *revision, "Committed {kind:?}");

        // Having no subscriber is not an error
        let _ = self.changes.send(DescriptorChange {
            revision: *revision,
            kind,
        });

        true
    }
}

impl std::fmt::Debug for GpuDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDescriptor")
            .field("id", &self.id)
            .field("state", &self.snapshot())
            .finish()
    }
}
