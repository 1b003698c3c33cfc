use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use gpures::{GpuDescriptor, Policy};
use thiserror::Error;
use tokio::{
    select,
    sync::{
        mpsc::{Receiver, Sender},
        oneshot,
    },
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config_manager::DaemonConfig,
    errors::GpuresdError,
    gpu_device::{GpuProbe, ProbeTelemetry, ProbedGpu},
};

type Responder = oneshot::Sender<DevicesManagerAnswer>;

pub type BoxedProbe = Box<dyn GpuProbe + Send + Sync>;

pub enum DevicesManagerMessage {
    // Get the descriptors of every known GPU
    ListGpus { tx: Responder },
    // Get the descriptor of one GPU
    GetDescriptor { id: String, tx: Responder },

    // Run every probe again
    Rescan,
}

#[derive(Debug)]
pub enum DevicesManagerAnswer {
    Gpus(Vec<Arc<GpuDescriptor>>),
    Descriptor(Option<Arc<GpuDescriptor>>),
}

#[derive(Debug, Error)]
pub enum DevicesManagerError {
    #[error("Failed to flush the request sink")]
    Sink(#[source] io::Error),
    #[error("Devices manager TX error: {reason}")]
    TX { reason: String },
}

type Result<T> = std::result::Result<T, DevicesManagerError>;

// Owns the GPU descriptors and feeds them with the probes results
pub struct DevicesManager {
    probes: Vec<BoxedProbe>,
    policy: Arc<Policy>,

    // Keyed by normalised PCI slot name
    descriptors: BTreeMap<String, Arc<GpuDescriptor>>,

    // Index of the probe reading the telemetry of each GPU
    telemetry_sources: HashMap<String, usize>,

    telemetry_interval: Duration,
    report_interval: Duration,

    // Requests are written one Json object per line
    report_sink: Box<dyn Write + Send>,
}

impl DevicesManager {
    pub fn new(
        probes: Vec<BoxedProbe>,
        config: &DaemonConfig,
        report_sink: Box<dyn Write + Send>,
    ) -> Self {
        let mut manager = Self {
            probes,
            policy: Arc::new(config.policy.clone()),

            descriptors: BTreeMap::new(),
            telemetry_sources: HashMap::new(),

            telemetry_interval: config.telemetry_interval,
            report_interval: config.report_interval,

            report_sink,
        };

        // Find the GPUs on the system
        manager.scan();

        manager
    }

    pub fn policy(&self) -> Arc<Policy> {
        self.policy.clone()
    }

    pub fn descriptors(&self) -> Vec<Arc<GpuDescriptor>> {
        self.descriptors.values().cloned().collect()
    }

    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        mut rx_message: Receiver<DevicesManagerMessage>,
        tx_err: Sender<GpuresdError>,
    ) {
        info!("Devices manager: Running");

        let mut telemetry_tick = interval(self.telemetry_interval);
        telemetry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report_tick = interval(self.report_interval);
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = select! {
                _ = run_token.cancelled() => {
                    info!("Devices manager: Quiting");

                    break;
                },
                _ = telemetry_tick.tick() => {
                    self.update_telemetry();
                    Ok(())
                },
                _ = report_tick.tick() => {
                    self.write_requests().map(|count| {
                        trace!("Wrote {count} GPU requests");
                    })
                },
                Some(message) = rx_message.recv() => {
                    self.parse_message(message)
                }
            };

            if let Err(err) = result {
                tx_err.send(err.into()).await.unwrap_or_else(|err| {
                    error!("Failed to send error over channel: {err}");
                });
            }
        }
    }

    fn parse_message(&mut self, message: DevicesManagerMessage) -> Result<()> {
        let (tx, answer) = match message {
            DevicesManagerMessage::ListGpus { tx } => {
                (tx, DevicesManagerAnswer::Gpus(self.descriptors()))
            }
            DevicesManagerMessage::GetDescriptor { id, tx } => {
                let descriptor = self.descriptors.get(&id).cloned();
                (tx, DevicesManagerAnswer::Descriptor(descriptor))
            }
            DevicesManagerMessage::Rescan => {
                self.scan();
                return Ok(());
            }
        };

        tx.send(answer).map_err(|v| DevicesManagerError::TX {
            reason: format!("Failed to send answer to channel: {v:?}"),
        })
    }

    // Run every probe and merge the results into the descriptors.
    // GPUs no probe reports anymore are dropped, unless a probe
    // failed, in which case they are only marked as unsupported
    pub fn scan(&mut self) {
        let mut seen = BTreeSet::new();
        let mut complete = true;

        self.telemetry_sources.clear();

        for (index, probe) in self.probes.iter().enumerate() {
            let gpus = match probe.discover() {
                Ok(gpus) => gpus,
                Err(err) => {
                    warn!("Error during {} GPUs discovery: {}", probe.name(), err);

                    err.chain().skip(1).for_each(|e| {
                        debug!("Error chain: {}", e);
                    });

                    complete = false;
                    continue;
                }
            };

            for gpu in gpus {
                let descriptor = Self::merge(&mut self.descriptors, &gpu);

                if gpu.telemetry {
                    self.telemetry_sources.entry(gpu.id.clone()).or_insert(index);
                }

                descriptor.set_supported(true);
                seen.insert(gpu.id);
            }
        }

        self.descriptors.retain(|id, descriptor| {
            if seen.contains(id) {
                return true;
            }

            // Views still holding the descriptor must see it go away
            descriptor.set_supported(false);

            if complete {
                info!("GPU \"{id}\" disappeared");
                return false;
            }

            true
        });
    }

    // Feed one probe result into the matching descriptor
    fn merge(
        descriptors: &mut BTreeMap<String, Arc<GpuDescriptor>>,
        gpu: &ProbedGpu,
    ) -> Arc<GpuDescriptor> {
        let descriptor = descriptors
            .entry(gpu.id.clone())
            .or_insert_with(|| {
                info!("Found GPU \"{}\"", gpu.id);
                Arc::new(GpuDescriptor::new(&gpu.id))
            })
            .clone();

        if let Some(pci) = &gpu.pci {
            descriptor.set_pci(pci);
        }

        for (backend, probe) in &gpu.compute {
            descriptor.set_compute_backend(*backend, probe);
        }

        descriptor
    }

    // Read a telemetry sample for every GPU that has a source,
    // failures are logged by the descriptor and otherwise ignored
    pub fn update_telemetry(&self) {
        for (id, index) in &self.telemetry_sources {
            let (Some(descriptor), Some(probe)) =
                (self.descriptors.get(id), self.probes.get(*index))
            else {
                continue;
            };

            let reader = ProbeTelemetry::new(&**probe, id);
            let _ = descriptor.set_telemetry(&reader);
        }
    }

    // Write the request of every supported GPU, returns the number of
    // requests written. A GPU whose request cannot be written is
    // skipped and the others still go out
    pub fn write_requests(&mut self) -> Result<usize> {
        let mut count = 0;

        for (id, descriptor) in &self.descriptors {
            // Gate and request must see the same state
            let state = descriptor.snapshot();

            if !state.is_supported(&self.policy) {
                continue;
            }

            // Serialize first so a failed write never leaves half a line
            let mut line = Vec::new();
            let written = state
                .request(&self.policy)
                .and_then(|request| request.write_to(&mut line))
                .map_err(anyhow::Error::from)
                .and_then(|_| {
                    line.push(b'\n');
                    Ok(self.report_sink.write_all(&line)?)
                });

            match written {
                Ok(()) => count += 1,
                Err(err) => warn!("Skipping request of GPU \"{id}\": {err}"),
            }
        }

        self.report_sink.flush().map_err(DevicesManagerError::Sink)?;

        Ok(count)
    }
}

// Open the request sink, stdout if no file is configured
pub fn open_report_sink(path: Option<&Path>) -> anyhow::Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open request file {path:?}"))?;

            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use gpures::{
        ChangeKind, ComputeBackend, ComputeDeviceProbeResult, GpuRequest,
        PciProbeResult, TelemetryError, TelemetrySample,
    };
    use tokio::sync::mpsc;
    use tracing_subscriber::prelude::*;

    use super::*;
    use crate::logger::log_layer;

    const NVIDIA_GPU: &str = "0000:01:00.0";
    const AMD_GPU: &str = "0000:03:00.0";

    // Probe returning whatever the test put in it
    #[derive(Clone, Default)]
    struct FakeProbe {
        gpus: Arc<Mutex<Option<Vec<ProbedGpu>>>>,
        sample: Arc<Mutex<Option<TelemetrySample>>>,
    }

    impl FakeProbe {
        fn set_gpus(&self, gpus: Option<Vec<ProbedGpu>>) {
            *self.gpus.lock().unwrap() = gpus;
        }

        fn set_sample(&self, sample: Option<TelemetrySample>) {
            *self.sample.lock().unwrap() = sample;
        }
    }

    impl GpuProbe for FakeProbe {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn discover(&self) -> anyhow::Result<Vec<ProbedGpu>> {
            self.gpus
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow!("driver went away"))
        }

        fn read_telemetry(
            &self,
            id: &str,
        ) -> std::result::Result<TelemetrySample, TelemetryError> {
            self.sample.lock().unwrap().clone().ok_or(TelemetryError::Read {
                field: "temperature",
                reason: format!("GPU {id} is lost"),
            })
        }
    }

    // Sink the test can read back
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pci_gpu(id: &str, vendor: u16, device: u16) -> ProbedGpu {
        let mut gpu = ProbedGpu::new(id);
        gpu.pci = Some(PciProbeResult::new(vendor, device));
        gpu
    }

    fn cuda_gpu(id: &str, valid: bool) -> ProbedGpu {
        let mut gpu = ProbedGpu::new(id);
        gpu.telemetry = true;
        gpu.compute.push((
            ComputeBackend::Cuda,
            ComputeDeviceProbeResult {
                vendor_id: Some(0x10de),
                platform_index: valid.then_some(0),
                device_index: valid.then_some(0),
                compute_version: "8.6".to_string(),
                driver_version: "12.2".to_string(),
                ..Default::default()
            },
        ));
        gpu
    }

    fn config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.policy.enable_gpu(NVIDIA_GPU, true);
        config.policy.enable_gpu(AMD_GPU, true);
        config
    }

    fn manager(probes: &[FakeProbe], sink: &SharedSink) -> DevicesManager {
        let probes = probes
            .iter()
            .map(|probe| Box::new(probe.clone()) as BoxedProbe)
            .collect();

        DevicesManager::new(probes, &config(), Box::new(sink.clone()))
    }

    #[test]
    fn test_probes_feed_one_descriptor() {
        let (bus, nvml) = (FakeProbe::default(), FakeProbe::default());
        bus.set_gpus(Some(vec![
            pci_gpu(NVIDIA_GPU, 0x10de, 0x2204),
            pci_gpu(AMD_GPU, 0x1002, 0x744c),
        ]));
        nvml.set_gpus(Some(vec![cuda_gpu(NVIDIA_GPU, true)]));

        let sink = SharedSink::default();
        let mut manager = manager(&[bus, nvml], &sink);

        assert_eq!(manager.descriptors().len(), 2);
        assert_eq!(manager.write_requests().unwrap(), 1);
        assert_eq!(
            sink.lines(),
            vec![
                r#"{"gpu":"nvidia","vendor":4318,"device":8708,"cuda":{"platform":0,"device":0,"compute":"8.6","driver":"12.2"}}"#
            ]
        );
    }

    #[test]
    fn test_policy_is_applied_to_requests() {
        let probe = FakeProbe::default();
        let mut gpu = cuda_gpu(NVIDIA_GPU, true);
        gpu.pci = Some(PciProbeResult::new(0x10de, 0x2204));
        probe.set_gpus(Some(vec![gpu]));

        let sink = SharedSink::default();
        let probes = vec![Box::new(probe) as BoxedProbe];

        // GPU not enabled by the operator
        let mut manager =
            DevicesManager::new(probes, &DaemonConfig::default(), Box::new(sink.clone()));

        assert_eq!(manager.write_requests().unwrap(), 0);
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_rescan_drops_vanished_gpus() {
        let probe = FakeProbe::default();
        probe.set_gpus(Some(vec![
            pci_gpu(NVIDIA_GPU, 0x10de, 0x2204),
            pci_gpu(AMD_GPU, 0x1002, 0x744c),
        ]));

        let sink = SharedSink::default();
        let mut manager = manager(&[probe.clone()], &sink);

        probe.set_gpus(Some(vec![pci_gpu(AMD_GPU, 0x1002, 0x744c)]));
        manager.scan();

        let ids: Vec<_> = manager
            .descriptors()
            .iter()
            .map(|descriptor| descriptor.id().to_string())
            .collect();
        assert_eq!(ids, vec![AMD_GPU.to_string()]);
    }

    #[test]
    fn test_failed_probe_keeps_gpus_unsupported() {
        let (bus, nvml) = (FakeProbe::default(), FakeProbe::default());
        bus.set_gpus(Some(vec![pci_gpu(NVIDIA_GPU, 0x10de, 0x2204)]));
        nvml.set_gpus(Some(vec![cuda_gpu(NVIDIA_GPU, true), cuda_gpu(AMD_GPU, true)]));

        let sink = SharedSink::default();
        let mut manager = manager(&[bus, nvml.clone()], &sink);

        nvml.set_gpus(None);
        manager.scan();

        let descriptors = manager.descriptors();
        assert_eq!(descriptors.len(), 2);

        // Still seen by the bus probe
        assert!(descriptors[0].snapshot().supported);
        assert!(!descriptors[1].snapshot().supported);
    }

    #[test]
    fn test_invalid_backend_is_retracted_on_rescan() {
        let probe = FakeProbe::default();
        probe.set_gpus(Some(vec![cuda_gpu(NVIDIA_GPU, true)]));

        let sink = SharedSink::default();
        let mut manager = manager(&[probe.clone()], &sink);

        probe.set_gpus(Some(vec![cuda_gpu(NVIDIA_GPU, false)]));
        manager.scan();

        let state = manager.descriptors()[0].snapshot();
        assert!(!state.backends.contains(ComputeBackend::Cuda));
    }

    #[test]
    fn test_telemetry_failure_is_contained() {
        let probe = FakeProbe::default();
        probe.set_gpus(Some(vec![cuda_gpu(NVIDIA_GPU, true)]));
        probe.set_sample(Some(TelemetrySample {
            pstate: 2,
            ..Default::default()
        }));

        let sink = SharedSink::default();
        let manager = manager(&[probe.clone()], &sink);

        manager.update_telemetry();
        let before = manager.descriptors()[0].snapshot();
        assert_eq!(before.telemetry.as_ref().map(|t| t.pstate.as_str()), Some("P2"));

        probe.set_sample(None);
        manager.update_telemetry();
        assert_eq!(manager.descriptors()[0].snapshot(), before);
    }

    #[test]
    fn test_vanished_gpu_is_unsupported_for_holders() {
        let probe = FakeProbe::default();
        let mut gpu = cuda_gpu(NVIDIA_GPU, true);
        gpu.pci = Some(PciProbeResult::new(0x10de, 0x2204));
        probe.set_gpus(Some(vec![gpu]));

        let sink = SharedSink::default();
        let mut manager = manager(&[probe.clone()], &sink);
        let policy = manager.policy();

        let held = manager.descriptors()[0].clone();
        let mut changes = held.subscribe();
        assert!(held.is_supported(&*policy));

        probe.set_gpus(Some(vec![]));
        manager.scan();

        assert!(manager.descriptors().is_empty());
        assert!(!held.is_supported(&*policy));
        assert_eq!(
            changes.try_recv().map(|change| change.kind),
            Ok(ChangeKind::Supported)
        );
    }

    // Fails the first write it sees, then behaves
    struct FlakySink {
        failed: bool,
        inner: SharedSink,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.failed {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"));
            }

            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_does_not_skip_other_gpus() {
        let probe = FakeProbe::default();
        let mut nvidia = cuda_gpu(NVIDIA_GPU, true);
        nvidia.pci = Some(PciProbeResult::new(0x10de, 0x2204));
        let mut other = cuda_gpu(AMD_GPU, true);
        other.pci = Some(PciProbeResult::new(0x10de, 0x2684));
        probe.set_gpus(Some(vec![nvidia, other]));

        let sink = SharedSink::default();
        let flaky = FlakySink {
            failed: false,
            inner: sink.clone(),
        };
        let mut manager = DevicesManager::new(
            vec![Box::new(probe) as BoxedProbe],
            &config(),
            Box::new(flaky),
        );

        assert_eq!(manager.write_requests().unwrap(), 1);
        assert_eq!(
            sink.lines(),
            vec![
                r#"{"gpu":"nvidia","vendor":4318,"device":9860,"cuda":{"platform":0,"device":0,"compute":"8.6","driver":"12.2"}}"#
            ]
        );
    }

    #[test]
    fn test_report_sink_only_gets_requests() {
        let bus = FakeProbe::default();
        let nvml = FakeProbe::default();
        bus.set_gpus(Some(vec![pci_gpu(NVIDIA_GPU, 0x10de, 0x2204)]));
        // No bus data for this one, its request is incomplete
        nvml.set_gpus(Some(vec![cuda_gpu(NVIDIA_GPU, true), cuda_gpu(AMD_GPU, true)]));

        let sink = SharedSink::default();
        let logs = SharedSink::default();

        let subscriber = tracing_subscriber::registry().with(log_layer({
            let logs = logs.clone();
            move || logs.clone()
        }));

        let count = tracing::subscriber::with_default(subscriber, || {
            let mut manager = manager(&[bus, nvml], &sink);
            manager.write_requests().unwrap()
        });

        assert_eq!(count, 1);
        assert!(logs.lines().iter().any(|line| line.contains(AMD_GPU)));

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        for line in lines {
            let request: GpuRequest = serde_json::from_str(&line).unwrap();
            assert_eq!(request.gpu, "nvidia");
        }
    }

    #[tokio::test]
    async fn test_answers_messages() {
        let probe = FakeProbe::default();
        probe.set_gpus(Some(vec![pci_gpu(NVIDIA_GPU, 0x10de, 0x2204)]));

        let sink = SharedSink::default();
        let mut manager = manager(&[probe], &sink);

        let token = CancellationToken::new();
        let (tx_message, rx_message) = mpsc::channel(16);
        let (tx_err, _rx_err) = mpsc::channel(16);

        let task = {
            let token = token.clone();
            tokio::spawn(async move { manager.run(token, rx_message, tx_err).await })
        };

        let (tx, rx) = oneshot::channel();
        tx_message
            .send(DevicesManagerMessage::GetDescriptor {
                id: NVIDIA_GPU.to_string(),
                tx,
            })
            .await
            .unwrap();

        match rx.await.unwrap() {
            DevicesManagerAnswer::Descriptor(Some(gpu)) => assert_eq!(gpu.id(), NVIDIA_GPU),
            answer => panic!("Unexpected answer: {answer:?}"),
        }

        let (tx, rx) = oneshot::channel();
        tx_message
            .send(DevicesManagerMessage::ListGpus { tx })
            .await
            .unwrap();

        assert!(matches!(
            rx.await.unwrap(),
            DevicesManagerAnswer::Gpus(gpus) if gpus.len() == 1
        ));

        token.cancel();
        task.await.unwrap();
    }
}
