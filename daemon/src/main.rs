use anyhow::{Context, Result};
use gpuresd::{
    arg_parser::ArgsOptions,
    config_manager::ConfigManager,
    dbus_service::DBusService,
    devices_manager::{
        BoxedProbe, DevicesManager, DevicesManagerMessage, open_report_sink,
    },
    gpu_device::{nvidia_device::NvidiaDevice, pci_device::PciDevice},
    logger,
};
use tokio::{
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    let config = ConfigManager::new(&args_options.config_file_path)
        .load()
        .with_context(|| "Failed to load the daemon configuration")?;

    // The bus probe always runs, NVML only where the driver is installed
    let mut probes: Vec<BoxedProbe> = vec![Box::new(PciDevice::new())];

    match NvidiaDevice::init() {
        Ok(nvidia) => probes.push(Box::new(nvidia)),
        Err(err) => warn!("NVML unavailable, no Nvidia telemetry: {err:#}"),
    }

    let report_path = args_options.report_path(config.report_path.clone());
    let report_sink = open_report_sink(report_path.as_deref())?;

    // Discovery happens here, before any task is started
    let mut devices_manager = DevicesManager::new(probes, &config, report_sink);
    let policy = devices_manager.policy();

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Every task reports its errors through this channel
    let (tx_err, mut rx_err) = mpsc::channel(16);

    // Start the devices manager
    let (tx_devices_manager, rx_devices_manager) = mpsc::channel(16);
    {
        let token = token.clone();
        let tx_err = tx_err.clone();

        tracker.spawn(async move {
            devices_manager.run(token, rx_devices_manager, tx_err).await;
        });
    }

    // Start the D-Bus service
    {
        let token = token.clone();
        let tx_err = tx_err.clone();
        let tx_devices_manager = tx_devices_manager.clone();

        tracker.spawn(async move {
            let mut dbus_service = DBusService::new(policy);
            dbus_service.run(token, tx_devices_manager, tx_err).await;
        });
    }

    // SIGHUP triggers a new GPU discovery
    let mut hangup = signal(SignalKind::hangup())?;

    // Only the tasks hold a sender from now on
    drop(tx_err);

    loop {
        tokio::select! {
            result = ctrl_c() => {
                result?;
                info!("Termination requested");
                break;
            }
            _ = hangup.recv() => {
                info!("Rescanning GPUs");

                if tx_devices_manager.send(DevicesManagerMessage::Rescan).await.is_err() {
                    warn!("Devices manager is not running, rescan ignored");
                }
            }
            Some(err) = rx_err.recv() => {
                let err = anyhow::Error::from(err);
                error!("{err}");

                err.chain().skip(1).for_each(|e| {
                    error!("Caused by: {e}");
                });
            }
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    Ok(())
}
