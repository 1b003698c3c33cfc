use std::sync::Arc;

use anyhow::anyhow;
use gpures::{ChangeKind, DescriptorChange, GpuDescriptor, Policy};
use thiserror::Error;
use tokio::{
    select,
    sync::{
        broadcast::{self, error::RecvError},
        mpsc::Sender,
        oneshot,
    },
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};
use zbus::{Connection, fdo, interface, object_server::InterfaceRef};

use crate::{
    devices_manager::{DevicesManagerAnswer, DevicesManagerMessage},
    errors::GpuresdError,
};

const SERVICE_NAME: &str = "com.github.Gpuresd1";
const OBJECT_PATH: &str = "/com/github/Gpuresd1";

type Result<T> = std::result::Result<T, DbusServiceError>;

#[derive(Debug, Error)]
pub enum DbusServiceError {
    #[error("DBus service TX error: {reason}")]
    TX {
        reason: String,
        #[source]
        error: anyhow::Error,
    },
    #[error("DBus service RX error: {reason}")]
    RX {
        reason: String,
        #[source]
        error: anyhow::Error,
    },
    #[error("DBus service invalid response error: {reason}")]
    InvalidResponse { reason: String },
    #[error("DBus service DBus connection error: {reason}")]
    DBusConnection {
        reason: String,
        #[source]
        error: anyhow::Error,
    },
    #[error("DBus service DBus object error: {reason}")]
    DBusObject {
        reason: String,
        #[source]
        error: anyhow::Error,
    },
}

// Read-only view of one GPU descriptor
struct GpuInterface {
    descriptor: Arc<GpuDescriptor>,
    policy: Arc<Policy>,
}

impl GpuInterface {
    fn new(descriptor: Arc<GpuDescriptor>, policy: Arc<Policy>) -> Self {
        Self { descriptor, policy }
    }
}

#[interface(name = "com.github.Gpuresd1.Gpu")]
impl GpuInterface {
    #[zbus(property)]
    async fn id(&self) -> String {
        self.descriptor.id().to_string()
    }

    #[zbus(property)]
    async fn supported(&self) -> bool {
        self.descriptor.is_supported(&*self.policy)
    }

    // Policy filtered request, empty when the GPU is not supported
    #[zbus(property)]
    async fn request(&self) -> fdo::Result<String> {
        let state = self.descriptor.snapshot();

        if !state.is_supported(&*self.policy) {
            return Ok(String::new());
        }

        state
            .request(&*self.policy)
            .and_then(|request| serde_json::to_string(&request).map_err(Into::into))
            .map_err(|err| fdo::Error::Failed(err.to_string()))
    }

    #[zbus(property)]
    async fn state(&self) -> fdo::Result<String> {
        serde_json::to_string(&*self.descriptor.snapshot())
            .map_err(|err| fdo::Error::Failed(err.to_string()))
    }
}

pub struct DBusService {
    policy: Arc<Policy>,

    // One task per GPU object forwarding descriptor changes
    tracker: TaskTracker,
}

impl DBusService {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self {
            policy,
            tracker: TaskTracker::new(),
        }
    }

    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        tx_devices_manager: Sender<DevicesManagerMessage>,
        tx_err: Sender<GpuresdError>,
    ) {
        // Connect to the session D-Bus
        let connection = match Connection::session().await {
            Ok(conn) => conn,
            Err(err) => {
                let err = DbusServiceError::DBusConnection {
                    reason: "Failed to establish connection with the bus".to_string(),
                    error: err.into(),
                };

                tx_err.send(err.into()).await.unwrap_or_else(|cerr| {
                    error!("Failed to send error over channel: {cerr}");
                });

                // Just return, there is nothing else to do
                return;
            }
        };

        trace!("DBus connection enstablished");

        if let Err(err) = self
            .initialize_service(&connection, &run_token, tx_devices_manager)
            .await
        {
            tx_err.send(err.into()).await.unwrap_or_else(|cerr| {
                error!("Failed to send error over channel: {cerr}");
            });
        }

        run_token.cancelled().await;
        info!("DBus service: Quiting");

        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn initialize_service(
        &mut self,
        connection: &Connection,
        run_token: &CancellationToken,
        tx_devices_manager: Sender<DevicesManagerMessage>,
    ) -> Result<()> {
        // Query the devices manager to get the list of the known GPUs
        let (tx, rx) = oneshot::channel();
        let message = DevicesManagerMessage::ListGpus { tx };

        tx_devices_manager
            .send(message)
            .await
            .map_err(|e| DbusServiceError::TX {
                reason: "Failed to send message to devices manager".to_string(),
                error: anyhow!("{e}"),
            })?;

        // Wait for an answer
        let answer = rx.await.map_err(|e| DbusServiceError::RX {
            reason: "Error while waiting for devices manager answer".to_string(),
            error: e.into(),
        })?;

        let DevicesManagerAnswer::Gpus(descriptors) = answer else {
            return Err(DbusServiceError::InvalidResponse {
                reason: "Invalid response from devices manager".to_string(),
            });
        };

        // Create a D-Bus object for each GPUs on the system
        for (index, descriptor) in descriptors.into_iter().enumerate() {
            let path = format!("{OBJECT_PATH}/Gpu{}", index + 1);

            trace!("Creating D-Bus object {path} for GPU: {}", descriptor.id());

            // Subscribe before exporting so no change is missed
            let changes = descriptor.subscribe();

            let object_error = |e: zbus::Error| DbusServiceError::DBusObject {
                reason: format!("Error while initializing GPU object {path}"),
                error: e.into(),
            };

            let object_server = connection.object_server();
            object_server
                .at(
                    path.as_str(),
                    GpuInterface::new(descriptor, self.policy.clone()),
                )
                .await
                .map_err(object_error)?;

            let iface_ref = object_server
                .interface::<_, GpuInterface>(path.as_str())
                .await
                .map_err(object_error)?;

            let token = run_token.clone();
            self.tracker
                .spawn(forward_changes(token, iface_ref, changes));
        }

        // Request the service name
        // NOTE:    The name request must happen AFTER setting up the
        //          server object or messages might be lost
        connection.request_name(SERVICE_NAME).await.map_err(|e| {
            DbusServiceError::DBusConnection {
                reason: "Failed to acquire service name".to_string(),
                error: e.into(),
            }
        })?;

        info!("DBus service: Running as {SERVICE_NAME}");

        Ok(())
    }
}

// GPU object properties that can change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuProperty {
    Supported,
    Request,
    State,
}

const ALL_PROPERTIES: &[GpuProperty] =
    &[GpuProperty::Supported, GpuProperty::Request, GpuProperty::State];

// Properties to signal for one received notification, None once the
// descriptor is gone. Every change shows up in the full state
fn changed_properties(
    received: &std::result::Result<DescriptorChange, RecvError>,
) -> Option<&'static [GpuProperty]> {
    let kind = match received {
        Ok(change) => change.kind,
        // Some changes were lost, refresh everything
        Err(RecvError::Lagged(count)) => {
            debug!("Missed {count} GPU changes");
            return Some(ALL_PROPERTIES);
        }
        Err(RecvError::Closed) => return None,
    };

    let properties: &'static [GpuProperty] = match kind {
        ChangeKind::Telemetry => &[GpuProperty::State],
        ChangeKind::Identity => &[GpuProperty::Request, GpuProperty::State],
        // Backends and the supported flag both gate the request
        ChangeKind::Backend(_) | ChangeKind::Supported => ALL_PROPERTIES,
    };

    Some(properties)
}

// Turn descriptor change notifications into property change signals
async fn forward_changes(
    run_token: CancellationToken,
    iface_ref: InterfaceRef<GpuInterface>,
    mut changes: broadcast::Receiver<DescriptorChange>,
) {
    loop {
        let received = select! {
            _ = run_token.cancelled() => break,
            received = changes.recv() => received,
        };

        let Some(properties) = changed_properties(&received) else {
            break;
        };

        if let Err(err) = emit_changed(&iface_ref, properties).await {
            warn!("Failed to emit property change signal: {err}");
        }
    }
}

async fn emit_changed(
    iface_ref: &InterfaceRef<GpuInterface>,
    properties: &[GpuProperty],
) -> zbus::Result<()> {
    let iface = iface_ref.get().await;
    let emitter = iface_ref.signal_emitter();

    for property in properties {
        match property {
            GpuProperty::Supported => iface.supported_changed(emitter).await?,
            GpuProperty::Request => iface.request_changed(emitter).await?,
            GpuProperty::State => iface.state_changed(emitter).await?,
        }
    }

    Ok(())
}
