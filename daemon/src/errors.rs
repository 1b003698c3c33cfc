use thiserror::Error;

use crate::{
    config_manager::ConfigError, dbus_service::DbusServiceError,
    devices_manager::DevicesManagerError,
};

// The main daemon error type
#[derive(Debug, Error)]
pub enum GpuresdError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DevicesManager(#[from] DevicesManagerError),
    #[error(transparent)]
    DBusService(#[from] DbusServiceError),
}
