pub mod arg_parser;
pub mod config_manager;
pub mod dbus_service;
pub mod devices_manager;
pub mod errors;
pub mod gpu_device;
pub mod logger;
