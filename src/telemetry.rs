// Telemetry is information that is updated in real time

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Number of fans a descriptor keeps a percentage for
pub const MAX_FANS: usize = 3;

const FAN_FIELDS: [&str; MAX_FANS] = ["fan0_pct", "fan1_pct", "fan2_pct"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("Failed to read {field}: {reason}")]
    Read { field: &'static str, reason: String },
    #[error("Telemetry is not available for GPU \"{0}\"")]
    Unavailable(String),
    #[error("Invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: f64 },
}

/// One point in time sensor read of a GPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    // PCIe link, the device maximum and the maximum the
    // device and the system can agree on
    pub max_pcie_link_gen_device: u8,
    pub max_pcie_link_gen: u8,
    pub max_pcie_link_width: u8,
    pub curr_pcie_link_gen: u8,
    pub curr_pcie_link_width: u8,

    // Core and memory frequency limits and current values
    pub gpu_freq_limit_mhz: u32,
    pub mem_freq_limit_mhz: u32,
    pub gpu_freq_mhz: u32,
    pub mem_freq_mhz: u32,

    pub gpu_temp_c: i32,
    pub pstate: u8,

    // Power draw and power limit
    pub curr_power_watts: f64,
    pub max_power_watts: f64,

    // Only the first fan_count speeds are meaningful
    pub fan_count: u32,
    pub fan_speed_pct: [f64; MAX_FANS],
}

/// Source of telemetry samples, usually a handle on a driver library.
pub trait TelemetryReader {
    fn read_sample(&self) -> Result<TelemetrySample, TelemetryError>;
}

// A sample that was read elsewhere is its own reader
impl TelemetryReader for TelemetrySample {
    fn read_sample(&self) -> Result<TelemetrySample, TelemetryError> {
        Ok(self.clone())
    }
}

pub fn pstate_label(state: u8) -> String {
    format!("P{state}")
}

pub fn pcie_gen_label(generation: u8) -> String {
    format!("Gen{generation}")
}

pub fn pcie_link_label(generation: u8, width: u8) -> String {
    format!("Gen{generation}x{width}")
}

/// Formatted telemetry fields as stored in a descriptor.
///
/// A value of this type is always built from one complete sample, the
/// descriptor replaces its telemetry with it as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub pcie_link_device: String,
    pub pcie_link_system: String,
    pub pcie_link_current: String,

    pub max_gpu_clock: u32,
    pub max_mem_clock: u32,
    pub cur_gpu_clock: u32,
    pub cur_mem_clock: u32,

    pub cur_temp: i32,
    pub pstate: String,

    pub cur_gpu_power: f64,
    pub max_gpu_power: f64,

    pub gpu_fans: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan0_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan1_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan2_pct: Option<f64>,
}

impl Telemetry {
    pub fn from_reader<R: TelemetryReader + ?Sized>(
        reader: &R,
    ) -> Result<Self, TelemetryError> {
        Self::try_from(&reader.read_sample()?)
    }

    // Return the fan percentages that are set, in fan order
    pub fn fan_pcts(&self) -> Vec<f64> {
        [self.fan0_pct, self.fan1_pct, self.fan2_pct]
            .into_iter()
            .flatten()
            .collect()
    }
}

impl TryFrom<&TelemetrySample> for Telemetry {
    type Error = TelemetryError;

    fn try_from(sample: &TelemetrySample) -> Result<Self, Self::Error> {
        let cur_gpu_power = power("cur_gpu_power", sample.curr_power_watts)?;
        let max_gpu_power = power("max_gpu_power", sample.max_power_watts)?;

        // Fans past the reported count are left out entirely
        let fan_count = (sample.fan_count as usize).min(MAX_FANS);
        let mut fans = [None; MAX_FANS];

        for (i, fan) in fans.iter_mut().enumerate().take(fan_count) {
            *fan = Some(percentage(FAN_FIELDS[i], sample.fan_speed_pct[i])?);
        }

        let [fan0_pct, fan1_pct, fan2_pct] = fans;

        Ok(Self {
            pcie_link_device: pcie_gen_label(sample.max_pcie_link_gen_device),
            pcie_link_system: pcie_link_label(
                sample.max_pcie_link_gen,
                sample.max_pcie_link_width,
            ),
            pcie_link_current: pcie_link_label(
                sample.curr_pcie_link_gen,
                sample.curr_pcie_link_width,
            ),

            max_gpu_clock: sample.gpu_freq_limit_mhz,
            max_mem_clock: sample.mem_freq_limit_mhz,
            cur_gpu_clock: sample.gpu_freq_mhz,
            cur_mem_clock: sample.mem_freq_mhz,

            cur_temp: sample.gpu_temp_c,
            pstate: pstate_label(sample.pstate),

            cur_gpu_power,
            max_gpu_power,

            gpu_fans: sample.fan_count,
            fan0_pct,
            fan1_pct,
            fan2_pct,
        })
    }
}

fn power(field: &'static str, watts: f64) -> Result<f64, TelemetryError> {
    if watts.is_finite() && watts >= 0. {
        Ok(watts)
    } else {
        Err(TelemetryError::InvalidValue {
            field,
            value: watts,
        })
    }
}

// Fans can report more than 100% when driven past their nominal speed
fn percentage(field: &'static str, pct: f64) -> Result<f64, TelemetryError> {
    if pct.is_finite() && pct >= 0. {
        Ok(pct)
    } else {
        Err(TelemetryError::InvalidValue { field, value: pct })
    }
}
