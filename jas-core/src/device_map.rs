use anyhow::{Context, Result};
use candle_core::{DType, Device};

use crate::select_best_device;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }
}

/// Device and numeric precision for local inference, resolved once at startup.
///
/// Accelerators run in half precision; the CPU path stays in `f32` since most
/// CPU kernels have no `f16` implementation.
#[derive(Clone, Debug)]
pub struct Capability {
    pub device: Device,
    pub dtype: DType,
}

impl Capability {
    pub fn resolve(device_map: DeviceMap) -> Result<Self> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = dtype_for(&device);
        tracing::info!(device = ?device, dtype = ?dtype, "resolved local inference capability");
        Ok(Self { device, dtype })
    }
}

fn dtype_for(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}
