//! # Compute Device Selection
//!
//! Picks the Candle device used by the Whisper backend from the `model.device`
//! setting, falling back to the CPU when a GPU backend is unavailable.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Detection result for `auto`, computed once per process.
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device requested in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Resolve a preference to a usable device.
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => AUTO_DEVICE.get_or_init(Self::detect_best_device).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::cuda_device().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, using CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::metal_device().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, using CPU");
                Device::Cpu
            }),
        }
    }

    fn detect_best_device() -> Device {
        if let Some(device) = Self::cuda_device() {
            info!("Selected CUDA GPU for recognition");
            return device;
        }
        if let Some(device) = Self::metal_device() {
            info!("Selected Metal GPU for recognition");
            return device;
        }
        info!("Using CPU for recognition");
        Device::Cpu
    }

    fn cuda_device() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!("CUDA not available: {}", e))
            .ok()
    }

    fn metal_device() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!("Metal not available: {}", e))
            .ok()
    }

    /// Short label for logs and the health endpoint.
    pub fn get_device_info(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}

/// Parse a preference string, treating unknown values as `auto`.
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::get_device(preference),
        Err(e) => {
            warn!("{}, using auto", e);
            DeviceManager::get_device(DevicePreference::Auto)
        }
    }
}
