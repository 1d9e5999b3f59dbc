use candle_core::{Device, DeviceLocation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SIZE_IN_MB: f64 = 1024.0 * 1024.0;

/// Device memory usage in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub allocated_mb: f64,
    pub reserved_mb: f64,
}

impl MemoryStats {
    pub fn from_bytes(allocated: usize, reserved: usize) -> Self {
        let round = |bytes: usize| (bytes as f64 / SIZE_IN_MB * 100.0).round() / 100.0;
        Self {
            allocated_mb: round(allocated),
            reserved_mb: round(reserved),
        }
    }
}

/// The compute device the model lives on, seen from the lifecycle manager.
///
/// Implementations must tolerate `release_transient_memory` being called
/// redundantly and from several threads at once.
pub trait DeviceBackend: Send + Sync {
    fn device(&self) -> &Device;

    /// Short descriptor such as `cuda:0`, `metal:0` or `cpu`.
    fn label(&self) -> String;

    /// Whether a hardware accelerator is present on this host.
    fn is_available(&self) -> bool;

    fn memory_stats(&self) -> Option<MemoryStats>;

    /// Reclaim scratch memory left behind by a forward pass. This does not
    /// unload the model.
    fn release_transient_memory(&self);
}

pub struct CandleBackend {
    device: Device,
    release_lock: Mutex<()>,
}

impl CandleBackend {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            release_lock: Mutex::new(()),
        }
    }

    #[cfg(feature = "cuda")]
    fn cuda_memory_stats(&self) -> Option<MemoryStats> {
        use candle_core::cuda_backend::cudarc::driver::result::mem_get_info;
        let cuda = self.device.as_cuda_device().ok()?;
        cuda.cuda_device().bind_to_thread().ok()?;
        let (free, total) = mem_get_info().ok()?;
        Some(MemoryStats::from_bytes(total.saturating_sub(free), total))
    }
}

impl DeviceBackend for CandleBackend {
    fn device(&self) -> &Device {
        &self.device
    }

    fn label(&self) -> String {
        match self.device.location() {
            DeviceLocation::Cpu => "cpu".to_string(),
            DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
            DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
        }
    }

    fn is_available(&self) -> bool {
        candle_core::utils::cuda_is_available() || candle_core::utils::metal_is_available()
    }

    fn memory_stats(&self) -> Option<MemoryStats> {
        #[cfg(feature = "cuda")]
        if self.device.is_cuda() {
            return self.cuda_memory_stats();
        }
        None
    }

    fn release_transient_memory(&self) {
        if self.device.is_cpu() {
            return;
        }
        let _guard = self.release_lock.lock();
        match self.device.synchronize() {
            Ok(()) => debug!("Device memory released on {}", self.label()),
            Err(e) => warn!("Failed to synchronize {}: {e}", self.label()),
        }
    }
}
