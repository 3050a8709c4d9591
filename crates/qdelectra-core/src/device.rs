use candle_core::Device;
use tracing::{debug, info, warn};

use crate::error::CoreResult;

/// Upper bound when probing for CUDA devices.
#[cfg(feature = "cuda")]
const MAX_PROBED_DEVICES: usize = 16;

/// Picks the training device: the requested accelerator when one is compiled
/// in and reachable, the CPU otherwise.
pub fn select_device(prefer_gpu: bool, cuda_device_id: usize) -> CoreResult<Device> {
    if prefer_gpu {
        match accelerator(cuda_device_id) {
            Some(Ok(dev)) => {
                info!(device = device_name(&dev), "Training on accelerator");
                return Ok(dev);
            }
            Some(Err(e)) => warn!(error = %e, "Accelerator unavailable, training on CPU"),
            None => warn!("--gpu ignored: built without the `cuda` or `metal` feature"),
        }
    }
    info!("Training on CPU");
    Ok(Device::Cpu)
}

#[cfg(feature = "cuda")]
fn accelerator(cuda_device_id: usize) -> Option<candle_core::Result<Device>> {
    Some(Device::new_cuda(cuda_device_id))
}

#[cfg(all(feature = "metal", not(feature = "cuda")))]
fn accelerator(_cuda_device_id: usize) -> Option<candle_core::Result<Device>> {
    Some(Device::new_metal(0))
}

#[cfg(not(any(feature = "cuda", feature = "metal")))]
fn accelerator(_cuda_device_id: usize) -> Option<candle_core::Result<Device>> {
    None
}

/// Devices a data-parallel step spreads a batch over, `primary` first.
///
/// A CUDA primary is joined by every other CUDA device that opens. CPU and
/// Metal run alone.
pub fn replica_devices(primary: &Device) -> Vec<Device> {
    let mut devices = vec![primary.clone()];
    devices.extend(peer_accelerators(primary));
    devices
}

#[cfg(feature = "cuda")]
fn peer_accelerators(primary: &Device) -> Vec<Device> {
    let primary_id = match primary.location() {
        candle_core::DeviceLocation::Cuda { gpu_id } => gpu_id,
        _ => return Vec::new(),
    };
    (0..MAX_PROBED_DEVICES)
        .filter(|&i| i != primary_id)
        .map_while(|i| Device::new_cuda(i).ok())
        .collect()
}

#[cfg(not(feature = "cuda"))]
fn peer_accelerators(_primary: &Device) -> Vec<Device> {
    Vec::new()
}

/// Seeds the device RNG used for weight initialisation and dropout masks.
///
/// Backends that cannot be seeded are left untouched.
pub fn seed_device(device: &Device, seed: u64) {
    match device.set_seed(seed) {
        Ok(()) => debug!(seed, device = device_name(device), "Seeded device RNG"),
        Err(e) => debug!(seed, error = %e, "Device RNG cannot be seeded; continuing unseeded"),
    }
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_gpu_request_returns_cpu() {
        let device = select_device(false, 0).unwrap();
        assert!(
            matches!(device, Device::Cpu),
            "prefer_gpu=false must always return CPU"
        );
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn gpu_request_without_backend_falls_back() {
        assert!(matches!(select_device(true, 0).unwrap(), Device::Cpu));
    }

    #[test]
    fn cpu_runs_alone() {
        let devices = replica_devices(&Device::Cpu);
        assert_eq!(devices.len(), 1);
        assert!(devices[0].same_device(&Device::Cpu));
    }

    #[test]
    fn seeding_cpu_does_not_panic() {
        seed_device(&Device::Cpu, 42);
    }

    #[test]
    fn cpu_is_named() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }
}
