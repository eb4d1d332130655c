//! Compute device selection.

use candle_core::Device;
use tracing::info;

use crate::error::{Error, Result};

/// Resolve a device spec: `auto` probes CUDA then Metal then CPU; explicit
/// specs are `cpu`, `cuda`, `cuda:N`, or `metal`.
pub fn select_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let device = match spec.as_str() {
        "auto" => auto_device(),
        "cpu" => Device::Cpu,
        "metal" => Device::new_metal(0)
            .map_err(|e| Error::ConfigMissing(format!("metal device unavailable: {e}")))?,
        other => {
            if let Some(rest) = other.strip_prefix("cuda") {
                let ordinal: usize = rest
                    .strip_prefix(':')
                    .map(|n| n.parse())
                    .transpose()
                    .map_err(|_| Error::ConfigMissing(format!("bad device spec '{other}'")))?
                    .unwrap_or(0);
                Device::new_cuda(ordinal)
                    .map_err(|e| Error::ConfigMissing(format!("cuda device unavailable: {e}")))?
            } else {
                return Err(Error::ConfigMissing(format!("unknown device spec '{other}'")));
            }
        }
    };
    info!("Selected compute device: {}", label(&device));
    Ok(device)
}

fn auto_device() -> Device {
    if let Ok(device) = Device::new_cuda(0) {
        return device;
    }
    if let Ok(device) = Device::new_metal(0) {
        return device;
    }
    Device::Cpu
}

pub fn label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_spec_resolves() {
        let device = select_device("cpu").unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(label(&device), "cpu");
    }

    #[test]
    fn auto_never_fails() {
        assert!(select_device("auto").is_ok());
    }

    #[test]
    fn unknown_spec_is_rejected() {
        assert!(select_device("tpu").is_err());
        assert!(select_device("cuda:banana").is_err());
    }
}
