// src/backend/device.rs

/// An execution target owning a value's memory. `Cpu` is the default
/// compute device; `Accel(id)` is an accelerator address space honored by
/// the memory/accumulation protocol (allocation, release, work signalling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accel(usize), // Device ID for multi-accelerator systems
}

impl Device {
    // Check if device is CPU
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_accel(&self) -> bool {
        matches!(self, Device::Accel(_))
    }

    // Get device ID for accelerator devices
    pub fn device_id(&self) -> Option<usize> {
        match self {
            Device::Cpu => None,
            Device::Accel(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Accel(id) => write!(f, "ACCEL:{}", id),
        }
    }
}

pub fn cpu() -> Device {
    Device::Cpu
}

/// Default device selection. The core engine never assumes anything beyond
/// "there is one default compute device"; callers targeting accelerators
/// tag values explicitly.
pub fn default_device() -> Device {
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids() {
        assert!(cpu().is_cpu());
        assert_eq!(cpu().device_id(), None);
        assert_eq!(Device::Accel(2).device_id(), Some(2));
        assert!(Device::Accel(0).is_accel());
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Cpu.to_string(), "CPU");
        assert_eq!(Device::Accel(1).to_string(), "ACCEL:1");
    }
}
