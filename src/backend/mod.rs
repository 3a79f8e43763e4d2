// src/backend/mod.rs
pub mod context;
pub mod device;
pub mod number;

pub use context::{DeviceContext, DeviceMem, HostContext, ScopedValue};
pub use device::{cpu, default_device, Device};
pub use number::{GradixF, GradixN};
