// src/backend/context.rs
// Device/execution context boundary. The differentiation engine talks to
// devices exclusively through these traits: acquire scratch memory, return
// values, and signal that outstanding asynchronous work exists. The engine
// itself never blocks on a device; callers synchronize through the device
// layer before reading results.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use log::trace;

use crate::backend::device::Device;
use crate::backend::number::GradixF;
use crate::error::Result;
use crate::value::Value;

/// Raw memory side of a device context: acquire a zeroed buffer of a given
/// shape on a device, and hand values back when a scope is done with them.
pub trait DeviceMem<T: GradixF> {
    /// Returns a zeroed value of the requested shape, owned by `device`.
    /// An empty shape yields a scalar.
    fn get(&self, device: Device, shape: &[usize]) -> Result<Value<T>>;

    /// Releases a value back to the allocator. Scalars are dropped; tensor
    /// buffers re-enter the free list keyed by element count.
    fn put_value(&self, device: Device, value: Value<T>);
}

/// Full execution-context contract used during numeric differentiation.
pub trait DeviceContext<T: GradixF>: DeviceMem<T> {
    /// The device computation runs on when a value carries no explicit tag.
    fn default_device(&self) -> Device;

    /// Marks outstanding asynchronous work on the device queue. Fire and
    /// forget; the engine never waits on it.
    fn signal(&self);
}

/// Host-memory context. Buffers are recycled through a free list keyed by
/// element count, and `signal` just counts, which is what the tests observe.
pub struct HostContext<T: GradixF> {
    depot: RefCell<HashMap<usize, Vec<Value<T>>>>,
    signals: Cell<usize>,
}

impl<T: GradixF> HostContext<T> {
    pub fn new() -> Self {
        Self {
            depot: RefCell::new(HashMap::new()),
            signals: Cell::new(0),
        }
    }

    /// Number of `signal` calls since construction.
    pub fn signal_count(&self) -> usize {
        self.signals.get()
    }

    /// Number of values currently parked in the free list.
    pub fn pooled(&self) -> usize {
        self.depot.borrow().values().map(Vec::len).sum()
    }
}

impl<T: GradixF> Default for HostContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: GradixF> DeviceMem<T> for HostContext<T> {
    fn get(&self, device: Device, shape: &[usize]) -> Result<Value<T>> {
        if shape.is_empty() {
            return Ok(Value::Scalar(<T as crate::backend::number::GradixN>::zero()));
        }
        let size: usize = shape.iter().product();
        if let Some(free) = self.depot.borrow_mut().get_mut(&size) {
            if let Some(mut v) = free.pop() {
                trace!("reusing {} element buffer on {}", size, device);
                v.zero_fill();
                return v.reshaped(shape);
            }
        }
        trace!("allocating {} element buffer on {}", size, device);
        Ok(Value::Tensor(crate::tensor::Tensor::zeros_on(
            shape, device,
        )))
    }

    fn put_value(&self, _device: Device, value: Value<T>) {
        if let Value::Tensor(ref t) = value {
            let size = t.size();
            self.depot
                .borrow_mut()
                .entry(size)
                .or_default()
                .push(value);
        }
        // scalars and masks are not worth pooling
    }
}

impl<T: GradixF> DeviceContext<T> for HostContext<T> {
    fn default_device(&self) -> Device {
        Device::Cpu
    }

    fn signal(&self) {
        self.signals.set(self.signals.get() + 1);
    }
}

/// Scope guard around a device-allocated scratch value. Releases the value
/// through `put_value` when dropped, on every exit path; `take` defuses the
/// guard when ownership moves elsewhere.
pub struct ScopedValue<'a, T: GradixF> {
    ctx: &'a dyn DeviceMem<T>,
    device: Device,
    value: Option<Value<T>>,
}

impl<'a, T: GradixF> ScopedValue<'a, T> {
    pub fn new(ctx: &'a dyn DeviceMem<T>, device: Device, value: Value<T>) -> Self {
        Self {
            ctx,
            device,
            value: Some(value),
        }
    }

    pub fn value(&self) -> &Value<T> {
        // the slot is only empty after `take`, which consumes self
        self.value.as_ref().unwrap()
    }

    pub fn value_mut(&mut self) -> &mut Value<T> {
        self.value.as_mut().unwrap()
    }

    /// Defuses the guard and hands the value to the caller.
    pub fn take(mut self) -> Value<T> {
        self.value.take().unwrap()
    }
}

impl<T: GradixF> Drop for ScopedValue<'_, T> {
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            self.ctx.put_value(self.device, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_context_recycles_buffers() {
        let ctx: HostContext<f64> = HostContext::new();
        let v = ctx.get(Device::Cpu, &[2, 3]).unwrap();
        assert_eq!(v.shape(), &[2, 3]);
        ctx.put_value(Device::Cpu, v);
        assert_eq!(ctx.pooled(), 1);

        // same element count comes back out of the free list, reshaped
        let v2 = ctx.get(Device::Cpu, &[6]).unwrap();
        assert_eq!(v2.shape(), &[6]);
        assert_eq!(ctx.pooled(), 0);
    }

    #[test]
    fn scalars_are_not_pooled() {
        let ctx: HostContext<f64> = HostContext::new();
        ctx.put_value(Device::Cpu, Value::Scalar(1.0));
        assert_eq!(ctx.pooled(), 0);
    }

    #[test]
    fn scoped_value_releases_on_drop() {
        let ctx: HostContext<f64> = HostContext::new();
        {
            let v = ctx.get(Device::Cpu, &[4]).unwrap();
            let _guard = ScopedValue::new(&ctx, Device::Cpu, v);
            assert_eq!(ctx.pooled(), 0);
        }
        assert_eq!(ctx.pooled(), 1);
    }

    #[test]
    fn taken_value_is_not_released() {
        let ctx: HostContext<f64> = HostContext::new();
        let v = ctx.get(Device::Cpu, &[4]).unwrap();
        let guard = ScopedValue::new(&ctx, Device::Cpu, v);
        let owned = guard.take();
        assert_eq!(owned.shape(), &[4]);
        assert_eq!(ctx.pooled(), 0);
    }

    #[test]
    fn signal_counts_outstanding_work() {
        let ctx: HostContext<f64> = HostContext::new();
        ctx.signal();
        ctx.signal();
        assert_eq!(ctx.signal_count(), 2);
    }
}
