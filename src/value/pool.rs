// src/value/pool.rs
// Reuse pool for dual-value records. Backward passes bind and discard a
// dual per node per run; recycling the records keeps allocation churn out
// of the hot path. A record is cleared on the way in, so a borrower never
// observes another run's data.

use std::sync::Mutex;

use log::trace;

use crate::backend::{DeviceMem, GradixF};
use crate::value::{DualValue, Value};

pub struct DualValuePool<T> {
    free: Mutex<Vec<DualValue<T>>>,
}

impl<T: GradixF> DualValuePool<T> {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Yields a cleared record, recycled when one is available.
    pub fn borrow(&self) -> DualValue<T> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        match free.pop() {
            Some(dual) => {
                trace!("dual value reused, {} left in pool", free.len());
                dual
            }
            None => DualValue::empty(),
        }
    }

    /// Returns a record to the pool. Tensor buffers in either slot go back
    /// to the device allocator before the record re-enters circulation;
    /// scalar slots are simply dropped.
    pub fn put(&self, ctx: &dyn DeviceMem<T>, mut dual: DualValue<T>) {
        for slot in dual.release() {
            if let Value::Tensor(ref t) = slot {
                let device = t.device();
                ctx.put_value(device, slot);
            }
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(dual);
    }

    pub fn len(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: GradixF> Default for DualValuePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostContext;
    use crate::tensor::Tensor;
    use crate::value::Value;

    #[test]
    fn borrowed_records_are_cleared() {
        let ctx: HostContext<f64> = HostContext::new();
        let pool: DualValuePool<f64> = DualValuePool::new();
        let mut dual = DualValue::new(Value::Tensor(Tensor::ones(&[4])));
        dual.bind_for().unwrap();
        dual.set_deriv(Value::Tensor(Tensor::ones(&[4])));
        pool.put(&ctx, dual);
        assert_eq!(pool.len(), 1);

        let fresh = pool.borrow();
        assert!(fresh.value().is_none());
        assert!(fresh.deriv().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn put_returns_tensor_buffers_to_the_allocator() {
        let ctx: HostContext<f64> = HostContext::new();
        let pool: DualValuePool<f64> = DualValuePool::new();
        let mut dual = DualValue::new(Value::Tensor(Tensor::ones(&[4])));
        dual.bind_for().unwrap();
        pool.put(&ctx, dual);
        // both the primal and the derivative buffer re-enter the free list
        assert_eq!(ctx.pooled(), 2);

        let mut scalar = DualValue::new(Value::Scalar(1.0));
        scalar.bind_for().unwrap();
        pool.put(&ctx, scalar);
        assert_eq!(ctx.pooled(), 2);
    }

    #[test]
    fn empty_pool_hands_out_fresh_records() {
        let pool: DualValuePool<f64> = DualValuePool::new();
        let dual = pool.borrow();
        assert!(!dual.is_bound());
    }
}
