//! Half-open connection gate.
//!
//! Bounds the number of `connect()` calls in flight at once, protecting
//! NAT tables and the local file-descriptor budget. The connection pump
//! asks for a ticket before dialling; the ticket returns its slot when
//! dropped, which happens wherever the connect attempt ends — success,
//! failure, or timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared gate state. Cloning shares the same slot pool.
#[derive(Clone)]
pub struct HalfOpenGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    limit: AtomicUsize,
    in_flight: AtomicUsize,
}

/// One in-flight connect slot. Dropping it frees the slot.
pub struct HalfOpenTicket {
    inner: Arc<GateInner>,
}

impl HalfOpenGate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                limit: AtomicUsize::new(limit),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Claims a slot if one is free.
    pub fn try_enter(&self) -> Option<HalfOpenTicket> {
        let limit = self.inner.limit.load(Ordering::Relaxed);
        let mut current = self.inner.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= limit {
                return None;
            }
            match self.inner.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(HalfOpenTicket {
                        inner: Arc::clone(&self.inner),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Resizes the gate. Shrinking does not revoke outstanding tickets;
    /// the pool drains down to the new limit as they complete.
    pub fn set_limit(&self, limit: usize) {
        self.inner.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    pub fn free_slots(&self) -> usize {
        self.limit().saturating_sub(self.in_flight())
    }
}

impl Drop for HalfOpenTicket {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_bounded_by_limit() {
        let gate = HalfOpenGate::new(2);
        let a = gate.try_enter().unwrap();
        let _b = gate.try_enter().unwrap();
        assert!(gate.try_enter().is_none());
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn shrink_drains_naturally() {
        let gate = HalfOpenGate::new(3);
        let a = gate.try_enter().unwrap();
        let b = gate.try_enter().unwrap();
        gate.set_limit(1);
        assert!(gate.try_enter().is_none());
        drop(a);
        assert!(gate.try_enter().is_none()); // still at 1/1
        drop(b);
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn zero_limit_blocks_everything() {
        let gate = HalfOpenGate::new(0);
        assert!(gate.try_enter().is_none());
        assert_eq!(gate.free_slots(), 0);
    }
}
