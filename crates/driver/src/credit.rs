//! Per-sub-interface flow-control credit.
//!
//! The device advertises how many frames it can buffer per logical
//! interface. A credit is taken before every data-frame submit and returned
//! when the completion is observed, success or failure. Counters are
//! CAS-bounded to `[0, max]`; they cannot go negative, and a release that
//! would push past the ceiling is clamped and reported.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::DriverError;

pub struct CreditPool {
    per_if: Vec<AtomicU32>,
    max: u32,
}

impl CreditPool {
    /// All interfaces start with full credit.
    pub fn new(interfaces: usize, max: u32) -> Self {
        let mut per_if = Vec::with_capacity(interfaces);
        for _ in 0..interfaces {
            per_if.push(AtomicU32::new(max));
        }
        Self { per_if, max }
    }

    fn counter(&self, if_id: u8) -> Option<&AtomicU32> {
        self.per_if.get(if_id as usize)
    }

    /// Take one credit. Never blocks; zero credit is backpressure.
    pub fn acquire(&self, if_id: u8) -> Result<(), DriverError> {
        let counter = self.counter(if_id).ok_or(DriverError::NoCredit)?;
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(DriverError::NoCredit);
            }
            match counter.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Return `n` credits. Release past the ceiling means submit/complete
    /// accounting broke somewhere; the counter clamps and the violation is
    /// logged rather than propagated.
    pub fn release(&self, if_id: u8, n: u32) {
        let Some(counter) = self.counter(if_id) else {
            log::error!("credit release for unknown interface {if_id}");
            return;
        };
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            let target = cur.saturating_add(n);
            let clamped = target.min(self.max);
            if clamped != target {
                log::error!(
                    "credit overflow on interface {if_id}: {cur} + {n} > {}",
                    self.max
                );
            }
            match counter.compare_exchange_weak(
                cur,
                clamped,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn available(&self, if_id: u8) -> u32 {
        self.counter(if_id)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Bootstrap/teardown path: restore every interface to full credit.
    pub fn refill(&self) {
        for counter in &self.per_if {
            counter.store(self.max, Ordering::Release);
        }
    }
}
