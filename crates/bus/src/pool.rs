//! Fixed-capacity transfer-slot pool.
//!
//! Slots recycle without dynamic allocation on the hot path. Handles carry a
//! generation counter so a handle kept past `release` is detected instead of
//! being mistaken for the slot's next owner.
//!
//! The pool's bitmap and flags are mutated from both caller and completion
//! contexts; one fine-grained lock protects them and is never held across a
//! blocking call. Error-cleanup actions run after the lock is dropped.

use alloc::boxed::Box;
use alloc::vec::Vec;

use aquila_error::define_driver_error;
use bitflags::bitflags;
use spin::Mutex;

define_driver_error! {
    /// Slot-pool failures.
    pub enum PoolError(0x02) {
        /// Every slot of the requested direction is allocated. Normal
        /// backpressure; callers defer until a completion frees one.
        Exhausted = 0x01 => "All transfer slots in use" [Backpressure],
        /// The handle's generation no longer matches the slot.
        StaleHandle = 0x02 => "Slot handle is stale" [Fatal],
    }
}

bitflags! {
    /// Per-slot state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u8 {
        /// Submitted to the bus, completion pending.
        const IN_FLIGHT = 0x01;
        /// The transfer failed; cleanup must run before the slot frees.
        const ERRORED = 0x02;
        /// Fire-and-forget: the device never confirms, so release
        /// synthesizes the local completion.
        const NO_CONFIRM = 0x04;
    }
}

/// Transfer direction a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Borrowed reference to an allocated slot.
///
/// Valid until `release`; after that the generation check rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    index: u16,
    generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> u16 {
        self.index
    }
}

type CleanupFn = Box<dyn FnOnce() + Send>;

struct Slot {
    generation: u32,
    allocated: bool,
    dir: Direction,
    flags: SlotFlags,
    buf: Option<Vec<u8>>,
    cleanup: Option<CleanupFn>,
    seq: u16,
}

impl Slot {
    fn new(dir: Direction) -> Self {
        Self {
            generation: 0,
            allocated: false,
            dir,
            flags: SlotFlags::empty(),
            buf: None,
            cleanup: None,
            seq: 0,
        }
    }
}

struct PoolInner {
    slots: Vec<Slot>,
    tx_n: usize,
}

impl PoolInner {
    fn slot_checked(&mut self, handle: SlotHandle) -> Result<&mut Slot, PoolError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(PoolError::StaleHandle)?;
        if !slot.allocated || slot.generation != handle.generation {
            return Err(PoolError::StaleHandle);
        }
        Ok(slot)
    }
}

/// Fixed pool of `tx_n` transmit and `rx_n` receive slots.
pub struct SlotPool {
    inner: Mutex<PoolInner>,
}

impl SlotPool {
    pub fn new(tx_n: usize, rx_n: usize) -> Self {
        let mut slots = Vec::with_capacity(tx_n + rx_n);
        for _ in 0..tx_n {
            slots.push(Slot::new(Direction::Tx));
        }
        for _ in 0..rx_n {
            slots.push(Slot::new(Direction::Rx));
        }
        Self {
            inner: Mutex::new(PoolInner { slots, tx_n }),
        }
    }

    /// First-free scan over the requested direction. Never blocks.
    pub fn acquire(&self, dir: Direction) -> Result<SlotHandle, PoolError> {
        let mut inner = self.inner.lock();
        let (lo, hi) = match dir {
            Direction::Tx => (0, inner.tx_n),
            Direction::Rx => (inner.tx_n, inner.slots.len()),
        };
        for index in lo..hi {
            let slot = &mut inner.slots[index];
            if !slot.allocated {
                slot.allocated = true;
                slot.flags = SlotFlags::empty();
                slot.seq = 0;
                let handle = SlotHandle {
                    index: index as u16,
                    generation: slot.generation,
                };
                return Ok(handle);
            }
        }
        log::trace!("slot pool exhausted ({dir:?})");
        Err(PoolError::Exhausted)
    }

    /// Free the slot. If it is flagged `ERRORED` or `NO_CONFIRM` the
    /// configured cleanup action runs first, exactly once, outside the pool
    /// lock.
    pub fn release(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let cleanup = {
            let mut inner = self.inner.lock();
            let slot = inner.slot_checked(handle)?;
            let cleanup = if slot
                .flags
                .intersects(SlotFlags::ERRORED | SlotFlags::NO_CONFIRM)
            {
                slot.cleanup.take()
            } else {
                None
            };
            slot.allocated = false;
            slot.flags = SlotFlags::empty();
            slot.buf = None;
            slot.cleanup = None;
            slot.generation = slot.generation.wrapping_add(1);
            cleanup
        };
        if let Some(run) = cleanup {
            run();
        }
        Ok(())
    }

    /// Flag the slot errored. Idempotent.
    pub fn mark_errored(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        slot.flags.insert(SlotFlags::ERRORED);
        Ok(())
    }

    /// Flag the slot as a fire-and-forget command.
    pub fn mark_unconfirmed(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        slot.flags.insert(SlotFlags::NO_CONFIRM);
        Ok(())
    }

    pub fn mark_in_flight(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        slot.flags.insert(SlotFlags::IN_FLIGHT);
        Ok(())
    }

    /// Install the error-cleanup action: returns device credit and
    /// synthesizes the locally-generated failure completion.
    pub fn set_cleanup(&self, handle: SlotHandle, cleanup: CleanupFn) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        slot.cleanup = Some(cleanup);
        Ok(())
    }

    /// Bind a buffer; the slot owns it exclusively while allocated.
    pub fn bind_buffer(&self, handle: SlotHandle, buf: Vec<u8>) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        slot.buf = Some(buf);
        Ok(())
    }

    /// Take the bound buffer back, typically on submit.
    pub fn take_buffer(&self, handle: SlotHandle) -> Result<Option<Vec<u8>>, PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        Ok(slot.buf.take())
    }

    pub fn set_seq(&self, handle: SlotHandle, seq: u16) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_checked(handle)?;
        slot.seq = seq;
        Ok(())
    }

    pub fn seq(&self, handle: SlotHandle) -> Result<u16, PoolError> {
        let mut inner = self.inner.lock();
        Ok(inner.slot_checked(handle)?.seq)
    }

    /// Number of allocated slots in `dir`.
    pub fn in_use(&self, dir: Direction) -> usize {
        let inner = self.inner.lock();
        let (lo, hi) = match dir {
            Direction::Tx => (0, inner.tx_n),
            Direction::Rx => (inner.tx_n, inner.slots.len()),
        };
        inner.slots[lo..hi].iter().filter(|s| s.allocated).count()
    }

    /// Teardown path: mark every outstanding slot errored and release it so
    /// its cleanup runs exactly once.
    pub fn fail_all_outstanding(&self) {
        let outstanding: Vec<SlotHandle> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.allocated)
                .map(|(index, s)| SlotHandle {
                    index: index as u16,
                    generation: s.generation,
                })
                .collect()
        };
        for handle in outstanding {
            // A completion racing us may already have released the slot;
            // the generation check makes that benign.
            let _ = self.mark_errored(handle);
            let _ = self.release(handle);
        }
    }
}
