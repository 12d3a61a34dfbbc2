//! # aquila-bus
//!
//! Bus-agnostic transport layer for the aquila wireless stack.
//!
//! This crate provides the pieces every physical bus backend has in common:
//! - [`Bus`] trait — the read/write/submit/interrupt contract the rest of the
//!   driver talks through
//! - [`SlotPool`] — fixed-capacity transfer-slot allocator with
//!   generation-checked handles
//! - [`DmaRing`] — circular chunk arena backing aggregated DMA transmits
//! - [`FrameCodec`] — pluggable wire-header codec
//!
//! Two concrete backends are included: [`SdioBus`] (block-synchronous) and
//! [`UsbBus`] (bulk-endpoint). Both are generic over a small platform port
//! trait supplying the raw bus primitives; everything above the port is
//! shared bookkeeping.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::boxed::Box;
use alloc::vec::Vec;

mod codec;
mod error;
mod pool;
mod ring;
mod sdio;
mod usb;

pub use codec::{
    CHAN_CMD, CHAN_DATA, CMD_SEQ_WINDOW, DATA_SEQ_MASK, FRAME_MAGIC, FrameCodec, FrameFlags,
    FrameHeader, Gen1Codec, HDR_LEN,
};
pub use error::BusError;
pub use pool::{Direction, PoolError, SlotFlags, SlotHandle, SlotPool};
pub use ring::{DmaRing, RingError};
pub use sdio::{SDIO_BLOCK_SIZE, SdioBus, SdioPort};
pub use usb::{EP_PKT_SIZE, UsbBus, UsbPort};

/// Completion for an asynchronous receive. Invoked exactly once with the
/// filled buffer, unless the submit itself failed synchronously.
pub type ReadDone = Box<dyn FnOnce(Result<Vec<u8>, BusError>) + Send>;

/// Completion for an asynchronous transmit. Same exactly-once contract.
pub type WriteDone = Box<dyn FnOnce(Result<(), BusError>) + Send>;

/// Data-availability interrupt handler. At most one may be subscribed.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Bounded retry count for blocking register access.
pub const SYNC_RETRY_LIMIT: u32 = 3;

/// Monotonic millisecond clock supplied by the embedder.
///
/// The core never reads wall time itself; timeouts and reorder expiry are
/// all measured against this.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Contract implemented once per physical bus type.
///
/// `submit_*` failures are synchronous: when they return `Err`, the
/// completion will never fire. `read_sync`/`write_sync` retry internally up
/// to [`SYNC_RETRY_LIMIT`] attempts before surfacing [`BusError::Io`]; they
/// are intended for bootstrap-time register access, not the steady-state
/// fast path.
pub trait Bus: Send + Sync {
    /// Blocking register-level read.
    fn read_sync(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError>;

    /// Blocking register-level write.
    fn write_sync(&self, addr: u32, data: &[u8]) -> Result<(), BusError>;

    /// Asynchronous bulk receive of up to `len` bytes.
    fn submit_read(&self, addr: u32, len: usize, done: ReadDone) -> Result<(), BusError>;

    /// Asynchronous bulk transmit. The backend owns `data` until completion.
    fn submit_write(&self, addr: u32, data: Vec<u8>, done: WriteDone) -> Result<(), BusError>;

    /// Begin a sequence of operations that must not interleave with other
    /// bus users. Backends may map this to a power-management reference
    /// count instead of a hard lock. Prefer [`BusClaim`] over calling this
    /// directly.
    fn lock(&self);

    /// End the exclusive sequence started by [`Bus::lock`].
    fn unlock(&self);

    /// Register the data-availability interrupt handler.
    fn subscribe_irq(&self, handler: IrqHandler) -> Result<(), BusError>;

    /// Remove the interrupt handler, if any.
    fn unsubscribe_irq(&self);

    /// Best-effort, idempotent bus-level device reset.
    fn reset(&self);

    /// Round `len` up to the backend's transfer granularity.
    fn align_size(&self, len: usize) -> usize;

    /// Transition bus power state. Callable with no transfer outstanding.
    fn power(&self, suspend: bool) -> Result<(), BusError>;
}

/// Scoped exclusive bus access. Unlocks on drop.
pub struct BusClaim<'a> {
    bus: &'a dyn Bus,
}

impl<'a> BusClaim<'a> {
    pub fn new(bus: &'a dyn Bus) -> Self {
        bus.lock();
        Self { bus }
    }
}

impl Drop for BusClaim<'_> {
    fn drop(&mut self) {
        self.bus.unlock();
    }
}
