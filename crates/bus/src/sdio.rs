//! Block-synchronous (SDIO-like) transport backend.
//!
//! The platform supplies raw CMD52/CMD53 primitives through [`SdioPort`];
//! this backend layers the shared contract on top: block-size alignment,
//! the bounded retry on blocking access, exclusive-access claiming and the
//! single interrupt-handler subscription.

use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::error::BusError;
use crate::{Bus, IrqHandler, ReadDone, SYNC_RETRY_LIMIT, WriteDone};

/// Transfer granularity of the block bus.
pub const SDIO_BLOCK_SIZE: usize = 256;

/// Function register poked by `power`.
const REG_PWR_CTRL: u32 = 0x0000_0002;

/// Raw bus primitives the platform implements.
pub trait SdioPort: Send + Sync {
    /// Single-byte register read.
    fn cmd52_read(&self, addr: u32) -> Result<u8, BusError>;

    /// Single-byte register write.
    fn cmd52_write(&self, addr: u32, val: u8) -> Result<(), BusError>;

    /// Multi-byte block read. `buf` is block-aligned.
    fn cmd53_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError>;

    /// Multi-byte block write. `data` is block-aligned.
    fn cmd53_write(&self, addr: u32, data: &[u8]) -> Result<(), BusError>;

    /// Enable or disable the function interrupt.
    fn irq_enable(&self, on: bool);

    /// Host-controller-level reset of the card. May be a no-op.
    fn bus_reset(&self);
}

/// SDIO-like [`Bus`] implementation.
pub struct SdioBus<P: SdioPort> {
    port: P,
    claimed: AtomicBool,
    irq: Mutex<Option<IrqHandler>>,
}

impl<P: SdioPort> SdioBus<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            claimed: AtomicBool::new(false),
            irq: Mutex::new(None),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Entry point for the platform's interrupt service glue.
    pub fn raise_irq(&self) {
        let irq = self.irq.lock();
        if let Some(handler) = irq.as_ref() {
            handler();
        }
    }

    fn retry<T>(&self, mut op: impl FnMut() -> Result<T, BusError>) -> Result<T, BusError> {
        let mut last = BusError::Io;
        for attempt in 0..SYNC_RETRY_LIMIT {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    log::trace!("sdio sync transfer attempt {attempt} failed: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

impl<P: SdioPort> Bus for SdioBus<P> {
    fn read_sync(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError> {
        let aligned = self.align_size(buf.len());
        if aligned == buf.len() {
            return self.retry(|| self.port.cmd53_read(addr, buf));
        }
        let mut bounce = vec![0u8; aligned];
        self.retry(|| self.port.cmd53_read(addr, &mut bounce))?;
        buf.copy_from_slice(&bounce[..buf.len()]);
        Ok(())
    }

    fn write_sync(&self, addr: u32, data: &[u8]) -> Result<(), BusError> {
        let aligned = self.align_size(data.len());
        if aligned == data.len() {
            return self.retry(|| self.port.cmd53_write(addr, data));
        }
        let mut bounce = vec![0u8; aligned];
        bounce[..data.len()].copy_from_slice(data);
        self.retry(|| self.port.cmd53_write(addr, &bounce))
    }

    fn submit_read(&self, addr: u32, len: usize, done: ReadDone) -> Result<(), BusError> {
        // The block bus completes transfers in the submitting context; the
        // async contract still holds (done fires exactly once, after Ok).
        let mut buf = vec![0u8; self.align_size(len)];
        match self.port.cmd53_read(addr, &mut buf) {
            Ok(()) => {
                buf.truncate(len);
                done(Ok(buf));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn submit_write(&self, addr: u32, mut data: Vec<u8>, done: WriteDone) -> Result<(), BusError> {
        let aligned = self.align_size(data.len());
        data.resize(aligned, 0);
        match self.port.cmd53_write(addr, &data) {
            Ok(()) => {
                done(Ok(()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) {
        while self
            .claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn subscribe_irq(&self, handler: IrqHandler) -> Result<(), BusError> {
        let mut irq = self.irq.lock();
        if irq.is_some() {
            return Err(BusError::HandlerInstalled);
        }
        *irq = Some(handler);
        self.port.irq_enable(true);
        Ok(())
    }

    fn unsubscribe_irq(&self) {
        let mut irq = self.irq.lock();
        if irq.take().is_some() {
            self.port.irq_enable(false);
        }
    }

    fn reset(&self) {
        self.port.bus_reset();
    }

    fn align_size(&self, len: usize) -> usize {
        len.div_ceil(SDIO_BLOCK_SIZE) * SDIO_BLOCK_SIZE
    }

    fn power(&self, suspend: bool) -> Result<(), BusError> {
        let val = if suspend { 0 } else { 1 };
        self.retry(|| self.port.cmd52_write(REG_PWR_CTRL, val))
            .map_err(|_| BusError::Power)
    }
}
