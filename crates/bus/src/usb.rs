//! Bulk-endpoint (USB-like) transport backend.
//!
//! The platform supplies control-pipe access and bulk transfers through
//! [`UsbPort`]; bulk submits carry the completion down to the port, so the
//! port is free to finish them on its own completion context. Exclusive
//! access maps to an autosuspend reference count rather than a hard lock.

use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

use crate::error::BusError;
use crate::{Bus, IrqHandler, ReadDone, SYNC_RETRY_LIMIT, WriteDone};

/// Bulk endpoint max packet size. Transfers that are an exact multiple get
/// one pad byte so the device sees the end of the transfer.
pub const EP_PKT_SIZE: usize = 512;

/// Raw endpoint primitives the platform implements.
pub trait UsbPort: Send + Sync {
    /// Vendor control-pipe read.
    fn control_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError>;

    /// Vendor control-pipe write.
    fn control_write(&self, addr: u32, data: &[u8]) -> Result<(), BusError>;

    /// Bulk-in transfer of up to `len` bytes; `done` fires from the port's
    /// completion context.
    fn bulk_in(&self, len: usize, done: ReadDone) -> Result<(), BusError>;

    /// Bulk-out transfer; same completion contract.
    fn bulk_out(&self, data: Vec<u8>, done: WriteDone) -> Result<(), BusError>;

    /// Enter or leave autosuspend.
    fn set_suspended(&self, on: bool) -> Result<(), BusError>;

    /// Port-level device reset.
    fn port_reset(&self);
}

/// USB-like [`Bus`] implementation.
pub struct UsbBus<P: UsbPort> {
    port: P,
    /// Autosuspend holds; the device stays awake while positive.
    pm_ref: AtomicI32,
    irq: Mutex<Option<IrqHandler>>,
}

impl<P: UsbPort> UsbBus<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            pm_ref: AtomicI32::new(0),
            irq: Mutex::new(None),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Entry point for the platform's data-availability notification.
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
                    log::trace!("usb control transfer attempt {attempt} failed: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

impl<P: UsbPort> Bus for UsbBus<P> {
    fn read_sync(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.retry(|| self.port.control_read(addr, buf))
    }

    fn write_sync(&self, addr: u32, data: &[u8]) -> Result<(), BusError> {
        self.retry(|| self.port.control_write(addr, data))
    }

    fn submit_read(&self, _addr: u32, len: usize, done: ReadDone) -> Result<(), BusError> {
        self.port.bulk_in(self.align_size(len), done)
    }

    fn submit_write(&self, _addr: u32, mut data: Vec<u8>, done: WriteDone) -> Result<(), BusError> {
        if !data.is_empty() && data.len() % EP_PKT_SIZE == 0 {
            data.push(0);
        }
        self.port.bulk_out(data, done)
    }

    fn lock(&self) {
        // Exclusive access maps to a PM hold: first holder wakes the device.
        if self.pm_ref.fetch_add(1, Ordering::AcqRel) == 0
            && self.port.set_suspended(false).is_err()
        {
            log::warn!("usb resume on lock failed");
        }
    }

    fn unlock(&self) {
        let prev = self.pm_ref.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            log::warn!("usb unlock without matching lock");
            self.pm_ref.store(0, Ordering::Release);
            return;
        }
        if prev == 1 && self.port.set_suspended(true).is_err() {
            log::warn!("usb autosuspend on unlock failed");
        }
    }

    fn subscribe_irq(&self, handler: IrqHandler) -> Result<(), BusError> {
        let mut irq = self.irq.lock();
        if irq.is_some() {
            return Err(BusError::HandlerInstalled);
        }
        *irq = Some(handler);
        Ok(())
    }

    fn unsubscribe_irq(&self) {
        self.irq.lock().take();
    }

    fn reset(&self) {
        self.port.port_reset();
    }

    fn align_size(&self, len: usize) -> usize {
        // Dword-align; the endpoint handles arbitrary lengths beyond that.
        len.div_ceil(4) * 4
    }

    fn power(&self, suspend: bool) -> Result<(), BusError> {
        if suspend && self.pm_ref.load(Ordering::Acquire) > 0 {
            return Err(BusError::Power);
        }
        self.port.set_suspended(suspend).map_err(|_| BusError::Power)
    }
}
