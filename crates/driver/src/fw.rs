//! Firmware image parsing and bootstrap.
//!
//! The device boots from host-downloaded firmware: an instruction region
//! written to ICCM and a data region written to DCCM, both in fixed-size
//! chunks over the blocking register path. The loader walks an explicit
//! state machine so a wedged bootstrap is observable mid-flight:
//!
//! `Idle -> LoadImage -> DownloadIccm -> DownloadDccm -> Verify -> Ready`
//!
//! Any failing step goes through `Error`, resets the bus and restarts at
//! `LoadImage`, bounded by [`FW_RETRY_LIMIT`]. Parsed images are cached so
//! a recovery cycle does not re-read external storage.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use aquila_bus::Bus;
use bytemuck::{Pod, Zeroable};
use spin::Mutex;

use crate::error::FwError;

/// Magic value in `FwHeader::flags` low 16 bits.
pub const FW_MAGIC: u16 = 0x5746; // "FW"

/// Instruction-memory window.
pub const ICCM_BASE: u32 = 0x0001_0000;
pub const ICCM_MAX: usize = 256 * 1024;

/// Data-memory window.
pub const DCCM_BASE: u32 = 0x0080_0000;
pub const DCCM_MAX: usize = 160 * 1024;

/// Per-write transfer unit during download.
pub const DOWNLOAD_BLOCK_SIZE: usize = 512;

/// Bootstrap attempts before `BootstrapFailed`.
pub const FW_RETRY_LIMIT: u32 = 3;

/// Boot-control register; writing [`BOOT_RUN`] hands execution to the
/// downloaded firmware.
pub const BOOT_CTRL: u32 = 0x0000_0100;
pub const BOOT_RUN: u32 = 1;

/// Status word probed during verify.
pub const STATUS_REG: u32 = 0x0000_0104;

/// On-disk image header: five little-endian u32s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FwHeader {
    /// Magic in the low 16 bits; the rest is generation flags.
    pub flags: u32,
    pub version: u32,
    pub iccm_len: u32,
    pub dccm_len: u32,
    /// Additive checksum over both regions.
    pub checksum: u32,
}

pub const FW_HDR_LEN: usize = core::mem::size_of::<FwHeader>();

const _: () = assert!(FW_HDR_LEN == 20);

/// Parsed and split firmware image.
#[derive(Debug, Clone)]
pub struct FwImage {
    pub version: u32,
    pub iccm: Vec<u8>,
    pub dccm: Vec<u8>,
    /// Present only when the blob carried a header.
    pub checksum: Option<u32>,
}

impl FwImage {
    /// Split a raw blob into ICCM/DCCM regions.
    ///
    /// With a recognized header the declared lengths rule; without one the
    /// default policy applies: first [`ICCM_MAX`] bytes to instruction
    /// memory, remainder to data. Either way the regions must fit the
    /// device memory windows.
    pub fn parse(raw: &[u8]) -> Result<Self, FwError> {
        if raw.len() >= FW_HDR_LEN {
            let hdr: FwHeader = bytemuck::pod_read_unaligned(&raw[..FW_HDR_LEN]);
            let flags = u32::from_le(hdr.flags);
            if flags as u16 == FW_MAGIC {
                let iccm_len = u32::from_le(hdr.iccm_len) as usize;
                let dccm_len = u32::from_le(hdr.dccm_len) as usize;
                if iccm_len > ICCM_MAX || dccm_len > DCCM_MAX {
                    return Err(FwError::Format);
                }
                let body = &raw[FW_HDR_LEN..];
                let total = iccm_len.checked_add(dccm_len).ok_or(FwError::Format)?;
                if total > body.len() {
                    return Err(FwError::Format);
                }
                return Ok(Self {
                    version: u32::from_le(hdr.version),
                    iccm: body[..iccm_len].to_vec(),
                    dccm: body[iccm_len..total].to_vec(),
                    checksum: Some(u32::from_le(hdr.checksum)),
                });
            }
        }
        // Headerless blob: default split.
        let split = raw.len().min(ICCM_MAX);
        let dccm = &raw[split..];
        if dccm.len() > DCCM_MAX {
            return Err(FwError::Format);
        }
        Ok(Self {
            version: 0,
            iccm: raw[..split].to_vec(),
            dccm: dccm.to_vec(),
            checksum: None,
        })
    }

    /// Wrapping additive checksum over both regions.
    pub fn sum(&self) -> u32 {
        let mut acc: u32 = 0;
        for &b in self.iccm.iter().chain(self.dccm.iter()) {
            acc = acc.wrapping_add(u32::from(b));
        }
        acc
    }
}

/// Supplies named firmware blobs from external storage. Read-only.
pub trait FwProvider: Send + Sync {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, FwError>;
}

/// Loader state, observable while a bootstrap is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwState {
    Idle,
    LoadImage,
    DownloadIccm,
    DownloadDccm,
    Verify,
    Ready,
    Error,
}

/// Bootstrap progress counters.
#[derive(Debug, Default)]
pub struct FwTelemetry {
    pub chunks_written: AtomicU32,
    pub retries: AtomicU32,
    pub verify_failures: AtomicU32,
}

pub struct FwLoader {
    bus: Arc<dyn Bus>,
    state: Mutex<FwState>,
    cache: Mutex<Option<FwImage>>,
    verify_checksum: bool,
    pub telemetry: FwTelemetry,
}

impl FwLoader {
    pub fn new(bus: Arc<dyn Bus>, verify_checksum: bool) -> Self {
        Self {
            bus,
            state: Mutex::new(FwState::Idle),
            cache: Mutex::new(None),
            verify_checksum,
            telemetry: FwTelemetry::default(),
        }
    }

    pub fn state(&self) -> FwState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == FwState::Ready
    }

    fn set_state(&self, next: FwState) {
        *self.state.lock() = next;
    }

    fn load_image(&self, provider: &dyn FwProvider, name: &str) -> Result<FwImage, FwError> {
        self.set_state(FwState::LoadImage);
        if let Some(cached) = self.cache.lock().clone() {
            return Ok(cached);
        }
        let image = FwImage::parse(&provider.fetch(name)?)?;
        log::info!(
            "firmware {name} v{}: iccm {} B, dccm {} B",
            image.version,
            image.iccm.len(),
            image.dccm.len()
        );
        *self.cache.lock() = Some(image.clone());
        Ok(image)
    }

    /// Write one region in [`DOWNLOAD_BLOCK_SIZE`] chunks, address cursor
    /// ascending. The first failed chunk aborts the region.
    fn download_region(&self, base: u32, region: &[u8]) -> Result<(), FwError> {
        let mut addr = base;
        for chunk in region.chunks(DOWNLOAD_BLOCK_SIZE) {
            self.bus.write_sync(addr, chunk).map_err(FwError::Bus)?;
            self.telemetry.chunks_written.fetch_add(1, Ordering::Relaxed);
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    fn verify(&self, image: &FwImage) -> Result<(), FwError> {
        self.set_state(FwState::Verify);
        // The device must still answer register reads after download.
        let mut status = [0u8; 4];
        self.bus
            .read_sync(STATUS_REG, &mut status)
            .map_err(FwError::Bus)?;
        if self.verify_checksum {
            if let Some(expected) = image.checksum {
                if image.sum() != expected {
                    self.telemetry.verify_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(FwError::Checksum);
                }
            }
        }
        Ok(())
    }

    fn attempt(&self, provider: &dyn FwProvider, name: &str) -> Result<(), FwError> {
        let image = self.load_image(provider, name)?;
        self.set_state(FwState::DownloadIccm);
        self.download_region(ICCM_BASE, &image.iccm)?;
        self.set_state(FwState::DownloadDccm);
        self.download_region(DCCM_BASE, &image.dccm)?;
        self.verify(&image)?;
        // Hand execution to the runtime firmware.
        self.bus
            .write_sync(BOOT_CTRL, &BOOT_RUN.to_le_bytes())
            .map_err(FwError::Bus)?;
        self.set_state(FwState::Ready);
        Ok(())
    }

    /// Run the full bootstrap, retrying up to [`FW_RETRY_LIMIT`] times.
    /// Only after `Ok` is the command channel usable.
    pub fn bootstrap(&self, provider: &dyn FwProvider, name: &str) -> Result<(), FwError> {
        self.set_state(FwState::Idle);
        let mut last = FwError::BootstrapFailed;
        for round in 0..FW_RETRY_LIMIT {
            match self.attempt(provider, name) {
                Ok(()) => return Ok(()),
                // A missing image will not appear on retry.
                Err(FwError::NotFound) => {
                    self.set_state(FwState::Error);
                    self.bus.reset();
                    self.set_state(FwState::Idle);
                    return Err(FwError::NotFound);
                }
                Err(err) => {
                    log::warn!("bootstrap round {round} failed: {err}");
                    last = err;
                    self.set_state(FwState::Error);
                    self.bus.reset();
                    self.set_state(FwState::Idle);
                    self.telemetry.retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        log::error!("bootstrap gave up after {FW_RETRY_LIMIT} rounds: {last}");
        Err(FwError::BootstrapFailed)
    }

    /// Forget the ready state, keeping the image cache. Recovery calls this
    /// before re-running `bootstrap`.
    pub fn invalidate(&self) {
        self.set_state(FwState::Idle);
    }
}
