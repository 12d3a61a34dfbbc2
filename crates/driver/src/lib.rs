//! # aquila-driver
//!
//! Host-side core for aquila wireless NICs: command issuance, flow-control
//! credits, firmware bootstrap, crash recovery and the per-device context
//! that ties them to a transport from `aquila-bus`.
//!
//! The layering, bottom up:
//! - [`CreditPool`] — device-advertised transmit capacity per sub-interface
//! - [`CmdChannel`] — single-in-flight command serialization with sequence
//!   validation, plus the credit-throttled data transmit path
//! - [`FwLoader`] — chunked ICCM/DCCM download state machine with a bounded
//!   retry budget
//! - [`Supervisor`] — the watchdog loop that tears down and re-bootstraps a
//!   wedged stack
//! - [`WifiDevice`] — one attached device: owns all of the above plus the
//!   receive demux into the reorder map
//!
//! Everything is `no_std` + `alloc`; the embedder supplies the bus, a
//! monotonic clock, a firmware provider and a frame sink.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod cmd;
mod config;
mod credit;
mod device;
mod dispatch;
mod error;
mod fw;
mod recovery;

pub use cmd::{ADDR_CMD, ADDR_DATA, CmdChannel, FailureNotifier};
pub use config::{CompletionDispatch, DriverConfig, WatchdogPolicy};
pub use credit::CreditPool;
pub use device::{FrameSink, WifiDevice};
pub use dispatch::Dispatcher;
pub use error::{DriverError, FwError};
pub use fw::{
    BOOT_CTRL, BOOT_RUN, DCCM_BASE, DCCM_MAX, DOWNLOAD_BLOCK_SIZE, FW_HDR_LEN, FW_MAGIC,
    FW_RETRY_LIMIT, FwHeader, FwImage, FwLoader, FwProvider, FwState, FwTelemetry, ICCM_BASE,
    ICCM_MAX, STATUS_REG,
};
pub use recovery::{PROBE_INTERVAL_MS, PROBE_POLLS, Recoverable, Supervisor};
