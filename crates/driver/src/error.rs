//! Error taxonomy for the command and bootstrap layers.

use aquila_bus::{BusError, RingError};
use aquila_error::define_driver_error;

define_driver_error! {
    /// Command-channel and data-path failures.
    pub enum DriverError(0x04) {
        /// The command did not complete within `cmd_timeout_ms`. The slot
        /// and any credit are returned before this propagates.
        Timeout = 0x01 => "Command timed out" [Transient],
        /// The stack is being torn down; blocked issuers wake with this.
        Aborted = 0x02 => "Command aborted by teardown" [Transient],
        /// A completion's sequence number did not match the in-flight
        /// request. Escalated to recovery, never silently accepted.
        Desync = 0x03 => "Completion sequence desynchronized" [Fatal],
        /// No flow-control credit for the sub-interface. Backpressure.
        NoCredit = 0x04 => "No flow-control credit available" [Backpressure],
        /// No free transfer slot or ring chunk. Backpressure.
        Busy = 0x05 => "Transmit path is saturated" [Backpressure],
        /// The device reported failure for the command.
        Device = 0x06 => "Device rejected the command" [Transient],
        /// Commands before firmware handoff are refused.
        NotReady = 0x07 => "Command channel is not open" [Transient],
        /// The bus transfer itself failed.
        Bus(BusError) = 0x08 => "Bus transfer failed" [Transient],
        /// DMA ring bookkeeping went inconsistent. Fatal to the transmit
        /// path; escalated to recovery.
        Ring(RingError) = 0x09 => "DMA ring failure" [Fatal],
    }
}

define_driver_error! {
    /// Firmware bootstrap failures.
    pub enum FwError(0x05) {
        /// Image malformed: bad header, region overrun, or exceeds the
        /// device memory limits.
        Format = 0x01 => "Firmware image is malformed" [Fatal],
        /// The provider has no image under the requested name.
        NotFound = 0x02 => "Firmware image not found" [Fatal],
        /// Additive checksum mismatch during verify.
        Checksum = 0x03 => "Firmware checksum mismatch" [Transient],
        /// The retry budget is exhausted; the device never came up.
        BootstrapFailed = 0x04 => "Firmware bootstrap failed after retries" [Fatal],
        /// A chunk transfer or verify probe failed on the bus.
        Bus(BusError) = 0x05 => "Bus transfer failed during bootstrap" [Transient],
    }
}
