//! Error-handling infrastructure for the aquila wireless stack.
//!
//! Every subsystem (bus, pool, ring, command, firmware, recovery) defines its
//! error type through [`define_driver_error!`], which assigns a stable
//! subsystem byte plus a per-variant code and a [`Severity`] class. The
//! combined `u16` code shows up in logs as `E<subsystem><code>` so a failure
//! can be traced to its layer without symbols; the severity tells the
//! recovery path how to react without matching on foreign variants.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_driver_error! {
//!     pub enum RingError(0x03) {
//!         Exhausted = 0x01 => "No free chunk in the DMA arena" [Backpressure],
//!         Corrupt = 0x02 => "Ring cursor bookkeeping mismatch" [Fatal],
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_driver_error! {
//!     pub enum FwError(0x05) {
//!         Bus(BusError) = 0x01 => "Bus transfer failed during download" [Transient],
//!     }
//! }
//! ```

#![no_std]

/// Escalation class of an error, declared per variant.
///
/// The recovery supervisor keys restart decisions on this instead of
/// matching every subsystem's variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation failed but the stack is healthy; retry or drop.
    Transient,
    /// Flow control. Resolves on its own when capacity frees up.
    Backpressure,
    /// The stack state is unrecoverable without a restart cycle.
    Fatal,
}

/// Define a driver error type with a subsystem code, per-variant codes and
/// per-variant [`Severity`] classes.
///
/// Supports both simple variants and nested variants wrapping the error of a
/// lower layer, so `?`-propagation keeps the originating code visible.
#[macro_export]
macro_rules! define_driver_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal [$class:ident]
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Combined subsystem + variant code, for logging.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_driver_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Human-readable description of the variant.
            pub const fn describe(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_driver_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }

            /// Escalation class of the variant.
            pub const fn severity(&self) -> $crate::Severity {
                match self {
                    $(
                        $crate::define_driver_error!(@pattern $variant $(($inner))? _unused) => {
                            $crate::Severity::$class
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_driver_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_driver_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::Severity;
    use std::format;

    define_driver_error! {
        /// Bus-layer test error.
        pub enum ProbeError(0x0A) {
            /// Device absent.
            NoDevice = 0x01 => "No device on the bus" [Fatal],
            /// Handshake timed out.
            Timeout = 0x02 => "Probe handshake timed out" [Transient],
            /// Probe queue full.
            QueueFull = 0x03 => "Probe queue is full" [Backpressure],
        }
    }

    define_driver_error! {
        pub enum AttachError(0x0B) {
            Probe(ProbeError) = 0x01 => "Probe stage failed" [Fatal],
        }
    }

    #[test]
    fn codes_combine_subsystem_and_variant() {
        assert_eq!(ProbeError::NoDevice.code(), 0x0A01);
        assert_eq!(ProbeError::Timeout.code(), 0x0A02);
        assert_eq!(AttachError::Probe(ProbeError::Timeout).code(), 0x0B01);
        assert_eq!(ProbeError::SUBSYSTEM, 0x0A);
    }

    #[test]
    fn display_keeps_the_inner_error_visible() {
        assert_eq!(
            format!("{}", ProbeError::NoDevice),
            "E0A01: No device on the bus"
        );
        assert_eq!(
            format!("{}", AttachError::Probe(ProbeError::Timeout)),
            "E0B01: Probe stage failed (E0A02: Probe handshake timed out)"
        );
    }

    #[test]
    fn describe_matches_variant() {
        assert_eq!(ProbeError::Timeout.describe(), "Probe handshake timed out");
    }

    #[test]
    fn severity_is_per_variant() {
        assert_eq!(ProbeError::NoDevice.severity(), Severity::Fatal);
        assert_eq!(ProbeError::Timeout.severity(), Severity::Transient);
        assert_eq!(ProbeError::QueueFull.severity(), Severity::Backpressure);
        assert_eq!(
            AttachError::Probe(ProbeError::Timeout).severity(),
            Severity::Fatal
        );
    }
}
