use aquila_error::define_driver_error;

define_driver_error! {
    /// Failures reported by a transport backend.
    pub enum BusError(0x01) {
        /// Transaction failed after the internal retry budget.
        Io = 0x01 => "Bus transaction failed" [Transient],
        /// No slot or bandwidth available right now. Expected backpressure,
        /// not a fault; the caller defers and retries.
        Busy = 0x02 => "Bus has no transfer bandwidth available" [Backpressure],
        /// A frame or header did not parse.
        Format = 0x03 => "Malformed frame header" [Transient],
        /// `subscribe_irq` while a handler is already active.
        HandlerInstalled = 0x04 => "An interrupt handler is already subscribed" [Fatal],
        /// The bus refused the requested power transition.
        Power = 0x05 => "Power state transition refused" [Transient],
    }
}
