//! Construction-time driver configuration.
//!
//! Every behavioral switch is chosen once, when the device context is
//! built; nothing here changes at runtime.

/// Watchdog re-arm policy after a failed bootstrap cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPolicy {
    /// Give up after this many consecutive failed cycles.
    Bounded(u32),
    /// Re-arm forever; availability over fast-fail.
    Unconditional,
}

/// Where transport completions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDispatch {
    /// In the completion context itself.
    Inline,
    /// Queued, drained by `service()` on a context the embedder picks.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Stage aggregated transmits through the DMA chunk ring.
    pub use_dma_ring: bool,
    pub watchdog_policy: WatchdogPolicy,
    pub completion_dispatch: CompletionDispatch,
    /// Bound on `issue` blocking time.
    pub cmd_timeout_ms: u64,
    /// Full additive checksum during firmware verify, instead of the bare
    /// responsiveness probe.
    pub verify_checksum: bool,
    /// Flow-control ceiling per sub-interface.
    pub max_credits: u32,
    /// Number of logical sub-interfaces with independent credit.
    pub interfaces: usize,
    pub tx_slots: usize,
    pub rx_slots: usize,
    /// DMA ring geometry, used when `use_dma_ring`.
    pub ring_chunks: usize,
    pub ring_chunk_size: usize,
    /// Reorder-window hold time before force delivery.
    pub reorder_hold_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            use_dma_ring: false,
            watchdog_policy: WatchdogPolicy::Bounded(3),
            completion_dispatch: CompletionDispatch::Inline,
            cmd_timeout_ms: 1000,
            verify_checksum: false,
            max_credits: 29,
            interfaces: 2,
            tx_slots: 32,
            rx_slots: 16,
            ring_chunks: 16,
            ring_chunk_size: 1664,
            reorder_hold_ms: aquila_reorder::DEFAULT_HOLD_MS,
        }
    }
}
