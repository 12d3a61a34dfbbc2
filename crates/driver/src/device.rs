//! Device context and lifecycle surface.
//!
//! [`WifiDevice`] owns one attached device's whole stack: the bus handle,
//! slot pool, optional DMA ring, command channel, firmware loader, recovery
//! supervisor and reorder map. The embedder constructs one per physical
//! attachment, parks one thread on [`Supervisor::supervise`] and feeds raw
//! inbound frames into [`WifiDevice::on_bus_rx`]; everything else is wired
//! internally.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use aquila_bus::{
    Bus, BusClaim, CHAN_CMD, CHAN_DATA, DmaRing, FrameCodec, FrameFlags, Gen1Codec, SlotPool,
    TimeSource,
};
use aquila_reorder::ReorderMap;
use spin::Mutex;

use crate::cmd::CmdChannel;
use crate::config::DriverConfig;
use crate::credit::CreditPool;
use crate::dispatch::Dispatcher;
use crate::error::{DriverError, FwError};
use crate::fw::{FwLoader, FwProvider};
use crate::recovery::{Recoverable, Supervisor};

/// Ordered-frame consumer on the receive side.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, peer: u16, tid: u8, seq: u16, frame: Vec<u8>);
}

/// Data-frame `id` field packs the peer and traffic class.
fn unpack_peer_tid(id: u16) -> (u16, u8) {
    (id >> 4, (id & 0xF) as u8)
}

pub struct WifiDevice {
    bus: Arc<dyn Bus>,
    pool: Arc<SlotPool>,
    ring: Option<Arc<DmaRing>>,
    codec: Arc<dyn FrameCodec>,
    cmd: Arc<CmdChannel>,
    fw: Arc<FwLoader>,
    supervisor: Arc<Supervisor>,
    reorder: Mutex<ReorderMap>,
    sink: Arc<dyn FrameSink>,
    clock: Arc<dyn TimeSource>,
    dispatcher: Dispatcher,
    provider: Arc<dyn FwProvider>,
    fw_name: String,
    config: DriverConfig,
    /// Set by the bus IRQ handler, cleared by `service()`.
    rx_signal: AtomicBool,
    /// Used to re-subscribe the IRQ handler after a recovery cycle.
    self_ref: Mutex<Option<Weak<WifiDevice>>>,
}

impl WifiDevice {
    pub fn new(
        bus: Arc<dyn Bus>,
        clock: Arc<dyn TimeSource>,
        sink: Arc<dyn FrameSink>,
        provider: Arc<dyn FwProvider>,
        fw_name: &str,
        config: DriverConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(SlotPool::new(config.tx_slots, config.rx_slots));
        let ring = config
            .use_dma_ring
            .then(|| Arc::new(DmaRing::new(config.ring_chunks, config.ring_chunk_size)));
        let codec: Arc<dyn FrameCodec> = Arc::new(Gen1Codec);
        let credits = Arc::new(CreditPool::new(config.interfaces, config.max_credits));
        let cmd = Arc::new(CmdChannel::new(
            bus.clone(),
            pool.clone(),
            ring.clone(),
            codec.clone(),
            credits,
            clock.clone(),
            config.cmd_timeout_ms,
        ));
        let fw = Arc::new(FwLoader::new(bus.clone(), config.verify_checksum));
        let supervisor = Arc::new(Supervisor::new(config.watchdog_policy));
        cmd.set_notifier(supervisor.clone());
        Arc::new(Self {
            bus,
            pool,
            ring,
            codec,
            cmd,
            fw,
            supervisor,
            reorder: Mutex::new(ReorderMap::new()),
            sink,
            clock,
            dispatcher: Dispatcher::new(config.completion_dispatch),
            provider,
            fw_name: fw_name.to_owned(),
            config,
            rx_signal: AtomicBool::new(false),
            self_ref: Mutex::new(None),
        })
    }

    fn subscribe_irq(self: &Arc<Self>) {
        *self.self_ref.lock() = Some(Arc::downgrade(self));
        self.resubscribe_irq();
    }

    fn resubscribe_irq(&self) {
        let weak = self.self_ref.lock().clone();
        let Some(weak) = weak else { return };
        let handler = Box::new(move || {
            if let Some(dev) = weak.upgrade() {
                dev.rx_signal.store(true, Ordering::Release);
            }
        });
        if let Err(err) = self.bus.subscribe_irq(handler) {
            log::warn!("irq subscribe failed: {err}");
        }
    }

    /// Attach-time bring-up: IRQ, firmware bootstrap, command channel.
    pub fn start(self: &Arc<Self>) -> Result<(), FwError> {
        self.subscribe_irq();
        self.fw.bootstrap(self.provider.as_ref(), &self.fw_name)?;
        self.cmd.reopen();
        log::info!("device up, firmware {}", self.fw_name);
        Ok(())
    }

    /// Detach: teardown in the required order, then stop the supervisor.
    pub fn stop(&self) {
        self.teardown();
        self.supervisor.request_shutdown();
    }

    pub fn issue(&self, opcode: u16, payload: &[u8]) -> Result<Vec<u8>, DriverError> {
        self.cmd.issue(opcode, payload)
    }

    pub fn send_frame(&self, if_id: u8, payload: &[u8]) -> Result<(), DriverError> {
        self.cmd.send_frame(if_id, payload)
    }

    pub fn send_frame_unconfirmed(&self, if_id: u8, payload: &[u8]) -> Result<(), DriverError> {
        self.cmd.send_frame_unconfirmed(if_id, payload)
    }

    pub fn power(&self, suspend: bool) -> Result<(), DriverError> {
        self.bus.power(suspend).map_err(DriverError::Bus)
    }

    /// Exclusive bus access around a multi-operation sequence, e.g. a
    /// channel change. Unlocks on drop.
    pub fn claim(&self) -> BusClaim<'_> {
        BusClaim::new(self.bus.as_ref())
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn firmware(&self) -> &Arc<FwLoader> {
        &self.fw
    }

    pub fn ring(&self) -> Option<&Arc<DmaRing>> {
        self.ring.as_ref()
    }

    /// A block-ack agreement was struck for `(peer, tid)`.
    pub fn open_ba_session(&self, peer: u16, tid: u8, start_seq: u16, wind_size: u16) {
        self.reorder.lock().open(
            peer,
            tid,
            start_seq,
            wind_size,
            self.config.reorder_hold_ms,
        );
    }

    /// Peer disassociated; drop its reorder state.
    pub fn close_peer(&self, peer: u16) {
        self.reorder.lock().remove_peer(peer);
    }

    /// Demultiplex one raw inbound frame from the bus.
    ///
    /// Command completions go to the command channel, data frames through
    /// the reorder map to the [`FrameSink`]. In deferred dispatch mode the
    /// work queues until [`WifiDevice::service`].
    pub fn on_bus_rx(self: &Arc<Self>, raw: &[u8]) {
        let (hdr, payload) = match self.codec.decode(raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!("dropping malformed inbound frame: {err}");
                return;
            }
        };
        let payload = payload.to_vec();
        match hdr.channel {
            CHAN_CMD => {
                let cmd = self.cmd.clone();
                let seq = hdr.seq;
                // The device flags a completion whose request it rejected.
                let result = if hdr.frame_flags().contains(FrameFlags::FAILED) {
                    Err(DriverError::Device)
                } else {
                    Ok(payload)
                };
                self.dispatcher
                    .dispatch(Box::new(move || cmd.complete(seq, result)));
            }
            CHAN_DATA => {
                let dev = self.clone();
                let (id, seq) = (hdr.id, hdr.seq);
                self.dispatcher.dispatch(Box::new(move || {
                    dev.deliver_data(id, seq, payload);
                }));
            }
            other => log::warn!("frame on unknown channel {other}"),
        }
    }

    fn deliver_data(&self, id: u16, seq: u16, frame: Vec<u8>) {
        let (peer, tid) = unpack_peer_tid(id);
        let now = self.clock.now_ms();
        // Collect under the lock, deliver after; the sink may call back
        // into the session surface.
        let mut ready: Vec<(u16, Vec<u8>)> = Vec::new();
        let outcome = self.reorder.lock().insert(
            peer,
            tid,
            seq,
            frame,
            now,
            &mut |seq, frame| ready.push((seq, frame)),
        );
        log::trace!("data frame peer={peer} tid={tid} seq={seq}: {outcome:?}");
        for (seq, frame) in ready {
            self.sink.deliver(peer, tid, seq, frame);
        }
    }

    /// Housekeeping tick: drain deferred completions and force-deliver
    /// expired reorder entries. The embedder calls this from its service
    /// context, typically after an IRQ or on a timer.
    pub fn service(&self) {
        if self.rx_signal.swap(false, Ordering::AcqRel) {
            log::trace!("rx signal");
        }
        self.dispatcher.service();
        let now = self.clock.now_ms();
        let mut ready: Vec<(u16, u8, u16, Vec<u8>)> = Vec::new();
        self.reorder
            .lock()
            .flush_expired(now, &mut |peer, tid, seq, frame| {
                ready.push((peer, tid, seq, frame));
            });
        for (peer, tid, seq, frame) in ready {
            self.sink.deliver(peer, tid, seq, frame);
        }
    }
}

impl Recoverable for WifiDevice {
    /// Ordering matters: wake issuers first, then fail outstanding slots
    /// (cleanup exactly once), then drop the IRQ handler so no completion
    /// touches freed state.
    fn teardown(&self) {
        self.cmd.abort();
        self.pool.fail_all_outstanding();
        self.bus.unsubscribe_irq();
    }

    fn reinit(&self) {
        self.bus.reset();
        self.fw.invalidate();
        self.resubscribe_irq();
    }

    fn bootstrap(&self) -> Result<(), FwError> {
        self.fw.bootstrap(self.provider.as_ref(), &self.fw_name)?;
        self.cmd.reopen();
        Ok(())
    }

    fn bootstrap_done(&self) -> bool {
        self.fw.is_ready() && self.cmd.is_open()
    }
}
