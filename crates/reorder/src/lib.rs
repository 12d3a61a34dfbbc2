//! # aquila-reorder
//!
//! Per-traffic-class reassembly of out-of-order wireless frames.
//!
//! Each block-ack session owns a [`ReorderWindow`]: a wrapping 12-bit
//! sequence window of up to [`WIND_MAX`] slots. In-order frames pass
//! straight through; frames ahead of the start buffer until the gap fills
//! or times out. [`ReorderMap`] keeps one window per `(peer, tid)` pair,
//! created on block-ack negotiation and dropped when the peer leaves.
//!
//! A window never delivers a sequence number twice, and delivery order is
//! strictly increasing modulo the sequence space.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

/// Sequence numbers are 12 bits wide.
pub const SEQ_MASK: u16 = 0x0FFF;

/// Largest supported window. Also the slot-ring capacity, so any run of
/// in-window sequence numbers maps to distinct slots.
pub const WIND_MAX: u16 = 64;

/// Default hold time before a buffered frame is force-delivered.
pub const DEFAULT_HOLD_MS: u64 = 100;

/// Ordered-delivery callback: `(sequence, frame)`.
pub type DeliverSink<'a> = &'a mut dyn FnMut(u16, Vec<u8>);

/// Classification of an inserted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Matched the window start; delivered along with any now-contiguous
    /// buffered run.
    DeliveredInOrder,
    /// Ahead of the start but inside the window; held for reassembly.
    Buffered,
    /// Behind the window or already buffered; dropped.
    Duplicate,
    /// Too far ahead of the window; dropped.
    OutOfWindow,
}

fn seq_sub(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b) & SEQ_MASK
}

/// One block-ack session's reassembly state.
pub struct ReorderWindow {
    start_seq: u16,
    wind_size: u16,
    hold_ms: u64,
    slots: Vec<Option<Vec<u8>>>,
    /// Arrival timestamp per slot; 0 means untimed. Gap slots inherit the
    /// arrival time of the frame buffered past them so expiry can advance
    /// over a hole that is never filled.
    rx_time: Vec<u64>,
    buffered: u16,
    active: bool,
}

impl ReorderWindow {
    pub fn new(start_seq: u16, wind_size: u16, hold_ms: u64) -> Self {
        let wind_size = wind_size.clamp(1, WIND_MAX);
        Self {
            start_seq: start_seq & SEQ_MASK,
            wind_size,
            hold_ms,
            slots: vec![None; WIND_MAX as usize],
            rx_time: vec![0; WIND_MAX as usize],
            buffered: 0,
            active: true,
        }
    }

    pub fn start_seq(&self) -> u16 {
        self.start_seq
    }

    pub fn buffered(&self) -> u16 {
        self.buffered
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn slot_of(seq: u16) -> usize {
        (seq & (WIND_MAX - 1)) as usize
    }

    /// Deliver the slot at the current start (if occupied) and advance.
    fn pop_start(&mut self, sink: DeliverSink<'_>) {
        let idx = Self::slot_of(self.start_seq);
        if let Some(frame) = self.slots[idx].take() {
            self.buffered -= 1;
            sink(self.start_seq, frame);
        }
        self.rx_time[idx] = 0;
        self.start_seq = (self.start_seq + 1) & SEQ_MASK;
    }

    /// Deliver the contiguous buffered run at the window start.
    fn drain_in_order(&mut self, sink: DeliverSink<'_>) {
        while self.buffered > 0 && self.slots[Self::slot_of(self.start_seq)].is_some() {
            self.pop_start(sink);
        }
    }

    /// Classify and file one frame.
    pub fn insert(
        &mut self,
        seq: u16,
        frame: Vec<u8>,
        now_ms: u64,
        sink: DeliverSink<'_>,
    ) -> InsertOutcome {
        if !self.active {
            return InsertOutcome::OutOfWindow;
        }
        let seq = seq & SEQ_MASK;
        let offset = seq_sub(seq, self.start_seq);

        if offset == 0 {
            sink(seq, frame);
            self.rx_time[Self::slot_of(self.start_seq)] = 0;
            self.start_seq = (self.start_seq + 1) & SEQ_MASK;
            self.drain_in_order(sink);
            return InsertOutcome::DeliveredInOrder;
        }

        if offset < self.wind_size {
            let idx = Self::slot_of(seq);
            if self.slots[idx].is_some() {
                return InsertOutcome::Duplicate;
            }
            self.slots[idx] = Some(frame);
            self.buffered += 1;
            // Stamp this slot and backfill untimed gap slots toward the
            // start, so a hole ages from the first frame buffered past it.
            let mut walk = seq;
            loop {
                let widx = Self::slot_of(walk);
                if self.rx_time[widx] != 0 {
                    break;
                }
                self.rx_time[widx] = now_ms;
                if walk == self.start_seq {
                    break;
                }
                walk = walk.wrapping_sub(1) & SEQ_MASK;
            }
            return InsertOutcome::Buffered;
        }

        // Behind the window start means the frame was already accounted
        // for; far ahead means the session is desynchronized from the
        // transmitter's view.
        if seq_sub(self.start_seq, seq) <= SEQ_MASK / 2 {
            InsertOutcome::Duplicate
        } else {
            log::debug!(
                "reorder: seq {seq:#x} outside window [{:#x}, +{})",
                self.start_seq,
                self.wind_size
            );
            InsertOutcome::OutOfWindow
        }
    }

    /// Force-deliver frames held longer than the hold time, advancing the
    /// start past them (and past aged-out holes) in sequence order.
    pub fn flush_expired(&mut self, now_ms: u64, sink: DeliverSink<'_>) {
        let mut steps = 0;
        while steps < self.wind_size {
            let idx = Self::slot_of(self.start_seq);
            let stamp = self.rx_time[idx];
            if stamp == 0 || now_ms.saturating_sub(stamp) < self.hold_ms {
                break;
            }
            self.pop_start(sink);
            steps += 1;
        }
        self.drain_in_order(sink);
    }

    /// Earliest arrival timestamp still held, for timer re-arming.
    pub fn oldest_stamp(&self) -> Option<u64> {
        if self.buffered == 0 {
            return None;
        }
        self.rx_time.iter().copied().filter(|&t| t != 0).min()
    }

    /// Block-ack renegotiation: drop everything and restart the window.
    pub fn reset(&mut self, new_start: u16) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.rx_time.fill(0);
        self.buffered = 0;
        self.start_seq = new_start & SEQ_MASK;
        self.active = true;
    }

    /// Session teardown: deliver nothing further.
    pub fn deactivate(&mut self) {
        self.active = false;
        for slot in &mut self.slots {
            *slot = None;
        }
        self.rx_time.fill(0);
        self.buffered = 0;
    }
}

/// Windows for all live block-ack sessions, keyed by `(peer, tid)`.
#[derive(Default)]
pub struct ReorderMap {
    sessions: HashMap<(u16, u8), ReorderWindow>,
}

impl ReorderMap {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Create (or re-create) the session window. Called when a block-ack
    /// agreement is struck.
    pub fn open(&mut self, peer: u16, tid: u8, start_seq: u16, wind_size: u16, hold_ms: u64) {
        self.sessions
            .insert((peer, tid), ReorderWindow::new(start_seq, wind_size, hold_ms));
    }

    pub fn get_mut(&mut self, peer: u16, tid: u8) -> Option<&mut ReorderWindow> {
        self.sessions.get_mut(&(peer, tid))
    }

    /// Route a frame into its session. Frames with no session pass through
    /// in arrival order (no agreement, nothing to reorder).
    pub fn insert(
        &mut self,
        peer: u16,
        tid: u8,
        seq: u16,
        frame: Vec<u8>,
        now_ms: u64,
        sink: DeliverSink<'_>,
    ) -> InsertOutcome {
        match self.sessions.get_mut(&(peer, tid)) {
            Some(window) => window.insert(seq, frame, now_ms, sink),
            None => {
                sink(seq & SEQ_MASK, frame);
                InsertOutcome::DeliveredInOrder
            }
        }
    }

    /// Expiry sweep across every session.
    pub fn flush_expired(
        &mut self,
        now_ms: u64,
        sink: &mut dyn FnMut(u16, u8, u16, Vec<u8>),
    ) {
        for (&(peer, tid), window) in &mut self.sessions {
            window.flush_expired(now_ms, &mut |seq, frame| sink(peer, tid, seq, frame));
        }
    }

    /// Peer disassociated: drop all of its sessions.
    pub fn remove_peer(&mut self, peer: u16) {
        self.sessions.retain(|&(p, _), _| p != peer);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    fn discard() -> impl FnMut(u16, Vec<u8>) {
        |_seq, _frame| {}
    }

    /// Delivery recorder the sink borrows through a cell, so assertions
    /// can interleave with further inserts.
    fn recorder() -> RefCell<Vec<u16>> {
        RefCell::new(Vec::new())
    }

    #[test]
    fn in_order_frames_pass_straight_through() {
        let mut w = ReorderWindow::new(0, 8, DEFAULT_HOLD_MS);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        for seq in 0..4 {
            assert_eq!(
                w.insert(seq, vec![seq as u8], 1, &mut sink),
                InsertOutcome::DeliveredInOrder
            );
        }
        assert_eq!(*got.borrow(), vec![0, 1, 2, 3]);
        assert_eq!(w.start_seq(), 4);
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn gap_fill_releases_the_contiguous_run() {
        // Window start 4: 5 and 6 arrive early, then 4 fills the gap.
        let mut w = ReorderWindow::new(4, 8, DEFAULT_HOLD_MS);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        assert_eq!(w.insert(5, vec![5], 1, &mut sink), InsertOutcome::Buffered);
        assert_eq!(w.insert(6, vec![6], 1, &mut sink), InsertOutcome::Buffered);
        assert!(got.borrow().is_empty());
        assert_eq!(
            w.insert(4, vec![4], 2, &mut sink),
            InsertOutcome::DeliveredInOrder
        );
        assert_eq!(*got.borrow(), vec![4, 5, 6]);
        assert_eq!(w.start_seq(), 7);
        // A re-arrival of 5 is behind the window now.
        assert_eq!(w.insert(5, vec![5], 3, &mut sink), InsertOutcome::Duplicate);
        assert_eq!(*got.borrow(), vec![4, 5, 6]);
    }

    #[test]
    fn buffered_duplicate_is_dropped() {
        let mut w = ReorderWindow::new(0, 8, DEFAULT_HOLD_MS);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        assert_eq!(w.insert(3, vec![1], 1, &mut sink), InsertOutcome::Buffered);
        assert_eq!(w.insert(3, vec![2], 2, &mut sink), InsertOutcome::Duplicate);
        assert_eq!(w.buffered(), 1);
    }

    #[test]
    fn far_ahead_is_out_of_window() {
        let mut w = ReorderWindow::new(0, 8, DEFAULT_HOLD_MS);
        let mut sink = discard();
        assert_eq!(
            w.insert(100, vec![], 1, &mut sink),
            InsertOutcome::OutOfWindow
        );
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn sequence_space_wraps_cleanly() {
        let mut w = ReorderWindow::new(0xFFE, 8, DEFAULT_HOLD_MS);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        assert_eq!(w.insert(0xFFF, vec![], 1, &mut sink), InsertOutcome::Buffered);
        assert_eq!(w.insert(0x001, vec![], 1, &mut sink), InsertOutcome::Buffered);
        assert_eq!(
            w.insert(0xFFE, vec![], 1, &mut sink),
            InsertOutcome::DeliveredInOrder
        );
        // FFE and FFF delivered; 000 still missing, 001 held.
        assert_eq!(*got.borrow(), vec![0xFFE, 0xFFF]);
        assert_eq!(w.start_seq(), 0x000);
        assert_eq!(
            w.insert(0x000, vec![], 2, &mut sink),
            InsertOutcome::DeliveredInOrder
        );
        assert_eq!(*got.borrow(), vec![0xFFE, 0xFFF, 0x000, 0x001]);
    }

    #[test]
    fn no_sequence_is_ever_delivered_twice_and_order_is_monotonic() {
        let mut w = ReorderWindow::new(0, 16, DEFAULT_HOLD_MS);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        // Scrambled arrivals with duplicates.
        for &seq in &[2u16, 0, 0, 1, 5, 3, 2, 4, 6] {
            w.insert(seq, vec![], 1, &mut sink);
        }
        assert_eq!(*got.borrow(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn expiry_advances_past_a_hole_that_never_fills() {
        let mut w = ReorderWindow::new(0, 8, 50);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        // 0 is lost; 1..=3 buffer at t=10.
        for seq in 1..=3 {
            assert_eq!(w.insert(seq, vec![], 10, &mut sink), InsertOutcome::Buffered);
        }
        // Before the hold time nothing moves.
        w.flush_expired(40, &mut sink);
        assert!(got.borrow().is_empty());
        // After it, the hole ages out and the run delivers.
        w.flush_expired(61, &mut sink);
        assert_eq!(*got.borrow(), vec![1, 2, 3]);
        assert_eq!(w.start_seq(), 4);
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn expiry_only_releases_aged_frames() {
        let mut w = ReorderWindow::new(0, 8, 50);
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        w.insert(1, vec![], 10, &mut sink);
        w.insert(3, vec![], 100, &mut sink);
        // Only the first hole + frame 1 have aged at t=70.
        w.flush_expired(70, &mut sink);
        assert_eq!(*got.borrow(), vec![1]);
        assert_eq!(w.start_seq(), 2);
        assert_eq!(w.buffered(), 1);
    }

    #[test]
    fn reset_discards_buffered_frames() {
        let mut w = ReorderWindow::new(0, 8, DEFAULT_HOLD_MS);
        let mut sink = discard();
        w.insert(2, vec![], 1, &mut sink);
        w.insert(3, vec![], 1, &mut sink);
        w.reset(100);
        assert_eq!(w.buffered(), 0);
        assert_eq!(w.start_seq(), 100);
        let got = recorder();
        let mut sink2 = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        assert_eq!(
            w.insert(100, vec![], 2, &mut sink2),
            InsertOutcome::DeliveredInOrder
        );
        assert_eq!(*got.borrow(), vec![100]);
    }

    #[test]
    fn map_routes_by_peer_and_tid_and_passes_through_without_a_session() {
        let mut map = ReorderMap::new();
        let got = recorder();
        let mut sink = |seq: u16, _f: Vec<u8>| got.borrow_mut().push(seq);
        // No session: arrival order.
        assert_eq!(
            map.insert(1, 0, 9, vec![], 1, &mut sink),
            InsertOutcome::DeliveredInOrder
        );
        map.open(1, 0, 0, 8, DEFAULT_HOLD_MS);
        assert_eq!(
            map.insert(1, 0, 1, vec![], 1, &mut sink),
            InsertOutcome::Buffered
        );
        assert_eq!(map.len(), 1);
        map.remove_peer(1);
        assert!(map.is_empty());
    }

    #[test]
    fn map_flush_reports_session_identity() {
        let mut map = ReorderMap::new();
        map.open(2, 3, 0, 8, 50);
        let mut sink = discard();
        map.insert(2, 3, 1, vec![], 10, &mut sink);
        let mut got = Vec::new();
        map.flush_expired(100, &mut |peer, tid, seq, _f| got.push((peer, tid, seq)));
        assert_eq!(got, vec![(2, 3, 1)]);
    }
}
