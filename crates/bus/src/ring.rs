//! Circular DMA chunk arena for aggregated transmits.
//!
//! A contiguous byte arena is divided into fixed-size chunks. An allocation
//! cursor and a free cursor chase each other around the arena; `pick` peeks
//! the next chunk, `take` commits it, `give_back` retires chunks in the
//! order they were taken. Cursor bookkeeping going inconsistent is a fatal
//! consistency violation surfaced as [`RingError::Corrupt`] — the transfer
//! path aborts rather than corrupting state.

use alloc::vec;
use alloc::vec::Vec;

use aquila_error::define_driver_error;
use spin::Mutex;

define_driver_error! {
    /// DMA-ring failures.
    pub enum RingError(0x03) {
        /// No free chunk. Backpressure, retried on the next completion.
        Full = 0x01 => "DMA ring has no free chunk" [Backpressure],
        /// Free count or free-cursor bookkeeping mismatch. Fatal to the
        /// transfer path.
        Corrupt = 0x02 => "DMA ring bookkeeping mismatch" [Fatal],
    }
}

struct RingInner {
    arena: Vec<u8>,
    /// Next chunk handed out, as a chunk index.
    alloc_at: usize,
    /// Next chunk expected back.
    free_at: usize,
    /// Distinguishes full from empty when the cursors meet.
    full: bool,
    free_count: usize,
}

/// Fixed arena of `total` chunks of `chunk_size` bytes.
pub struct DmaRing {
    inner: Mutex<RingInner>,
    chunk_size: usize,
    total: usize,
}

impl DmaRing {
    pub fn new(total: usize, chunk_size: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                arena: vec![0; total * chunk_size],
                alloc_at: 0,
                free_at: 0,
                full: false,
                free_count: total,
            }),
            chunk_size,
            total,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn free_chunks(&self) -> usize {
        self.inner.lock().free_count
    }

    /// Peek the next chunk without committing it.
    pub fn pick(&self) -> Result<usize, RingError> {
        let inner = self.inner.lock();
        if inner.alloc_at == inner.free_at && inner.full {
            return Err(RingError::Full);
        }
        Ok(inner.alloc_at)
    }

    /// Commit the next chunk, advancing the allocation cursor.
    pub fn take(&self) -> Result<usize, RingError> {
        let mut inner = self.inner.lock();
        if inner.alloc_at == inner.free_at && inner.full {
            return Err(RingError::Full);
        }
        if inner.free_count == 0 {
            // The full flag should have caught this; the cursors are lying.
            log::error!(
                "dma ring free count underflow (alloc_at={} free_at={})",
                inner.alloc_at,
                inner.free_at
            );
            return Err(RingError::Corrupt);
        }
        inner.free_count -= 1;
        let chunk = inner.alloc_at;
        inner.alloc_at += 1;
        if inner.alloc_at == self.total {
            inner.alloc_at = 0;
        }
        if inner.alloc_at == inner.free_at {
            inner.full = true;
        }
        Ok(chunk)
    }

    /// Retire `n` chunks starting at `first`, which must be the oldest
    /// outstanding chunk.
    pub fn give_back(&self, first: usize, n: usize) -> Result<(), RingError> {
        let mut inner = self.inner.lock();
        if first != inner.free_at {
            log::error!(
                "dma ring give_back mismatch (first={first} free_at={})",
                inner.free_at
            );
            return Err(RingError::Corrupt);
        }
        for _ in 0..n {
            if inner.free_count == inner.arena.len() / self.chunk_size {
                log::error!("dma ring give_back past capacity");
                return Err(RingError::Corrupt);
            }
            if inner.alloc_at == inner.free_at && !inner.full {
                log::error!("dma ring give_back while empty");
                return Err(RingError::Corrupt);
            }
            inner.full = false;
            inner.free_count += 1;
            inner.free_at += 1;
            if inner.free_at == self.total {
                inner.free_at = 0;
            }
        }
        Ok(())
    }

    /// Copy `data` into the chunk. `data` longer than a chunk is truncated.
    pub fn copy_in(&self, chunk: usize, data: &[u8]) -> Result<(), RingError> {
        if chunk >= self.total {
            log::error!("dma ring chunk index {chunk} out of range");
            return Err(RingError::Corrupt);
        }
        let mut inner = self.inner.lock();
        let offset = chunk * self.chunk_size;
        let len = data.len().min(self.chunk_size);
        inner.arena[offset..offset + len].copy_from_slice(&data[..len]);
        Ok(())
    }

    /// Copy the chunk's bytes out.
    pub fn copy_out(&self, chunk: usize) -> Result<Vec<u8>, RingError> {
        if chunk >= self.total {
            log::error!("dma ring chunk index {chunk} out of range");
            return Err(RingError::Corrupt);
        }
        let inner = self.inner.lock();
        let offset = chunk * self.chunk_size;
        Ok(inner.arena[offset..offset + self.chunk_size].to_vec())
    }

    /// Forget every outstanding chunk and rewind both cursors. Only valid
    /// once teardown has settled all in-flight transfers; chunks a failed
    /// retirement stranded come back with everything else.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.alloc_at = 0;
        inner.free_at = 0;
        inner.full = false;
        inner.free_count = self.total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_walks_the_arena_and_wraps() {
        let ring = DmaRing::new(4, 8);
        assert_eq!(ring.take().unwrap(), 0);
        assert_eq!(ring.take().unwrap(), 1);
        ring.give_back(0, 2).unwrap();
        assert_eq!(ring.take().unwrap(), 2);
        assert_eq!(ring.take().unwrap(), 3);
        // Wraps to the arena start.
        assert_eq!(ring.take().unwrap(), 0);
    }

    #[test]
    fn pick_does_not_commit() {
        let ring = DmaRing::new(2, 8);
        assert_eq!(ring.pick().unwrap(), 0);
        assert_eq!(ring.pick().unwrap(), 0);
        assert_eq!(ring.free_chunks(), 2);
        assert_eq!(ring.take().unwrap(), 0);
        assert_eq!(ring.pick().unwrap(), 1);
        assert_eq!(ring.free_chunks(), 1);
    }

    #[test]
    fn full_ring_reports_backpressure_not_corruption() {
        let ring = DmaRing::new(2, 8);
        ring.take().unwrap();
        ring.take().unwrap();
        assert_eq!(ring.pick().unwrap_err(), RingError::Full);
        assert_eq!(ring.take().unwrap_err(), RingError::Full);
        ring.give_back(0, 1).unwrap();
        assert_eq!(ring.take().unwrap(), 0);
    }

    #[test]
    fn give_back_pointer_mismatch_is_fatal() {
        let ring = DmaRing::new(4, 8);
        ring.take().unwrap();
        ring.take().unwrap();
        // Oldest outstanding chunk is 0, not 1.
        assert_eq!(ring.give_back(1, 1).unwrap_err(), RingError::Corrupt);
    }

    #[test]
    fn give_back_while_empty_is_fatal() {
        let ring = DmaRing::new(2, 8);
        assert_eq!(ring.give_back(0, 1).unwrap_err(), RingError::Corrupt);
    }

    #[test]
    fn free_count_stays_within_bounds() {
        let ring = DmaRing::new(3, 8);
        for round in 0..10 {
            let n = (round % 3) + 1;
            let mut taken = alloc::vec::Vec::new();
            for _ in 0..n {
                taken.push(ring.take().unwrap());
            }
            assert!(ring.free_chunks() <= 3);
            ring.give_back(taken[0], n).unwrap();
            assert!(ring.free_chunks() <= 3);
        }
        assert_eq!(ring.free_chunks(), 3);
    }

    #[test]
    fn chunk_data_round_trips() {
        let ring = DmaRing::new(2, 4);
        let c = ring.take().unwrap();
        ring.copy_in(c, &[9, 8, 7]).unwrap();
        assert_eq!(ring.copy_out(c).unwrap(), &[9, 8, 7, 0]);
    }

    #[test]
    fn out_of_range_chunk_index_is_rejected() {
        let ring = DmaRing::new(2, 4);
        assert_eq!(ring.copy_in(2, &[1]).unwrap_err(), RingError::Corrupt);
        assert_eq!(ring.copy_out(9).unwrap_err(), RingError::Corrupt);
    }

    #[test]
    fn reset_reclaims_chunks_stranded_by_a_failed_retirement() {
        let ring = DmaRing::new(4, 8);
        ring.take().unwrap();
        ring.take().unwrap();
        ring.take().unwrap();
        // Retiring out of cursor order strands the skipped chunk.
        assert_eq!(ring.give_back(1, 1).unwrap_err(), RingError::Corrupt);
        ring.give_back(0, 1).unwrap();
        assert_eq!(ring.free_chunks(), 2);
        ring.reset();
        assert_eq!(ring.free_chunks(), 4);
        assert_eq!(ring.take().unwrap(), 0);
    }
}
