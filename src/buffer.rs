//! Shared-memory-shaped packet buffer (spec section 4.A): a
//! single-producer-or-multi-producer variable-size FIFO with
//! reserve/commit/cancel semantics.
//!
//! Re-architected per spec section 9's design notes as an in-process
//! bounded FIFO of owned byte buffers guarded by a `Mutex` + `Condvar`,
//! with a byte budget standing in for the physical ring's contiguous-space
//! constraint. This changes nothing externally observable: callers still
//! see commit order equal to `close()` call order, atomic commits, and
//! `Busy`/`NoSpace` on over-reservation.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{PipelineError, Result};

/// Capability flag for `WriteHandle::dma`. In this safe rendition `dma`
/// always hands out a slice into the handle's own staging buffer — there
/// is no physical shared-memory region to map — so this flag exists only
/// to preserve the interface spec section 4.A names; it has no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaFlags(pub u32);

impl DmaFlags {
    pub const ACCEPT_FAKE_DMA: DmaFlags = DmaFlags(1 << 0);

    pub const fn empty() -> Self {
        DmaFlags(0)
    }
}

struct Inner {
    queue: VecDeque<Vec<u8>>,
    /// Bytes reserved by open write handles plus bytes sitting in `queue`
    /// unread. Bounded by `capacity`.
    inflight: usize,
    cancelled: bool,
}

/// A shared-memory ring of variable-size packets, re-expressed as a
/// bounded byte-budgeted FIFO (see module docs).
pub struct PacketBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                inflight: 0,
                cancelled: false,
            }),
            cond: Condvar::new(),
            capacity,
        })
    }

    /// Reserve a write handle. Never blocks: the physical reservation
    /// (and any `Busy`/`NoSpace` failure) happens in `set_size`, since the
    /// payload length is not known until then.
    pub fn open_write(self: &Arc<Self>, try_mode: bool) -> Result<WriteHandle> {
        let _ = try_mode;
        let g = self.inner.lock().unwrap();
        if g.cancelled {
            return Err(PipelineError::Cancelled);
        }
        drop(g);
        Ok(WriteHandle {
            buffer: self.clone(),
            staging: Vec::new(),
            reserved: 0,
            try_mode,
            finished: false,
        })
    }

    pub fn open_read(self: &Arc<Self>, try_mode: bool) -> Result<ReadHandle> {
        let mut g = self.inner.lock().unwrap();
        loop {
            if let Some(data) = g.queue.pop_front() {
                let len = data.len();
                return Ok(ReadHandle {
                    buffer: self.clone(),
                    data,
                    len,
                    finished: false,
                });
            }
            if g.cancelled {
                return Err(PipelineError::Cancelled);
            }
            if try_mode {
                return Err(PipelineError::Busy);
            }
            g = self.cond.wait(g).unwrap();
        }
    }

    /// Global cancellation: wakes every blocked `open`/`set_size` call
    /// with `Cancelled`. Readers may still drain messages already sitting
    /// in the queue (spec section 7's "remaining messages ... are drained
    /// by consumers"); only new write reservations and reads of an empty
    /// queue start failing.
    pub fn cancel_buffer(&self) {
        let mut g = self.inner.lock().unwrap();
        g.cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    /// Reopen after a `cancel_buffer`, dropping anything left in the
    /// queue. Used by consumer-contract `start()` after a prior `stop()`.
    pub fn reopen(&self) {
        let mut g = self.inner.lock().unwrap();
        g.cancelled = false;
        g.queue.clear();
        g.inflight = 0;
    }

    fn release(&self, bytes: usize) {
        let mut g = self.inner.lock().unwrap();
        g.inflight = g.inflight.saturating_sub(bytes);
        self.cond.notify_all();
    }

    /// Publishes `bytes`, unless the buffer was cancelled first — checked
    /// and applied under the same lock so a `close()` racing
    /// `cancel_buffer()` cannot land a message after cancellation.
    /// `reserved` is the byte budget this write held, released back on
    /// cancellation (on success the budget carries over to the queued
    /// entry, released only once a reader consumes it).
    fn commit(&self, bytes: Vec<u8>, reserved: usize) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        if g.cancelled {
            g.inflight = g.inflight.saturating_sub(reserved);
            self.cond.notify_all();
            return Err(PipelineError::Cancelled);
        }
        g.queue.push_back(bytes);
        self.cond.notify_all();
        Ok(())
    }
}

pub struct WriteHandle {
    buffer: Arc<PacketBuffer>,
    staging: Vec<u8>,
    reserved: usize,
    try_mode: bool,
    finished: bool,
}

impl WriteHandle {
    /// Declares the payload length of this write. Growing the reservation
    /// may fail with `NoSpace` (the size could never fit, regardless of
    /// draining) or `Busy` (try mode, and it doesn't fit right now);
    /// blocking mode waits for space to free.
    pub fn set_size(&mut self, n: usize) -> Result<()> {
        if n > self.buffer.capacity {
            return Err(PipelineError::NoSpace);
        }
        let mut g = self.buffer.inner.lock().unwrap();
        if n > self.reserved {
            let need = n - self.reserved;
            loop {
                if g.cancelled {
                    return Err(PipelineError::Cancelled);
                }
                if g.inflight + need <= self.buffer.capacity {
                    break;
                }
                if self.try_mode {
                    return Err(PipelineError::Busy);
                }
                g = self.buffer.cond.wait(g).unwrap();
            }
            g.inflight += need;
        } else if n < self.reserved {
            g.inflight -= self.reserved - n;
        }
        drop(g);
        self.reserved = n;
        if self.staging.len() > n {
            self.staging.truncate(n);
        }
        Ok(())
    }

    /// Appends bytes to the reserved region, bounded by the declared size.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buffer.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if self.staging.len() + bytes.len() > self.reserved {
            return Err(PipelineError::InvalidArgument(
                "write exceeds reserved size".into(),
            ));
        }
        self.staging.extend_from_slice(bytes);
        Ok(())
    }

    /// Hands out a direct, exclusively-borrowed slice of `n` bytes within
    /// the reserved region for zero-copy fill. `flags` is accepted for
    /// interface parity but has no effect (see `DmaFlags`).
    pub fn dma(&mut self, n: usize, _flags: DmaFlags) -> Result<&mut [u8]> {
        if self.buffer.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let start = self.staging.len();
        if start + n > self.reserved {
            return Err(PipelineError::InvalidArgument(
                "dma region exceeds reserved size".into(),
            ));
        }
        self.staging.resize(start + n, 0);
        Ok(&mut self.staging[start..start + n])
    }

    pub fn bytes_written(&self) -> usize {
        self.staging.len()
    }

    /// Commits the write. Bytes become visible to readers in the order
    /// `close()` calls were issued across all writers. Fails instead of
    /// publishing if the buffer was cancelled while this handle was open.
    pub fn close(mut self) -> Result<()> {
        self.finished = true;
        let bytes = std::mem::take(&mut self.staging);
        self.buffer.commit(bytes, self.reserved)
    }

    /// Discards the write without publishing it; the reserved region is
    /// returned atomically.
    pub fn cancel(mut self) {
        self.finished = true;
        self.buffer.release(self.reserved);
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.release(self.reserved);
        }
    }
}

pub struct ReadHandle {
    buffer: Arc<PacketBuffer>,
    data: Vec<u8>,
    len: usize,
    finished: bool,
}

impl ReadHandle {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn close(mut self) {
        self.finished = true;
        self.buffer.release(self.len);
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.release(self.len);
        }
    }
}
