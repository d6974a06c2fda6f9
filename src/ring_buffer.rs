//! Positioned read/write ring buffers backing the audio capture pipeline.
//!
//! Positions are absolute 64-bit byte indexes into the logical lifetime
//! stream of the buffer, stable across wrap-arounds. The non-blocking
//! [`RingBuffer`] fails fast on under-reads; [`BlockingRingBuffer`] parks
//! readers until data arrives, the writer signals end-of-stream with a
//! zero-byte write, or the buffer is terminated.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer has been terminated")]
    Terminated,

    #[error("ring buffer has no backing store yet")]
    Unsized,

    #[error("ring buffer size is already {existing}, cannot change to {requested}")]
    SizeAlreadySet { existing: usize, requested: usize },

    #[error("invalid ring buffer size: {0}")]
    InvalidSize(usize),

    #[error("init position cannot change after data has been written")]
    AlreadyWritten,

    #[error("not enough data available: requested {requested}, available {available}")]
    NotEnoughData { requested: usize, available: u64 },

    #[error("not enough space available: requested {requested}, free {free}")]
    NotEnoughSpace { requested: usize, free: u64 },

    #[error("position {pos} is outside the written range [{low}, {high})")]
    PositionOutOfRange { pos: u64, low: u64, high: u64 },

    #[error("data at position {0} has been overwritten")]
    DataOverwritten(u64),
}

struct RingState {
    name: String,
    data: Vec<u8>,
    init_pos: u64,
    read_pos: u64,
    write_pos: u64,
    allow_overflow: bool,
    terminated: bool,
    // Bumped by every zero-byte write; waiting readers compare against the
    // value they captured on entry, so the pulse only releases readers that
    // were already parked.
    unblock_epoch: u64,
}

impl RingState {
    fn live(&self) -> Result<(), RingBufferError> {
        if self.terminated {
            Err(RingBufferError::Terminated)
        } else {
            Ok(())
        }
    }

    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    /// Oldest absolute position whose byte is still present in the store.
    fn oldest_valid_pos(&self) -> u64 {
        self.write_pos
            .saturating_sub(self.capacity())
            .max(self.init_pos)
    }

    fn offset_of(&self, pos: u64) -> usize {
        ((pos - self.init_pos) % self.capacity()) as usize
    }

    fn copy_out(&self, pos: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let cap = self.data.len();
        let start = self.offset_of(pos);
        let first = (cap - start).min(buf.len());
        let len = buf.len();
        buf[..first].copy_from_slice(&self.data[start..start + first]);
        if first < len {
            buf[first..].copy_from_slice(&self.data[..len - first]);
        }
    }

    fn copy_in(&mut self, pos: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let cap = self.data.len();
        let start = self.offset_of(pos);
        let first = (cap - start).min(data.len());
        self.data[start..start + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.data[..rest].copy_from_slice(&data[first..]);
        }
    }

    fn read_queue(&mut self, buf: &mut [u8], strict: bool) -> Result<usize, RingBufferError> {
        self.live()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.write_pos - self.read_pos;
        if strict && buf.len() as u64 > available {
            return Err(RingBufferError::NotEnoughData {
                requested: buf.len(),
                available,
            });
        }
        let got = (buf.len() as u64).min(available) as usize;
        self.copy_out(self.read_pos, &mut buf[..got]);
        self.read_pos += got as u64;
        Ok(got)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8], strict: bool) -> Result<usize, RingBufferError> {
        self.live()?;
        if pos < self.init_pos || pos > self.write_pos {
            return Err(RingBufferError::PositionOutOfRange {
                pos,
                low: self.init_pos,
                high: self.write_pos,
            });
        }
        if pos < self.oldest_valid_pos() {
            return Err(RingBufferError::DataOverwritten(pos));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.write_pos - pos;
        if strict && buf.len() as u64 > available {
            return Err(RingBufferError::NotEnoughData {
                requested: buf.len(),
                available,
            });
        }
        let got = (buf.len() as u64).min(available) as usize;
        self.copy_out(pos, &mut buf[..got]);
        Ok(got)
    }
}

/// Absolute-position circular byte store with non-blocking reads.
///
/// Lifecycle: construct empty, configure with `set_name`/`set_size`/
/// `set_init_pos`/`allow_overflow` in any order before the first I/O, then
/// read and write freely. `term` destroys the buffer; every later operation
/// fails with [`RingBufferError::Terminated`].
pub struct RingBuffer {
    state: Mutex<RingState>,
    wakeup: Condvar,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState {
                name: String::new(),
                data: Vec::new(),
                init_pos: 0,
                read_pos: 0,
                write_pos: 0,
                allow_overflow: false,
                terminated: false,
                unblock_epoch: 0,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap()
    }

    /// Sets the debug label. No semantic effect.
    pub fn set_name(&self, name: impl Into<String>) -> Result<(), RingBufferError> {
        let mut state = self.lock();
        state.live()?;
        state.name = name.into();
        Ok(())
    }

    /// Allocates the backing store. Re-setting the same size is accepted;
    /// changing an already allocated size is not.
    pub fn set_size(&self, size: usize) -> Result<(), RingBufferError> {
        let mut state = self.lock();
        state.live()?;
        if size == 0 {
            return Err(RingBufferError::InvalidSize(size));
        }
        if !state.data.is_empty() && state.data.len() != size {
            return Err(RingBufferError::SizeAlreadySet {
                existing: state.data.len(),
                requested: size,
            });
        }
        if state.data.is_empty() {
            state.data = vec![0; size];
        }
        Ok(())
    }

    /// Maps absolute position `pos` to internal offset 0. Only legal before
    /// any byte has been written.
    pub fn set_init_pos(&self, pos: u64) -> Result<(), RingBufferError> {
        let mut state = self.lock();
        state.live()?;
        if state.write_pos != state.init_pos {
            return Err(RingBufferError::AlreadyWritten);
        }
        state.init_pos = pos;
        state.read_pos = pos;
        state.write_pos = pos;
        Ok(())
    }

    /// In overflow mode writers never fail for lack of space; the oldest
    /// unread bytes are discarded instead.
    pub fn allow_overflow(&self, allow: bool) -> Result<(), RingBufferError> {
        let mut state = self.lock();
        state.live()?;
        state.allow_overflow = allow;
        Ok(())
    }

    /// Appends `data` at the write position.
    ///
    /// A zero-length write is the unblock signal: it stores nothing but
    /// wakes every blocked reader, which then completes with whatever is
    /// available. See also [`RingBuffer::unblock`].
    pub fn write(&self, data: &[u8]) -> Result<(), RingBufferError> {
        let mut state = self.lock();
        state.live()?;
        if data.is_empty() {
            state.unblock_epoch += 1;
            self.wakeup.notify_all();
            return Ok(());
        }
        if state.data.is_empty() {
            return Err(RingBufferError::Unsized);
        }

        let capacity = state.capacity();
        let used = state.write_pos - state.read_pos;
        let free = capacity.saturating_sub(used);
        if !state.allow_overflow && data.len() as u64 > free {
            return Err(RingBufferError::NotEnoughSpace {
                requested: data.len(),
                free,
            });
        }

        // Only the last `capacity` bytes of an oversized write stay readable.
        let skip = (data.len() as u64).saturating_sub(capacity) as usize;
        let write_pos = state.write_pos;
        state.copy_in(write_pos + skip as u64, &data[skip..]);
        state.write_pos += data.len() as u64;

        // Overflow discards the oldest unread bytes.
        if state.write_pos - state.read_pos > capacity {
            state.read_pos = state.write_pos - capacity;
        }

        self.wakeup.notify_all();
        Ok(())
    }

    /// Wakes every blocked reader without storing any bytes.
    pub fn unblock(&self) -> Result<(), RingBufferError> {
        self.write(&[])
    }

    /// Reads exactly `buf.len()` bytes, advancing the read position.
    /// Fails without side effects when fewer bytes are available.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), RingBufferError> {
        self.lock().read_queue(buf, true).map(|_| ())
    }

    /// Reads up to `buf.len()` bytes, advancing the read position.
    /// Returns the number of bytes copied.
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize, RingBufferError> {
        self.lock().read_queue(buf, false)
    }

    /// Like [`RingBuffer::read`], returning an independently owned copy.
    pub fn read_shared(&self, size: usize) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        self.lock().read_queue(&mut buf, true)?;
        Ok(buf.into())
    }

    /// Like [`RingBuffer::read_some`], returning an independently owned copy
    /// sized to the bytes actually read.
    pub fn read_shared_some(&self, size: usize) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        let got = self.lock().read_queue(&mut buf, false)?;
        buf.truncate(got);
        Ok(buf.into())
    }

    /// Reads exactly `buf.len()` bytes starting at absolute position `pos`
    /// without moving the read position.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<(), RingBufferError> {
        self.lock().read_at(pos, buf, true).map(|_| ())
    }

    /// Positional counterpart of [`RingBuffer::read_some`].
    pub fn read_at_some(&self, pos: u64, buf: &mut [u8]) -> Result<usize, RingBufferError> {
        self.lock().read_at(pos, buf, false)
    }

    /// Positional counterpart of [`RingBuffer::read_shared`].
    pub fn read_shared_at(&self, pos: u64, size: usize) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        self.lock().read_at(pos, &mut buf, true)?;
        Ok(buf.into())
    }

    /// Positional counterpart of [`RingBuffer::read_shared_some`].
    pub fn read_shared_at_some(
        &self,
        pos: u64,
        size: usize,
    ) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        let got = self.lock().read_at(pos, &mut buf, false)?;
        buf.truncate(got);
        Ok(buf.into())
    }

    pub fn name(&self) -> Result<String, RingBufferError> {
        let state = self.lock();
        state.live()?;
        Ok(state.name.clone())
    }

    pub fn size(&self) -> Result<usize, RingBufferError> {
        let state = self.lock();
        state.live()?;
        Ok(state.data.len())
    }

    pub fn init_pos(&self) -> Result<u64, RingBufferError> {
        let state = self.lock();
        state.live()?;
        Ok(state.init_pos)
    }

    pub fn read_pos(&self) -> Result<u64, RingBufferError> {
        let state = self.lock();
        state.live()?;
        Ok(state.read_pos)
    }

    pub fn write_pos(&self) -> Result<u64, RingBufferError> {
        let state = self.lock();
        state.live()?;
        Ok(state.write_pos)
    }

    /// Destroys the buffer: all blocked readers wake and fail, and every
    /// subsequent operation fails. Idempotent.
    pub fn term(&self) {
        let mut state = self.lock();
        state.terminated = true;
        state.data = Vec::new();
        self.wakeup.notify_all();
    }
}

/// Ring buffer whose read family parks the caller until the requested byte
/// count is available, a zero-byte write signals end-of-stream, or the
/// buffer is terminated.
pub struct BlockingRingBuffer {
    inner: RingBuffer,
}

impl Default for BlockingRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingRingBuffer {
    pub fn new() -> Self {
        Self {
            inner: RingBuffer::new(),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), RingBufferError> {
        self.inner.set_name(name)
    }

    pub fn set_size(&self, size: usize) -> Result<(), RingBufferError> {
        self.inner.set_size(size)
    }

    pub fn set_init_pos(&self, pos: u64) -> Result<(), RingBufferError> {
        self.inner.set_init_pos(pos)
    }

    pub fn allow_overflow(&self, allow: bool) -> Result<(), RingBufferError> {
        self.inner.allow_overflow(allow)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), RingBufferError> {
        self.inner.write(data)
    }

    pub fn unblock(&self) -> Result<(), RingBufferError> {
        self.inner.unblock()
    }

    pub fn name(&self) -> Result<String, RingBufferError> {
        self.inner.name()
    }

    pub fn size(&self) -> Result<usize, RingBufferError> {
        self.inner.size()
    }

    pub fn init_pos(&self) -> Result<u64, RingBufferError> {
        self.inner.init_pos()
    }

    pub fn read_pos(&self) -> Result<u64, RingBufferError> {
        self.inner.read_pos()
    }

    pub fn write_pos(&self) -> Result<u64, RingBufferError> {
        self.inner.write_pos()
    }

    pub fn term(&self) {
        self.inner.term()
    }

    /// Parks until `needed` bytes are readable from `pos` (or the queue read
    /// position when `pos` is `None`), an unblock pulse arrives, or the
    /// buffer is terminated. The read itself happens under the returned
    /// guard.
    fn wait_for(
        &self,
        pos: Option<u64>,
        needed: usize,
    ) -> Result<MutexGuard<'_, RingState>, RingBufferError> {
        let mut state = self.inner.lock();
        state.live()?;
        let entry_epoch = state.unblock_epoch;
        loop {
            let from = pos.unwrap_or(state.read_pos);
            let available = state.write_pos.saturating_sub(from);
            if available >= needed as u64 || state.unblock_epoch != entry_epoch {
                return Ok(state);
            }
            state = self.inner.wakeup.wait(state).unwrap();
            state.live()?;
        }
    }

    /// Blocking strict read: completes once `buf.len()` bytes are available.
    /// An unblock pulse releases the wait; with fewer bytes than requested
    /// the strict form fails, leaving the available bytes in place.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), RingBufferError> {
        let mut state = self.wait_for(None, buf.len())?;
        state.read_queue(buf, true).map(|_| ())
    }

    /// Blocking counted read: completes with `buf.len()` bytes, or with
    /// whatever is available (possibly zero) after an unblock pulse.
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize, RingBufferError> {
        let mut state = self.wait_for(None, buf.len())?;
        state.read_queue(buf, false)
    }

    pub fn read_shared(&self, size: usize) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        let mut state = self.wait_for(None, size)?;
        state.read_queue(&mut buf, true)?;
        Ok(buf.into())
    }

    pub fn read_shared_some(&self, size: usize) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        let mut state = self.wait_for(None, size)?;
        let got = state.read_queue(&mut buf, false)?;
        buf.truncate(got);
        Ok(buf.into())
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<(), RingBufferError> {
        let state = self.wait_for(Some(pos), buf.len())?;
        state.read_at(pos, buf, true).map(|_| ())
    }

    pub fn read_at_some(&self, pos: u64, buf: &mut [u8]) -> Result<usize, RingBufferError> {
        let state = self.wait_for(Some(pos), buf.len())?;
        state.read_at(pos, buf, false)
    }

    pub fn read_shared_at(&self, pos: u64, size: usize) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        let state = self.wait_for(Some(pos), size)?;
        state.read_at(pos, &mut buf, true)?;
        Ok(buf.into())
    }

    pub fn read_shared_at_some(
        &self,
        pos: u64,
        size: usize,
    ) -> Result<Arc<[u8]>, RingBufferError> {
        let mut buf = vec![0u8; size];
        let state = self.wait_for(Some(pos), size)?;
        let got = state.read_at(pos, &mut buf, false)?;
        buf.truncate(got);
        Ok(buf.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(size: usize) -> RingBuffer {
        let rb = RingBuffer::new();
        rb.set_size(size).unwrap();
        rb
    }

    #[test]
    fn test_positions_track_io() {
        let rb = sized(64);
        rb.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(rb.write_pos().unwrap(), 4);
        assert_eq!(rb.read_pos().unwrap(), 0);

        let mut buf = [0u8; 4];
        rb.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(rb.read_pos().unwrap(), 4);
    }

    #[test]
    fn test_init_pos_offsets_the_stream() {
        let rb = sized(16);
        rb.set_init_pos(1000).unwrap();
        assert_eq!(rb.init_pos().unwrap(), 1000);
        assert_eq!(rb.read_pos().unwrap(), 1000);
        assert_eq!(rb.write_pos().unwrap(), 1000);

        rb.write(b"abcdef").unwrap();
        let mut buf = [0u8; 6];
        rb.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");

        // Too late to move once bytes exist
        assert_eq!(rb.set_init_pos(0), Err(RingBufferError::AlreadyWritten));
    }

    #[test]
    fn test_resize_rules() {
        let rb = sized(32);
        assert_eq!(rb.set_size(32), Ok(()));
        assert_eq!(
            rb.set_size(64),
            Err(RingBufferError::SizeAlreadySet {
                existing: 32,
                requested: 64
            })
        );
        assert_eq!(rb.set_size(0), Err(RingBufferError::InvalidSize(0)));
    }

    #[test]
    fn test_write_wraps_around() {
        let rb = sized(8);
        rb.write(&[0; 6]).unwrap();
        let mut buf = [0u8; 6];
        rb.read(&mut buf).unwrap();

        // Crosses the internal wrap point
        rb.write(&[9, 8, 7, 6]).unwrap();
        let mut buf = [0u8; 4];
        rb.read(&mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7, 6]);
    }

    #[test]
    fn test_overflow_discards_oldest() {
        let rb = sized(4);
        rb.allow_overflow(true).unwrap();
        rb.write(&[1, 2, 3, 4]).unwrap();
        rb.write(&[5, 6]).unwrap();
        assert_eq!(rb.read_pos().unwrap(), 2);
        assert_eq!(rb.write_pos().unwrap(), 6);

        let mut buf = [0u8; 1];
        assert_eq!(
            rb.read_at(0, &mut buf),
            Err(RingBufferError::DataOverwritten(0))
        );

        let mut buf = [0u8; 4];
        rb.read(&mut buf).unwrap();
        assert_eq!(buf, [3, 4, 5, 6]);
    }

    #[test]
    fn test_oversized_overflow_write_keeps_tail() {
        let rb = sized(4);
        rb.allow_overflow(true).unwrap();
        rb.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(rb.write_pos().unwrap(), 9);
        assert_eq!(rb.read_pos().unwrap(), 5);

        let mut buf = [0u8; 4];
        rb.read(&mut buf).unwrap();
        assert_eq!(buf, [6, 7, 8, 9]);
    }

    #[test]
    fn test_term_poisons_everything() {
        let rb = sized(8);
        rb.write(&[1]).unwrap();
        rb.term();
        rb.term(); // idempotent

        assert_eq!(rb.size(), Err(RingBufferError::Terminated));
        assert_eq!(rb.write(&[1]), Err(RingBufferError::Terminated));
        assert_eq!(rb.read_shared(1), Err(RingBufferError::Terminated));
        assert_eq!(rb.set_name("x"), Err(RingBufferError::Terminated));
    }

    #[test]
    fn test_unblock_pulse_only_hits_parked_readers() {
        let rb = BlockingRingBuffer::new();
        rb.set_size(8).unwrap();
        rb.unblock().unwrap();

        // The pulse above predates this read, so it must still block and
        // then complete normally once the data arrives.
        rb.write(&[1, 2]).unwrap();
        let mut buf = [0u8; 2];
        rb.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
    }
}
