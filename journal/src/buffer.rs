// Buffer Cache Collaborator
// Block-sized buffers shared between the cache, client threads and the commit thread

use jbd_core::{BlockDevice, Result};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared handle to a cached block. Dropping the last handle outside the
/// cache is the release; the cache reclaims it once nothing else holds it.
pub type BufferRef = Arc<Buffer>;

/// State bits of a buffer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferFlags {
    /// Needs writing to its home location
    pub dirty: bool,
    /// Dirty, but owned by the journal until its transaction commits
    pub jbd_dirty: bool,
    /// I/O in flight
    pub locked: bool,
    /// Contents match the device (or are newer)
    pub uptodate: bool,
}

/// One block of the device
pub struct Buffer {
    blocknr: u64,
    data: RwLock<Box<[u8]>>,
    flags: Mutex<BufferFlags>,
    unlocked: Condvar,
    journaled: AtomicBool,
}

impl Buffer {
    fn new(blocknr: u64, block_size: usize) -> Self {
        Self {
            blocknr,
            data: RwLock::new(vec![0u8; block_size].into_boxed_slice()),
            flags: Mutex::new(BufferFlags::default()),
            unlocked: Condvar::new(),
            journaled: AtomicBool::new(false),
        }
    }

    /// A buffer outside the cache, used for blocks written to the log.
    pub(crate) fn detached(blocknr: u64, data: Vec<u8>) -> BufferRef {
        let buffer = Self {
            blocknr,
            data: RwLock::new(data.into_boxed_slice()),
            flags: Mutex::new(BufferFlags::default()),
            unlocked: Condvar::new(),
            journaled: AtomicBool::new(false),
        };
        buffer.mark_uptodate();
        Arc::new(buffer)
    }

    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Mutable contents. Journaled metadata must go through
    /// `get_write_access` first, and the guard must not be held across
    /// calls into the journal.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn flags(&self) -> BufferFlags {
        *self.flags.lock()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.lock().dirty
    }

    pub fn is_jbd_dirty(&self) -> bool {
        self.flags.lock().jbd_dirty
    }

    pub fn is_locked(&self) -> bool {
        self.flags.lock().locked
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags.lock().uptodate
    }

    /// Whether the journal is tracking this buffer.
    pub fn is_journaled(&self) -> bool {
        self.journaled.load(Ordering::Acquire)
    }

    pub(crate) fn set_journaled(&self, journaled: bool) {
        self.journaled.store(journaled, Ordering::Release);
    }

    pub fn mark_dirty(&self) {
        let mut flags = self.flags.lock();
        flags.dirty = true;
        flags.uptodate = true;
    }

    pub fn mark_uptodate(&self) {
        self.flags.lock().uptodate = true;
    }

    pub(crate) fn test_clear_dirty(&self) -> bool {
        let mut flags = self.flags.lock();
        std::mem::replace(&mut flags.dirty, false)
    }

    pub(crate) fn set_jbd_dirty(&self) {
        let mut flags = self.flags.lock();
        flags.jbd_dirty = true;
        flags.uptodate = true;
    }

    pub(crate) fn test_clear_jbd_dirty(&self) -> bool {
        let mut flags = self.flags.lock();
        std::mem::replace(&mut flags.jbd_dirty, false)
    }

    /// Take the I/O lock, sleeping while someone else holds it.
    pub fn lock(&self) {
        let mut flags = self.flags.lock();
        while flags.locked {
            self.unlocked.wait(&mut flags);
        }
        flags.locked = true;
    }

    pub fn try_lock(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.locked {
            return false;
        }
        flags.locked = true;
        true
    }

    pub fn unlock(&self) {
        self.flags.lock().locked = false;
        self.unlocked.notify_all();
    }

    pub fn wait_unlocked(&self) {
        let mut flags = self.flags.lock();
        while flags.locked {
            self.unlocked.wait(&mut flags);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("blocknr", &self.blocknr)
            .field("flags", &self.flags())
            .field("journaled", &self.is_journaled())
            .finish()
    }
}

/// Told about every buffer the cache writes to its home location.
pub trait WritebackHook: Send + Sync {
    fn buffer_written(&self, buffer: &BufferRef);
}

/// Minimal buffer cache over one block device
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    buffers: Mutex<HashMap<u64, BufferRef>>,
    hook: RwLock<Option<Weak<dyn WritebackHook>>>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            buffers: Mutex::new(HashMap::new()),
            hook: RwLock::new(None),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    pub fn set_writeback_hook(&self, hook: Weak<dyn WritebackHook>) {
        *self.hook.write() = Some(hook);
    }

    /// Buffer for `blocknr`, without reading it.
    pub fn getblk(&self, blocknr: u64) -> BufferRef {
        let mut buffers = self.buffers.lock();
        buffers
            .entry(blocknr)
            .or_insert_with(|| Arc::new(Buffer::new(blocknr, self.device.block_size())))
            .clone()
    }

    /// Buffer for `blocknr`, read from the device unless already up to date.
    pub fn bread(&self, blocknr: u64) -> Result<BufferRef> {
        let buffer = self.getblk(blocknr);
        if buffer.is_uptodate() {
            return Ok(buffer);
        }

        buffer.lock();
        let result = if buffer.is_uptodate() {
            Ok(())
        } else {
            let mut data = buffer.data_mut();
            self.device.read_block(blocknr, &mut data)
        };
        if result.is_ok() {
            buffer.mark_uptodate();
        }
        buffer.unlock();

        result.map(|_| buffer)
    }

    pub fn lookup(&self, blocknr: u64) -> Option<BufferRef> {
        self.buffers.lock().get(&blocknr).cloned()
    }

    /// Write one buffer to its home location if it is dirty.
    ///
    /// Returns whether a write happened. The write-back hook runs after the
    /// write completes.
    pub fn write_buffer(&self, buffer: &BufferRef) -> Result<bool> {
        buffer.lock();
        if !buffer.test_clear_dirty() {
            buffer.unlock();
            return Ok(false);
        }

        let result = {
            let data = buffer.data();
            self.device.write_block(buffer.blocknr(), &data)
        };
        if let Err(e) = result {
            buffer.mark_dirty();
            buffer.unlock();
            return Err(e);
        }
        buffer.unlock();

        log::trace!("wrote back block {}", buffer.blocknr());
        let hook = self.hook.read().as_ref().and_then(Weak::upgrade);
        if let Some(hook) = hook {
            hook.buffer_written(buffer);
        }
        Ok(true)
    }

    /// Ordinary write-back of every dirty buffer, then a device flush.
    pub fn sync_dirty(&self) -> Result<usize> {
        let dirty: Vec<BufferRef> = self
            .buffers
            .lock()
            .values()
            .filter(|b| b.is_dirty())
            .cloned()
            .collect();

        let mut written = 0;
        for buffer in &dirty {
            if self.write_buffer(buffer)? {
                written += 1;
            }
        }
        self.device.flush()?;
        Ok(written)
    }

    /// Drop buffers nobody else references and that hold no pending state.
    pub fn shrink(&self) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|_, buffer| {
            let flags = buffer.flags();
            Arc::strong_count(buffer) > 1
                || flags.dirty
                || flags.jbd_dirty
                || flags.locked
                || buffer.is_journaled()
        });
        before - buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}
