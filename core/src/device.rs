// Block Device Abstractions
// The journal and the buffer cache talk to storage only through this trait

use crate::error::{JournalError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A device addressed in fixed-size blocks.
///
/// Writes may be reordered by the device until `flush` returns; `flush` is the
/// only ordering barrier the journal relies on.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;
    fn block_count(&self) -> u64;
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

fn check_access(device: &dyn BlockDevice, block: u64, len: usize) -> Result<()> {
    if block >= device.block_count() {
        return Err(JournalError::OutOfRange {
            block,
            len: device.block_count(),
        });
    }
    if len != device.block_size() {
        return Err(JournalError::InvalidBlockSize {
            expected: device.block_size(),
            actual: len,
        });
    }
    Ok(())
}

/// In-memory device. Unwritten blocks read back as zeros.
pub struct MemoryDevice {
    blocks: Mutex<Vec<Option<Box<[u8]>>>>,
    block_size: usize,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            blocks: Mutex::new(vec![None; block_count as usize]),
            block_size,
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Copy of the current contents, as a power cut would leave them.
    pub fn snapshot(&self) -> MemoryDevice {
        let blocks = self.blocks.lock().clone();
        MemoryDevice {
            blocks: Mutex::new(blocks),
            block_size: self.block_size,
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Contents of one block, zeros if never written.
    pub fn block(&self, block: u64) -> Vec<u8> {
        match self.blocks.lock().get(block as usize) {
            Some(Some(data)) => data.to_vec(),
            _ => vec![0u8; self.block_size],
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.lock().len() as u64
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_access(self, block, buf.len())?;
        match &self.blocks.lock()[block as usize] {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_access(self, block, data.len())?;
        self.blocks.lock()[block as usize] = Some(data.into());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Device backed by a regular file or a raw device node.
pub struct FileDevice {
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Open (and size) a file to hold `block_count` blocks.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_size as u64 * block_count)?;
        log::debug!("file device of {} blocks of {} bytes", block_count, block_size);
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    /// Open an existing file; its length must be a whole number of blocks.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if block_size == 0 || len % block_size as u64 != 0 {
            return Err(JournalError::InvalidConfig(format!(
                "device length {} is not a multiple of block size {}",
                len, block_size
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count: len / block_size as u64,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_access(self, block, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_access(self, block, data.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Wraps a device and loses power after a fixed number of writes.
///
/// Every write past the budget fails without reaching the inner device, so
/// the inner device holds exactly the prefix of the write stream that made it.
pub struct CrashDevice {
    inner: Arc<dyn BlockDevice>,
    budget: AtomicU64,
    crashed: AtomicBool,
}

impl CrashDevice {
    pub fn new(inner: Arc<dyn BlockDevice>, writes_before_crash: u64) -> Self {
        Self {
            inner,
            budget: AtomicU64::new(writes_before_crash),
            crashed: AtomicBool::new(false),
        }
    }

    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    fn power_loss() -> JournalError {
        JournalError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "simulated power loss",
        ))
    }
}

impl BlockDevice for CrashDevice {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_block(block, buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        let taken = self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1));
        if taken.is_err() {
            if !self.crashed.swap(true, Ordering::AcqRel) {
                log::warn!("simulated power loss at write of block {}", block);
            }
            return Err(Self::power_loss());
        }
        self.inner.write_block(block, data)
    }

    fn flush(&self) -> Result<()> {
        if self.crashed() {
            return Err(Self::power_loss());
        }
        self.inner.flush()
    }
}
