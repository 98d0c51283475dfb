// JBD (Journaling Block Device) Implementation
// Write-ahead logging of metadata blocks with crash recovery

pub mod buffer;
pub mod checkpoint;
pub mod checksum;
pub mod commit;
pub mod commit_thread;
pub mod format;
pub mod handle;
pub mod journal;
pub mod recovery;
pub mod revoke;
pub mod transaction;

pub use buffer::{Buffer, BufferCache, BufferFlags, BufferRef, WritebackHook};
pub use checkpoint::CheckpointStats;
pub use commit_thread::CommitThread;
pub use handle::Handle;
pub use journal::{Journal, LogState, TransactionInfo};
pub use recovery::RecoveryInfo;
pub use transaction::{tid_geq, tid_gt, BufferList, Tid, TransactionState};

pub use jbd_core::{BlockDevice, JournalError, Result};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fewest blocks a journal may have
pub const MIN_JOURNAL_BLOCKS: u32 = 32;

/// Journal configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Block size shared by the device and the log
    pub block_size: usize,
    /// First device block of the log area (holds the journal superblock)
    pub journal_start: u64,
    /// Log length in blocks, superblock included
    pub journal_blocks: u32,
    /// Credit ceiling of one transaction. Zero means a quarter of the log.
    pub max_transaction_buffers: u32,
    /// Metadata buffers submitted per descriptor batch
    pub flush_nr_buffers: usize,
    /// Headroom `extend` keeps back before telling the caller to restart
    pub reserve_credits: u32,
    /// Age at which the commit thread commits the running transaction
    pub commit_interval_ms: u64,
    /// Journal mode
    pub mode: JournalMode,
    /// Write crc32c checksums into commit blocks
    pub commit_checksum: bool,
    /// Refuse every handle
    pub read_only: bool,
}

/// Journal modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Journal data and metadata
    Journal,
    /// Journal metadata only, data written before metadata
    Ordered,
    /// Journal metadata only, data can be written anytime
    Writeback,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            journal_start: 0,
            journal_blocks: 1024,
            max_transaction_buffers: 0,
            flush_nr_buffers: 64,
            reserve_credits: 12,
            commit_interval_ms: 5000,
            mode: JournalMode::Ordered,
            commit_checksum: false,
            read_only: false,
        }
    }
}

impl JournalConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Effective per-transaction credit ceiling
    pub fn max_transaction(&self) -> u32 {
        if self.max_transaction_buffers == 0 {
            self.journal_blocks / 4
        } else {
            self.max_transaction_buffers
        }
    }

    /// Tags carried by one descriptor batch
    pub fn batch_size(&self) -> usize {
        self.flush_nr_buffers
            .min(format::tags_per_descriptor(self.block_size))
    }

    /// Log blocks a transaction of `credits` buffers may occupy, control
    /// blocks included.
    pub fn log_space_for(&self, credits: u32) -> u32 {
        let batch = self.batch_size().max(1) as u32;
        credits + credits.div_ceil(batch) + journal::LOG_CONTROL_RESERVE
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(JournalError::InvalidConfig(format!(
                "block size {} is not a power of two of at least 512",
                self.block_size
            )));
        }
        if self.journal_blocks < MIN_JOURNAL_BLOCKS {
            return Err(JournalError::InvalidConfig(format!(
                "journal of {} blocks is below the minimum of {}",
                self.journal_blocks, MIN_JOURNAL_BLOCKS
            )));
        }
        if self.flush_nr_buffers == 0 {
            return Err(JournalError::InvalidConfig(
                "flush_nr_buffers must be at least 1".to_string(),
            ));
        }
        let max = self.max_transaction();
        if max == 0 {
            return Err(JournalError::InvalidConfig(
                "transactions must allow at least one buffer".to_string(),
            ));
        }
        let usable = self.journal_blocks - 1;
        if self.log_space_for(max) > usable {
            return Err(JournalError::InvalidConfig(format!(
                "a full transaction of {} buffers needs {} log blocks, only {} available",
                max,
                self.log_space_for(max),
                usable
            )));
        }
        if self.reserve_credits >= max {
            return Err(JournalError::InvalidConfig(format!(
                "reserve of {} credits leaves nothing of a {} credit transaction",
                self.reserve_credits, max
            )));
        }
        Ok(())
    }

    /// Check the configuration against the device it will run on.
    pub fn validate_for(&self, device: &dyn BlockDevice) -> Result<()> {
        self.validate()?;
        if device.block_size() != self.block_size {
            return Err(JournalError::InvalidBlockSize {
                expected: self.block_size,
                actual: device.block_size(),
            });
        }
        if device.block_count() > u32::MAX as u64 + 1 {
            return Err(JournalError::InvalidConfig(format!(
                "{} blocks do not fit 32-bit log tags",
                device.block_count()
            )));
        }
        let end = self.journal_start + self.journal_blocks as u64;
        if end > device.block_count() {
            return Err(JournalError::OutOfRange {
                block: end - 1,
                len: device.block_count(),
            });
        }
        Ok(())
    }
}

/// Journal statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    /// Total transactions started
    pub transactions_started: u64,
    /// Total transactions committed
    pub transactions_committed: u64,
    /// Total transactions aborted
    pub transactions_aborted: u64,
    /// Total metadata blocks logged
    pub blocks_logged: u64,
    /// Descriptor blocks written
    pub descriptor_blocks: u64,
    /// Revoke blocks written
    pub revoke_blocks: u64,
    /// Checkpoint passes run
    pub checkpoints: u64,
    /// Current transaction ID
    pub current_tid: u32,
    /// Oldest transaction ID still in the log
    pub oldest_tid: u32,
}
