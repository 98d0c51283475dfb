// Checkpoint Management
// Writes committed buffers home so their log space can be reused

use crate::buffer::BufferRef;
use crate::journal::{Journal, JournalState};
use jbd_core::{JournalError, Result};
use parking_lot::MutexGuard;

/// Outcome of one checkpoint pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Buffers written to their home location
    pub written: usize,
    /// Buffers that were already clean
    pub released: usize,
    /// Commits waited for because a newer transaction held a buffer
    pub commits_waited: usize,
}

impl Journal {
    /// Checkpoint the oldest committed transaction, then move the log tail.
    pub fn do_checkpoint(&self) -> Result<CheckpointStats> {
        let mut stats = CheckpointStats::default();
        let mut st = self.state.lock();
        let Some(tid) = st.txns.checkpoint.front().map(|t| t.tid) else {
            return Ok(stats);
        };
        log::debug!("checkpointing transaction {}", tid);

        loop {
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            let next = st
                .txns
                .checkpoint
                .iter()
                .find(|t| t.tid == tid)
                .and_then(|t| t.checkpoint.first().copied());
            let Some(id) = next else {
                break;
            };

            let buffer = st.heads[id].buffer.clone();
            if buffer.is_locked() {
                MutexGuard::unlocked(&mut st, || buffer.wait_unlocked());
                continue;
            }
            if let Some(owner) = st.heads[id].transaction {
                // Journaled again; its commit takes the buffer off this list
                MutexGuard::unlocked(&mut st, || self.wait_commit(owner))?;
                stats.commits_waited += 1;
                continue;
            }
            if buffer.is_dirty() {
                MutexGuard::unlocked(&mut st, || self.cache.write_buffer(&buffer))?;
                stats.written += 1;
                continue;
            }
            st.remove_checkpoint_head(id);
            stats.released += 1;
        }

        st.stats.checkpoints += 1;
        drop(st);
        self.wait_commit.notify_all();
        self.cleanup_tail()?;
        log::debug!(
            "checkpoint of transaction {} done: {} written, {} already clean",
            tid,
            stats.written,
            stats.released
        );
        Ok(stats)
    }

    /// Take a buffer that reached its home location off its checkpoint list.
    /// Returns whether the buffer was waiting for checkpoint.
    pub fn remove_checkpoint(&self, buffer: &BufferRef) -> bool {
        let mut st = self.state.lock();
        let Some(id) = st.lookup_head(buffer) else {
            return false;
        };
        if st.heads[id].cp_transaction.is_none() || buffer.is_dirty() {
            return false;
        }
        if st.remove_checkpoint_head(id) {
            drop(st);
            self.wait_commit.notify_all();
        }
        true
    }

    /// Make log space available: move the tail, checkpoint, or wait for the
    /// commit in flight.
    pub(crate) fn wait_for_space(&self, st: &mut MutexGuard<'_, JournalState>) -> Result<()> {
        let before = st.log.free;
        MutexGuard::unlocked(st, || self.cleanup_tail())?;
        if st.log.free > before {
            return Ok(());
        }

        if !st.txns.checkpoint.is_empty() {
            log::debug!("log space low ({} free), checkpointing", st.log.free);
            MutexGuard::unlocked(st, || self.do_checkpoint())?;
            return Ok(());
        }
        if st.flags.commit_in_progress {
            self.wait_commit.wait(st);
            return Ok(());
        }

        log::error!("journal has no space left and nothing to checkpoint");
        Err(JournalError::NoSpace)
    }
}
