// Journal State and Lifecycle
// Log space accounting, superblock updates, buffer filing and journal setup

use crate::buffer::{BufferCache, BufferRef, WritebackHook};
use crate::format::{JournalSuperblock, JBD_FEATURE_COMPAT_CHECKSUM};
use crate::recovery;
use crate::revoke::RevokeTable;
use crate::transaction::{
    tid_gt, BufferList, HeadId, JournalHead, Tid, Transaction, TransactionState, Transactions,
};
use crate::{JournalConfig, JournalStats};
use jbd_core::{BlockDevice, JournalError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use slab::Slab;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Log blocks kept back from every reservation for revoke and commit blocks
pub const LOG_CONTROL_RESERVE: u32 = 8;

const EIO: i32 = -5;

/// Circular log pointers and sequence counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogState {
    /// First usable log block (the superblock sits before it)
    pub first: u32,
    /// One past the last usable log block
    pub last: u32,
    /// Next block to allocate
    pub head: u32,
    /// Oldest block still needed for recovery
    pub tail: u32,
    /// Blocks between head and tail
    pub free: u32,
    /// Sequence of the oldest transaction still in the log
    pub tail_sequence: Tid,
    /// Sequence the next transaction will get
    pub transaction_sequence: Tid,
    /// Most recently committed transaction
    pub commit_sequence: Tid,
    /// Newest transaction somebody asked to commit
    pub commit_request: Tid,
}

impl LogState {
    fn new(first: u32, last: u32, sequence: Tid) -> Self {
        Self {
            first,
            last,
            head: first,
            tail: first,
            free: last - first,
            tail_sequence: sequence,
            transaction_sequence: sequence,
            commit_sequence: sequence.wrapping_sub(1),
            commit_request: sequence.wrapping_sub(1),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.last - self.first
    }

    /// Blocks from `from` up to, not including, `to`, walking the ring.
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        if to >= from {
            to - from
        } else {
            (self.last - from) + (to - self.first)
        }
    }

    pub(crate) fn next_block(&mut self) -> Result<u32> {
        if self.free == 0 {
            return Err(JournalError::NoSpace);
        }
        let block = self.head;
        self.head += 1;
        if self.head == self.last {
            self.head = self.first;
        }
        self.free -= 1;
        Ok(block)
    }
}

/// Snapshot of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub tid: Tid,
    pub state: TransactionState,
    pub outstanding_credits: u32,
    pub updates: u32,
    pub handle_count: u32,
    pub nr_buffers: u32,
    pub log_start: Option<u32>,
    pub checkpoint_buffers: usize,
}

impl From<&Transaction> for TransactionInfo {
    fn from(t: &Transaction) -> Self {
        Self {
            tid: t.tid,
            state: t.state,
            outstanding_credits: t.outstanding_credits,
            updates: t.updates,
            handle_count: t.handle_count,
            nr_buffers: t.nr_buffers,
            log_start: t.log_start,
            checkpoint_buffers: t.checkpoint.len(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct JournalFlags {
    /// On-disk superblock is clean; the next commit must dirty it first
    pub flushed: bool,
    pub aborted: bool,
    pub unmounted: bool,
    pub commit_in_progress: bool,
    pub commit_thread: bool,
    pub stop_thread: bool,
}

/// Everything guarded by the journal lock
pub(crate) struct JournalState {
    pub heads: Slab<JournalHead>,
    pub by_block: HashMap<u64, HeadId>,
    pub txns: Transactions,
    pub revoke: RevokeTable,
    pub log: LogState,
    pub superblock: JournalSuperblock,
    pub flags: JournalFlags,
    pub errno: i32,
    pub stats: JournalStats,
}

impl JournalState {
    /// Journal head of a cache buffer, attached on first use.
    pub fn head_for(&mut self, buffer: &BufferRef) -> HeadId {
        if let Some(&id) = self.by_block.get(&buffer.blocknr()) {
            return id;
        }
        let id = self.heads.insert(JournalHead::new(buffer.clone()));
        self.by_block.insert(buffer.blocknr(), id);
        buffer.set_journaled(true);
        id
    }

    pub fn lookup_head(&self, buffer: &BufferRef) -> Option<HeadId> {
        self.by_block
            .get(&buffer.blocknr())
            .copied()
            .filter(|&id| Arc::ptr_eq(&self.heads[id].buffer, buffer))
    }

    pub fn front_of(&self, tid: Tid, list: BufferList) -> Option<HeadId> {
        self.txns
            .get(tid)
            .and_then(|t| t.list(list))
            .and_then(|l| l.front().copied())
    }

    /// Take a buffer off its list, leaving its owner in place.
    pub fn unlink(&mut self, id: HeadId) {
        let jh = &mut self.heads[id];
        let list = std::mem::replace(&mut jh.list, BufferList::None);
        if let Some(tid) = jh.transaction {
            if let Some(entries) = self.txns.get_mut(tid).and_then(|t| t.list_mut(list)) {
                if let Some(pos) = entries.iter().position(|&x| x == id) {
                    entries.remove(pos);
                }
            }
        }
    }

    pub fn file(&mut self, id: HeadId, tid: Tid, list: BufferList) {
        self.unlink(id);
        let jh = &mut self.heads[id];
        jh.transaction = Some(tid);
        jh.list = list;
        if let Some(t) = self.txns.get_mut(tid) {
            if list == BufferList::Metadata {
                t.nr_buffers += 1;
            }
            if let Some(entries) = t.list_mut(list) {
                entries.push_back(id);
            }
        }
    }

    pub fn unfile(&mut self, id: HeadId) {
        self.unlink(id);
        self.heads[id].transaction = None;
    }

    /// Release a buffer from its transaction once that transaction is done
    /// with it: hand it to the waiting transaction or back to write-back.
    pub fn refile(&mut self, id: HeadId) {
        let buffer = self.heads[id].buffer.clone();
        let was_dirty = buffer.test_clear_jbd_dirty();
        match self.heads[id].next_transaction.take() {
            None => {
                self.unfile(id);
                if was_dirty {
                    buffer.mark_dirty();
                }
                self.maybe_free(id);
            }
            Some(next) => {
                let list = std::mem::replace(&mut self.heads[id].next_list, BufferList::Reserved);
                self.file(id, next, list);
                if was_dirty {
                    buffer.set_jbd_dirty();
                }
            }
        }
    }

    /// Drop the journal head once nothing refers to it.
    pub fn maybe_free(&mut self, id: HeadId) -> bool {
        if !self.heads[id].is_idle() {
            return false;
        }
        let jh = self.heads.remove(id);
        if self.by_block.get(&jh.buffer.blocknr()) == Some(&id) {
            self.by_block.remove(&jh.buffer.blocknr());
            jh.buffer.set_journaled(false);
        }
        true
    }

    /// Free the head of a log block once its write completed.
    pub fn release_log_head(&mut self, id: HeadId) -> JournalHead {
        self.unlink(id);
        self.heads.remove(id)
    }

    /// Take a buffer off its checkpoint list. Returns whether that finished
    /// the transaction's checkpoint.
    pub fn remove_checkpoint_head(&mut self, id: HeadId) -> bool {
        let Some(tid) = self.heads[id].cp_transaction.take() else {
            return false;
        };
        if let Some(t) = self.txns.get_mut(tid) {
            if let Some(pos) = t.checkpoint.iter().position(|&x| x == id) {
                t.checkpoint.swap_remove(pos);
            }
        }
        let released = self.txns.release_if_checkpointed(tid);
        if released {
            log::debug!("transaction {} fully checkpointed", tid);
        }
        self.maybe_free(id);
        released
    }

    /// Oldest transaction the log still has to keep, and where it starts.
    pub fn oldest_live(&self) -> (Tid, u32) {
        let head = self.log.head;
        if let Some(t) = self.txns.checkpoint.front() {
            return (t.tid, t.log_start.unwrap_or(head));
        }
        if let Some(t) = &self.txns.committing {
            return (t.tid, t.log_start.unwrap_or(head));
        }
        if let Some(t) = &self.txns.running {
            return (t.tid, t.log_start.unwrap_or(head));
        }
        (self.log.transaction_sequence, head)
    }

    /// Log blocks the running transaction (grown by `extra`) and the
    /// committing one may still claim.
    pub fn log_space_needed(&self, config: &JournalConfig, extra: u32) -> u32 {
        let running = self
            .txns
            .running
            .as_ref()
            .map_or(0, |t| t.outstanding_credits)
            + extra;
        let mut needed = config.log_space_for(running);
        if let Some(t) = &self.txns.committing {
            needed += config.log_space_for(t.outstanding_credits);
        }
        needed
    }
}

/// A journal over one block device
pub struct Journal {
    pub(crate) config: JournalConfig,
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) state: Mutex<JournalState>,
    /// Serializes superblock writes; never taken while holding `state`
    sb_lock: Mutex<()>,
    /// Open handles of a locked transaction dropped to zero
    pub(crate) wait_updates: Condvar,
    /// The running transaction was replaced
    pub(crate) wait_transaction_locked: Condvar,
    /// A commit finished or log space was released
    pub(crate) wait_commit: Condvar,
    /// Wakes the commit thread
    pub(crate) wait_commit_request: Condvar,
}

impl Journal {
    /// Format a fresh log and open it.
    pub fn create(cache: Arc<BufferCache>, config: JournalConfig) -> Result<Arc<Self>> {
        let device = cache.device().clone();
        config.validate_for(device.as_ref())?;
        if config.read_only {
            return Err(JournalError::ReadOnly);
        }

        let bs = config.block_size;
        let mut sb = JournalSuperblock::new(
            bs as u32,
            config.journal_blocks,
            *uuid::Uuid::new_v4().as_bytes(),
        );
        sb.max_transaction = config.max_transaction();
        if config.commit_checksum {
            sb.feature_compat |= JBD_FEATURE_COMPAT_CHECKSUM;
        }

        // Stale log blocks from an earlier journal must not look valid
        let zero = vec![0u8; bs];
        for block in 1..config.journal_blocks as u64 {
            device.write_block(config.journal_start + block, &zero)?;
        }
        device.write_block(config.journal_start, &sb.encode(bs)?)?;
        device.flush()?;

        log::info!(
            "created journal of {} blocks at block {}",
            config.journal_blocks,
            config.journal_start
        );
        Ok(Self::assemble(cache, config, sb))
    }

    /// Open an existing log, replaying it first if it is dirty.
    pub fn load(cache: Arc<BufferCache>, config: JournalConfig) -> Result<Arc<Self>> {
        let device = cache.device().clone();
        config.validate_for(device.as_ref())?;

        let bs = config.block_size;
        let mut block = vec![0u8; bs];
        device.read_block(config.journal_start, &mut block)?;
        let mut sb = JournalSuperblock::decode(&block)?;

        if sb.blocksize as usize != bs {
            return Err(JournalError::InvalidBlockSize {
                expected: bs,
                actual: sb.blocksize as usize,
            });
        }
        if sb.maxlen != config.journal_blocks || sb.first == 0 || sb.first >= sb.maxlen {
            return Err(JournalError::CorruptJournal(format!(
                "journal geometry first={} maxlen={} does not match {} configured blocks",
                sb.first, sb.maxlen, config.journal_blocks
            )));
        }
        if sb.errno != 0 {
            log::warn!("journal was aborted with error {}", sb.errno);
        }
        if config.commit_checksum {
            sb.feature_compat |= JBD_FEATURE_COMPAT_CHECKSUM;
        }

        if sb.start != 0 {
            if config.read_only {
                return Err(JournalError::ReadOnly);
            }
            let info = recovery::recover(device.as_ref(), config.journal_start, &sb)?;
            // Skip the sequence of a transaction that may be partly on disk
            sb.sequence = info.end_transaction.wrapping_add(1);
            sb.start = 0;
            sb.errno = 0;
            device.write_block(config.journal_start, &sb.encode(bs)?)?;
            device.flush()?;
        }

        Ok(Self::assemble(cache, config, sb))
    }

    fn assemble(cache: Arc<BufferCache>, config: JournalConfig, sb: JournalSuperblock) -> Arc<Self> {
        let log = LogState::new(sb.first, sb.maxlen, sb.sequence);
        let state = JournalState {
            heads: Slab::new(),
            by_block: HashMap::new(),
            txns: Transactions::default(),
            revoke: RevokeTable::new(),
            log,
            superblock: sb,
            flags: JournalFlags {
                flushed: true,
                ..Default::default()
            },
            errno: 0,
            stats: JournalStats::default(),
        };

        let journal = Arc::new(Self {
            device: cache.device().clone(),
            cache,
            config,
            state: Mutex::new(state),
            sb_lock: Mutex::new(()),
            wait_updates: Condvar::new(),
            wait_transaction_locked: Condvar::new(),
            wait_commit: Condvar::new(),
            wait_commit_request: Condvar::new(),
        });
        let hook: Weak<dyn WritebackHook> = Arc::downgrade(&journal) as Weak<dyn WritebackHook>;
        journal.cache.set_writeback_hook(hook);
        journal
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.state.lock().superblock.uuid
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().flags.aborted
    }

    pub fn errno(&self) -> i32 {
        self.state.lock().errno
    }

    pub fn log_state(&self) -> LogState {
        self.state.lock().log.clone()
    }

    pub fn running_transaction(&self) -> Option<TransactionInfo> {
        self.state.lock().txns.running.as_ref().map(TransactionInfo::from)
    }

    pub fn committing_transaction(&self) -> Option<TransactionInfo> {
        self.state.lock().txns.committing.as_ref().map(TransactionInfo::from)
    }

    /// Committed transactions still waiting for checkpoint, oldest first
    pub fn checkpoint_transactions(&self) -> Vec<TransactionInfo> {
        self.state
            .lock()
            .txns
            .checkpoint
            .iter()
            .map(TransactionInfo::from)
            .collect()
    }

    pub fn stats(&self) -> JournalStats {
        let st = self.state.lock();
        let mut stats = st.stats.clone();
        stats.current_tid = st
            .txns
            .running
            .as_ref()
            .map_or(st.log.transaction_sequence, |t| t.tid);
        stats.oldest_tid = st.log.tail_sequence;
        stats
    }

    /// Whether the buffer is attached to the journal in any way.
    pub fn is_journaled(&self, buffer: &BufferRef) -> bool {
        self.state.lock().lookup_head(buffer).is_some()
    }

    /// Transaction whose list currently holds the buffer, and which list.
    pub fn buffer_owner(&self, buffer: &BufferRef) -> Option<(Tid, BufferList)> {
        let st = self.state.lock();
        let id = st.lookup_head(buffer)?;
        let jh = &st.heads[id];
        jh.transaction.map(|tid| (tid, jh.list))
    }

    /// Committed transaction still waiting to write the buffer home.
    pub fn buffer_checkpoint(&self, buffer: &BufferRef) -> Option<Tid> {
        let st = self.state.lock();
        st.lookup_head(buffer)
            .and_then(|id| st.heads[id].cp_transaction)
    }

    /// Put the journal into the failed state. Later operations return
    /// `Aborted`; nothing more is written to the log.
    pub fn abort(&self) {
        let mut st = self.state.lock();
        self.abort_locked(&mut st);
    }

    pub(crate) fn abort_locked(&self, st: &mut JournalState) {
        if !st.flags.aborted {
            log::error!("aborting journal");
            st.flags.aborted = true;
            st.errno = EIO;
        }
        self.wait_updates.notify_all();
        self.wait_transaction_locked.notify_all();
        self.wait_commit.notify_all();
        self.wait_commit_request.notify_all();
    }

    /// Write the journal superblock. A clean superblock tells recovery the
    /// log holds nothing.
    pub(crate) fn write_superblock(&self, clean: bool) -> Result<()> {
        let _sb = self.sb_lock.lock();
        let block = {
            let mut st = self.state.lock();
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            st.superblock.sequence = st.log.tail_sequence;
            st.superblock.start = if clean { 0 } else { st.log.tail };
            st.superblock.errno = st.errno;
            st.superblock.encode(self.config.block_size)?
        };

        self.device.write_block(self.config.journal_start, &block)?;
        self.device.flush()?;
        self.state.lock().flags.flushed = clean;
        log::debug!("wrote {} journal superblock", if clean { "clean" } else { "dirty" });
        Ok(())
    }

    /// Move the log tail past transactions that no longer need recovery and
    /// hand their space back.
    pub fn cleanup_tail(&self) -> Result<()> {
        let _sb = self.sb_lock.lock();
        let (tid, blocknr) = {
            let st = self.state.lock();
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            let (tid, blocknr) = st.oldest_live();
            if !tid_gt(tid, st.log.tail_sequence) {
                return Ok(());
            }
            (tid, blocknr)
        };

        // Checkpoint writes must be durable before the log forgets them
        self.device.flush()?;

        let block = {
            let mut st = self.state.lock();
            st.superblock.sequence = tid;
            st.superblock.start = blocknr;
            st.superblock.errno = st.errno;
            st.superblock.encode(self.config.block_size)?
        };
        self.device.write_block(self.config.journal_start, &block)?;
        self.device.flush()?;

        let mut st = self.state.lock();
        let old_tail = st.log.tail;
        let live = st.log.distance(blocknr, st.log.head);
        st.log.free = st.log.capacity() - live;
        st.log.tail = blocknr;
        st.log.tail_sequence = tid;
        st.flags.flushed = false;
        log::debug!(
            "journal tail moved from {} to {} (transaction {}), {} blocks free",
            old_tail,
            blocknr,
            tid,
            st.log.free
        );
        drop(st);
        self.wait_commit.notify_all();
        Ok(())
    }

    /// Ask for `tid` to be committed. Without a commit thread the commit
    /// runs here.
    pub(crate) fn request_commit_locked(
        &self,
        st: &mut MutexGuard<'_, JournalState>,
        tid: Tid,
    ) -> Result<()> {
        if !tid_gt(tid, st.log.commit_sequence) {
            return Ok(());
        }
        if tid_gt(tid, st.log.commit_request) {
            st.log.commit_request = tid;
        }
        if st.flags.commit_thread {
            log::trace!("requesting commit of transaction {}", tid);
            self.wait_commit_request.notify_all();
            Ok(())
        } else {
            self.commit_locked(st, Some(tid))
        }
    }

    /// Block until `tid` is committed.
    pub fn wait_commit(&self, tid: Tid) -> Result<()> {
        let mut st = self.state.lock();
        if !tid_gt(st.log.transaction_sequence, tid) {
            return Err(JournalError::Other(format!(
                "transaction {} has not been started",
                tid
            )));
        }
        self.request_commit_locked(&mut st, tid)?;
        while tid_gt(tid, st.log.commit_sequence) {
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            if !st.flags.commit_thread {
                self.commit_locked(&mut st, Some(tid))?;
                continue;
            }
            self.wait_commit.wait(&mut st);
        }
        if st.flags.aborted {
            return Err(JournalError::Aborted);
        }
        Ok(())
    }

    /// Commit whatever is running now and wait for it.
    pub fn force_commit(&self) -> Result<()> {
        let tid = {
            let st = self.state.lock();
            st.txns
                .running
                .as_ref()
                .or(st.txns.committing.as_ref())
                .map(|t| t.tid)
        };
        match tid {
            Some(tid) => self.wait_commit(tid),
            None => Ok(()),
        }
    }

    /// Commit everything, checkpoint everything and mark the log clean.
    pub fn flush(&self) -> Result<()> {
        self.force_commit()?;
        loop {
            let mut st = self.state.lock();
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            if st.flags.commit_in_progress {
                self.wait_commit.wait(&mut st);
                continue;
            }
            if st.txns.checkpoint.is_empty() {
                break;
            }
            drop(st);
            self.do_checkpoint()?;
        }
        self.cleanup_tail()?;
        self.write_superblock(true)?;
        log::info!("journal flushed");
        Ok(())
    }

    /// Flush and shut the journal. Handles can no longer be started.
    pub fn destroy(&self) -> Result<()> {
        let result = if self.is_aborted() {
            Err(JournalError::Aborted)
        } else {
            self.flush()
        };
        self.state.lock().flags.unmounted = true;
        self.wait_commit_request.notify_all();
        log::info!("journal destroyed");
        result
    }
}

impl WritebackHook for Journal {
    fn buffer_written(&self, buffer: &BufferRef) {
        self.remove_checkpoint(buffer);
    }
}
