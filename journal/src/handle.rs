// Transaction Handles
// Credit reservation and buffer access for client operations

use crate::buffer::BufferRef;
use crate::journal::{Journal, JournalState};
use crate::transaction::{BufferList, Tid, Transaction, TransactionState};
use crate::JournalMode;
use jbd_core::{JournalError, Result};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// One client operation's share of the running transaction
pub struct Handle {
    /// Journal reference
    journal: Arc<Journal>,
    /// Transaction ID
    tid: Tid,
    /// Credits not yet spent on new buffers
    credits: u32,
    /// Wait for the commit when the handle stops
    sync: bool,
    /// Is this handle active?
    active: bool,
}

impl Handle {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Make `stop` wait until the transaction is durable.
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    fn take_over(&mut self, mut other: Handle) {
        self.tid = other.tid;
        self.credits = other.credits;
        self.active = true;
        other.active = false;
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("tid", &self.tid)
            .field("credits", &self.credits)
            .field("sync", &self.sync)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            let journal = self.journal.clone();
            if let Err(e) = journal.stop_handle(self) {
                log::warn!("stopping handle of transaction {} failed: {}", self.tid, e);
            }
        }
    }
}

impl Journal {
    /// Join the running transaction with `nblocks` credits, starting a
    /// transaction if none is running.
    pub fn start(self: &Arc<Self>, nblocks: u32) -> Result<Handle> {
        if self.config.read_only {
            return Err(JournalError::ReadOnly);
        }
        let max = self.config.max_transaction();
        if nblocks > max {
            return Err(JournalError::TransactionTooLarge {
                requested: nblocks,
                max,
            });
        }

        let mut st = self.state.lock();
        let tid = loop {
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            if st.flags.unmounted {
                return Err(JournalError::ReadOnly);
            }

            if st.txns.running.is_none() {
                let tid = st.log.transaction_sequence;
                st.log.transaction_sequence = tid.wrapping_add(1);
                st.txns.running = Some(Transaction::new(tid));
                st.stats.transactions_started += 1;
                log::debug!("started transaction {}", tid);
            }
            let (tid, state, outstanding) = match st.txns.running.as_ref() {
                Some(t) => (t.tid, t.state, t.outstanding_credits),
                None => continue,
            };

            if state != TransactionState::Running {
                self.wait_transaction_locked.wait(&mut st);
                continue;
            }

            if outstanding + nblocks > max {
                log::debug!(
                    "transaction {} is full ({} + {} credits), committing",
                    tid,
                    outstanding,
                    nblocks
                );
                self.request_commit_locked(&mut st, tid)?;
                if st.txns.running.as_ref().map(|t| t.tid) == Some(tid) {
                    self.wait_transaction_locked.wait(&mut st);
                }
                continue;
            }

            if st.log.free < st.log_space_needed(&self.config, nblocks) {
                self.wait_for_space(&mut st)?;
                continue;
            }

            break tid;
        };

        if let Some(t) = st.txns.running.as_mut() {
            t.updates += 1;
            t.handle_count += 1;
            t.outstanding_credits += nblocks;
        }
        Ok(Handle {
            journal: self.clone(),
            tid,
            credits: nblocks,
            sync: false,
            active: true,
        })
    }

    /// Try to add credits to a handle without blocking. `Ok(false)` means
    /// the transaction is too full and the caller should restart.
    pub fn extend(&self, handle: &mut Handle, nblocks: u32) -> Result<bool> {
        check_active(handle)?;
        let mut st = self.state.lock();
        if st.flags.aborted {
            return Err(JournalError::Aborted);
        }

        let max = self.config.max_transaction();
        let needed = st.log_space_needed(&self.config, nblocks);
        let free = st.log.free;
        let reserve = self.config.reserve_credits;
        let Some(t) = st.txns.running.as_mut().filter(|t| t.tid == handle.tid) else {
            return Ok(false);
        };
        if t.state != TransactionState::Running {
            return Ok(false);
        }

        let headroom = max.saturating_sub(t.outstanding_credits);
        if headroom < nblocks.saturating_add(reserve) {
            log::debug!(
                "cannot extend handle of transaction {} by {}: {} credits of headroom",
                t.tid,
                nblocks,
                headroom
            );
            return Ok(false);
        }
        if free < needed {
            return Ok(false);
        }

        t.outstanding_credits += nblocks;
        handle.credits += nblocks;
        Ok(true)
    }

    /// Commit the handle's transaction and continue in a new one with
    /// `nblocks` credits.
    pub fn restart(self: &Arc<Self>, handle: &mut Handle, nblocks: u32) -> Result<()> {
        check_active(handle)?;
        let old = handle.tid;
        {
            let mut st = self.state.lock();
            release_handle(&mut st, handle);
            handle.credits = 0;
            handle.active = false;
            self.wait_updates.notify_all();

            log::debug!("restarting handle of transaction {}", old);
            self.request_commit_locked(&mut st, old)?;
            while st.txns.running.as_ref().map(|t| t.tid) == Some(old) {
                if st.flags.aborted {
                    return Err(JournalError::Aborted);
                }
                self.wait_transaction_locked.wait(&mut st);
            }
        }

        let fresh = self.start(nblocks)?;
        handle.take_over(fresh);
        Ok(())
    }

    /// Give back unused credits and leave the transaction.
    pub fn stop(&self, mut handle: Handle) -> Result<()> {
        check_active(&handle)?;
        handle.active = false;
        self.stop_handle(&handle)
    }

    pub(crate) fn stop_handle(&self, handle: &Handle) -> Result<()> {
        let mut st = self.state.lock();
        release_handle(&mut st, handle);
        self.wait_updates.notify_all();
        if st.flags.aborted {
            return Err(JournalError::Aborted);
        }
        drop(st);

        if handle.sync {
            self.wait_commit(handle.tid)?;
        }
        Ok(())
    }

    /// Declare intent to modify a buffer as metadata of this transaction.
    pub fn get_write_access(&self, handle: &mut Handle, buffer: &BufferRef) -> Result<()> {
        check_active(handle)?;
        let mut st = self.state.lock();
        self.do_get_write_access(&mut st, handle.tid, buffer)?;
        Ok(())
    }

    /// Write access that also keeps the last committed contents, for
    /// allocators that must not reuse anything freed since the last commit.
    pub fn get_undo_access(&self, handle: &mut Handle, buffer: &BufferRef) -> Result<()> {
        check_active(handle)?;
        let mut st = self.state.lock();
        let id = self.do_get_write_access(&mut st, handle.tid, buffer)?;
        if st.heads[id].committed_data.is_none() {
            let copy = buffer.data().to_vec().into_boxed_slice();
            st.heads[id].committed_data = Some(copy);
        }
        Ok(())
    }

    /// Contents as of the last commit, if undo access kept them.
    pub fn committed_data(&self, buffer: &BufferRef) -> Option<Vec<u8>> {
        let st = self.state.lock();
        let id = st.lookup_head(buffer)?;
        st.heads[id].committed_data.as_ref().map(|d| d.to_vec())
    }

    fn do_get_write_access(
        &self,
        st: &mut MutexGuard<'_, JournalState>,
        tid: Tid,
        buffer: &BufferRef,
    ) -> Result<usize> {
        loop {
            if st.flags.aborted {
                return Err(JournalError::Aborted);
            }
            if buffer.is_locked() {
                MutexGuard::unlocked(st, || buffer.wait_unlocked());
                continue;
            }
            break;
        }

        let id = st.head_for(buffer);
        if st.revoke.cancel(buffer.blocknr(), tid) {
            log::trace!("write access to block {} cancels its revoke", buffer.blocknr());
        }

        let owner = st.heads[id].transaction;
        if owner == Some(tid) || st.heads[id].next_transaction == Some(tid) {
            return Ok(id);
        }

        // Dirty from ordinary write-back: the journal owns it from now on
        if buffer.test_clear_dirty() {
            buffer.set_jbd_dirty();
        }

        match owner {
            None => st.file(id, tid, BufferList::Reserved),
            Some(owner) => {
                // Owned by the committing transaction. If it has not copied
                // the buffer to the log yet, keep the contents it must log.
                let jh = &mut st.heads[id];
                if jh.list == BufferList::Metadata && jh.frozen_data.is_none() {
                    log::trace!(
                        "freezing block {} for transaction {}",
                        buffer.blocknr(),
                        owner
                    );
                    jh.frozen_data = Some(buffer.data().to_vec().into_boxed_slice());
                }
                jh.next_transaction = Some(tid);
                jh.next_list = BufferList::Reserved;
            }
        }
        Ok(id)
    }

    /// Mark a buffer with write access as modified metadata. The first
    /// modification in a transaction spends one credit.
    pub fn dirty_metadata(&self, handle: &mut Handle, buffer: &BufferRef) -> Result<()> {
        check_active(handle)?;
        let mut st = self.state.lock();
        if st.flags.aborted {
            return Err(JournalError::Aborted);
        }
        let Some(id) = st.lookup_head(buffer) else {
            return Err(no_write_access(buffer));
        };

        let tid = handle.tid;
        let jh = &mut st.heads[id];
        if jh.transaction == Some(tid) {
            if jh.list == BufferList::Metadata {
                buffer.set_jbd_dirty();
                return Ok(());
            }
            spend_credit(handle)?;
            buffer.set_jbd_dirty();
            st.file(id, tid, BufferList::Metadata);
        } else if jh.next_transaction == Some(tid) {
            if jh.next_list != BufferList::Metadata {
                spend_credit(handle)?;
                jh.next_list = BufferList::Metadata;
            }
            buffer.set_jbd_dirty();
        } else {
            return Err(no_write_access(buffer));
        }
        Ok(())
    }

    /// Mark a data block modified, handled according to the journal mode.
    pub fn dirty_data(&self, handle: &mut Handle, buffer: &BufferRef) -> Result<()> {
        check_active(handle)?;
        match self.config.mode {
            JournalMode::Journal => {
                self.get_write_access(handle, buffer)?;
                self.dirty_metadata(handle, buffer)
            }
            JournalMode::Writeback => {
                buffer.mark_dirty();
                Ok(())
            }
            JournalMode::Ordered => {
                let mut st = self.state.lock();
                if st.flags.aborted {
                    return Err(JournalError::Aborted);
                }
                buffer.mark_dirty();
                let tid = handle.tid;
                let id = st.head_for(buffer);
                match st.heads[id].transaction {
                    Some(owner) if owner == tid => {}
                    None => st.file(id, tid, BufferList::Data),
                    Some(_) => {
                        let jh = &mut st.heads[id];
                        if jh.next_transaction != Some(tid) {
                            jh.next_transaction = Some(tid);
                            jh.next_list = BufferList::Data;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// The block was freed by this transaction: drop pending writes of it.
    pub fn forget(&self, handle: &mut Handle, buffer: &BufferRef) -> Result<()> {
        check_active(handle)?;
        let mut st = self.state.lock();
        if st.flags.aborted {
            return Err(JournalError::Aborted);
        }
        forget_locked(&mut st, handle.tid, buffer);
        Ok(())
    }

    /// Forbid replay of older logged copies of `blocknr`.
    pub fn revoke(
        &self,
        handle: &mut Handle,
        blocknr: u64,
        buffer: Option<&BufferRef>,
    ) -> Result<()> {
        check_active(handle)?;
        let buffer = match buffer {
            Some(b) if b.blocknr() != blocknr => {
                return Err(JournalError::Other(format!(
                    "revoking block {} through buffer of block {}",
                    blocknr,
                    b.blocknr()
                )))
            }
            Some(b) => Some(b.clone()),
            None => self.cache.lookup(blocknr),
        };

        let mut st = self.state.lock();
        if st.flags.aborted {
            return Err(JournalError::Aborted);
        }
        if let Some(buffer) = &buffer {
            forget_locked(&mut st, handle.tid, buffer);
        }
        st.revoke.record(blocknr, handle.tid);
        if let Some(t) = st.txns.get_mut(handle.tid) {
            t.revokes += 1;
        }
        log::trace!("transaction {} revoked block {}", handle.tid, blocknr);
        Ok(())
    }
}

fn check_active(handle: &Handle) -> Result<()> {
    if !handle.active {
        return Err(JournalError::Other("transaction handle not active".to_string()));
    }
    Ok(())
}

fn spend_credit(handle: &mut Handle) -> Result<()> {
    if handle.credits == 0 {
        return Err(JournalError::CreditsExhausted);
    }
    handle.credits -= 1;
    Ok(())
}

fn no_write_access(buffer: &BufferRef) -> JournalError {
    JournalError::Other(format!(
        "block {} modified without write access",
        buffer.blocknr()
    ))
}

/// Drop the handle's update and its unused credits from its transaction.
fn release_handle(st: &mut JournalState, handle: &Handle) {
    if let Some(t) = st.txns.get_mut(handle.tid) {
        t.updates = t.updates.saturating_sub(1);
        t.outstanding_credits = t.outstanding_credits.saturating_sub(handle.credits);
    }
}

fn forget_locked(st: &mut JournalState, tid: Tid, buffer: &BufferRef) {
    let Some(id) = st.lookup_head(buffer) else {
        buffer.test_clear_dirty();
        return;
    };

    let (owner, cp_transaction) = {
        let jh = &st.heads[id];
        (jh.transaction, jh.cp_transaction)
    };
    match owner {
        Some(t) if t == tid => {
            buffer.test_clear_dirty();
            buffer.test_clear_jbd_dirty();
            if cp_transaction.is_some() {
                // Still on an older checkpoint list; the commit takes it off
                st.file(id, tid, BufferList::Forget);
            } else {
                st.unfile(id);
                st.maybe_free(id);
            }
        }
        Some(_) => {
            // The committing transaction still writes this buffer
            let jh = &mut st.heads[id];
            if jh.next_transaction == Some(tid) {
                jh.next_transaction = None;
                jh.next_list = BufferList::Reserved;
            }
        }
        // A committed copy is waiting for checkpoint; it must reach home
        None if cp_transaction.is_some() => {}
        None => {
            buffer.test_clear_dirty();
            st.maybe_free(id);
        }
    }
}
