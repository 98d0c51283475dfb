// Transaction Commit
// Drives one transaction from Running through Locked, Flush and Commit to Finished

use crate::buffer::Buffer;
use crate::checksum::TransactionChecksum;
use crate::format::{encode_revoke_blocks, escape_block, needs_escape, CommitBlock, DescriptorBuilder};
use crate::journal::{Journal, JournalState};
use crate::transaction::{BufferList, HeadId, JournalHead, Tid, TransactionState};
use jbd_core::{JournalError, Result};
use parking_lot::MutexGuard;

type Guard<'a> = MutexGuard<'a, JournalState>;

/// Descriptor block being filled, with the log block reserved for it
struct OpenDescriptor {
    log_block: u32,
    builder: DescriptorBuilder,
    /// Log copies described so far
    copies: Vec<HeadId>,
}

impl Journal {
    /// Commit the running transaction, if there is one, and wait for it.
    pub fn commit(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.commit_locked(&mut st, None)
    }

    /// Commit the running transaction, or only `target` when given. Only one
    /// commit runs at a time.
    pub(crate) fn commit_locked(&self, st: &mut Guard<'_>, target: Option<Tid>) -> Result<()> {
        while st.flags.commit_in_progress {
            self.wait_commit.wait(st);
        }
        let tid = match st.txns.running.as_ref() {
            Some(t) => t.tid,
            None => return Ok(()),
        };
        if target.is_some_and(|target| target != tid) {
            return Ok(());
        }

        st.flags.commit_in_progress = true;
        let result = self.commit_transaction(st, tid);
        st.flags.commit_in_progress = false;
        self.wait_commit.notify_all();
        self.wait_transaction_locked.notify_all();
        result
    }

    fn commit_transaction(&self, st: &mut Guard<'_>, tid: Tid) -> Result<()> {
        let mut failure: Option<JournalError> = None;

        // Phase 1: no new handles, wait for the open ones
        if let Some(t) = st.txns.running.as_mut() {
            t.state = TransactionState::Locked;
        }
        log::debug!("commit phase 1: locking transaction {}", tid);
        while st.txns.running.as_ref().map_or(0, |t| t.updates) > 0 {
            self.wait_updates.wait(st);
        }
        if let Some(t) = st.txns.running.as_ref() {
            assert!(t.outstanding_credits <= self.config.max_transaction());
        }

        if st.flags.flushed && !st.flags.aborted {
            if let Err(e) = MutexGuard::unlocked(st, || self.write_superblock(false)) {
                self.fail(st, &mut failure, e);
            }
        }

        // Reserved but never modified buffers go back where they came from
        while let Some(id) = st.front_of(tid, BufferList::Reserved) {
            st.refile(id);
        }

        // Phase 2: revoke records
        let mut checksum = TransactionChecksum::new();
        let head = st.log.head;
        if let Some(t) = st.txns.running.as_mut() {
            t.log_start = Some(head);
        }
        let revoked = st.revoke.serialize(tid);
        if !revoked.is_empty() && !st.flags.aborted {
            let blocks = encode_revoke_blocks(tid, &revoked, self.config.block_size);
            let mut batch = Vec::with_capacity(blocks.len());
            for data in blocks {
                match st.log.next_block() {
                    Ok(log_block) => {
                        checksum.update(&data);
                        batch.push(self.new_log_head(st, tid, log_block, data, BufferList::LogControl, None));
                        st.stats.revoke_blocks += 1;
                    }
                    Err(e) => {
                        self.fail(st, &mut failure, e);
                        break;
                    }
                }
            }
            if let Err(e) = self.submit(st, &batch) {
                self.fail(st, &mut failure, e);
            }
            log::debug!(
                "commit phase 2: {} revoke records of transaction {} in {} blocks",
                revoked.len(),
                tid,
                batch.len()
            );
        }

        // Phase 3: become the committing transaction
        let Some(mut transaction) = st.txns.running.take() else {
            return Err(JournalError::Other(format!("transaction {} vanished", tid)));
        };
        transaction.state = TransactionState::Flush;
        st.txns.committing = Some(transaction);
        self.wait_transaction_locked.notify_all();
        log::debug!("commit phase 3: transaction {} is committing", tid);

        // Phase 4: ordered data reaches its home location first
        while let Some(id) = st.front_of(tid, BufferList::Data) {
            let buffer = st.heads[id].buffer.clone();
            if buffer.is_locked() {
                MutexGuard::unlocked(st, || buffer.wait_unlocked());
                continue;
            }
            if buffer.is_dirty() && !st.flags.aborted {
                if let Err(e) = MutexGuard::unlocked(st, || self.cache.write_buffer(&buffer)) {
                    self.fail(st, &mut failure, e);
                }
                continue;
            }
            st.refile(id);
        }

        // Phase 5: copy metadata into the log, one descriptor per batch
        if let Some(t) = st.txns.committing.as_mut() {
            t.state = TransactionState::Commit;
        }
        log::debug!("commit phase 5: logging metadata of transaction {}", tid);
        let mut descriptor: Option<OpenDescriptor> = None;
        loop {
            let next = st.front_of(tid, BufferList::Metadata);
            if let Some(id) = next {
                if st.flags.aborted {
                    st.file(id, tid, BufferList::Forget);
                } else if let Err(e) = self.log_metadata_buffer(st, tid, id, &mut descriptor) {
                    self.fail(st, &mut failure, e);
                }
            }

            let full = descriptor.as_ref().is_some_and(|d| {
                d.copies.len() >= self.config.batch_size() || !d.builder.has_space()
            });
            if next.is_none() || full {
                if let Some(d) = descriptor.take() {
                    if let Err(e) = self.write_descriptor(st, tid, d, &mut checksum) {
                        self.fail(st, &mut failure, e);
                    }
                }
            }
            if next.is_none() {
                break;
            }
        }

        // Phase 6: wait for the log writes, oldest first
        log::debug!("commit phase 6: waiting for log writes of transaction {}", tid);
        while let Some(io) = st.front_of(tid, BufferList::IoBuffer) {
            let copy = st.heads[io].buffer.clone();
            if copy.is_locked() {
                MutexGuard::unlocked(st, || copy.wait_unlocked());
                continue;
            }
            let jh = st.release_log_head(io);
            if let Some(original) = jh.shadow_of {
                st.file(original, tid, BufferList::Forget);
            }
        }
        assert!(st.front_of(tid, BufferList::Shadow).is_none());
        while let Some(id) = st.front_of(tid, BufferList::LogControl) {
            let block = st.heads[id].buffer.clone();
            if block.is_locked() {
                MutexGuard::unlocked(st, || block.wait_unlocked());
                continue;
            }
            st.release_log_head(id);
        }

        // Phase 7: the commit record, behind a barrier on both sides
        if !st.flags.aborted {
            let now = chrono::Utc::now();
            let record = CommitBlock {
                sequence: tid,
                checksum: st.superblock.has_checksum().then(|| checksum.value()),
                commit_sec: now.timestamp().max(0) as u64,
                commit_nsec: now.timestamp_subsec_nanos(),
            };
            match st.log.next_block() {
                Ok(log_block) => {
                    let block = record.encode(self.config.block_size);
                    let at = self.config.journal_start + log_block as u64;
                    let written = MutexGuard::unlocked(st, || -> Result<()> {
                        self.device.flush()?;
                        self.device.write_block(at, &block)?;
                        self.device.flush()
                    });
                    if let Err(e) = written {
                        self.fail(st, &mut failure, e);
                    }
                }
                Err(e) => self.fail(st, &mut failure, e),
            }
        }

        // Phase 8: logged buffers join this transaction's checkpoint list
        log::debug!("commit phase 8: checkpointing buffers of transaction {}", tid);
        let aborted = st.flags.aborted;
        while let Some(id) = st.front_of(tid, BufferList::Forget) {
            let buffer = st.heads[id].buffer.clone();
            {
                let jh = &mut st.heads[id];
                if jh.committed_data.is_some() {
                    jh.committed_data = jh.frozen_data.take();
                } else {
                    jh.frozen_data = None;
                }
            }
            if aborted {
                buffer.test_clear_jbd_dirty();
            }

            if buffer.is_jbd_dirty() {
                if st.heads[id].cp_transaction.is_some() {
                    st.remove_checkpoint_head(id);
                }
                st.heads[id].cp_transaction = Some(tid);
                if let Some(t) = st.txns.committing.as_mut() {
                    t.checkpoint.push(id);
                }
            } else if st.heads[id].cp_transaction.is_some() {
                // Freed by this transaction: the older copy never needs to go home
                st.remove_checkpoint_head(id);
            }
            st.refile(id);
        }

        let Some(mut transaction) = st.txns.committing.take() else {
            return Err(JournalError::Other(format!("transaction {} vanished", tid)));
        };
        assert!(transaction.lists_drained());
        transaction.state = TransactionState::Finished;
        st.log.commit_sequence = tid;
        if aborted {
            st.stats.transactions_aborted += 1;
        } else {
            st.stats.transactions_committed += 1;
        }

        if transaction.checkpoint.is_empty() {
            log::debug!("transaction {} finished with nothing to checkpoint", tid);
        } else {
            log::debug!(
                "transaction {} finished, {} buffers to checkpoint",
                tid,
                transaction.checkpoint.len()
            );
            st.txns.checkpoint.push_back(transaction);
        }
        self.wait_commit.notify_all();

        match failure {
            Some(e) => Err(e),
            None if aborted => Err(JournalError::Aborted),
            None => Ok(()),
        }
    }

    /// Copy one metadata buffer into a fresh log block and shadow the original.
    fn log_metadata_buffer(
        &self,
        st: &mut Guard<'_>,
        tid: Tid,
        id: HeadId,
        descriptor: &mut Option<OpenDescriptor>,
    ) -> Result<()> {
        if descriptor.is_none() {
            let log_block = st.log.next_block()?;
            *descriptor = Some(OpenDescriptor {
                log_block,
                builder: DescriptorBuilder::new(self.config.block_size, tid, st.superblock.uuid),
                copies: Vec::new(),
            });
        }

        let buffer = st.heads[id].buffer.clone();
        let mut copy = match &st.heads[id].frozen_data {
            Some(frozen) => frozen.to_vec(),
            None => buffer.data().to_vec(),
        };
        let escaped = needs_escape(&copy);
        if escaped {
            escape_block(&mut copy);
        }

        let log_block = st.log.next_block()?;
        let io = self.new_log_head(st, tid, log_block, copy, BufferList::IoBuffer, Some(id));
        st.file(id, tid, BufferList::Shadow);
        st.stats.blocks_logged += 1;

        if let Some(d) = descriptor.as_mut() {
            d.builder.push(buffer.blocknr() as u32, escaped);
            d.copies.push(io);
        }
        Ok(())
    }

    /// Finish a descriptor and submit it with the copies it describes.
    fn write_descriptor(
        &self,
        st: &mut Guard<'_>,
        tid: Tid,
        descriptor: OpenDescriptor,
        checksum: &mut TransactionChecksum,
    ) -> Result<()> {
        let block = descriptor.builder.finish();
        checksum.update(&block);
        for &io in &descriptor.copies {
            checksum.update(&st.heads[io].buffer.data());
        }

        let desc = self.new_log_head(st, tid, descriptor.log_block, block, BufferList::LogControl, None);
        st.stats.descriptor_blocks += 1;

        let mut batch = Vec::with_capacity(descriptor.copies.len() + 1);
        batch.push(desc);
        batch.extend(descriptor.copies);
        self.submit(st, &batch)
    }

    fn new_log_head(
        &self,
        st: &mut JournalState,
        tid: Tid,
        log_block: u32,
        data: Vec<u8>,
        list: BufferList,
        shadow_of: Option<HeadId>,
    ) -> HeadId {
        let buffer = Buffer::detached(self.config.journal_start + log_block as u64, data);
        let mut jh = JournalHead::new(buffer);
        jh.shadow_of = shadow_of;
        let id = st.heads.insert(jh);
        st.file(id, tid, list);
        id
    }

    /// Write log blocks in order with the journal lock dropped. Each block
    /// stays locked until its write completes.
    fn submit(&self, st: &mut Guard<'_>, ids: &[HeadId]) -> Result<()> {
        if ids.is_empty() || st.flags.aborted {
            return Ok(());
        }
        let blocks: Vec<_> = ids.iter().map(|&id| st.heads[id].buffer.clone()).collect();
        for block in &blocks {
            block.lock();
        }

        MutexGuard::unlocked(st, || {
            let mut result = Ok(());
            for block in &blocks {
                if result.is_ok() {
                    result = self.device.write_block(block.blocknr(), &block.data());
                }
                block.unlock();
            }
            result
        })
    }

    fn fail(&self, st: &mut JournalState, failure: &mut Option<JournalError>, e: JournalError) {
        log::error!("commit failed: {}", e);
        self.abort_locked(st);
        failure.get_or_insert(e);
    }
}
