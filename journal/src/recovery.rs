// Journal Recovery
// Finds the committed tail of the log and replays it after a crash

use crate::checksum::TransactionChecksum;
use crate::format::{
    parse_descriptor, parse_revoke_block, unescape_block, CommitBlock, JournalHeader,
    JournalSuperblock, JBD_COMMIT_BLOCK, JBD_DESCRIPTOR_BLOCK, JBD_REVOKE_BLOCK,
};
use crate::revoke::RevokeTable;
use crate::transaction::{tid_gt, Tid};
use jbd_core::{BlockDevice, Result};

/// Recovery pass types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryPass {
    /// Find the last fully committed transaction
    Scan,
    /// Collect revoke records
    Revoke,
    /// Write logged blocks home
    Replay,
}

/// What a recovery run found and did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// First transaction in the log
    pub start_transaction: Tid,
    /// First transaction that is not fully committed
    pub end_transaction: Tid,
    /// Blocks written home
    pub nr_replays: u64,
    /// Revoke records read
    pub nr_revokes: u64,
    /// Logged blocks skipped because of a revoke
    pub nr_revoke_hits: u64,
}

struct LogWalker<'a> {
    device: &'a dyn BlockDevice,
    journal_start: u64,
    first: u32,
    last: u32,
    block_size: usize,
}

impl LogWalker<'_> {
    fn read(&self, log_block: u32, buf: &mut [u8]) -> Result<()> {
        self.device.read_block(self.journal_start + log_block as u64, buf)
    }

    fn advance(&self, log_block: u32) -> u32 {
        let next = log_block + 1;
        if next >= self.last {
            self.first
        } else {
            next
        }
    }
}

/// Replay a dirty log onto the device.
///
/// Only transactions whose commit block is present (with a matching
/// checksum, when the journal keeps them) are replayed. Running it again
/// over the same log gives the same result.
pub fn recover(
    device: &dyn BlockDevice,
    journal_start: u64,
    sb: &JournalSuperblock,
) -> Result<RecoveryInfo> {
    let walker = LogWalker {
        device,
        journal_start,
        first: sb.first,
        last: sb.maxlen,
        block_size: sb.blocksize as usize,
    };
    let mut info = RecoveryInfo {
        start_transaction: sb.sequence,
        end_transaction: sb.sequence,
        ..Default::default()
    };
    let mut revoke = RevokeTable::new();

    if sb.start == 0 {
        log::debug!("journal is clean, nothing to recover");
        return Ok(info);
    }

    do_one_pass(&walker, sb, &mut info, &mut revoke, RecoveryPass::Scan)?;
    do_one_pass(&walker, sb, &mut info, &mut revoke, RecoveryPass::Revoke)?;
    do_one_pass(&walker, sb, &mut info, &mut revoke, RecoveryPass::Replay)?;
    device.flush()?;

    log::info!(
        "recovery complete: transactions {} to {}, {} blocks replayed, {} revoke records, {} revoked blocks skipped",
        info.start_transaction,
        info.end_transaction.wrapping_sub(1),
        info.nr_replays,
        info.nr_revokes,
        info.nr_revoke_hits
    );
    Ok(info)
}

fn do_one_pass(
    walker: &LogWalker<'_>,
    sb: &JournalSuperblock,
    info: &mut RecoveryInfo,
    revoke: &mut RevokeTable,
    pass: RecoveryPass,
) -> Result<()> {
    let mut next_commit_id = sb.sequence;
    let mut next_log_block = sb.start;
    let mut checksum = TransactionChecksum::new();
    let mut block = vec![0u8; walker.block_size];
    let mut data = vec![0u8; walker.block_size];
    let capacity = (walker.last - walker.first) as u64;
    let mut visited: u64 = 0;

    loop {
        if pass != RecoveryPass::Scan && !tid_gt(info.end_transaction, next_commit_id) {
            break;
        }
        // A log never holds more blocks than it has
        if visited >= capacity {
            break;
        }

        walker.read(next_log_block, &mut block)?;
        next_log_block = walker.advance(next_log_block);
        visited += 1;

        let Some(header) = JournalHeader::read_from(&block) else {
            break;
        };
        if !header.is_valid() || header.sequence != next_commit_id {
            break;
        }

        match header.blocktype {
            JBD_DESCRIPTOR_BLOCK => {
                let tags = parse_descriptor(&block);
                if pass == RecoveryPass::Scan {
                    checksum.update(&block);
                }
                for tag in tags {
                    let at = next_log_block;
                    next_log_block = walker.advance(next_log_block);
                    visited += 1;

                    match pass {
                        RecoveryPass::Scan => {
                            if sb.has_checksum() {
                                walker.read(at, &mut data)?;
                                checksum.update(&data);
                            }
                        }
                        RecoveryPass::Revoke => {}
                        RecoveryPass::Replay => {
                            let target = tag.blocknr as u64;
                            if revoke.should_skip_on_replay(target, next_commit_id) {
                                info.nr_revoke_hits += 1;
                                continue;
                            }
                            walker.read(at, &mut data)?;
                            if tag.escaped() {
                                unescape_block(&mut data);
                            }
                            walker.device.write_block(target, &data)?;
                            info.nr_replays += 1;
                        }
                    }
                }
            }
            JBD_COMMIT_BLOCK => {
                if pass == RecoveryPass::Scan && sb.has_checksum() {
                    let recorded = CommitBlock::decode(&block).and_then(|c| c.checksum);
                    if recorded != Some(checksum.value()) {
                        log::warn!(
                            "commit block of transaction {} has a bad checksum, stopping there",
                            next_commit_id
                        );
                        break;
                    }
                }
                checksum = TransactionChecksum::new();
                next_commit_id = next_commit_id.wrapping_add(1);
            }
            JBD_REVOKE_BLOCK => match pass {
                RecoveryPass::Scan => checksum.update(&block),
                RecoveryPass::Revoke => {
                    for blocknr in parse_revoke_block(&block)? {
                        revoke.record(blocknr, next_commit_id);
                        info.nr_revokes += 1;
                    }
                }
                RecoveryPass::Replay => {}
            },
            other => {
                log::debug!("unexpected log block type {} ends the scan", other);
                break;
            }
        }
    }

    if pass == RecoveryPass::Scan {
        info.end_transaction = next_commit_id;
        log::debug!(
            "scan found transactions {} up to {}",
            info.start_transaction,
            next_commit_id
        );
    }
    Ok(())
}
