// Revoke Table
// Blocks whose logged copies must not be replayed

use crate::transaction::{tid_gt, Tid};
use std::collections::HashMap;

/// Block number to revoking transaction.
///
/// While running, the table only ever holds records of the running
/// transaction: the committing transaction drains its own records before a new
/// transaction may start. During recovery it holds the newest revoking
/// sequence seen for each block.
#[derive(Debug, Default)]
pub struct RevokeTable {
    records: HashMap<u64, Tid>,
}

impl RevokeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revoke, keeping the newest transaction if one already exists.
    pub fn record(&mut self, blocknr: u64, tid: Tid) {
        self.records
            .entry(blocknr)
            .and_modify(|existing| {
                if tid_gt(tid, *existing) {
                    *existing = tid;
                }
            })
            .or_insert(tid);
    }

    /// Drop a revoke when the block is journaled again by the same transaction.
    pub fn cancel(&mut self, blocknr: u64, tid: Tid) -> bool {
        if self.records.get(&blocknr) == Some(&tid) {
            self.records.remove(&blocknr);
            return true;
        }
        false
    }

    pub fn contains(&self, blocknr: u64) -> bool {
        self.records.contains_key(&blocknr)
    }

    /// Take out every record of `tid`, sorted by block number.
    pub fn serialize(&mut self, tid: Tid) -> Vec<u64> {
        let mut blocks: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, &owner)| owner == tid)
            .map(|(&block, _)| block)
            .collect();
        blocks.sort_unstable();
        for block in &blocks {
            self.records.remove(block);
        }
        blocks
    }

    /// Replay must skip a logged copy written by a transaction older than
    /// the one that revoked the block.
    pub fn should_skip_on_replay(&self, blocknr: u64, sequence: Tid) -> bool {
        match self.records.get(&blocknr) {
            Some(&revoked_by) => tid_gt(revoked_by, sequence),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
