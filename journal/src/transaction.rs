// Transaction Model
// Transactions, their buffer lists and the per-buffer journal head

use crate::buffer::BufferRef;
use std::collections::VecDeque;
use std::time::Instant;

/// Transaction sequence number. Compared with wrapping arithmetic.
pub type Tid = u32;

/// Index of a journal head in the journal's arena
pub(crate) type HeadId = usize;

/// `x` is newer than `y`
pub fn tid_gt(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) > 0
}

/// `x` is `y` or newer
pub fn tid_geq(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) >= 0
}

/// Transaction states, in the order a transaction passes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransactionState {
    /// Accepting new handles
    Running,
    /// No new handles; waiting for open ones to stop
    Locked,
    /// Writing ordered data out
    Flush,
    /// Writing metadata and the commit record to the log
    Commit,
    /// Durable; only checkpointing remains
    Finished,
}

/// Which list of its owning transaction a buffer sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferList {
    None,
    /// Write access taken, not yet modified
    Reserved,
    /// Ordered data to flush before the commit record
    Data,
    /// Modified metadata to log
    Metadata,
    /// Logged or forgotten, awaiting checkpoint insertion
    Forget,
    /// Original buffer whose copy is being written to the log
    Shadow,
    /// Log copy of a metadata buffer
    IoBuffer,
    /// Descriptor and revoke blocks
    LogControl,
}

/// Journal bookkeeping attached to one buffer
pub(crate) struct JournalHead {
    pub buffer: BufferRef,
    /// Transaction whose list holds this buffer
    pub transaction: Option<Tid>,
    /// Running transaction waiting to take the buffer over from the committing one
    pub next_transaction: Option<Tid>,
    /// List to join when handed over to `next_transaction`
    pub next_list: BufferList,
    pub list: BufferList,
    /// Committed transaction whose checkpoint still needs this buffer written home
    pub cp_transaction: Option<Tid>,
    /// Contents to log, captured when a newer transaction modified the buffer
    /// while the committing one still had to copy it
    pub frozen_data: Option<Box<[u8]>>,
    /// Last committed contents, kept for undo-aware allocators
    pub committed_data: Option<Box<[u8]>>,
    /// For a log copy: the original buffer it shadows
    pub shadow_of: Option<HeadId>,
}

impl JournalHead {
    pub fn new(buffer: BufferRef) -> Self {
        Self {
            buffer,
            transaction: None,
            next_transaction: None,
            next_list: BufferList::Reserved,
            list: BufferList::None,
            cp_transaction: None,
            frozen_data: None,
            committed_data: None,
            shadow_of: None,
        }
    }

    /// Nothing references this head any more.
    pub fn is_idle(&self) -> bool {
        self.transaction.is_none()
            && self.next_transaction.is_none()
            && self.cp_transaction.is_none()
            && self.list == BufferList::None
    }
}

/// One atomic group of buffer updates
pub(crate) struct Transaction {
    pub tid: Tid,
    pub state: TransactionState,

    pub reserved: VecDeque<HeadId>,
    pub data: VecDeque<HeadId>,
    pub metadata: VecDeque<HeadId>,
    pub forget: VecDeque<HeadId>,
    pub shadow: VecDeque<HeadId>,
    pub io: VecDeque<HeadId>,
    pub log_ctl: VecDeque<HeadId>,

    /// Buffers still to be written home before the log space can be reused
    pub checkpoint: Vec<HeadId>,

    /// Credits reserved by handles, used or not
    pub outstanding_credits: u32,
    /// Open handles
    pub updates: u32,
    pub handle_count: u32,
    /// First log block this transaction wrote
    pub log_start: Option<u32>,
    pub start_time: Instant,
    /// Buffers ever filed on the metadata list
    pub nr_buffers: u32,
    pub revokes: u32,
}

impl Transaction {
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            state: TransactionState::Running,
            reserved: VecDeque::new(),
            data: VecDeque::new(),
            metadata: VecDeque::new(),
            forget: VecDeque::new(),
            shadow: VecDeque::new(),
            io: VecDeque::new(),
            log_ctl: VecDeque::new(),
            checkpoint: Vec::new(),
            outstanding_credits: 0,
            updates: 0,
            handle_count: 0,
            log_start: None,
            start_time: Instant::now(),
            nr_buffers: 0,
            revokes: 0,
        }
    }

    pub fn list_mut(&mut self, list: BufferList) -> Option<&mut VecDeque<HeadId>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&mut self.reserved),
            BufferList::Data => Some(&mut self.data),
            BufferList::Metadata => Some(&mut self.metadata),
            BufferList::Forget => Some(&mut self.forget),
            BufferList::Shadow => Some(&mut self.shadow),
            BufferList::IoBuffer => Some(&mut self.io),
            BufferList::LogControl => Some(&mut self.log_ctl),
        }
    }

    pub fn list(&self, list: BufferList) -> Option<&VecDeque<HeadId>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&self.reserved),
            BufferList::Data => Some(&self.data),
            BufferList::Metadata => Some(&self.metadata),
            BufferList::Forget => Some(&self.forget),
            BufferList::Shadow => Some(&self.shadow),
            BufferList::IoBuffer => Some(&self.io),
            BufferList::LogControl => Some(&self.log_ctl),
        }
    }

    /// Every primary list is empty.
    pub fn lists_drained(&self) -> bool {
        self.reserved.is_empty()
            && self.data.is_empty()
            && self.metadata.is_empty()
            && self.forget.is_empty()
            && self.shadow.is_empty()
            && self.io.is_empty()
            && self.log_ctl.is_empty()
    }

    /// Nothing worth committing was recorded.
    pub fn is_empty(&self) -> bool {
        self.nr_buffers == 0 && self.revokes == 0 && self.data.is_empty() && self.forget.is_empty()
    }
}

/// Running, committing and checkpointing transactions
#[derive(Default)]
pub(crate) struct Transactions {
    pub running: Option<Transaction>,
    pub committing: Option<Transaction>,
    /// Committed transactions with checkpoint work left, oldest first
    pub checkpoint: VecDeque<Transaction>,
}

impl Transactions {
    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Transaction> {
        if let Some(t) = self.running.as_mut().filter(|t| t.tid == tid) {
            return Some(t);
        }
        if let Some(t) = self.committing.as_mut().filter(|t| t.tid == tid) {
            return Some(t);
        }
        self.checkpoint.iter_mut().find(|t| t.tid == tid)
    }

    pub fn get(&self, tid: Tid) -> Option<&Transaction> {
        self.running
            .iter()
            .chain(self.committing.iter())
            .chain(self.checkpoint.iter())
            .find(|t| t.tid == tid)
    }

    /// Drop a checkpointed transaction whose buffers have all gone home.
    pub fn release_if_checkpointed(&mut self, tid: Tid) -> bool {
        let position = self.checkpoint.iter().position(|t| {
            t.tid == tid && t.state == TransactionState::Finished && t.checkpoint.is_empty()
        });
        match position {
            Some(index) => {
                self.checkpoint.remove(index);
                true
            }
            None => false,
        }
    }
}
