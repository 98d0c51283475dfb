// Commit Thread
// Background committer woken by commit requests and by the commit interval

use crate::journal::Journal;
use crate::transaction::{tid_geq, tid_gt, TransactionState};
use jbd_core::{JournalError, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Owns the journal's commit thread. Dropping it stops the thread.
pub struct CommitThread {
    journal: Arc<Journal>,
    /// Background thread handle
    thread: Option<JoinHandle<()>>,
}

impl CommitThread {
    pub fn spawn(journal: Arc<Journal>) -> Result<Self> {
        {
            let mut st = journal.state.lock();
            if st.flags.commit_thread {
                return Err(JournalError::Other(
                    "commit thread already running".to_string(),
                ));
            }
            st.flags.commit_thread = true;
            st.flags.stop_thread = false;
        }

        let worker = journal.clone();
        let spawned = std::thread::Builder::new()
            .name("jbd-commit".to_string())
            .spawn(move || worker.commit_loop());
        match spawned {
            Ok(thread) => Ok(Self {
                journal,
                thread: Some(thread),
            }),
            Err(e) => {
                journal.state.lock().flags.commit_thread = false;
                Err(e.into())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.journal.state.lock().flags.stop_thread = true;
        self.journal.wait_commit_request.notify_all();
        if thread.join().is_err() {
            log::error!("commit thread panicked");
        }
    }
}

impl Drop for CommitThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Journal {
    /// Start committing in the background. Without this, commits run in the
    /// thread that asks for them.
    pub fn spawn_commit_thread(self: &Arc<Self>) -> Result<CommitThread> {
        CommitThread::spawn(self.clone())
    }

    fn commit_loop(&self) {
        let interval = Duration::from_millis(self.config.commit_interval_ms.max(1));
        let mut st = self.state.lock();
        log::info!("commit thread started, interval {:?}", interval);

        loop {
            if st.flags.stop_thread || st.flags.unmounted {
                break;
            }

            let due = match st.txns.running.as_ref() {
                Some(t) if t.state == TransactionState::Running => {
                    let requested = tid_geq(st.log.commit_request, t.tid)
                        && tid_gt(t.tid, st.log.commit_sequence);
                    let expired = t.start_time.elapsed() >= interval && !t.is_empty();
                    requested || expired
                }
                _ => false,
            };
            if due {
                if let Err(e) = self.commit_locked(&mut st, None) {
                    log::error!("background commit failed: {}", e);
                }
                continue;
            }

            self.wait_commit_request.wait_for(&mut st, interval);
        }

        st.flags.commit_thread = false;
        drop(st);
        self.wait_commit.notify_all();
        log::info!("commit thread stopped");
    }
}
