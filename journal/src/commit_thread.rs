// Commit Thread
// Background committer woken by durability requests or the commit interval

use jcommit_core::JournalResult;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::commit;
use crate::journal::{tid_gt, Journal};

/// Owns the background thread that commits the running transaction.
/// Dropping it stops the thread; callers waiting for durability then
/// commit on their own threads.
pub struct CommitThread {
    journal: Arc<Journal>,
    handle: Option<JoinHandle<()>>,
}

impl CommitThread {
    /// Start the commit thread for `journal`. Only one may be attached.
    pub fn spawn(journal: Arc<Journal>) -> JournalResult<Self> {
        journal.attach_commit_thread()?;

        let worker = journal.clone();
        let handle = thread::Builder::new()
            .name("jbd2-commit".to_string())
            .spawn(move || Self::commit_loop(worker));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                journal.detach_commit_thread();
                return Err(e.into());
            }
        };

        log::debug!("Commit thread started");
        Ok(Self {
            journal,
            handle: Some(handle),
        })
    }

    fn commit_loop(journal: Arc<Journal>) {
        let interval = Duration::from_millis(journal.config().commit_interval_ms.max(1));
        loop {
            {
                let mut state = journal.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let aborted = journal.is_aborted();
                    let requested = tid_gt(state.commit_request, state.commit_sequence);
                    if !aborted && requested && state.running.is_some() {
                        break;
                    }
                    let timed_out = journal.commit_wakeup.wait_for(&mut state, interval).timed_out();
                    if timed_out && !aborted && !state.shutdown && state.running.is_some() {
                        break;
                    }
                }
            }

            match commit::commit_transaction(&journal) {
                Ok(Some(tid)) => log::trace!("Commit thread committed transaction {}", tid),
                Ok(None) => {}
                Err(e) => log::error!("Commit thread: commit failed: {}", e),
            }
        }
    }

    /// Stop the thread, letting an in-progress commit finish first.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut state = self.journal.state.lock();
            state.shutdown = true;
            self.journal.commit_wakeup.notify_all();
        }
        if handle.join().is_err() {
            log::error!("Commit thread panicked");
        }
        self.journal.detach_commit_thread();
        log::debug!("Commit thread stopped");
    }
}

impl Drop for CommitThread {
    fn drop(&mut self) {
        self.stop();
    }
}
