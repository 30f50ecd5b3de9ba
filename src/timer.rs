//! Stop-debounce timer.
//!
//! At most one timer is armed at a time. Arming replaces (aborts) the previous
//! one and cancelling aborts the task, so a cancelled timer never fires. The
//! engine's generation check stays in place for fires already queued.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

/// A single abortable, generation-tagged sleep task.
#[derive(Debug, Default)]
pub struct StopTimer {
    pending: Option<(u64, JoinHandle<()>)>,
}

impl StopTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer. `on_fire` runs after `delay` unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&mut self, generation: u64, delay: Duration, on_fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.abort_pending();
        debug!(
            "[StopTimer] Arming #{} for {}ms",
            generation,
            delay.as_millis()
        );
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation).await;
        });
        self.pending = Some((generation, handle));
    }

    /// Abort the timer if `generation` is the one armed.
    pub fn cancel(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some((armed, _)) if *armed == generation => {
                self.abort_pending();
                true
            }
            _ => false,
        }
    }

    /// Generation of the armed timer, if it has not completed.
    pub fn armed(&self) -> Option<u64> {
        self.pending
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(generation, _)| *generation)
    }

    fn abort_pending(&mut self) {
        if let Some((generation, handle)) = self.pending.take() {
            if !handle.is_finished() {
                debug!("[StopTimer] Aborting #{}", generation);
            }
            handle.abort();
        }
    }
}

impl Drop for StopTimer {
    fn drop(&mut self) {
        self.abort_pending();
    }
}
