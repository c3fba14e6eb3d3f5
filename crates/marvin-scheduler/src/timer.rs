//! Wall-clock access and cancellable single-shot timers.

use chrono::Utc;
use tokio::task::JoinHandle;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Longest single timer sleep. Longer waits re-arm in slices so
/// platform timer caps and wall-clock jumps cannot strand a job.
pub(crate) const MAX_TIMER_SLICE_MS: i64 = 24 * 60 * 60 * 1000;

/// Sleep until `target_ms`, re-checking the wall clock on each wake.
pub(crate) async fn sleep_until_ms(target_ms: i64) {
    loop {
        let remaining = target_ms - now_ms();
        if remaining <= 0 {
            return;
        }
        let slice = remaining.min(MAX_TIMER_SLICE_MS).max(1) as u64;
        tokio::time::sleep(std::time::Duration::from_millis(slice)).await;
    }
}

/// Cancellable handle to a spawned timer or cron tick task.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Abort the underlying task. Callers always hold the serializer
    /// lock here, and a fire callback's first await is that same lock,
    /// so an aborted callback can never re-enter engine state.
    pub(crate) fn cancel(&self) {
        self.task.abort();
    }
}
