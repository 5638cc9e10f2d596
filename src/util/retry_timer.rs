use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

const IDLE: u8 = 0;
const TIMING: u8 = 1;

/// A single-shot, cancelable delay. Each schedule returns a token that is passed to the expiration
///  callback, so the owner can recognize expirations that were superseded while they were queued
///  somewhere on the way to being handled.
///
/// There are two ways to cancel: [RetryTimer::cancel_sync] waits until an expiration callback that
///  is already running has completed (or until it is guaranteed not to run), [RetryTimer::cancel]
///  returns immediately and relies on the token for filtering a callback that slipped through.
pub struct RetryTimer {
    last_id: u32,
    state: Arc<AtomicU8>,
    task: Option<JoinHandle<()>>,
}

impl Default for RetryTimer {
    fn default() -> Self {
        RetryTimer::new()
    }
}

impl RetryTimer {
    pub fn new() -> RetryTimer {
        RetryTimer {
            last_id: 0,
            state: Arc::new(AtomicU8::new(IDLE)),
            task: None,
        }
    }

    pub fn is_timing(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMING
    }

    /// Only one expiration can be outstanding: scheduling while a previous schedule has neither
    ///  fired nor been canceled is an error.
    pub fn schedule<F>(&mut self, delay: Duration, on_expire: F) -> anyhow::Result<u32>
    where F: FnOnce(u32) + Send + 'static
    {
        if self.is_timing() {
            bail!("timer is not idle");
        }

        self.last_id = next_timer_id(self.last_id);
        let id = self.last_id;

        // a fresh state per schedule, so a straggling previous task can not touch this one
        let state = Arc::new(AtomicU8::new(TIMING));
        self.state = state.clone();

        self.task = Some(tokio::spawn(async move {
            sleep(delay).await;
            if state.compare_exchange(TIMING, IDLE, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                trace!("timer {} expired", id);
                on_expire(id);
            }
        }));
        Ok(id)
    }

    pub fn cancel(&mut self) {
        self.state.store(IDLE, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub async fn cancel_sync(&mut self) {
        self.state.store(IDLE, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
            // an aborted task is only reported as finished once it is no longer running
            let _ = task.await;
        }
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn next_timer_id(id: u32) -> u32 {
    if id == u32::MAX {
        1
    }
    else {
        id + 1
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;
    use super::*;

    fn callback(sender: &mpsc::UnboundedSender<u32>) -> impl FnOnce(u32) + Send + 'static {
        let sender = sender.clone();
        move |id| { let _ = sender.send(id); }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once_after_delay() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut timer = RetryTimer::new();

        let id = timer.schedule(Duration::from_millis(100), callback(&sender)).unwrap();
        assert_eq!(id, 1);
        assert!(timer.is_timing());

        sleep(Duration::from_millis(99)).await;
        assert!(receiver.try_recv().is_err());

        sleep(Duration::from_millis(2)).await;
        assert_eq!(receiver.try_recv().unwrap(), 1);
        assert!(!timer.is_timing());

        sleep(Duration::from_millis(500)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_while_timing_fails() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut timer = RetryTimer::new();

        timer.schedule(Duration::from_millis(100), callback(&sender)).unwrap();
        assert!(timer.schedule(Duration::from_millis(10), callback(&sender)).is_err());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(receiver.try_recv().unwrap(), 1);
        assert!(receiver.try_recv().is_err());

        // idle again after expiry
        let id = timer.schedule(Duration::from_millis(10), callback(&sender)).unwrap();
        assert_eq!(id, 2);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(receiver.try_recv().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sync_prevents_expiry() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut timer = RetryTimer::new();

        timer.schedule(Duration::from_millis(100), callback(&sender)).unwrap();
        sleep(Duration::from_millis(50)).await;
        timer.cancel_sync().await;
        assert!(!timer.is_timing());

        sleep(Duration::from_millis(200)).await;
        assert!(receiver.try_recv().is_err());

        let id = timer.schedule(Duration::from_millis(100), callback(&sender)).unwrap();
        assert_eq!(id, 2);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(receiver.try_recv().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut timer = RetryTimer::new();

        timer.schedule(Duration::from_millis(100), callback(&sender)).unwrap();
        timer.cancel();
        assert!(!timer.is_timing());

        sleep(Duration::from_millis(200)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_idle_timer() {
        let mut timer = RetryTimer::new();
        timer.cancel();
        timer.cancel_sync().await;
        assert!(!timer.is_timing());
    }

    #[test]
    fn test_next_timer_id_wraps() {
        assert_eq!(next_timer_id(0), 1);
        assert_eq!(next_timer_id(41), 42);
        assert_eq!(next_timer_id(u32::MAX), 1);
    }
}
