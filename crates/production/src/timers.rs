//! Timer management for the production runner.
//!
//! Each armed timer is a tokio task that sleeps and then feeds a
//! `TimerFired` event back into the runner's channel. Cancelling aborts the
//! task; a fire that races a cancel is tolerated by the engine, which checks
//! current state in every timer handler.

use lockstep_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Manages one-shot timers for the production runner.
pub struct TimerManager {
    /// Active timers (id -> task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    /// A manager feeding fires into `event_tx`.
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer. An already-armed timer with the same id is replaced.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = event_tx.send(Event::TimerFired { id }).await;
        });
        self.timers.insert(id, handle);
        debug!(?id, ?duration, "timer set");
    }

    /// Cancel a timer. No-op if it is not armed or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!(?id, "timer cancelled");
        }
    }

    /// Cancel everything; called on shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "timer cancelled (shutdown)");
        }
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires_into_the_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::Batch, Duration::from_millis(5));
        let event = rx.recv().await.expect("timer event");
        assert!(matches!(event, Event::TimerFired { id: TimerId::Batch }));
        assert_eq!(timers.active_count(), 1); // fired but not reaped
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::Batch, Duration::from_millis(20));
        timers.cancel_timer(TimerId::Batch);
        assert_eq!(timers.active_count(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_timer() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::Batch, Duration::from_millis(5));
        timers.set_timer(TimerId::Batch, Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(15)).await;
        // The first (replaced) timer must not have fired.
        assert!(rx.try_recv().is_err());
        let event = rx.recv().await.expect("second timer fires");
        assert!(matches!(event, Event::TimerFired { id: TimerId::Batch }));
    }
}
