//! Timer management for the production runner.
//!
//! Each timer is a tokio task that sleeps and then sends its event to the
//! runner's event channel. Timers can be replaced and cancelled by id.

use concord_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Convert a TimerId to the corresponding Event.
fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::LocalTimeout { epoch, view } => Event::LocalTimeout { epoch, view },
        TimerId::SyncRetry { epoch, vertex_hash } => Event::SyncTimeout { epoch, vertex_hash },
    }
}

/// Manages timers for the production runner.
pub struct TimerManager {
    /// Active timers (id -> task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Set a timer that will fire after the given duration.
    ///
    /// If a timer with the same ID already exists, it is cancelled first.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        // Fired timers stay in the map until replaced; drop them here.
        self.timers.retain(|_, handle| !handle.is_finished());

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "Timer fired");
            // The runner is gone if the channel is closed.
            let _ = event_tx.send(timer_event(id)).await;
        });

        self.timers.insert(id, handle);
        debug!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer. A no-op if it doesn't exist or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    /// Cancel all timers.
    ///
    /// Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }

    /// Get the number of tracked timers.
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
    use concord_types::{EpochId, Hash, View};

    fn view_timer(view: u64) -> TimerId {
        TimerId::LocalTimeout {
            epoch: EpochId(0),
            view: View(view),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>, within: Duration) -> Option<Event> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(view_timer(3), Duration::from_millis(10));

        let event = next_event(&mut event_rx, Duration::from_millis(500))
            .await
            .expect("timer fired");
        assert!(matches!(
            event,
            Event::LocalTimeout { view: View(3), .. }
        ));
    }

    #[tokio::test]
    async fn test_timer_cancel() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(view_timer(1), Duration::from_millis(50));
        manager.cancel_timer(view_timer(1));

        assert!(next_event(&mut event_rx, Duration::from_millis(150)).await.is_none());
    }

    #[tokio::test]
    async fn test_timer_replace() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(view_timer(1), Duration::from_millis(500));
        manager.set_timer(view_timer(1), Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = next_event(&mut event_rx, Duration::from_millis(200)).await;
        assert!(event.is_some(), "replacement timer didn't fire quickly");
        // The original was aborted.
        assert!(next_event(&mut event_rx, Duration::from_millis(600)).await.is_none());
    }

    #[tokio::test]
    async fn test_distinct_ids_coexist() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(view_timer(1), Duration::from_millis(10));
        manager.set_timer(
            TimerId::SyncRetry {
                epoch: EpochId(0),
                vertex_hash: Hash::from_bytes(b"missing"),
            },
            Duration::from_millis(20),
        );
        assert_eq!(manager.active_count(), 2);

        let mut timeouts = 0;
        let mut retries = 0;
        for _ in 0..2 {
            match next_event(&mut event_rx, Duration::from_millis(500)).await {
                Some(Event::LocalTimeout { .. }) => timeouts += 1,
                Some(Event::SyncTimeout { .. }) => retries += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((timeouts, retries), (1, 1));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(view_timer(1), Duration::from_millis(50));
        manager.set_timer(view_timer(2), Duration::from_millis(50));
        manager.cancel_all();
        assert_eq!(manager.active_count(), 0);

        assert!(next_event(&mut event_rx, Duration::from_millis(150)).await.is_none());
    }
}
