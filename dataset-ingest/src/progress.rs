use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

/// Bytes acknowledged by the store so far, out of the file's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.transferred == 0 { 0.0 } else { 1.0 };
        }
        self.transferred as f64 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.transferred >= self.total
    }
}

/// Cumulative transfer counter for one upload attempt.
///
/// Parts may be acknowledged from several tasks; the counter is only moved
/// under its lock and every new value is published on a watch channel, so
/// observers always see a non-decreasing count and can poll the latest value
/// without blocking the transfer.
#[derive(Clone)]
pub struct ProgressTracker {
    counter: Arc<Mutex<Progress>>,
    tx: Arc<watch::Sender<Progress>>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        let (tx, _) = watch::channel(Progress {
            transferred: 0,
            total,
        });
        Self {
            counter: Arc::new(Mutex::new(Progress {
                transferred: 0,
                total,
            })),
            tx: Arc::new(tx),
        }
    }

    pub fn set_total(&self, total: u64) -> Progress {
        self.update(|c| c.total = total)
    }

    /// Record `bytes` more as acknowledged and publish the new total
    pub fn advance(&self, bytes: u64) -> Progress {
        self.update(|c| c.transferred = c.transferred.saturating_add(bytes))
    }

    pub fn snapshot(&self) -> Progress {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut Progress)) -> Progress {
        // A plain integer can't be left half-updated, so poisoning is ignored
        let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut counter);
        let progress = *counter;
        // Publish while holding the lock so values go out in order
        self.tx.send_replace(progress);
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_accumulates() {
        let tracker = ProgressTracker::new(100);
        tracker.advance(30);
        let p = tracker.advance(70);
        assert_eq!(
            p,
            Progress {
                transferred: 100,
                total: 100
            }
        );
        assert!(p.is_complete());
        assert_eq!(tracker.snapshot(), p);
    }

    #[test]
    fn test_fraction() {
        assert_eq!(Progress::default().fraction(), 0.0);
        let half = Progress {
            transferred: 5,
            total: 10,
        };
        assert_eq!(half.fraction(), 0.5);
        assert!(!half.is_complete());
    }

    #[tokio::test]
    async fn test_concurrent_updates_sum_exactly() {
        let tracker = ProgressTracker::new(64 * 1000);
        let mut rx = tracker.subscribe();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    for _ in 0..1000 {
                        tracker.advance(1);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(tracker.snapshot().transferred, 64 * 1000);
        assert_eq!(rx.borrow_and_update().transferred, 64 * 1000);
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest_value() {
        let tracker = ProgressTracker::new(0);
        let mut rx = tracker.subscribe();
        tracker.set_total(10);
        tracker.advance(4);

        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow(),
            Progress {
                transferred: 4,
                total: 10
            }
        );
    }
}
