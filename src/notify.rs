use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::ledger::Ledger;
use crate::limits::CAPACITY_CHANNEL_SIZE;
use crate::model::{CapacityUpdate, EventId, SlotId};

/// Broadcast hub for capacity snapshots. Scope is this process only.
pub struct CapacityHub {
    ledger: Arc<Ledger>,
    sender: broadcast::Sender<CapacityUpdate>,
    /// Held from snapshot to send, so updates go out in snapshot order.
    order: Mutex<()>,
}

impl CapacityHub {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let (sender, _) = broadcast::channel(CAPACITY_CHANNEL_SIZE);
        Self {
            ledger,
            sender,
            order: Mutex::new(()),
        }
    }

    /// Take a fresh snapshot and send it to every subscriber.
    /// No-op for the channel if nobody is listening.
    pub async fn publish(
        &self,
        updated_slot_id: Option<SlotId>,
        event_id: Option<EventId>,
    ) -> CapacityUpdate {
        let _order = self.order.lock().await;
        let update = CapacityUpdate {
            snapshot: self.ledger.capacity_snapshot().await,
            updated_slot_id,
            event_id,
        };
        let _ = self.sender.send(update.clone());
        update
    }

    /// Subscribe to capacity updates. The first item is the current snapshot.
    pub async fn subscribe(&self) -> CapacitySubscription {
        // Subscribe before reading, so nothing published in between is lost.
        let _order = self.order.lock().await;
        let receiver = self.sender.subscribe();
        let seed = CapacityUpdate {
            snapshot: self.ledger.capacity_snapshot().await,
            updated_slot_id: None,
            event_id: None,
        };
        CapacitySubscription {
            seed: Some(seed),
            receiver,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct CapacitySubscription {
    seed: Option<CapacityUpdate>,
    receiver: broadcast::Receiver<CapacityUpdate>,
}

impl CapacitySubscription {
    /// Next update in publish order. A subscriber that falls behind skips
    /// to the oldest update still buffered. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<CapacityUpdate> {
        if let Some(seed) = self.seed.take() {
            return Some(seed);
        }
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("capacity subscriber lagged, skipped {skipped} updates");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgate_test_notify");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn subscription_is_seeded_then_follows_updates() {
        let ledger = Arc::new(Ledger::open(&test_wal_path("seeded.wal")).unwrap());
        ledger.create_slot(1, 10, 2).await.unwrap();
        let hub = CapacityHub::new(ledger.clone());

        let mut sub = hub.subscribe().await;
        let seed = sub.next().await.unwrap();
        assert_eq!(seed.snapshot.len(), 1);
        assert_eq!(seed.snapshot[0].current_count, 0);
        assert_eq!(seed.updated_slot_id, None);

        ledger.create_slot(2, 10, 5).await.unwrap();
        hub.publish(Some(2), Some(10)).await;
        let update = sub.next().await.unwrap();
        assert_eq!(update.snapshot.len(), 2);
        assert_eq!(update.updated_slot_id, Some(2));
        assert_eq!(update.event_id, Some(10));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let ledger = Arc::new(Ledger::open(&test_wal_path("noop.wal")).unwrap());
        let hub = CapacityHub::new(ledger);
        let update = hub.publish(None, None).await;
        assert!(update.snapshot.is_empty());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let ledger = Arc::new(Ledger::open(&test_wal_path("lag.wal")).unwrap());
        ledger.create_slot(1, 10, 2).await.unwrap();
        let hub = CapacityHub::new(ledger);

        let mut sub = hub.subscribe().await;
        sub.next().await.unwrap();
        for _ in 0..CAPACITY_CHANNEL_SIZE + 10 {
            hub.publish(Some(1), Some(10)).await;
        }
        let mut received = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await
        {
            received += 1;
        }
        assert_eq!(received, CAPACITY_CHANNEL_SIZE);
    }

    #[tokio::test]
    async fn update_serializes_without_absent_tags() {
        let ledger = Arc::new(Ledger::open(&test_wal_path("json.wal")).unwrap());
        ledger.create_slot(3, 10, 4).await.unwrap();
        let hub = CapacityHub::new(ledger);
        let mut sub = hub.subscribe().await;
        let seed = sub.next().await.unwrap();
        let json = serde_json::to_value(&seed).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "snapshot": [{"slotId": 3, "currentCount": 0, "maxCapacity": 4}]
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_never_send_an_older_snapshot_later() {
        let ledger = Arc::new(Ledger::open(&test_wal_path("ordered.wal")).unwrap());
        let slots = 32u64;
        for id in 0..slots {
            ledger.create_slot(id, id, 1).await.unwrap();
        }
        let hub = Arc::new(CapacityHub::new(ledger.clone()));
        let mut sub = hub.subscribe().await;
        sub.next().await.unwrap();

        let mut tasks = Vec::new();
        for id in 0..slots {
            let ledger = ledger.clone();
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .commit_reservation(crate::ledger::CommitRequest {
                        slot_id: id,
                        expected_version: 0,
                        user_id: "alice",
                        job_id: None,
                    })
                    .await
                    .unwrap();
                hub.publish(Some(id), Some(id)).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..slots {
            let update = sub.next().await.unwrap();
            let booked: u32 = update.snapshot.iter().map(|s| s.current_count).sum();
            assert!(booked >= last, "snapshot went back from {last} to {booked}");
            last = booked;
        }
        assert_eq!(last, slots as u32);
    }
}
