//! `run:notify` push channel between the platform and runners.
//!
//! The platform publishes a run's new snapshot whenever its state changes
//! externally (cancellation, waitpoint completion); runners subscribed to
//! the run's room react without waiting for their next poll. Delivery is
//! best-effort — the runner's 5-second snapshot poll is the fallback for
//! missed notifications.

use crate::core::ExecutionSnapshot;
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-run notification rooms.
pub trait RunNotifier: Send + Sync {
    /// Publishes a snapshot to the run's room. Best-effort: no receivers,
    /// no delivery.
    fn notify(&self, snapshot: &ExecutionSnapshot);

    /// Subscribes to the run's room.
    fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<ExecutionSnapshot>;

    /// Drops the run's room once the run is finished.
    fn close_room(&self, run_id: Uuid);
}

const ROOM_CAPACITY: usize = 16;

/// In-process notifier backed by one broadcast channel per run.
///
/// The external WebSocket transport subscribes here and forwards events to
/// remote runners; in-process runners subscribe directly.
#[derive(Default)]
pub struct InProcessNotifier {
    rooms: DashMap<Uuid, broadcast::Sender<ExecutionSnapshot>>,
}

impl InProcessNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn room(&self, run_id: Uuid) -> broadcast::Sender<ExecutionSnapshot> {
        self.rooms
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }
}

impl RunNotifier for InProcessNotifier {
    fn notify(&self, snapshot: &ExecutionSnapshot) {
        if let Some(sender) = self.rooms.get(&snapshot.run_id) {
            // A lagging or absent receiver is fine; polling covers it.
            let _ = sender.send(snapshot.clone());
        }
    }

    fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<ExecutionSnapshot> {
        self.room(run_id).subscribe()
    }

    fn close_room(&self, run_id: Uuid) {
        self.rooms.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, RunStatus};

    #[tokio::test]
    async fn test_subscriber_receives_notifications() {
        let notifier = InProcessNotifier::new();
        let run_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(run_id);

        let snapshot = ExecutionSnapshot::new(
            run_id,
            ExecutionStatus::PendingCancel,
            RunStatus::Executing,
            "cancel requested",
        );
        notifier.notify(&snapshot);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, snapshot.id);
        assert_eq!(received.execution_status, ExecutionStatus::PendingCancel);
    }

    #[test]
    fn test_notify_without_subscribers_is_noop() {
        let notifier = InProcessNotifier::new();
        let snapshot = ExecutionSnapshot::new(
            Uuid::new_v4(),
            ExecutionStatus::Queued,
            RunStatus::Pending,
            "queued",
        );
        notifier.notify(&snapshot);
    }
}
