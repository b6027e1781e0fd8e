use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-workgroup broadcast of membership changes (joins, removals, sharing).
///
/// Consumers are in-process subscribers. A channel lives while it has
/// receivers and is dropped on the first send after the last one goes away.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a workgroup's changes. Creates the channel if needed.
    pub fn subscribe(&self, workgroup_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(workgroup_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, workgroup_id: Ulid, event: &Event) {
        let delivered = match self.channels.get(&workgroup_id) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            self.remove_idle(&workgroup_id);
        }
    }

    /// Drop the channel if nobody holds a receiver for it.
    pub fn remove_idle(&self, workgroup_id: &Ulid) {
        self.channels
            .remove_if(workgroup_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn subscriber_count(&self, workgroup_id: &Ulid) -> usize {
        self.channels
            .get(workgroup_id)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_workgroup_events() {
        let hub = NotifyHub::new();
        let wg = Ulid::new();
        let mut rx = hub.subscribe(wg);
        assert_eq!(hub.subscriber_count(&wg), 1);

        let event = Event::GroupSharingSet {
            workgroup_id: wg,
            enabled: false,
        };
        hub.send(wg, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_workgroups_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.subscribe(mine);

        hub.send(
            other,
            &Event::GroupSharingSet {
                workgroup_id: other,
                enabled: true,
            },
        );

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_dropped_after_last_receiver() {
        let hub = NotifyHub::new();
        let wg = Ulid::new();
        let event = Event::GroupSharingSet {
            workgroup_id: wg,
            enabled: true,
        };
        let rx = hub.subscribe(wg);
        hub.send(wg, &event);
        assert_eq!(hub.channels.len(), 1);

        drop(rx);
        hub.send(wg, &event);
        assert!(hub.channels.is_empty());

        // A later subscriber gets a fresh channel.
        let mut rx = hub.subscribe(wg);
        hub.send(wg, &event);
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let wg = Ulid::new();
        hub.send(
            wg,
            &Event::GroupSharingSet {
                workgroup_id: wg,
                enabled: true,
            },
        );
        assert_eq!(hub.subscriber_count(&wg), 0);
    }
}
