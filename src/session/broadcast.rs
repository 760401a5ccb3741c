use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::time::Duration;

use log::{debug, warn};

use crate::protocol::EventMessage;

/// Fan-out of events to subscribers, each behind its own bounded queue so a
/// slow or absent subscriber never blocks the controller. When a queue is
/// full the newest event for that subscriber is dropped and counted.
#[derive(Debug)]
pub struct EventBroadcaster {
    subscribers: Vec<Subscriber>,
    capacity: usize,
    next_id: u64,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: SyncSender<EventMessage>,
    dropped: u64,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    pub fn subscribe(&mut self) -> EventReceiver {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, tx, dropped: 0 });
        EventReceiver { rx }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Fire-and-forget publish. Disconnected subscribers are pruned here.
    pub fn publish(&mut self, event: &EventMessage) {
        self.subscribers
            .retain_mut(|subscriber| match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    subscriber.dropped += 1;
                    if subscriber.dropped == 1 || subscriber.dropped % 100 == 0 {
                        warn!(
                            "subscriber {} is not keeping up, {} events dropped",
                            subscriber.id, subscriber.dropped
                        );
                    }
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("subscriber {} disconnected, removing", subscriber.id);
                    false
                }
            });
    }
}

/// The receiving side of one subscription.
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<EventMessage>,
}

impl EventReceiver {
    pub fn try_recv(&self) -> Option<EventMessage> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<EventMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<EventMessage> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventPayload;

    fn event(n: u16) -> EventMessage {
        EventMessage::new(&EventPayload::LevelUpdate {
            channel_id: n,
            peak_db: -6.0,
            rms_db: -9.0,
        })
    }

    #[test]
    fn full_queue_drops_newest() {
        let mut broadcaster = EventBroadcaster::new(2);
        let receiver = broadcaster.subscribe();
        for n in 0..5 {
            broadcaster.publish(&event(n));
        }
        let received = receiver.drain();
        // The first two made it in; the rest were dropped on the floor.
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].event_data["channelId"], 0);
        assert_eq!(received[1].event_data["channelId"], 1);
        // The subscriber is still registered and receives again after
        // draining.
        broadcaster.publish(&event(9));
        assert_eq!(receiver.drain().len(), 1);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let mut broadcaster = EventBroadcaster::new(4);
        let keep = broadcaster.subscribe();
        let gone = broadcaster.subscribe();
        drop(gone);
        assert_eq!(broadcaster.subscriber_count(), 2);
        broadcaster.publish(&event(0));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(keep.drain().len(), 1);
    }

    #[test]
    fn subscribers_receive_independently() {
        let mut broadcaster = EventBroadcaster::new(4);
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        broadcaster.publish(&event(1));
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }
}
