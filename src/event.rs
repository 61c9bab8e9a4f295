//! Event-driven communication between the daemon's services.

use anyhow::Result;
use tokio::sync::broadcast;

/// Application events for inter-service communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The configuration file changed on disk.
    ConfigChangeDetected,
    /// The EC driver stopped waiting for OBF before reads.
    ProtocolDegraded { driver: String },
    SystemShutdown,
}

/// Event bus for publish-subscribe messaging between services.
///
/// # Example
///
/// ```no_run
/// use ecfand::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus.publish(Event::ConfigChangeDetected)?;
///
/// // In async context, receive events:
/// // let event = subscriber.recv().await;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(32)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new();
        let other = bus.clone();

        let _a = bus.subscribe();
        let _b = other.subscribe();
        assert_eq!(bus.sender.receiver_count(), 2);
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(Event::ConfigChangeDetected).unwrap();
        bus.publish(Event::ProtocolDegraded {
            driver: "dev_port".to_string(),
        })
        .unwrap();
        bus.publish(Event::SystemShutdown).unwrap();

        assert_eq!(receiver.recv().await.unwrap(), Event::ConfigChangeDetected);
        assert_eq!(
            receiver.recv().await.unwrap(),
            Event::ProtocolDegraded {
                driver: "dev_port".to_string()
            }
        );
        assert_eq!(receiver.recv().await.unwrap(), Event::SystemShutdown);
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns_error() {
        let bus = EventBus::new();
        assert!(bus.publish(Event::SystemShutdown).is_err());

        let receiver = bus.subscribe();
        drop(receiver);
        assert!(bus.publish(Event::SystemShutdown).is_err());
    }

    #[tokio::test]
    async fn late_subscriber_only_sees_new_events() {
        let bus = EventBus::new();
        let _early = bus.subscribe();
        bus.publish(Event::ConfigChangeDetected).unwrap();

        let mut late = bus.subscribe();
        bus.publish(Event::SystemShutdown).unwrap();
        assert_eq!(late.recv().await.unwrap(), Event::SystemShutdown);
    }
}
