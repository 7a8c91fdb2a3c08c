//! Typed broadcast bus used by every entity
//!
//! Each entity owns two buses: one for application events and one for the
//! observer (monitoring) stream. A bus is torn down when its entity closes:
//! receivers drain what was already sent and then observe end-of-stream.

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Events buffered per receiver before a slow receiver starts lagging
pub const CHANNEL_CAPACITY: usize = 64;

pub struct EventBus<E: Clone> {
    sender: Mutex<Option<broadcast::Sender<E>>>,
}

impl<E: Clone> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Subscribe to future events. After `close` the receiver is already ended.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Send an event to every current subscriber. Returns how many received it.
    pub fn emit(&self, event: E) -> usize {
        self.sender
            .lock()
            .as_ref()
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    /// Drop the sender so subscribers see end-of-stream
    pub fn close(&self) {
        self.sender.lock().take();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::<u32>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.emit(7), 2);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_close_ends_stream_after_pending_events() {
        let bus = EventBus::<&'static str>::new();
        let mut rx = bus.subscribe();

        bus.emit("close");
        bus.close();

        assert_eq!(rx.recv().await.unwrap(), "close");
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(bus.emit("late"), 0);

        let mut late = bus.subscribe();
        assert!(matches!(late.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::<u8>::new();
        assert_eq!(bus.emit(1), 0);
        assert!(!bus.is_closed());
    }
}
