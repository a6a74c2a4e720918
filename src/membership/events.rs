//! Membership Lifecycle Events
//!
//! The protocol loops never call user code directly. They push `MemberEvent`s into an
//! unbounded channel; a dispatcher task drains it, runs the registered handlers and
//! fans the event out to `broadcast` subscribers. A slow handler therefore delays other
//! handlers, never the gossip or failure detection loops.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// First message received from a previously unknown peer.
    New(SocketAddr),
    /// Peer has been silent for longer than `failure_timeout`.
    Failed(SocketAddr),
    /// Failed peer was purged after `cleanup_timeout`.
    Removed(SocketAddr),
    /// Failed peer is heard from again.
    Revived(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberEventKind {
    New,
    Failed,
    Removed,
    Revived,
}

impl MemberEvent {
    pub fn kind(&self) -> MemberEventKind {
        match self {
            MemberEvent::New(_) => MemberEventKind::New,
            MemberEvent::Failed(_) => MemberEventKind::Failed,
            MemberEvent::Removed(_) => MemberEventKind::Removed,
            MemberEvent::Revived(_) => MemberEventKind::Revived,
        }
    }

    pub fn address(&self) -> SocketAddr {
        match *self {
            MemberEvent::New(addr)
            | MemberEvent::Failed(addr)
            | MemberEvent::Removed(addr)
            | MemberEvent::Revived(addr) => addr,
        }
    }
}

/// A consumer callback. Receives the address of the peer the event is about.
pub type MemberHandlerFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Handlers registered per event kind. Several handlers may share a kind.
#[derive(Default)]
pub struct MemberListeners {
    handlers: DashMap<MemberEventKind, Vec<MemberHandlerFn>>,
}

impl MemberListeners {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register<F>(&self, kind: MemberEventKind, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));

        tracing::debug!("Registered {:?} member handler", kind);
    }

    /// Runs every handler registered for the event's kind.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers still run.
    pub fn notify(&self, event: &MemberEvent) {
        // Clone the handler list out so a handler may register further handlers.
        let handlers: Vec<MemberHandlerFn> = match self.handlers.get(&event.kind()) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event.address()))).is_err() {
                tracing::error!("Member handler panicked while handling {:?}", event);
            }
        }
    }

    pub fn handler_count(&self, kind: MemberEventKind) -> usize {
        self.handlers.get(&kind).map(|entry| entry.len()).unwrap_or(0)
    }
}

/// Drains `events` until the stop flag is raised or every sender is gone.
///
/// Events already queued when the flag is raised are still delivered.
pub async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<MemberEvent>,
    listeners: Arc<MemberListeners>,
    subscribers: broadcast::Sender<MemberEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                deliver(&listeners, &subscribers, event);
            }
            _ = stop.changed() => {}
        }
    }

    while let Ok(event) = events.try_recv() {
        deliver(&listeners, &subscribers, event);
    }

    tracing::debug!("Event dispatcher stopped");
}

fn deliver(
    listeners: &MemberListeners,
    subscribers: &broadcast::Sender<MemberEvent>,
    event: MemberEvent,
) {
    listeners.notify(&event);
    // No subscribers is not an error.
    let _ = subscribers.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_notify_only_matching_kind() {
        let listeners = MemberListeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        listeners.register(MemberEventKind::Failed, move |addr| {
            seen_clone.lock().unwrap().push(addr);
        });

        let addr: SocketAddr = "127.0.0.1:9091".parse().unwrap();
        listeners.notify(&MemberEvent::New(addr));
        listeners.notify(&MemberEvent::Failed(addr));

        assert_eq!(*seen.lock().unwrap(), vec![addr]);
        assert_eq!(listeners.handler_count(MemberEventKind::Failed), 1);
        assert_eq!(listeners.handler_count(MemberEventKind::New), 0);
    }

    #[test]
    fn test_multiple_handlers_per_kind() {
        let listeners = MemberListeners::new();
        let count = Arc::new(Mutex::new(0));

        for _ in 0..3 {
            let count = count.clone();
            listeners.register(MemberEventKind::Removed, move |_| {
                *count.lock().unwrap() += 1;
            });
        }

        listeners.notify(&MemberEvent::Removed("127.0.0.1:9092".parse().unwrap()));
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_to_subscribers() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sub_tx, mut sub_rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(dispatch_events(
            rx,
            Arc::new(MemberListeners::new()),
            sub_tx,
            stop_rx,
        ));

        let addr: SocketAddr = "127.0.0.1:9093".parse().unwrap();
        tx.send(MemberEvent::Revived(addr)).unwrap();

        let received = sub_rx.recv().await.unwrap();
        assert_eq!(received, MemberEvent::Revived(addr));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let listeners = MemberListeners::new();
        let count = Arc::new(Mutex::new(0));

        listeners.register(MemberEventKind::New, |addr| {
            if addr.port() == 9301 {
                panic!("handler failure for {}", addr);
            }
        });
        let count_clone = count.clone();
        listeners.register(MemberEventKind::New, move |_| {
            *count_clone.lock().unwrap() += 1;
        });

        listeners.notify(&MemberEvent::New("127.0.0.1:9301".parse().unwrap()));
        listeners.notify(&MemberEvent::New("127.0.0.1:9302".parse().unwrap()));

        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dispatcher_survives_panicking_handler() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sub_tx, mut sub_rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let listeners = Arc::new(MemberListeners::new());
        listeners.register(MemberEventKind::New, |_| panic!("bad consumer"));

        let handle = tokio::spawn(dispatch_events(rx, listeners, sub_tx, stop_rx));

        let first: SocketAddr = "127.0.0.1:9301".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:9302".parse().unwrap();
        tx.send(MemberEvent::New(first)).unwrap();
        tx.send(MemberEvent::New(second)).unwrap();

        assert_eq!(sub_rx.recv().await.unwrap(), MemberEvent::New(first));
        assert_eq!(sub_rx.recv().await.unwrap(), MemberEvent::New(second));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_queued_events_after_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sub_tx, mut sub_rx) = broadcast::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(true);

        let removed: SocketAddr = "127.0.0.1:9310".parse().unwrap();
        tx.send(MemberEvent::Failed(removed)).unwrap();
        tx.send(MemberEvent::Removed(removed)).unwrap();

        dispatch_events(rx, Arc::new(MemberListeners::new()), sub_tx, stop_rx).await;

        assert_eq!(sub_rx.try_recv().unwrap(), MemberEvent::Failed(removed));
        assert_eq!(sub_rx.try_recv().unwrap(), MemberEvent::Removed(removed));
    }
}
