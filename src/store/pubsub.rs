//! Channel publish/subscribe for store backends.
//!
//! Publishing fans a message out to every handle subscribed to the channel
//! through bounded buffers. A subscriber whose buffer is full is dropped and
//! sees its connection as lost; [`Listener`] resubscribes with backoff.

use crate::error::{EngineError, Result};
use crate::store::DocumentStore;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-receive wait used by [`PubSubHandle::listen`].
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default per-subscriber buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// A published message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

/// Why the broker stopped delivering to a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

#[derive(Clone, Debug)]
enum PubSubEvent {
    Message(Message),
    Dropped(DropReason),
}

struct Subscriber {
    channels: Vec<String>,
    sender: Sender<PubSubEvent>,
}

impl Subscriber {
    fn wants(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    fn try_send(&self, event: PubSubEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// In-process broker owned by a store backend.
pub struct PubSubBroker {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl PubSubBroker {
    pub fn new() -> Arc<Self> {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        })
    }

    /// Register a listener for the given channels.
    pub fn subscribe(self: &Arc<Self>, channels: &[&str]) -> PubSubHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.buffer_size);
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();

        self.subscribers.write().insert(
            id,
            Subscriber {
                channels: channels.clone(),
                sender,
            },
        );
        info!(subscriber = id, ?channels, "Subscribed to channels");

        PubSubHandle {
            id,
            channels,
            receiver,
            unsubscriber: Unsubscriber {
                id,
                broker: Arc::downgrade(self),
                unsubscribed: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            let _ = sub.sender.try_send(PubSubEvent::Dropped(DropReason::Unsubscribed));
            debug!(subscriber = id, "Unsubscribed");
        }
    }

    /// Publish to a channel. Returns how many subscribers received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let message = Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let mut delivered = 0;
        let mut to_remove = Vec::new();

        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter().filter(|(_, s)| s.wants(channel)) {
                if sub.try_send(PubSubEvent::Message(message.clone())) {
                    delivered += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    warn!(subscriber = id, channel, "Dropping slow subscriber");
                    let _ = sub.try_send(PubSubEvent::Dropped(DropReason::BufferOverflow));
                }
            }
        }

        debug!(channel, delivered, "TX-MSG");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Cloneable token that ends a subscription from any thread.
#[derive(Clone)]
pub struct Unsubscriber {
    id: u64,
    broker: Weak<PubSubBroker>,
    unsubscribed: Arc<AtomicBool>,
}

impl Unsubscriber {
    pub fn unsubscribe(&self) {
        self.unsubscribed.store(true, Ordering::SeqCst);
        if let Some(broker) = self.broker.upgrade() {
            broker.unsubscribe(self.id);
        }
    }
}

/// Receiving end of a subscription.
pub struct PubSubHandle {
    id: u64,
    channels: Vec<String>,
    receiver: Receiver<PubSubEvent>,
    unsubscriber: Unsubscriber,
}

impl PubSubHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn unsubscriber(&self) -> Unsubscriber {
        self.unsubscriber.clone()
    }

    pub fn unsubscribe(&self) {
        self.unsubscriber.unsubscribe();
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Errors are distinguishable: `ReceiveTimeout` means nothing arrived,
    /// `NotSubscribed` follows an explicit unsubscribe, `ConnectionLost` means
    /// the broker stopped delivering and the caller should resubscribe.
    pub fn receive(&self, timeout: Duration) -> Result<Message> {
        match self.receiver.recv_timeout(timeout) {
            Ok(PubSubEvent::Message(message)) => Ok(message),
            Ok(PubSubEvent::Dropped(DropReason::Unsubscribed)) => Err(EngineError::NotSubscribed),
            Ok(PubSubEvent::Dropped(DropReason::BufferOverflow)) => Err(
                EngineError::ConnectionLost("subscriber buffer overflowed".into()),
            ),
            Err(RecvTimeoutError::Timeout) => Err(EngineError::ReceiveTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                if self.unsubscriber.unsubscribed.load(Ordering::SeqCst) {
                    Err(EngineError::NotSubscribed)
                } else {
                    Err(EngineError::ConnectionLost("broker closed".into()))
                }
            }
        }
    }

    /// Block delivering messages until unsubscribed (`Ok`) or the connection
    /// is lost (`Err(ConnectionLost)`). Receive timeouts keep listening.
    pub fn listen<F>(&self, mut on_message: F) -> Result<()>
    where
        F: FnMut(&str, &str),
    {
        loop {
            match self.receive(RECEIVE_TIMEOUT) {
                Ok(message) => {
                    debug!(channel = %message.channel, "RX-MSG");
                    on_message(&message.channel, &message.payload);
                }
                Err(EngineError::ReceiveTimeout) => continue,
                Err(EngineError::NotSubscribed) => {
                    debug!(subscriber = self.id, "Exiting listen loop");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for PubSubHandle {
    fn drop(&mut self) {
        if let Some(broker) = self.unsubscriber.broker.upgrade() {
            broker.unsubscribe(self.id);
        }
    }
}

/// Listens on channels and resubscribes after connection loss.
pub struct Listener {
    store: Arc<dyn DocumentStore>,
    channels: Vec<String>,
    stop: ListenerStop,
    stop_signal: Receiver<()>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// Stops a running [`Listener`] from another thread.
#[derive(Clone)]
pub struct ListenerStop {
    stopped: Arc<AtomicBool>,
    current: Arc<Mutex<Option<Unsubscriber>>>,
    signal: Sender<()>,
}

impl ListenerStop {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(unsubscriber) = self.current.lock().take() {
            unsubscriber.unsubscribe();
        }
        let _ = self.signal.try_send(());
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Listener {
    pub fn new(store: Arc<dyn DocumentStore>, channels: &[&str]) -> Self {
        let (signal, stop_signal) = bounded(1);
        Self {
            store,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            stop: ListenerStop {
                stopped: Arc::new(AtomicBool::new(false)),
                current: Arc::new(Mutex::new(None)),
                signal,
            },
            stop_signal,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn stopper(&self) -> ListenerStop {
        self.stop.clone()
    }

    /// Run until stopped. Returns how many times the subscription was re-established.
    pub fn run<F>(&self, mut on_message: F) -> Result<u32>
    where
        F: FnMut(&str, &str),
    {
        let channels: Vec<&str> = self.channels.iter().map(String::as_str).collect();
        let mut delay = self.initial_backoff;
        let mut reconnects = 0;
        let mut first = true;

        while !self.stop.is_stopped() {
            match self.store.subscribe(&channels) {
                Ok(handle) => {
                    *self.stop.current.lock() = Some(handle.unsubscriber());
                    if self.stop.is_stopped() {
                        handle.unsubscribe();
                    }
                    if !first {
                        reconnects += 1;
                        info!(?channels, "Resubscribed after connection loss");
                    }
                    first = false;
                    delay = self.initial_backoff;

                    match handle.listen(&mut on_message) {
                        Ok(()) => return Ok(reconnects),
                        Err(e) => warn!(error = %e, "Pub/sub connection lost"),
                    }
                }
                Err(e) => warn!(error = %e, "Subscribe failed"),
            }

            if self.stop.is_stopped() {
                break;
            }
            warn!("Resubscribing in {:?}...", delay);
            if self.stop_signal.recv_timeout(delay).is_ok() {
                break;
            }
            delay = (delay * 2).min(self.max_backoff);
        }

        Ok(reconnects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_publish_to_matching_channel() {
        let broker = PubSubBroker::new();
        let handle = broker.subscribe(&["events"]);
        let _other = broker.subscribe(&["other"]);

        assert_eq!(broker.publish("events", "hello"), 1);

        let message = handle.receive(Duration::from_millis(100)).unwrap();
        assert_eq!(message.channel, "events");
        assert_eq!(message.payload, "hello");
    }

    #[test]
    fn test_receive_timeout_is_distinct() {
        let broker = PubSubBroker::new();
        let handle = broker.subscribe(&["events"]);

        let result = handle.receive(Duration::from_millis(20));
        assert!(matches!(result, Err(EngineError::ReceiveTimeout)));
    }

    #[test]
    fn test_listen_exits_on_unsubscribe() {
        let broker = PubSubBroker::new();
        let handle = broker.subscribe(&["events"]);
        let unsubscriber = handle.unsubscriber();

        broker.publish("events", "one");
        broker.publish("events", "two");

        let listener = thread::spawn(move || {
            let mut received = Vec::new();
            let result = handle.listen(|_, payload| received.push(payload.to_string()));
            (result, received)
        });

        thread::sleep(Duration::from_millis(50));
        unsubscriber.unsubscribe();

        let (result, received) = listener.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(received, vec!["one", "two"]);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn test_overflow_reports_connection_lost() {
        let broker = PubSubBroker::with_buffer_size(2);
        let handle = broker.subscribe(&["events"]);

        for i in 0..5 {
            broker.publish("events", &i.to_string());
        }
        assert_eq!(broker.subscriber_count(), 0);

        let result = handle.listen(|_, _| {});
        assert!(matches!(result, Err(EngineError::ConnectionLost(_))));
    }

    #[test]
    fn test_broker_gone_is_connection_lost() {
        let broker = PubSubBroker::new();
        let handle = broker.subscribe(&["events"]);
        drop(broker);

        let result = handle.receive(Duration::from_millis(20));
        assert!(matches!(result, Err(EngineError::ConnectionLost(_))));
    }

    #[test]
    fn test_drop_handle_unsubscribes() {
        let broker = PubSubBroker::new();
        {
            let _handle = broker.subscribe(&["events"]);
            assert_eq!(broker.subscriber_count(), 1);
        }
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(broker.publish("events", "nobody"), 0);
    }

    #[test]
    fn test_listener_resubscribes_after_overflow() {
        use crate::store::MemoryStore;

        let store: Arc<dyn DocumentStore> =
            Arc::new(MemoryStore::with_pubsub_buffer("listener", 1));
        let listener = Listener::new(store.clone(), &["ch"])
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        let stopper = listener.stopper();

        let (gate_tx, gate_rx) = bounded::<()>(1);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let worker = thread::spawn(move || {
            listener.run(move |_, payload| {
                sink.lock().push(payload.to_string());
                if payload == "a" {
                    let _ = gate_rx.recv();
                }
            })
        });

        while store.publish("ch", "a").unwrap() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        // Callback is parked on "a", so the one-slot buffer overflows
        store.publish("ch", "b").unwrap();
        store.publish("ch", "c").unwrap();
        gate_tx.send(()).unwrap();

        while store.publish("ch", "d").unwrap() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        stopper.stop();

        let reconnects = worker.join().unwrap().unwrap();
        assert_eq!(reconnects, 1);
        let received = received.lock();
        assert_eq!(received.first().map(String::as_str), Some("a"));
        assert_eq!(received.last().map(String::as_str), Some("d"));
    }
}
