use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use bit_vec::BitVec;
use crossbeam_channel::{RecvTimeoutError, TrySendError};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{event::Event, wake::Notification, TopicId};

/// One delivery sink per listener, fixed at construction.
pub(crate) enum Sink {
  /// Invoked synchronously on the dispatcher thread. Must not block on the
  /// bus and must not keep a pooled envelope past return.
  Callback(Box<dyn Fn(&Event) + Send + Sync>),
  /// Bounded queue; delivery is a non-blocking push.
  Queue(crossbeam_channel::Sender<Event>),
  /// One-shot wake-up, no envelope handover.
  Wake(Arc<Notification>),
}

impl Sink {
  pub fn kind(&self) -> &'static str {
    match self {
      Sink::Callback(_) => "callback",
      Sink::Queue(_) => "queue",
      Sink::Wake(_) => "wake",
    }
  }
}

pub(crate) struct ListenerInner {
  name: String,
  sink: Sink,
  // Sized to the bus topic range on first use; only the dispatcher mutates it.
  mask: Mutex<BitVec>,
  err_full: AtomicBool,
  ref_count: AtomicU32,
  priority: AtomicU8,
}

/// A registered consumer: a topic bitmask plus one delivery sink.
///
/// `Listener` is a cheap shared handle; the same handle is used to attach,
/// subscribe, and release events received through a queue sink. Identity is
/// by handle, not by name.
#[derive(Clone)]
pub struct Listener {
  inner: Arc<ListenerInner>,
}

impl Listener {
  fn with_sink(name: &str, sink: Sink) -> Listener {
    Listener {
      inner: Arc::new(ListenerInner {
        name: name.to_string(),
        sink,
        mask: Mutex::new(BitVec::new()),
        err_full: AtomicBool::new(false),
        ref_count: AtomicU32::new(0),
        priority: AtomicU8::new(0),
      }),
    }
  }

  /// A listener whose events are delivered by calling `callback` on the
  /// dispatcher thread.
  ///
  /// The callback must not call back into the bus (the dispatcher would
  /// deadlock on its own inbox) and must not hold on to the event past
  /// return unless the event is statically allocated.
  pub fn callback<F>(name: &str, callback: F) -> Listener
  where
    F: Fn(&Event) + Send + Sync + 'static,
  {
    Listener::with_sink(name, Sink::Callback(Box::new(callback)))
  }

  /// A listener with a bounded delivery queue of `depth` events. The
  /// returned [`EventReceiver`] is the consuming end.
  pub fn queue(name: &str, depth: usize) -> (Listener, EventReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(depth);
    (
      Listener::with_sink(name, Sink::Queue(tx)),
      EventReceiver { rx },
    )
  }

  /// A listener that is woken with no event handover; used for one-shot
  /// waiting ([`EventBus::wait_for`](crate::EventBus::wait_for)).
  pub fn wake(name: &str) -> (Listener, Arc<Notification>) {
    let notification = Arc::new(Notification::new());
    (
      Listener::with_sink(name, Sink::Wake(Arc::clone(&notification))),
      notification,
    )
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Scheduling priority metadata, checked at attach time: a queue-sink
  /// listener must run strictly below the dispatcher priority. Set before
  /// attaching.
  pub fn set_priority(&self, priority: u8) {
    self.inner.priority.store(priority, Ordering::SeqCst);
  }

  pub fn priority(&self) -> u8 {
    self.inner.priority.load(Ordering::SeqCst)
  }

  /// Sticky flag, set whenever a delivery found this listener's queue full.
  pub fn err_full(&self) -> bool {
    self.inner.err_full.load(Ordering::SeqCst)
  }

  pub fn clear_err_full(&self) {
    self.inner.err_full.store(false, Ordering::SeqCst);
  }

  /// Pooled envelopes currently sitting in this listener's queue.
  pub fn ref_count(&self) -> u32 {
    self.inner.ref_count.load(Ordering::SeqCst)
  }

  pub(crate) fn sink(&self) -> &Sink {
    &self.inner.sink
  }

  pub(crate) fn is_queue(&self) -> bool {
    matches!(self.inner.sink, Sink::Queue(_))
  }

  pub(crate) fn queue_sender(&self) -> Option<&crossbeam_channel::Sender<Event>> {
    match &self.inner.sink {
      Sink::Queue(tx) => Some(tx),
      _ => None,
    }
  }

  pub(crate) fn set_err_full(&self) {
    self.inner.err_full.store(true, Ordering::SeqCst);
  }

  pub(crate) fn inc_ref(&self) {
    self.inner.ref_count.fetch_add(1, Ordering::SeqCst);
  }

  pub(crate) fn dec_ref_checked(&self) {
    let current = self.inner.ref_count.load(Ordering::SeqCst);
    assert!(current > 0, "listener \"{}\" refcount underflow", self.inner.name);
    self.inner.ref_count.store(current - 1, Ordering::SeqCst);
  }

  /// Widens the mask to the bus topic range. Subscriptions survive a
  /// detach/attach cycle, so an already-sized mask is left alone.
  pub(crate) fn ensure_mask(&self, topic_count: usize) {
    let mut mask = self.inner.mask.lock().expect("listener mask lock poisoned");
    if mask.len() != topic_count {
      *mask = BitVec::from_elem(topic_count, false);
    }
  }

  pub(crate) fn set_topic(&self, topic: TopicId, subscribed: bool) {
    let mut mask = self.inner.mask.lock().expect("listener mask lock poisoned");
    let index = topic as usize;
    if index < mask.len() {
      mask.set(index, subscribed);
    }
  }

  pub(crate) fn is_subscribed(&self, topic: TopicId) -> bool {
    let mask = self.inner.mask.lock().expect("listener mask lock poisoned");
    mask.get(topic as usize).unwrap_or(false)
  }

  pub(crate) fn subscribed_topics(&self) -> Vec<TopicId> {
    let mask = self.inner.mask.lock().expect("listener mask lock poisoned");
    mask
      .iter()
      .enumerate()
      .filter_map(|(topic, bit)| bit.then_some(topic as TopicId))
      .collect()
  }

  pub(crate) fn same_listener(&self, other: &Listener) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Non-blocking push into a queue sink. `Ok` on delivery; `Err(true)` when
  /// the queue was full (sticky flag already set), `Err(false)` when the
  /// receiver is gone.
  pub(crate) fn try_push(&self, event: Event) -> Result<(), bool> {
    let Sink::Queue(tx) = &self.inner.sink else {
      panic!("push into listener \"{}\" without a queue sink", self.inner.name);
    };
    match tx.try_send(event) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => {
        self.set_err_full();
        Err(true)
      }
      Err(TrySendError::Disconnected(_)) => {
        // Receiver dropped; counts as undeliverable, same as full.
        self.set_err_full();
        Err(false)
      }
    }
  }
}

impl fmt::Debug for Listener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Listener")
      .field("name", &self.inner.name)
      .field("sink", &self.inner.sink.kind())
      .field("priority", &self.priority())
      .field("err_full", &self.err_full())
      .field("ref_count", &self.ref_count())
      .finish()
  }
}

/// Consuming end of a queue-sink listener.
pub struct EventReceiver {
  rx: crossbeam_channel::Receiver<Event>,
}

impl EventReceiver {
  pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
    self.rx.recv_timeout(timeout)
  }

  pub fn try_recv(&self) -> Option<Event> {
    self.rx.try_recv().ok()
  }

  pub fn len(&self) -> usize {
    self.rx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rx.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn queue_push_and_receive() {
    let (listener, receiver) = Listener::queue("q", 2);
    assert!(listener.try_push(Event::from_u32(0, 1)).is_ok());
    assert!(listener.try_push(Event::from_u32(0, 2)).is_ok());
    assert_eq!(listener.try_push(Event::from_u32(0, 3)), Err(true));
    assert!(listener.err_full());
    listener.clear_err_full();
    assert!(!listener.err_full());
    assert_eq!(receiver.try_recv().unwrap().value_u32(), Some(1));
    assert_eq!(receiver.try_recv().unwrap().value_u32(), Some(2));
    assert!(receiver.try_recv().is_none());
  }

  #[test]
  #[should_panic(expected = "without a queue sink")]
  fn pushing_into_a_callback_listener_is_fatal() {
    let listener = Listener::callback("cb", |_| {});
    let _ = listener.try_push(Event::from_u32(0, 0));
  }

  #[test]
  fn mask_tracks_subscriptions() {
    let (listener, _rx) = Listener::queue("q", 1);
    listener.ensure_mask(64);
    assert!(!listener.is_subscribed(5));
    listener.set_topic(5, true);
    listener.set_topic(63, true);
    assert!(listener.is_subscribed(5));
    assert_eq!(listener.subscribed_topics(), vec![5, 63]);
    listener.set_topic(5, false);
    assert_eq!(listener.subscribed_topics(), vec![63]);
    // Re-sizing to the same width keeps the bits.
    listener.ensure_mask(64);
    assert!(listener.is_subscribed(63));
  }

  #[test]
  fn identity_is_by_handle() {
    let (a, _rx) = Listener::queue("same-name", 1);
    let (b, _rx2) = Listener::queue("same-name", 1);
    assert!(a.same_listener(&a.clone()));
    assert!(!a.same_listener(&b));
  }
}
