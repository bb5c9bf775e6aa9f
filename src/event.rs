use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, MutexGuard,
  },
};

use byteorder::{ByteOrder, LittleEndian};

/// Topic identifier, `0..topic_count` of the bus the event travels on.
pub type TopicId = u16;

/// Publisher ids are provenance only; 12 bits, 0 means unspecified.
pub const MAX_PUBLISHER_ID: u16 = (1 << 12) - 1;

/// Which fixed-block pool owns an envelope's payload storage.
///
/// `Static` marks a caller-managed envelope: its lifetime is whatever the
/// caller makes of it, its refcount is ignored, and it is the only kind that
/// may be retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
  Static,
  Small,
  Medium,
  Large,
}

impl PoolClass {
  pub fn is_pooled(self) -> bool {
    self != PoolClass::Static
  }
}

pub(crate) struct EventInner {
  topic: TopicId,
  publisher_id: u16,
  pool_class: PoolClass,
  published: AtomicBool,
  publish_time_ms: AtomicU32,
  ref_count: AtomicU32,
  // Pooled storage is taken back out of here on the last release, so the
  // payload sits behind a lock rather than being plain immutable bytes.
  payload: Mutex<Vec<u8>>,
}

/// An event envelope: topic id, optional publisher id, payload bytes, and the
/// publication/refcount bookkeeping the bus maintains.
///
/// `Event` is a cheap shared handle; cloning it does not touch the refcount.
/// The explicit [`ref_count`] counts *consumers* of a pooled envelope (queue
/// deliveries plus an `alloc_owned` publisher), and the storage returns to
/// its pool when that count falls to zero.
///
/// [`ref_count`]: Event::ref_count
#[derive(Clone)]
pub struct Event {
  inner: Arc<EventInner>,
}

impl Event {
  /// A statically-allocated envelope: caller-managed lifetime, never pooled,
  /// may be republished and retained.
  pub fn with_payload(topic: TopicId, publisher_id: u16, payload: &[u8]) -> Event {
    assert!(
      publisher_id <= MAX_PUBLISHER_ID,
      "publisher id {publisher_id} does not fit in 12 bits"
    );
    Event {
      inner: Arc::new(EventInner {
        topic,
        publisher_id,
        pool_class: PoolClass::Static,
        published: AtomicBool::new(false),
        publish_time_ms: AtomicU32::new(0),
        ref_count: AtomicU32::new(0),
        payload: Mutex::new(payload.to_vec()),
      }),
    }
  }

  /// Shorthand for the common case of a four-byte little-endian value.
  pub fn from_u32(topic: TopicId, value: u32) -> Event {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    Event::with_payload(topic, 0, &bytes)
  }

  /// Built by the allocator facade only: `storage` is a pool block.
  pub(crate) fn pooled(
    topic: TopicId,
    publisher_id: u16,
    pool_class: PoolClass,
    storage: Vec<u8>,
    initial_refs: u32,
  ) -> Event {
    assert!(
      publisher_id <= MAX_PUBLISHER_ID,
      "publisher id {publisher_id} does not fit in 12 bits"
    );
    debug_assert!(pool_class.is_pooled());
    Event {
      inner: Arc::new(EventInner {
        topic,
        publisher_id,
        pool_class,
        published: AtomicBool::new(false),
        publish_time_ms: AtomicU32::new(0),
        ref_count: AtomicU32::new(initial_refs),
        payload: Mutex::new(storage),
      }),
    }
  }

  pub fn topic(&self) -> TopicId {
    self.inner.topic
  }

  pub fn publisher_id(&self) -> u16 {
    self.inner.publisher_id
  }

  pub fn pool_class(&self) -> PoolClass {
    self.inner.pool_class
  }

  pub fn is_pooled(&self) -> bool {
    self.inner.pool_class.is_pooled()
  }

  /// Payload bytes. For a pooled envelope that has already been fully
  /// released the guard is empty.
  pub fn payload(&self) -> PayloadGuard<'_> {
    PayloadGuard(self.inner.payload.lock().expect("event payload lock poisoned"))
  }

  /// First four payload bytes as a little-endian `u32`, if present.
  pub fn value_u32(&self) -> Option<u32> {
    let payload = self.payload();
    if payload.len() >= 4 {
      Some(LittleEndian::read_u32(&payload[..4]))
    } else {
      None
    }
  }

  /// Consumers still holding this envelope. Meaningful for pooled envelopes
  /// only; a static envelope always reads zero.
  pub fn ref_count(&self) -> u32 {
    self.inner.ref_count.load(Ordering::SeqCst)
  }

  /// True once the dispatcher has published this envelope.
  pub fn was_published(&self) -> bool {
    self.inner.published.load(Ordering::SeqCst)
  }

  /// Milliseconds since bus creation, stamped by the dispatcher at
  /// publication time. Wraps after ~49 days.
  pub fn publish_time_ms(&self) -> u32 {
    self.inner.publish_time_ms.load(Ordering::SeqCst)
  }

  pub(crate) fn mark_published(&self, now_ms: u32) {
    self.inner.publish_time_ms.store(now_ms, Ordering::SeqCst);
    self.inner.published.store(true, Ordering::SeqCst);
  }

  // The refcount helpers run under the allocator lock; the atomics exist so
  // that diagnostic reads stay lock-free.

  pub(crate) fn inc_ref(&self) {
    self.inner.ref_count.fetch_add(1, Ordering::SeqCst);
  }

  /// Returns the remaining count. Panics on underflow: releasing an envelope
  /// more often than it was held breaks the pool accounting.
  pub(crate) fn dec_ref_checked(&self) -> u32 {
    let current = self.inner.ref_count.load(Ordering::SeqCst);
    assert!(current > 0, "double release of pooled event on topic {}", self.inner.topic);
    self.inner.ref_count.store(current - 1, Ordering::SeqCst);
    current - 1
  }

  /// Takes the pool block back out of the envelope on the last release.
  pub(crate) fn take_storage(&self) -> Vec<u8> {
    std::mem::take(&mut *self.inner.payload.lock().expect("event payload lock poisoned"))
  }

  pub(crate) fn same_event(&self, other: &Event) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl fmt::Debug for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Event")
      .field("topic", &self.inner.topic)
      .field("publisher_id", &self.inner.publisher_id)
      .field("pool_class", &self.inner.pool_class)
      .field("published", &self.was_published())
      .field("ref_count", &self.ref_count())
      .field("payload_len", &self.payload().len())
      .finish()
  }
}

/// Read access to an event payload.
pub struct PayloadGuard<'a>(MutexGuard<'a, Vec<u8>>);

impl std::ops::Deref for PayloadGuard<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    &self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn u32_payload_roundtrip() {
    let event = Event::from_u32(7, 0xDEAD_BEEF);
    assert_eq!(event.topic(), 7);
    assert_eq!(event.publisher_id(), 0);
    assert_eq!(event.value_u32(), Some(0xDEAD_BEEF));
    assert_eq!(event.payload().len(), 4);
    assert_eq!(event.pool_class(), PoolClass::Static);
    assert!(!event.was_published());
  }

  #[test]
  fn short_payload_has_no_u32_value() {
    let event = Event::with_payload(0, 0, &[1, 2]);
    assert_eq!(event.value_u32(), None);
  }

  #[test]
  #[should_panic(expected = "12 bits")]
  fn publisher_id_must_fit_12_bits() {
    let _ = Event::with_payload(0, 0x1000, &[]);
  }

  #[test]
  fn clone_is_the_same_event() {
    let event = Event::from_u32(1, 1);
    let other = event.clone();
    assert!(event.same_event(&other));
    assert!(!event.same_event(&Event::from_u32(1, 1)));
  }

  #[test]
  #[should_panic(expected = "double release")]
  fn refcount_underflow_is_fatal() {
    let event = Event::pooled(0, 0, PoolClass::Small, Vec::with_capacity(64), 0);
    event.dec_ref_checked();
  }
}
