use std::{
  fmt::Write as _,
  sync::{Mutex, MutexGuard},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::BusConfig,
  error::{BusError, BusResult},
  event::{Event, PoolClass},
  listener::Listener,
  pool::{BlockPool, PoolInfo},
  TopicId,
};

struct Pools {
  small: BlockPool,
  medium: BlockPool,
  large: BlockPool,
}

impl Pools {
  fn by_class_mut(&mut self, class: PoolClass) -> &mut BlockPool {
    match class {
      PoolClass::Small => &mut self.small,
      PoolClass::Medium => &mut self.medium,
      PoolClass::Large => &mut self.large,
      PoolClass::Static => panic!("static events have no pool"),
    }
  }

  fn by_class(&self, class: PoolClass) -> &BlockPool {
    match class {
      PoolClass::Small => &self.small,
      PoolClass::Medium => &self.medium,
      PoolClass::Large => &self.large,
      PoolClass::Static => panic!("static events have no pool"),
    }
  }
}

const POOL_ORDER: [PoolClass; 3] = [PoolClass::Small, PoolClass::Medium, PoolClass::Large];

/// Pooled-event allocation and release.
///
/// Owns the three fixed-block pools behind one mutex. Refcount updates that
/// cross thread boundaries (delivery bumps, releases) share that mutex as
/// their critical section; the counters themselves are atomics so diagnostic
/// reads stay lock-free.
pub struct EventAllocator {
  pools: Mutex<Pools>,
}

impl EventAllocator {
  pub(crate) fn new(config: &BusConfig) -> BusResult<EventAllocator> {
    Ok(EventAllocator {
      pools: Mutex::new(Pools {
        small: BlockPool::new(config.small_pool.block_size, config.small_pool.block_count)?,
        medium: BlockPool::new(config.medium_pool.block_size, config.medium_pool.block_count)?,
        large: BlockPool::new(config.large_pool.block_size, config.large_pool.block_count)?,
      }),
    })
  }

  fn lock(&self) -> MutexGuard<'_, Pools> {
    self.pools.lock().expect("allocator mutex poisoned")
  }

  /// Allocates a pooled envelope with `payload` copied into the smallest
  /// fitting pool block. The refcount starts at zero: the envelope is freed
  /// right after publication unless some queue delivery picked it up.
  ///
  /// A payload larger than the largest pool block is a contract violation.
  pub fn alloc(&self, topic: TopicId, publisher_id: u16, payload: &[u8]) -> BusResult<Event> {
    self.alloc_with_refs(topic, publisher_id, payload, 0)
  }

  /// Like [`alloc`](EventAllocator::alloc), but the refcount starts at one:
  /// the allocating task keeps ownership until it releases, so the
  /// "no subscribers" branch cannot reclaim the envelope under the
  /// publisher. Required for [`publish_to_listener`] flows.
  ///
  /// [`publish_to_listener`]: crate::EventBus::publish_to_listener
  pub fn alloc_owned(&self, topic: TopicId, publisher_id: u16, payload: &[u8]) -> BusResult<Event> {
    self.alloc_with_refs(topic, publisher_id, payload, 1)
  }

  fn alloc_with_refs(
    &self,
    topic: TopicId,
    publisher_id: u16,
    payload: &[u8],
    initial_refs: u32,
  ) -> BusResult<Event> {
    let mut pools = self.lock();
    assert!(
      payload.len() <= pools.large.block_size(),
      "event payload of {} bytes exceeds the largest pool block ({})",
      payload.len(),
      pools.large.block_size()
    );
    for class in POOL_ORDER {
      let pool = pools.by_class_mut(class);
      if pool.block_size() < payload.len() {
        continue;
      }
      if let Some(mut storage) = pool.alloc() {
        storage.extend_from_slice(payload);
        trace!("allocated {:?} block for topic {} ({} bytes)", class, topic, payload.len());
        return Ok(Event::pooled(topic, publisher_id, class, storage, initial_refs));
      }
    }
    debug!("pools exhausted for a {}-byte payload", payload.len());
    Err(BusError::PoolExhausted {
      requested: payload.len(),
    })
  }

  /// Drops one hold on a pooled envelope; when the count reaches zero the
  /// block goes back to its pool. `listener` names the queue-sink listener
  /// the event was consumed through; publisher-side releases pass `None`.
  ///
  /// Releasing a static envelope is a no-op.
  pub fn release(&self, event: Event, listener: Option<&Listener>) {
    if !event.is_pooled() {
      return;
    }
    let mut pools = self.lock();
    if let Some(listener) = listener {
      listener.dec_ref_checked();
    }
    if event.dec_ref_checked() == 0 {
      let storage = event.take_storage();
      pools.by_class_mut(event.pool_class()).free(storage);
      trace!("event on topic {} returned to {:?} pool", event.topic(), event.pool_class());
    }
  }

  /// Dispatcher hold for the duration of a fan-out walk.
  pub(crate) fn acquire(&self, event: &Event) {
    let _pools = self.lock();
    event.inc_ref();
  }

  /// Accounts one successful queue delivery.
  pub(crate) fn bind(&self, event: &Event, listener: &Listener) {
    let _pools = self.lock();
    event.inc_ref();
    listener.inc_ref();
  }

  /// Rolls a delivery bump back after a failed push. The dispatcher still
  /// holds its fan-out reference, so this cannot reach zero there.
  pub(crate) fn unbind(&self, event: &Event, listener: &Listener) {
    let _pools = self.lock();
    event.dec_ref_checked();
    listener.dec_ref_checked();
  }

  /// True iff all three pools pass their free-list and accounting checks.
  pub fn integrity(&self) -> bool {
    let pools = self.lock();
    POOL_ORDER.iter().all(|&class| pools.by_class(class).integrity().0)
  }

  pub fn info(&self, class: PoolClass) -> PoolInfo {
    self.lock().by_class(class).info()
  }

  pub fn report(&self) -> String {
    let pools = self.lock();
    let mut out = String::new();
    let _ = writeln!(out, "pool    block  count  in_use  high  free  unlinked");
    for class in POOL_ORDER {
      let info = pools.by_class(class).info();
      let _ = writeln!(
        out,
        "{:<7} {:<6} {:<6} {:<7} {:<5} {:<5} {}",
        format!("{class:?}").to_lowercase(),
        info.block_size,
        info.block_count,
        info.in_use,
        info.high_water,
        info.free_len,
        info.unlinked
      );
    }
    out
  }
}
