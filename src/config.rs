use static_assertions::const_assert;

use crate::error::{BusError, BusResult};

/// Subscription bitmasks are stored in 32-bit blocks, so the topic range of a
/// bus must be a multiple of this.
pub const TOPIC_BLOCK_BITS: usize = 32;

pub const DEFAULT_TOPIC_COUNT: usize = 64;
pub const DEFAULT_INBOX_DEPTH: usize = 16;
pub const DEFAULT_DISPATCHER_PRIORITY: u8 = 8;

pub const DEFAULT_SMALL_POOL: PoolConfig = PoolConfig {
  block_size: 64,
  block_count: 16,
};
pub const DEFAULT_MEDIUM_POOL: PoolConfig = PoolConfig {
  block_size: 256,
  block_count: 8,
};
pub const DEFAULT_LARGE_POOL: PoolConfig = PoolConfig {
  block_size: 1024,
  block_count: 4,
};

const_assert!(DEFAULT_TOPIC_COUNT % TOPIC_BLOCK_BITS == 0);
const_assert!(DEFAULT_SMALL_POOL.block_size >= std::mem::size_of::<usize>());
const_assert!(DEFAULT_SMALL_POOL.block_size <= DEFAULT_MEDIUM_POOL.block_size);
const_assert!(DEFAULT_MEDIUM_POOL.block_size <= DEFAULT_LARGE_POOL.block_size);

/// Geometry of one fixed-block pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
  pub block_size: usize,
  pub block_count: usize,
}

/// Per-instance bus configuration, validated by [`EventBus::new`].
///
/// Every field has a default, so `BusConfig::default()` gives a working bus.
/// A bus carries its own copy; several buses with different geometries can
/// coexist in one process.
///
/// [`EventBus::new`]: crate::EventBus::new
#[derive(Debug, Clone)]
pub struct BusConfig {
  /// Name used for the dispatcher thread and log lines.
  pub name: String,
  /// Number of topic ids, `0..topic_count`. Must be a nonzero multiple of 32.
  pub topic_count: usize,
  /// Capacity of the dispatcher command inbox.
  pub inbox_depth: usize,
  /// Scheduling priority of the dispatcher. Queue-sink listeners must attach
  /// with a strictly lower priority, so the dispatcher can always drain its
  /// inbox ahead of its consumers.
  pub dispatcher_priority: u8,
  pub small_pool: PoolConfig,
  pub medium_pool: PoolConfig,
  pub large_pool: PoolConfig,
}

impl Default for BusConfig {
  fn default() -> Self {
    BusConfig {
      name: "ebus".to_string(),
      topic_count: DEFAULT_TOPIC_COUNT,
      inbox_depth: DEFAULT_INBOX_DEPTH,
      dispatcher_priority: DEFAULT_DISPATCHER_PRIORITY,
      small_pool: DEFAULT_SMALL_POOL,
      medium_pool: DEFAULT_MEDIUM_POOL,
      large_pool: DEFAULT_LARGE_POOL,
    }
  }
}

impl BusConfig {
  pub fn validate(&self) -> BusResult<()> {
    if self.topic_count == 0 || self.topic_count % TOPIC_BLOCK_BITS != 0 {
      return Err(BusError::InvalidConfig(format!(
        "topic_count {} is not a nonzero multiple of {}",
        self.topic_count, TOPIC_BLOCK_BITS
      )));
    }
    if self.inbox_depth == 0 {
      return Err(BusError::InvalidConfig("inbox_depth must be nonzero".to_string()));
    }
    for (label, pool) in [
      ("small", &self.small_pool),
      ("medium", &self.medium_pool),
      ("large", &self.large_pool),
    ] {
      // The block must at least hold the free-list word of the pool design.
      if pool.block_size < std::mem::size_of::<usize>() {
        return Err(BusError::InvalidConfig(format!(
          "{} pool block size {} is below the minimum {}",
          label,
          pool.block_size,
          std::mem::size_of::<usize>()
        )));
      }
    }
    if self.small_pool.block_size > self.medium_pool.block_size
      || self.medium_pool.block_size > self.large_pool.block_size
    {
      return Err(BusError::InvalidConfig(
        "pool block sizes must be ordered small <= medium <= large".to_string(),
      ));
    }
    Ok(())
  }
}
