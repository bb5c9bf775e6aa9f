use std::mem::size_of;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{BusError, BusResult};

/// Snapshot of one pool's accounting, for diagnostics and integrity checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolInfo {
  pub block_size: usize,
  pub block_count: usize,
  pub in_use: usize,
  pub high_water: usize,
  pub free_len: usize,
  pub unlinked: usize,
}

/// Fixed-block allocator: `block_count` blocks of `block_size` bytes, O(1)
/// alloc and free.
///
/// Two internal generations: a counter of blocks never yet handed out (the
/// unlinked prefix, materialized lazily) and a free list of returned blocks.
/// Allocation prefers the prefix, deferring free-list writes.
///
/// Not internally synchronized. The allocator facade owns the pools and calls
/// in under its own mutex, since allocation and release happen outside the
/// dispatcher thread.
pub(crate) struct BlockPool {
  block_size: usize,
  block_count: usize,
  unlinked: usize,
  free: Vec<Vec<u8>>,
  in_use: usize,
  high_water: usize,
}

impl BlockPool {
  pub fn new(block_size: usize, block_count: usize) -> BusResult<BlockPool> {
    // The block must at least hold the free-list link word.
    if block_size < size_of::<usize>() {
      return Err(BusError::InvalidConfig(format!(
        "pool block size {} is below the minimum {}",
        block_size,
        size_of::<usize>()
      )));
    }
    if block_count == 0 {
      return Err(BusError::InvalidConfig("pool must have at least one block".to_string()));
    }
    Ok(BlockPool {
      block_size,
      block_count,
      unlinked: block_count,
      free: Vec::with_capacity(block_count),
      in_use: 0,
      high_water: 0,
    })
  }

  pub fn block_size(&self) -> usize {
    self.block_size
  }

  /// One empty block with capacity `block_size`, or `None` when exhausted.
  pub fn alloc(&mut self) -> Option<Vec<u8>> {
    let block = if self.unlinked > 0 {
      self.unlinked -= 1;
      Vec::with_capacity(self.block_size)
    } else {
      self.free.pop()?
    };
    self.in_use += 1;
    if self.in_use > self.high_water {
      self.high_water = self.in_use;
    }
    Some(block)
  }

  /// Returns `block` to the free list. The caller must hand back a block that
  /// came out of this pool.
  pub fn free(&mut self, mut block: Vec<u8>) {
    assert!(self.in_use > 0, "pool freed more blocks than it allocated");
    debug_assert!(
      block.capacity() >= self.block_size,
      "foreign block returned to a {}-byte pool",
      self.block_size
    );
    block.clear();
    self.in_use -= 1;
    self.free.push(block);
  }

  /// Walks the free list and checks the accounting equation
  /// `block_count - in_use == free + unlinked`.
  pub fn integrity(&self) -> (bool, PoolInfo) {
    let free_ok = self.free.iter().all(|b| b.capacity() >= self.block_size && b.is_empty());
    let balance_ok = self.block_count - self.in_use == self.free.len() + self.unlinked;
    if !free_ok || !balance_ok {
      error!(
        "pool integrity failure: size={} count={} in_use={} free={} unlinked={}",
        self.block_size,
        self.block_count,
        self.in_use,
        self.free.len(),
        self.unlinked
      );
    }
    (free_ok && balance_ok, self.info())
  }

  pub fn info(&self) -> PoolInfo {
    PoolInfo {
      block_size: self.block_size,
      block_count: self.block_count,
      in_use: self.in_use,
      high_water: self.high_water,
      free_len: self.free.len(),
      unlinked: self.unlinked,
    }
  }
}
