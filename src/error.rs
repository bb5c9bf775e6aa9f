use thiserror::Error;

/// Recoverable failures of the event bus.
///
/// Contract violations (topic out of range, retaining a pooled event, double
/// release, queue-sink listener at or above the dispatcher priority, ...) are
/// not represented here: they guard the refcount bookkeeping and the pool
/// integrity, so they panic instead.
#[derive(Debug, Error)]
pub enum BusError {
  /// Every pool whose block size fits the requested payload is exhausted.
  #[error("no free pool block for a {requested}-byte payload")]
  PoolExhausted { requested: usize },

  /// The dispatcher thread is gone. Only observed after the dispatcher
  /// panicked on a contract violation; a healthy bus outlives its clients.
  #[error("event bus dispatcher has stopped")]
  BusStopped,

  #[error("invalid bus configuration: {0}")]
  InvalidConfig(String),

  /// Failure to set up the dispatcher poll or thread.
  #[error("event bus I/O error: {0}")]
  Io(#[from] std::io::Error),
}

pub type BusResult<T> = Result<T, BusError>;
