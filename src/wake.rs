use std::{
  sync::{Condvar, Mutex},
  time::Duration,
};

/// Counting one-shot notification, the wake-sink primitive.
///
/// Delivery to a wake-sink listener hands over no event; it just bumps the
/// pending count and wakes one waiter. Mirrors an RTOS task notification:
/// notifications accumulate while nobody waits, and each wait consumes one.
#[derive(Default)]
pub struct Notification {
  pending: Mutex<u32>,
  cond: Condvar,
}

impl Notification {
  pub fn new() -> Notification {
    Notification::default()
  }

  pub fn notify(&self) {
    let mut pending = self.pending.lock().expect("notification lock poisoned");
    *pending = pending.saturating_add(1);
    self.cond.notify_one();
  }

  /// Blocks until a notification is pending or `timeout` elapses. Returns
  /// true iff one was consumed.
  pub fn wait(&self, timeout: Duration) -> bool {
    let pending = self.pending.lock().expect("notification lock poisoned");
    let (mut pending, _timeout_result) = self
      .cond
      .wait_timeout_while(pending, timeout, |pending| *pending == 0)
      .expect("notification lock poisoned");
    if *pending > 0 {
      *pending -= 1;
      true
    } else {
      false
    }
  }

  /// Non-blocking variant of [`wait`](Notification::wait).
  pub fn try_consume(&self) -> bool {
    let mut pending = self.pending.lock().expect("notification lock poisoned");
    if *pending > 0 {
      *pending -= 1;
      true
    } else {
      false
    }
  }
}
