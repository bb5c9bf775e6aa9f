//! `ebus` is a topic-filtered, in-process publish/subscribe event bus.
//!
//! Publishers tag events with a small integer topic id. Listeners declare
//! interest through a per-topic bitmask and receive events through one of
//! three delivery sinks: a synchronous callback, a bounded queue, or a
//! one-shot wake-up notification.
//!
//! All topology changes (attach/detach/subscribe) and all publications are
//! serialized by a single dispatcher thread that owns the listener registry
//! and the retained-event cache. Clients talk to the dispatcher over a
//! bounded command inbox, which also gives the bus a total order over
//! publications: commands pushed from the same thread are processed in push
//! order, and two listeners subscribed to the same topic observe the same
//! publication order for that topic.
//!
//! Event payloads are either caller-managed ("static" envelopes, which may be
//! retained and republished) or drawn from three fixed-block pools and
//! reference counted across consumers. A pooled envelope returns to its pool
//! when the last consumer releases it.
//!
//! ```
//! use ebus::{BusConfig, Event, EventBus, Listener};
//! use std::time::Duration;
//!
//! let bus = EventBus::new(BusConfig::default()).unwrap();
//!
//! let (listener, events) = Listener::queue("logger", 8);
//! bus.attach(&listener).unwrap();
//! bus.subscribe_one(&listener, 3).unwrap();
//!
//! bus.publish(&Event::from_u32(3, 42), false).unwrap();
//!
//! let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
//! assert_eq!(event.value_u32(), Some(42));
//! ```

mod alloc;
mod bus;
mod command;
mod config;
mod dispatcher;
mod error;
mod event;
mod listener;
mod pool;
mod wake;

pub use crate::{
  alloc::EventAllocator,
  bus::EventBus,
  config::{BusConfig, PoolConfig},
  error::{BusError, BusResult},
  event::{Event, PayloadGuard, PoolClass, TopicId},
  listener::{EventReceiver, Listener},
  pool::PoolInfo,
  wake::Notification,
};
