use std::{
  cell::Cell,
  fmt::Write as _,
  sync::Arc,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_06::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel as mio_channel;

use crate::{
  alloc::EventAllocator,
  command::{Command, Request},
  event::{Event, PoolClass},
  listener::{Listener, Sink},
  TopicId,
};

pub(crate) const STOP_POLL_TOKEN: Token = Token(0);
pub(crate) const COMMAND_TOKEN: Token = Token(1);

thread_local! {
  static ON_DISPATCHER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Blocking bus calls from a delivery callback would deadlock the inbox, so
/// the client facade checks for that before enqueueing.
pub(crate) fn assert_not_on_dispatcher_thread() {
  assert!(
    !ON_DISPATCHER_THREAD.with(|flag| flag.get()),
    "event bus re-entered from a delivery callback on the dispatcher thread"
  );
}

#[derive(Clone, Copy, Default)]
struct LatencyStat {
  count: u64,
  min_us: u64,
  max_us: u64,
}

impl LatencyStat {
  fn record(&mut self, elapsed: Duration) {
    let us = elapsed.as_micros() as u64;
    if self.count == 0 || us < self.min_us {
      self.min_us = us;
    }
    if us > self.max_us {
      self.max_us = us;
    }
    self.count += 1;
  }
}

/// The single owner of the listener registry, the subscription masks and the
/// retained-event cache. All mutation of those happens on this struct's
/// thread; everyone else goes through the command inbox.
pub(crate) struct Dispatcher {
  name: String,
  topic_count: usize,
  start: Instant,
  allocator: Arc<EventAllocator>,
  // Attach order is delivery order.
  listeners: Vec<Listener>,
  retained: Box<[Option<Event>]>,
  latency: Box<[LatencyStat]>,
}

impl Dispatcher {
  pub fn new(
    name: String,
    topic_count: usize,
    start: Instant,
    allocator: Arc<EventAllocator>,
  ) -> Dispatcher {
    Dispatcher {
      name,
      topic_count,
      start,
      allocator,
      listeners: Vec::new(),
      retained: vec![None; topic_count].into_boxed_slice(),
      latency: vec![LatencyStat::default(); topic_count].into_boxed_slice(),
    }
  }

  /// The dispatcher task body. Blocks on the poll while idle; drains the
  /// inbox one command at a time; returns when the stop channel fires or
  /// every inbox sender is gone.
  pub fn event_loop(
    mut self,
    stop_receiver: mio_channel::Receiver<()>,
    inbox: mio_channel::Receiver<Request>,
  ) {
    ON_DISPATCHER_THREAD.with(|flag| flag.set(true));

    let poll = Poll::new().expect("dispatcher cannot create poll");
    poll
      .register(&stop_receiver, STOP_POLL_TOKEN, Ready::readable(), PollOpt::edge())
      .expect("dispatcher cannot register stop channel");
    poll
      .register(&inbox, COMMAND_TOKEN, Ready::readable(), PollOpt::edge())
      .expect("dispatcher cannot register inbox");

    info!("{}: dispatcher running, {} topics", self.name, self.topic_count);
    let mut poll_events = Events::with_capacity(4);
    loop {
      if let Err(e) = poll.poll(&mut poll_events, None) {
        error!("{}: poll failed: {e}", self.name);
        continue;
      }
      for poll_event in poll_events.iter() {
        match poll_event.token() {
          STOP_POLL_TOKEN => {
            info!("{}: dispatcher stopping", self.name);
            return;
          }
          COMMAND_TOKEN => {
            while let Ok(request) = inbox.try_recv() {
              self.handle(request);
            }
          }
          other => error!("{}: unexpected poll token {:?}", self.name, other),
        }
      }
    }
  }

  fn handle(&mut self, request: Request) {
    trace!("{}: serving {}", self.name, request.command.label());
    match request.command {
      Command::Attach { listener } => self.attach(listener),
      Command::Detach { listener } => self.detach(&listener),
      Command::SubscribeOne { listener, topic } => self.subscribe_one(&listener, topic),
      Command::SubscribeMany { listener, topics } => {
        for topic in topics {
          self.subscribe_one(&listener, topic);
        }
      }
      Command::UnsubscribeOne { listener, topic } => {
        listener.set_topic(topic, false);
      }
      Command::Publish {
        event,
        retain,
        enqueued,
      } => self.publish(event, retain, enqueued),
      Command::Invalidate { event } => {
        let topic = event.topic() as usize;
        assert!(topic < self.topic_count, "topic {topic} out of range");
        self.retained[topic] = None;
      }
      Command::DumpListeners { reply } => {
        let _ = reply.send(self.listener_table());
      }
      Command::DumpLatency { reply } => {
        let _ = reply.send(self.latency_table());
      }
    }
    if let Some(ack) = request.ack {
      let _ = ack.send(());
    }
  }

  fn attach(&mut self, listener: Listener) {
    assert!(
      !self.listeners.iter().any(|l| l.same_listener(&listener)),
      "listener \"{}\" attached twice",
      listener.name()
    );
    listener.ensure_mask(self.topic_count);
    debug!("{}: attach \"{}\" ({})", self.name, listener.name(), listener.sink().kind());
    self.listeners.push(listener);
  }

  fn detach(&mut self, listener: &Listener) {
    match self.listeners.iter().position(|l| l.same_listener(listener)) {
      Some(index) => {
        self.listeners.remove(index);
        debug!("{}: detach \"{}\"", self.name, listener.name());
      }
      None => warn!("{}: detach of unattached listener \"{}\"", self.name, listener.name()),
    }
  }

  fn subscribe_one(&mut self, listener: &Listener, topic: TopicId) {
    assert!((topic as usize) < self.topic_count, "topic {topic} out of range");
    listener.ensure_mask(self.topic_count);
    listener.set_topic(topic, true);
    // Late-join replay: a new subscriber sees the last retained value
    // before any publication admitted after this command.
    if let Some(retained) = self.retained[topic as usize].clone() {
      trace!("{}: replaying retained topic {} to \"{}\"", self.name, topic, listener.name());
      self.deliver(listener, &retained);
    }
  }

  fn publish(&mut self, event: Event, retain: bool, enqueued: Instant) {
    let topic = event.topic() as usize;
    assert!(topic < self.topic_count, "topic {topic} out of range");

    let now_ms = self.start.elapsed().as_millis() as u32;
    event.mark_published(now_ms);

    if retain {
      assert!(
        event.pool_class() == PoolClass::Static,
        "retained event on topic {topic} must be statically allocated"
      );
      self.retained[topic] = Some(event.clone());
    } else {
      self.retained[topic] = None;
    }

    // Hold the envelope for the duration of the walk so a consumer that
    // receives and releases mid-fan-out cannot reclaim the block under us.
    let pooled = event.is_pooled();
    if pooled {
      self.allocator.acquire(&event);
    }

    for listener in &self.listeners {
      if listener.is_subscribed(event.topic()) {
        self.deliver(listener, &event);
      }
    }

    if pooled {
      // Drops the fan-out hold; frees immediately when no queue picked it up.
      self.allocator.release(event, None);
    }

    self.latency[topic].record(enqueued.elapsed());
  }

  fn deliver(&self, listener: &Listener, event: &Event) {
    match listener.sink() {
      Sink::Callback(callback) => callback(event),
      Sink::Queue(_) => {
        let pooled = event.is_pooled();
        if pooled {
          self.allocator.bind(event, listener);
        }
        match listener.try_push(event.clone()) {
          Ok(()) => {
            trace!("{}: queued topic {} for \"{}\"", self.name, event.topic(), listener.name());
          }
          Err(full) => {
            // Partial-failure fan-out: drop this one delivery, keep walking.
            if pooled {
              self.allocator.unbind(event, listener);
            }
            warn!(
              "{}: dropped topic {} for \"{}\" ({})",
              self.name,
              event.topic(),
              listener.name(),
              if full { "queue full" } else { "receiver gone" }
            );
          }
        }
      }
      Sink::Wake(notification) => notification.notify(),
    }
  }

  fn listener_table(&self) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}: {} listeners", self.name, self.listeners.len());
    for (index, listener) in self.listeners.iter().enumerate() {
      let _ = writeln!(
        out,
        "  [{index}] \"{}\" sink={} prio={} err_full={} refs={} topics={:?}",
        listener.name(),
        listener.sink().kind(),
        listener.priority(),
        listener.err_full(),
        listener.ref_count(),
        listener.subscribed_topics()
      );
    }
    out
  }

  fn latency_table(&self) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "topic  count  min_us  max_us");
    for (topic, stat) in self.latency.iter().enumerate() {
      if stat.count > 0 {
        let _ = writeln!(
          out,
          "{:<6} {:<6} {:<7} {}",
          topic, stat.count, stat.min_us, stat.max_us
        );
      }
    }
    out
  }
}
