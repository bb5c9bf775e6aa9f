use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::{event::Event, listener::Listener, TopicId};

/// What the dispatcher is asked to do. Topology commands mutate the registry
/// or the retained cache; `Publish` fans out; the dump commands format
/// dispatcher-owned state and reply over their own channel.
pub(crate) enum Command {
  Attach { listener: Listener },
  Detach { listener: Listener },
  SubscribeOne { listener: Listener, topic: TopicId },
  SubscribeMany { listener: Listener, topics: Vec<TopicId> },
  UnsubscribeOne { listener: Listener, topic: TopicId },
  Publish { event: Event, retain: bool, enqueued: Instant },
  Invalidate { event: Event },
  DumpListeners { reply: Sender<String> },
  DumpLatency { reply: Sender<String> },
}

impl Command {
  pub fn label(&self) -> &'static str {
    match self {
      Command::Attach { .. } => "attach",
      Command::Detach { .. } => "detach",
      Command::SubscribeOne { .. } => "subscribe_one",
      Command::SubscribeMany { .. } => "subscribe_many",
      Command::UnsubscribeOne { .. } => "unsubscribe_one",
      Command::Publish { .. } => "publish",
      Command::Invalidate { .. } => "invalidate",
      Command::DumpListeners { .. } => "dump_listeners",
      Command::DumpLatency { .. } => "dump_latency",
    }
  }
}

/// One inbox entry: a command plus the caller's completion rendezvous.
/// The non-blocking publish path sends with no rendezvous.
pub(crate) struct Request {
  pub command: Command,
  pub ack: Option<Sender<()>>,
}

impl Request {
  /// A request the caller blocks on until the dispatcher has processed it.
  pub fn acked(command: Command) -> (Request, Receiver<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
      Request {
        command,
        ack: Some(tx),
      },
      rx,
    )
  }

  pub fn fire_and_forget(command: Command) -> Request {
    Request { command, ack: None }
  }
}
