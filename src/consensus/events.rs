//! Fan-out of block lifecycle notifications.
//!
//! Components interested in imported or finalized blocks register a
//! bounded channel and receive a best-effort copy of every event.
//! Sends never block the importer: a subscriber whose channel is
//! full simply misses that event, so subscribers size their buffers
//! for the rate they can drain.

use {
  crate::primitives::Header,
  dashmap::DashMap,
  futures::Stream,
  std::{
    pin::Pin,
    task::{Context, Poll},
  },
  thiserror::Error,
  tokio::sync::mpsc::{self, error::TrySendError, Sender},
  tracing::trace,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
  #[error("all subscriber slots are in use")]
  NoFreeSlots,
}

/// Registry of imported/finalized subscribers, keyed by a one-byte
/// id handed back on registration.
#[derive(Default)]
pub struct BlockEvents {
  imported: DashMap<u8, Sender<Header>>,
  finalized: DashMap<u8, Sender<Header>>,
}

impl BlockEvents {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register_imported_channel(
    &self,
    channel: Sender<Header>,
  ) -> Result<u8, Error> {
    register(&self.imported, channel)
  }

  pub fn register_finalized_channel(
    &self,
    channel: Sender<Header>,
  ) -> Result<u8, Error> {
    register(&self.finalized, channel)
  }

  /// Unregistering an id that is not (or no longer) present is
  /// fine.
  pub fn unregister_imported_channel(&self, id: u8) {
    self.imported.remove(&id);
  }

  pub fn unregister_finalized_channel(&self, id: u8) {
    self.finalized.remove(&id);
  }

  /// Registers a fresh channel of the given capacity and hands
  /// back its id together with the receiving side as a stream.
  pub fn imported_stream(
    &self,
    capacity: usize,
  ) -> Result<(u8, NotificationStream), Error> {
    let (tx, rx) = mpsc::channel(capacity);
    let id = self.register_imported_channel(tx)?;
    Ok((id, NotificationStream { receiver: rx }))
  }

  pub fn finalized_stream(
    &self,
    capacity: usize,
  ) -> Result<(u8, NotificationStream), Error> {
    let (tx, rx) = mpsc::channel(capacity);
    let id = self.register_finalized_channel(tx)?;
    Ok((id, NotificationStream { receiver: rx }))
  }

  pub(crate) fn notify_imported(&self, header: &Header) {
    broadcast(&self.imported, header, "imported");
  }

  pub(crate) fn notify_finalized(&self, header: &Header) {
    broadcast(&self.finalized, header, "finalized");
  }
}

/// A block-notification subscription viewed as a stream, for
/// consumers written against combinators rather than channels.
pub struct NotificationStream {
  receiver: mpsc::Receiver<Header>,
}

impl Stream for NotificationStream {
  type Item = Header;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    self.receiver.poll_recv(cx)
  }
}

fn register(
  channels: &DashMap<u8, Sender<Header>>,
  channel: Sender<Header>,
) -> Result<u8, Error> {
  // ids are reused after unregistration, smallest free byte first
  let id = (0..=u8::MAX)
    .find(|id| !channels.contains_key(id))
    .ok_or(Error::NoFreeSlots)?;
  channels.insert(id, channel);
  Ok(id)
}

fn broadcast(
  channels: &DashMap<u8, Sender<Header>>,
  header: &Header,
  kind: &str,
) {
  for entry in channels.iter() {
    match entry.value().try_send(header.clone()) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => {
        trace!(
          subscriber = *entry.key(),
          block = %header,
          "dropping {kind} notification, subscriber is falling behind"
        );
      }
      Err(TrySendError::Closed(_)) => {
        trace!(
          subscriber = *entry.key(),
          "dropping {kind} notification, subscriber is gone"
        );
      }
    }
  }
}
