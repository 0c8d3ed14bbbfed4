//! Shared view of the unfinalized chain: the block tree, the
//! headers backing it, and the notification fan-out.

use {
  super::{
    blocktree::{self, BlockTree},
    events::{self, BlockEvents},
  },
  crate::primitives::{BlockNumber, Hash, Header},
  std::{collections::HashMap, sync::RwLock, time::Instant},
  tokio::sync::mpsc::Sender,
  tracing::debug,
};

struct Inner {
  tree: BlockTree,
  headers: HashMap<Hash, Header>,
}

/// The tree and the header index form one critical section: writers
/// (import, finalize) take the lock exclusively, readers see a
/// consistent snapshot. Notifications are published while the write
/// lock is held so every subscriber observes events in insertion
/// order.
pub struct BlockState {
  inner: RwLock<Inner>,
  events: BlockEvents,
}

impl BlockState {
  pub fn new(genesis: Header) -> Self {
    let tree = BlockTree::new_from_root(&genesis);
    let mut headers = HashMap::new();
    headers.insert(genesis.hash(), genesis);

    Self {
      inner: RwLock::new(Inner { tree, headers }),
      events: BlockEvents::new(),
    }
  }

  /// Inserts a freshly imported header and announces it. The
  /// arrival time is the current monotonic time.
  pub fn add_block(&self, header: Header) -> Result<Hash, blocktree::Error> {
    self.add_block_with_arrival_time(header, Instant::now())
  }

  pub fn add_block_with_arrival_time(
    &self,
    header: Header,
    arrival_time: Instant,
  ) -> Result<Hash, blocktree::Error> {
    let mut inner = self.inner.write().expect("block state lock poisoned");
    let hash = inner.tree.add_block(&header, arrival_time)?;
    inner.headers.insert(hash, header.clone());
    self.events.notify_imported(&header);
    Ok(hash)
  }

  /// Marks the given block as finalized: prunes every branch not
  /// descending from it, drops the pruned headers and announces the
  /// finalization. Returns the pruned hashes.
  pub fn finalize(&self, hash: Hash) -> Result<Vec<Hash>, blocktree::Error> {
    let mut inner = self.inner.write().expect("block state lock poisoned");
    let pruned = inner.tree.prune(hash)?;
    for stale in &pruned {
      inner.headers.remove(stale);
    }

    let header = inner
      .headers
      .get(&hash)
      .expect("finalized block is retained by the prune")
      .clone();
    debug!(block = %header, pruned = pruned.len(), "block finalized");
    self.events.notify_finalized(&header);
    Ok(pruned)
  }

  /// Header of the tip of the canonical chain.
  pub fn best_block_header(&self) -> Header {
    let inner = self.inner.read().expect("block state lock poisoned");
    let best = inner.tree.best_block_hash();
    inner
      .headers
      .get(&best)
      .expect("tree and header index are kept in sync")
      .clone()
  }

  pub fn best_block_hash(&self) -> Hash {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.tree.best_block_hash()
  }

  pub fn header(&self, hash: Hash) -> Option<Header> {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.headers.get(&hash).cloned()
  }

  pub fn has_header(&self, hash: Hash) -> bool {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.headers.contains_key(&hash)
  }

  pub fn leaves(&self) -> Vec<Hash> {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.tree.leaves()
  }

  pub fn is_descendant_of(
    &self,
    block: Hash,
    ancestor: Hash,
  ) -> Result<bool, blocktree::Error> {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.tree.is_descendant_of(block, ancestor)
  }

  pub fn highest_common_ancestor(
    &self,
    a: Hash,
    b: Hash,
  ) -> Result<Hash, blocktree::Error> {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.tree.highest_common_ancestor(a, b)
  }

  pub fn subchain(
    &self,
    from: Hash,
    to: Hash,
  ) -> Result<Vec<Hash>, blocktree::Error> {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.tree.subchain(from, to)
  }

  pub fn get_hash_by_number(
    &self,
    number: BlockNumber,
  ) -> Result<Hash, blocktree::Error> {
    let inner = self.inner.read().expect("block state lock poisoned");
    inner.tree.get_hash_by_number(number)
  }

  pub fn register_imported_channel(
    &self,
    channel: Sender<Header>,
  ) -> Result<u8, events::Error> {
    self.events.register_imported_channel(channel)
  }

  pub fn register_finalized_channel(
    &self,
    channel: Sender<Header>,
  ) -> Result<u8, events::Error> {
    self.events.register_finalized_channel(channel)
  }

  pub fn unregister_imported_channel(&self, id: u8) {
    self.events.unregister_imported_channel(id);
  }

  pub fn unregister_finalized_channel(&self, id: u8) {
    self.events.unregister_finalized_channel(id);
  }
}
