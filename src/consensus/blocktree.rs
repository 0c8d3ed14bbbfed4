//! Fork-aware tree of the blocks imported since the last finalized
//! block.
//!
//! Ideally under perfect network conditions this structure would be
//! a linked list. Network delays, partitions and malicious actors
//! create competing histories, and this tree tracks all of them
//! until the finality gadget settles on one and the rest is pruned.

use {
  crate::primitives::{BlockNumber, Hash, Header},
  std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Instant,
  },
  thiserror::Error,
  tracing::trace,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
  #[error("block already exists in the tree")]
  BlockExists,

  #[error("parent block not found in the tree")]
  ParentNotFound,

  #[error("block {0} not found in the tree")]
  NodeNotFound(Hash),

  #[error("no block with number {0} on the canonical chain")]
  NumberNotInTree(BlockNumber),

  #[error("end block does not descend from the start block")]
  NotDescendant,
}

/// A single unfinalized block. Nodes live in the tree's flat node
/// map and link to each other by hash, so ancestry walks are plain
/// map chases without shared ownership.
#[derive(Debug, Clone)]
pub struct Node {
  hash: Hash,
  number: BlockNumber,
  parent: Option<Hash>,
  children: Vec<Hash>,
  arrival_time: Instant,
  is_primary: bool,
  description: String,
}

impl Node {
  pub fn hash(&self) -> Hash {
    self.hash
  }

  pub fn number(&self) -> BlockNumber {
    self.number
  }

  pub fn parent(&self) -> Option<Hash> {
    self.parent
  }

  pub fn children(&self) -> &[Hash] {
    &self.children
  }

  pub fn arrival_time(&self) -> Instant {
    self.arrival_time
  }

  pub fn is_primary(&self) -> bool {
    self.is_primary
  }

  pub fn description(&self) -> &str {
    &self.description
  }
}

/// True when `a` wins chain selection over `b`: greatest number
/// first, then earliest arrival, then smallest hash. Deterministic
/// across nodes observing the same arrivals.
fn prefer(a: &Node, b: &Node) -> bool {
  if a.number != b.number {
    return a.number > b.number;
  }
  if a.arrival_time != b.arrival_time {
    return a.arrival_time < b.arrival_time;
  }
  a.hash < b.hash
}

/// The current leaf set plus a cached pointer to the leaf the
/// chain-selection rule favors. The cache is kept current on every
/// insert and prune.
#[derive(Debug, Clone, Default)]
struct LeafMap {
  nodes: HashSet<Hash>,
  deepest: Option<Hash>,
}

/// In-memory tree of all unfinalized blocks, rooted at the last
/// finalized one.
#[derive(Debug, Clone)]
pub struct BlockTree {
  root: Hash,
  nodes: HashMap<Hash, Node>,
  leaves: LeafMap,
}

impl BlockTree {
  /// A tree with a single node for the given header. The root's
  /// arrival time is the current monotonic time.
  pub fn new_from_root(header: &Header) -> Self {
    let hash = header.hash();
    let node = Node {
      hash,
      number: header.number,
      parent: None,
      children: vec![],
      arrival_time: Instant::now(),
      is_primary: header.digest.has_primary_slot_claim(),
      description: "root block".into(),
    };

    let mut nodes = HashMap::new();
    nodes.insert(hash, node);

    Self {
      root: hash,
      nodes,
      leaves: LeafMap {
        nodes: HashSet::from([hash]),
        deepest: Some(hash),
      },
    }
  }

  /// Hash of the last finalized block, the root of the tree.
  pub fn root(&self) -> Hash {
    self.root
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn get_node(&self, hash: Hash) -> Option<&Node> {
    self.nodes.get(&hash)
  }

  pub fn contains(&self, hash: Hash) -> bool {
    self.nodes.contains_key(&hash)
  }

  /// All nodes currently in the tree, in no particular order.
  pub fn iter(&self) -> impl Iterator<Item = &Node> {
    self.nodes.values()
  }

  /// Inserts a new leaf for the given header. Fails if the header
  /// is already present or its parent is not. Forks at equal
  /// numbers are allowed; only the parent link is validated.
  pub fn add_block(
    &mut self,
    header: &Header,
    arrival_time: Instant,
  ) -> Result<Hash, Error> {
    let hash = header.hash();
    if self.nodes.contains_key(&hash) {
      return Err(Error::BlockExists);
    }

    let parent = header.parent_hash;
    if !self.nodes.contains_key(&parent) {
      return Err(Error::ParentNotFound);
    }

    let is_primary = header.digest.has_primary_slot_claim();
    let node = Node {
      hash,
      number: header.number,
      parent: Some(parent),
      children: vec![],
      arrival_time,
      is_primary,
      description: if is_primary {
        "primary block".into()
      } else {
        "secondary block".into()
      },
    };

    self
      .nodes
      .get_mut(&parent)
      .expect("presence checked above")
      .children
      .push(hash);
    self.nodes.insert(hash, node);

    self.leaves.nodes.remove(&parent);
    self.leaves.nodes.insert(hash);
    self.update_deepest_with(hash);

    Ok(hash)
  }

  /// Current leaf hashes: exactly the nodes with no children.
  pub fn leaves(&self) -> Vec<Hash> {
    self.leaves.nodes.iter().copied().collect()
  }

  /// The leaf the canonical chain ends in.
  pub fn deepest_leaf(&self) -> Hash {
    self
      .leaves
      .deepest
      .expect("a non-empty tree always has a deepest leaf")
  }

  /// Hash of the current best block, the tip of the canonical
  /// chain.
  pub fn best_block_hash(&self) -> Hash {
    self.deepest_leaf()
  }

  /// True iff `ancestor` lies on the path from `block` to the
  /// root. Every block is a descendant of itself.
  pub fn is_descendant_of(
    &self,
    block: Hash,
    ancestor: Hash,
  ) -> Result<bool, Error> {
    if !self.nodes.contains_key(&block) {
      return Err(Error::NodeNotFound(block));
    }
    if !self.nodes.contains_key(&ancestor) {
      return Err(Error::NodeNotFound(ancestor));
    }

    let mut current = Some(block);
    while let Some(hash) = current {
      if hash == ancestor {
        return Ok(true);
      }
      current = self.nodes[&hash].parent;
    }
    Ok(false)
  }

  /// The deepest block that both given blocks descend from.
  pub fn highest_common_ancestor(
    &self,
    a: Hash,
    b: Hash,
  ) -> Result<Hash, Error> {
    if !self.nodes.contains_key(&a) {
      return Err(Error::NodeNotFound(a));
    }
    if !self.nodes.contains_key(&b) {
      return Err(Error::NodeNotFound(b));
    }

    let mut ancestors = HashSet::new();
    let mut current = Some(a);
    while let Some(hash) = current {
      ancestors.insert(hash);
      current = self.nodes[&hash].parent;
    }

    let mut current = Some(b);
    while let Some(hash) = current {
      if ancestors.contains(&hash) {
        return Ok(hash);
      }
      current = self.nodes[&hash].parent;
    }

    // both walks terminate at the root, which is in `ancestors`
    Ok(self.root)
  }

  /// The ordered hash sequence `[from, .., to]`. Fails unless `to`
  /// descends from `from`.
  pub fn subchain(&self, from: Hash, to: Hash) -> Result<Vec<Hash>, Error> {
    if !self.is_descendant_of(to, from)? {
      return Err(Error::NotDescendant);
    }

    let mut chain = vec![];
    let mut current = Some(to);
    while let Some(hash) = current {
      chain.push(hash);
      if hash == from {
        break;
      }
      current = self.nodes[&hash].parent;
    }
    chain.reverse();
    Ok(chain)
  }

  /// The unique hash with the given number on the canonical chain.
  /// Fails for numbers below the root or above the deepest leaf.
  pub fn get_hash_by_number(
    &self,
    number: BlockNumber,
  ) -> Result<Hash, Error> {
    let deepest = self.deepest_leaf();
    if number > self.nodes[&deepest].number
      || number < self.nodes[&self.root].number
    {
      return Err(Error::NumberNotInTree(number));
    }

    let mut current = Some(deepest);
    while let Some(hash) = current {
      let node = &self.nodes[&hash];
      if node.number == number {
        return Ok(hash);
      }
      current = node.parent;
    }
    Err(Error::NumberNotInTree(number))
  }

  /// Every block with the given number, on any branch. Sorted by
  /// hash so the output is stable.
  pub fn all_blocks_at_number(&self, number: BlockNumber) -> Vec<Hash> {
    let mut hashes: Vec<Hash> = self
      .nodes
      .values()
      .filter(|node| node.number == number)
      .map(|node| node.hash)
      .collect();
    hashes.sort();
    hashes
  }

  /// The canonical chain: every hash from the root to the deepest
  /// leaf, in order.
  pub fn longest_path(&self) -> Vec<Hash> {
    let mut path = vec![];
    let mut current = Some(self.deepest_leaf());
    while let Some(hash) = current {
      path.push(hash);
      current = self.nodes[&hash].parent;
    }
    path.reverse();
    path
  }

  /// Makes `finalized` the new root and removes every block that
  /// is not in its subtree, returning the removed hashes so callers
  /// can clean up any per-block state. Finalizing the current root
  /// is a no-op.
  pub fn prune(&mut self, finalized: Hash) -> Result<Vec<Hash>, Error> {
    if finalized == self.root {
      return Ok(vec![]);
    }
    if !self.nodes.contains_key(&finalized) {
      return Err(Error::NodeNotFound(finalized));
    }

    let mut retained = HashSet::new();
    let mut stack = vec![finalized];
    while let Some(hash) = stack.pop() {
      retained.insert(hash);
      stack.extend(self.nodes[&hash].children.iter().copied());
    }

    let pruned: Vec<Hash> = self
      .nodes
      .keys()
      .filter(|hash| !retained.contains(*hash))
      .copied()
      .collect();
    for hash in &pruned {
      self.nodes.remove(hash);
      self.leaves.nodes.remove(hash);
    }

    // pruned subtrees carry their leaves with them, and no retained
    // node loses children, so only the detached root link and the
    // cached selection need fixing up
    self
      .nodes
      .get_mut(&finalized)
      .expect("finalized node is retained")
      .parent = None;
    self.root = finalized;

    let deepest_still_leaf = self
      .leaves
      .deepest
      .map_or(false, |hash| self.leaves.nodes.contains(&hash));
    if !deepest_still_leaf {
      self.reselect_deepest();
    }

    trace!(
      finalized = %finalized,
      pruned = pruned.len(),
      tree = %self,
      "pruned block tree"
    );

    Ok(pruned)
  }

  /// An independent tree with identical content.
  pub fn deep_copy(&self) -> Self {
    self.clone()
  }

  /// Folds a freshly inserted leaf into the cached deepest-leaf
  /// pointer.
  fn update_deepest_with(&mut self, candidate: Hash) {
    let current_is_leaf = self
      .leaves
      .deepest
      .map_or(false, |hash| self.leaves.nodes.contains(&hash));
    if !current_is_leaf {
      self.reselect_deepest();
      return;
    }

    let current = self.leaves.deepest.expect("checked above");
    if prefer(&self.nodes[&candidate], &self.nodes[&current]) {
      self.leaves.deepest = Some(candidate);
    }
  }

  fn reselect_deepest(&mut self) {
    let mut best: Option<&Node> = None;
    for hash in &self.leaves.nodes {
      let node = &self.nodes[hash];
      match best {
        Some(current) if !prefer(node, current) => {}
        _ => best = Some(node),
      }
    }
    self.leaves.deepest = best.map(|node| node.hash);
  }

  fn fmt_subtree(
    &self,
    f: &mut fmt::Formatter<'_>,
    hash: Hash,
    depth: usize,
  ) -> fmt::Result {
    let node = &self.nodes[&hash];
    writeln!(
      f,
      "{:indent$}#{} {} ({})",
      "",
      node.number,
      node.hash,
      node.description,
      indent = depth * 2
    )?;
    for child in &node.children {
      self.fmt_subtree(f, *child, depth + 1)?;
    }
    Ok(())
  }
}

impl fmt::Display for BlockTree {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.fmt_subtree(f, self.root, 0)
  }
}
