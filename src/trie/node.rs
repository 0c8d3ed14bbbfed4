use {crate::primitives::blake2_256, std::fmt};

/// Values longer than this are rendered as their hash when a node
/// is formatted for diagnostics.
const MAX_INLINE_VALUE_DISPLAY: usize = 1024;

/// A node of the storage trie.
#[derive(Debug, Clone, Default)]
pub enum Node {
  #[default]
  Empty,
  Branch(Branch),
  Leaf(Leaf),
}

/// An interior trie node with up to sixteen children, one per
/// nibble of the key alphabet.
#[derive(Debug, Clone, Default)]
pub struct Branch {
  /// Partial key, in nibbles.
  pub partial_key: Vec<u8>,
  pub children: [Option<Box<Node>>; 16],
  pub value: Option<Vec<u8>>,
  /// Set when the node differs from its persisted encoding.
  dirty: bool,
  /// Updated to the trie generation when the node is inserted,
  /// moved or iterated over; lets snapshots share unchanged nodes.
  generation: u64,
}

impl Branch {
  pub fn new(
    partial_key: Vec<u8>,
    value: Option<Vec<u8>>,
    dirty: bool,
    generation: u64,
  ) -> Self {
    Self {
      partial_key,
      children: Default::default(),
      value,
      dirty,
      generation,
    }
  }

  /// Bit `i` is set when the branch has a child at nibble `i`.
  pub fn children_bitmap(&self) -> u16 {
    let mut bitmap = 0u16;
    for (i, child) in self.children.iter().enumerate() {
      if child.is_some() {
        bitmap |= 1 << i;
      }
    }
    bitmap
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  pub fn set_dirty(&mut self, dirty: bool) {
    self.dirty = dirty;
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }
}

/// A terminal trie node holding a value.
#[derive(Debug, Clone, Default)]
pub struct Leaf {
  /// Partial key, in nibbles.
  pub partial_key: Vec<u8>,
  pub value: Vec<u8>,
  dirty: bool,
  generation: u64,
}

impl Leaf {
  pub fn new(
    partial_key: Vec<u8>,
    value: Vec<u8>,
    dirty: bool,
    generation: u64,
  ) -> Self {
    Self {
      partial_key,
      value,
      dirty,
      generation,
    }
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  pub fn set_dirty(&mut self, dirty: bool) {
    self.dirty = dirty;
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }
}

fn fmt_value(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
  if value.len() > MAX_INLINE_VALUE_DISPLAY {
    write!(f, "value (hashed)={}", blake2_256(value))
  } else {
    write!(f, "value=0x{}", hex_of(value))
  }
}

fn hex_of(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Display for Branch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "branch key=0x{} childrenBitmap={:b} ",
      hex_of(&self.partial_key),
      self.children_bitmap()
    )?;
    fmt_value(f, self.value.as_deref().unwrap_or_default())?;
    write!(f, " dirty={}", self.dirty)
  }
}

impl fmt::Display for Leaf {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "leaf key=0x{} ", hex_of(&self.partial_key))?;
    fmt_value(f, &self.value)?;
    write!(f, " dirty={}", self.dirty)
  }
}

impl fmt::Display for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Node::Empty => write!(f, "empty"),
      Node::Branch(branch) => branch.fmt(f),
      Node::Leaf(leaf) => leaf.fmt(f),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn branch_children_bitmap() {
    let mut branch = Branch::new(vec![0x1], None, false, 0);
    assert_eq!(branch.children_bitmap(), 0);

    branch.children[0] = Some(Box::new(Node::Leaf(Leaf::new(
      vec![],
      vec![1],
      false,
      0,
    ))));
    branch.children[7] = Some(Box::new(Node::Empty));
    branch.children[15] = Some(Box::new(Node::Empty));

    assert_eq!(branch.children_bitmap(), 1 | (1 << 7) | (1 << 15));
  }

  #[test]
  fn display_renders_key_and_value() {
    let leaf = Leaf::new(vec![0xa, 0x3], vec![0xde, 0xad], true, 0);
    assert_eq!(leaf.to_string(), "leaf key=0x0a03 value=0xdead dirty=true");

    let branch = Branch::new(vec![0x1], Some(vec![0xff]), false, 0);
    assert_eq!(
      branch.to_string(),
      "branch key=0x01 childrenBitmap=0 value=0xff dirty=false"
    );
  }

  #[test]
  fn display_hashes_large_values() {
    let leaf = Leaf::new(vec![], vec![0u8; 2048], false, 0);
    assert!(leaf.to_string().contains("value (hashed)="));
  }

  #[test]
  fn dirty_flag_toggles() {
    let mut leaf = Leaf::new(vec![], vec![], false, 3);
    assert!(!leaf.is_dirty());
    leaf.set_dirty(true);
    assert!(leaf.is_dirty());
    assert_eq!(leaf.generation(), 3);
  }
}
