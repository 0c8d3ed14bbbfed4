use {
  super::digest::Digest,
  blake2::{digest::consts::U32, Blake2b, Digest as _},
  parity_scale_codec::{Decode, Encode},
};

/// 32-byte block and state-root hash.
pub type Hash = primitive_types::H256;

/// Block height. The wire formats bound everything that crosses a
/// digest (u32 delays, u64 set ids), so heights fit in a u64.
pub type BlockNumber = u64;

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 of arbitrary bytes. Every hash in the header chain
/// is produced by this function.
pub fn blake2_256(data: &[u8]) -> Hash {
  let mut hasher = Blake2b256::new();
  hasher.update(data);
  Hash::from_slice(hasher.finalize().as_slice())
}

/// A block header as seen by the consensus bookkeeping layer.
///
/// The body is opaque to this crate; all scheduling decisions are
/// derived from the parent link, the height and the digest items.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Header {
  pub parent_hash: Hash,
  #[codec(compact)]
  pub number: BlockNumber,
  pub state_root: Hash,
  pub extrinsics_root: Hash,
  pub digest: Digest,
}

impl Header {
  pub fn new(
    parent_hash: Hash,
    number: BlockNumber,
    state_root: Hash,
    extrinsics_root: Hash,
    digest: Digest,
  ) -> Self {
    Self {
      parent_hash,
      number,
      state_root,
      extrinsics_root,
      digest,
    }
  }

  /// Blake2b-256 of the SCALE encoding of this header.
  pub fn hash(&self) -> Hash {
    blake2_256(&self.encode())
  }
}

impl std::fmt::Display for Header {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{} ({})", self.number, self.hash())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::digest::{DigestItem, GRANDPA_ENGINE_ID},
  };

  #[test]
  fn header_scale_roundtrip() {
    let header = Header::new(
      Hash::repeat_byte(0xab),
      42,
      Hash::repeat_byte(0x01),
      Hash::repeat_byte(0x02),
      Digest {
        logs: vec![
          DigestItem::Consensus(GRANDPA_ENGINE_ID, vec![1, 2, 3]),
          DigestItem::Other(vec![9]),
        ],
      },
    );

    let encoded = header.encode();
    let decoded = Header::decode(&mut &encoded[..]).unwrap();
    assert_eq!(header, decoded);
  }

  #[test]
  fn hash_commits_to_contents() {
    let a = Header::new(
      Hash::zero(),
      1,
      Hash::zero(),
      Hash::zero(),
      Digest::default(),
    );
    let mut b = a.clone();
    b.state_root = Hash::repeat_byte(0x01);

    assert_eq!(a.hash(), a.hash());
    assert_ne!(a.hash(), b.hash());
  }

  #[test]
  fn compact_number_encoding() {
    let header = Header::new(
      Hash::zero(),
      1,
      Hash::zero(),
      Hash::zero(),
      Digest::default(),
    );

    // parent(32) + compact(1) + roots(64) + empty digest(1)
    assert_eq!(header.encode().len(), 98);
  }
}
