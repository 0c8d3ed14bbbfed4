use {
  parity_scale_codec::{Decode, Encode},
  std::{fmt, ops::Deref},
};

/// Public key identifying a finality voter or block-production
/// authority.
#[derive(
  Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode,
)]
pub struct AuthorityId(pub [u8; 32]);

impl Deref for AuthorityId {
  type Target = [u8];
  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl From<[u8; 32]> for AuthorityId {
  fn from(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }
}

impl fmt::Display for AuthorityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x")?;
    for byte in &self.0 {
      write!(f, "{byte:02x}")?;
    }
    Ok(())
  }
}

impl fmt::Debug for AuthorityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "AuthorityId({self})")
  }
}

/// A member of a finality voter set: a public key and the weight of
/// its vote. On the wire this is the 32 key bytes followed by the
/// little-endian weight.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Voter {
  pub id: AuthorityId,
  pub weight: u64,
}

impl Voter {
  pub fn new(id: AuthorityId, weight: u64) -> Self {
    Self { id, weight }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn voter_scale_roundtrip() {
    let voter = Voter::new(AuthorityId([0xaa; 32]), 7);

    let encoded = voter.encode();
    assert_eq!(encoded.len(), 40);
    assert_eq!(&encoded[..32], &[0xaa; 32]);
    assert_eq!(&encoded[32..], &7u64.to_le_bytes());

    assert_eq!(Voter::decode(&mut &encoded[..]).unwrap(), voter);
  }

  #[test]
  fn voter_list_roundtrip() {
    let voters: Vec<Voter> = (0u8..5)
      .map(|i| Voter::new(AuthorityId([i; 32]), i as u64 + 1))
      .collect();

    let encoded = voters.encode();
    // compact length prefix followed by fixed-size voters
    assert_eq!(encoded.len(), 1 + 5 * 40);
    assert_eq!(Vec::<Voter>::decode(&mut &encoded[..]).unwrap(), voters);
  }

  #[test]
  fn authority_id_display_is_hex() {
    let id = AuthorityId([0x01; 32]);
    let repr = id.to_string();
    assert!(repr.starts_with("0x01"));
    assert_eq!(repr.len(), 2 + 64);
  }
}
