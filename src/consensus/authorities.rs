//! Persistent registry of finality voter sets.
//!
//! Voter sets are keyed by a monotonically increasing set id. Set 0
//! is the genesis set; every later set is pre-populated by
//! [`AuthoritySets::set_next_change`] when its announcement is seen
//! and activated by [`AuthoritySets::increment_set_id`] once the
//! triggering block is observed.

use {
  crate::{
    primitives::{BlockNumber, Voter},
    storage::{Database, StorageError, Table},
  },
  parity_scale_codec::{Decode, Encode},
  std::sync::Arc,
  thiserror::Error,
  tracing::debug,
};

const GRANDPA_PREFIX: &[u8] = b"grandpa";
const AUTHORITIES_PREFIX: &[u8] = b"auth";
const SET_ID_CHANGE_PREFIX: &[u8] = b"change";
const CURRENT_SET_ID_KEY: &[u8] = b"setID";

const GENESIS_SET_ID: u64 = 0;

#[derive(Debug, Error)]
pub enum Error {
  #[error("no voter set with id {0}")]
  SetNotFound(u64),

  #[error("no activation record for set id {0}")]
  ChangeNotFound(u64),

  #[error("current set id missing from storage")]
  NotInitialized,

  #[error("invalid current set id encoding")]
  InvalidSetId,

  #[error("activation block number record exceeds 64 bits")]
  InvalidBlockNumber,

  #[error("malformed voter set encoding: {0}")]
  Codec(#[from] parity_scale_codec::Error),

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// The on-disk voter-set registry, scoped to its own table of the
/// node database.
pub struct AuthoritySets {
  db: Table,
}

impl AuthoritySets {
  /// Initializes the registry with the genesis voter set as set 0.
  /// Genesis has no activation record; it is active from block 0.
  pub fn from_genesis(
    db: Arc<dyn Database>,
    voters: &[Voter],
  ) -> Result<Self, Error> {
    let sets = Self::open(db);
    sets.set_current_set_id(GENESIS_SET_ID)?;
    sets.set_authorities(GENESIS_SET_ID, voters)?;
    Ok(sets)
  }

  /// Attaches to an existing registry, trusting on-disk state. A
  /// torn compound update is reconverged by replaying headers from
  /// the last safe checkpoint, not detected here.
  pub fn open(db: Arc<dyn Database>) -> Self {
    Self {
      db: Table::new(db, GRANDPA_PREFIX),
    }
  }

  /// The voters of the given set, or an error if that set was
  /// never recorded.
  pub fn authorities(&self, set_id: u64) -> Result<Vec<Voter>, Error> {
    let encoded = self
      .db
      .get(&authorities_key(set_id))?
      .ok_or(Error::SetNotFound(set_id))?;
    Ok(Vec::<Voter>::decode(&mut &encoded[..])?)
  }

  /// Id of the latest activated voter set.
  pub fn current_set_id(&self) -> Result<u64, Error> {
    let encoded = self
      .db
      .get(CURRENT_SET_ID_KEY)?
      .ok_or(Error::NotInitialized)?;
    let bytes: [u8; 8] =
      encoded.try_into().map_err(|_| Error::InvalidSetId)?;
    Ok(u64::from_le_bytes(bytes))
  }

  /// Records the voters of the upcoming set (current + 1) and the
  /// block number at which it takes effect. Does not activate it.
  pub fn set_next_change(
    &self,
    voters: &[Voter],
    at_block: BlockNumber,
  ) -> Result<(), Error> {
    let next = self.current_set_id()? + 1;
    self.set_authorities(next, voters)?;
    self
      .db
      .put(&set_id_change_key(next), &encode_block_number(at_block))?;
    debug!(
      set_id = next,
      at_block,
      voters = voters.len(),
      "recorded upcoming authority set"
    );
    Ok(())
  }

  /// Activates the next set. Only called once the matching block
  /// has been observed: imported for forced changes, finalized for
  /// scheduled ones. Returns the new current set id.
  pub fn increment_set_id(&self) -> Result<u64, Error> {
    let next = self.current_set_id()? + 1;
    self.set_current_set_id(next)?;
    debug!(set_id = next, "rotated to next authority set");
    Ok(next)
  }

  /// The block number at which the given set became current.
  pub fn set_id_change(&self, set_id: u64) -> Result<BlockNumber, Error> {
    let encoded = self
      .db
      .get(&set_id_change_key(set_id))?
      .ok_or(Error::ChangeNotFound(set_id))?;
    decode_block_number(&encoded)
  }

  fn set_authorities(
    &self,
    set_id: u64,
    voters: &[Voter],
  ) -> Result<(), Error> {
    self.db.put(&authorities_key(set_id), &voters.encode())?;
    Ok(())
  }

  fn set_current_set_id(&self, set_id: u64) -> Result<(), Error> {
    self
      .db
      .put(CURRENT_SET_ID_KEY, &set_id.to_le_bytes())?;
    Ok(())
  }
}

fn authorities_key(set_id: u64) -> Vec<u8> {
  let mut key = AUTHORITIES_PREFIX.to_vec();
  key.extend_from_slice(&set_id.to_le_bytes());
  key
}

fn set_id_change_key(set_id: u64) -> Vec<u8> {
  let mut key = SET_ID_CHANGE_PREFIX.to_vec();
  key.extend_from_slice(&set_id.to_le_bytes());
  key
}

/// Minimal big-endian encoding: leading zero bytes are stripped, so
/// zero encodes to the empty string.
fn encode_block_number(number: BlockNumber) -> Vec<u8> {
  let bytes = number.to_be_bytes();
  let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
  bytes[first..].to_vec()
}

fn decode_block_number(bytes: &[u8]) -> Result<BlockNumber, Error> {
  if bytes.len() > 8 {
    return Err(Error::InvalidBlockNumber);
  }
  Ok(
    bytes
      .iter()
      .fold(0u64, |acc, byte| (acc << 8) | *byte as u64),
  )
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      primitives::AuthorityId,
      storage::{MemoryDb, SledDb},
    },
  };

  fn voters(seed: u8, count: u8) -> Vec<Voter> {
    (0..count)
      .map(|i| Voter::new(AuthorityId([seed + i; 32]), 1))
      .collect()
  }

  fn fresh() -> AuthoritySets {
    AuthoritySets::from_genesis(Arc::new(MemoryDb::new()), &voters(1, 3))
      .unwrap()
  }

  #[test]
  fn genesis_set_has_no_activation_record() {
    let sets = fresh();

    assert_eq!(sets.current_set_id().unwrap(), 0);
    assert_eq!(sets.authorities(0).unwrap(), voters(1, 3));
    assert!(matches!(
      sets.set_id_change(0),
      Err(Error::ChangeNotFound(0))
    ));
  }

  #[test]
  fn next_change_is_prepopulated_not_activated() {
    let sets = fresh();
    sets.set_next_change(&voters(10, 2), 15).unwrap();

    assert_eq!(sets.current_set_id().unwrap(), 0);
    assert_eq!(sets.authorities(1).unwrap(), voters(10, 2));
    assert_eq!(sets.set_id_change(1).unwrap(), 15);

    assert_eq!(sets.increment_set_id().unwrap(), 1);
    assert_eq!(sets.current_set_id().unwrap(), 1);
  }

  #[test]
  fn set_ids_stay_contiguous_over_a_rotation_schedule() {
    let sets = fresh();

    let schedule = [(20u64, 4u8), (40, 7), (60, 9)];
    for (round, (at_block, seed)) in schedule.into_iter().enumerate() {
      sets.set_next_change(&voters(seed, 3), at_block).unwrap();
      sets.increment_set_id().unwrap();
      assert_eq!(sets.current_set_id().unwrap(), round as u64 + 1);
    }

    // current set id equals the number of triggered rotations and
    // resolves to the last voters written
    assert_eq!(sets.current_set_id().unwrap(), 3);
    assert_eq!(sets.authorities(3).unwrap(), voters(9, 3));
    assert_eq!(sets.set_id_change(3).unwrap(), 60);
    for set_id in 0..=3u64 {
      assert!(sets.authorities(set_id).is_ok());
    }
    assert!(matches!(
      sets.authorities(4),
      Err(Error::SetNotFound(4))
    ));
  }

  #[test]
  fn state_survives_reopen() {
    let db: Arc<dyn Database> = Arc::new(SledDb::temporary().unwrap());

    {
      let sets =
        AuthoritySets::from_genesis(Arc::clone(&db), &voters(1, 3)).unwrap();
      sets.set_next_change(&voters(5, 2), 30).unwrap();
      sets.increment_set_id().unwrap();
    }

    let reopened = AuthoritySets::open(db);
    assert_eq!(reopened.current_set_id().unwrap(), 1);
    assert_eq!(reopened.authorities(1).unwrap(), voters(5, 2));
    assert_eq!(reopened.set_id_change(1).unwrap(), 30);
  }

  #[test]
  fn open_on_empty_database_reports_uninitialized() {
    let sets = AuthoritySets::open(Arc::new(MemoryDb::new()));
    assert!(matches!(
      sets.current_set_id(),
      Err(Error::NotInitialized)
    ));
  }

  #[test]
  fn block_numbers_use_minimal_big_endian_bytes() {
    assert_eq!(encode_block_number(0), Vec::<u8>::new());
    assert_eq!(encode_block_number(15), vec![15]);
    assert_eq!(encode_block_number(0x1234), vec![0x12, 0x34]);
    assert_eq!(
      encode_block_number(u64::MAX),
      vec![0xff; 8]
    );

    for number in [0u64, 1, 255, 256, 0xdead_beef, u64::MAX] {
      assert_eq!(
        decode_block_number(&encode_block_number(number)).unwrap(),
        number
      );
    }
    assert!(decode_block_number(&[1u8; 9]).is_err());
  }

  #[test]
  fn registry_is_namespaced_under_grandpa_prefix() {
    let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
    let _sets =
      AuthoritySets::from_genesis(Arc::clone(&db), &voters(1, 1)).unwrap();

    let mut expected_key = b"grandpasetID".to_vec();
    assert_eq!(
      db.get(&expected_key).unwrap(),
      Some(0u64.to_le_bytes().to_vec())
    );

    expected_key = b"grandpaauth".to_vec();
    expected_key.extend_from_slice(&0u64.to_le_bytes());
    assert!(db.get(&expected_key).unwrap().is_some());
  }
}
