use {
  dashmap::DashMap,
  std::{path::Path, sync::Arc},
  thiserror::Error,
};

/// Failure of the underlying key-value backend. The operation that
/// hit it is aborted; callers may retry or shut the node down.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage backend failure: {0}")]
  Backend(#[from] sled::Error),
}

/// An opaque byte-keyed persistence layer.
///
/// Single-key operations are atomic. No multi-key transactions are
/// offered; components that perform compound updates reconverge by
/// replaying the header chain after a crash.
pub trait Database: Send + Sync {
  fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
  fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
  fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
}

/// A namespaced view over a database. Every key is transparently
/// prefixed, and tables nest by concatenating prefixes.
#[derive(Clone)]
pub struct Table {
  db: Arc<dyn Database>,
  prefix: Vec<u8>,
}

impl Table {
  pub fn new(db: Arc<dyn Database>, prefix: &[u8]) -> Self {
    Self {
      db,
      prefix: prefix.to_vec(),
    }
  }

  pub fn sub_table(&self, prefix: &[u8]) -> Table {
    let mut nested = self.prefix.clone();
    nested.extend_from_slice(prefix);
    Table {
      db: Arc::clone(&self.db),
      prefix: nested,
    }
  }

  fn prefixed(&self, key: &[u8]) -> Vec<u8> {
    let mut full = self.prefix.clone();
    full.extend_from_slice(key);
    full
  }
}

impl Database for Table {
  fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
    self.db.get(&self.prefixed(key))
  }

  fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
    self.db.put(&self.prefixed(key), value)
  }

  fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
    self.db.delete(&self.prefixed(key))
  }
}

/// Disk-backed database used by full nodes.
pub struct SledDb {
  inner: sled::Db,
}

impl SledDb {
  pub fn open(directory: impl AsRef<Path>) -> Result<Self, StorageError> {
    Ok(Self {
      inner: sled::Config::new()
        .path(directory)
        .use_compression(true)
        .open()?,
    })
  }

  /// An ephemeral instance backed by a temp directory. Used by
  /// tests and throwaway nodes.
  pub fn temporary() -> Result<Self, StorageError> {
    Ok(Self {
      inner: sled::Config::new().temporary(true).open()?,
    })
  }
}

impl Database for SledDb {
  fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(self.inner.get(key)?.map(|value| value.to_vec()))
  }

  fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
    self.inner.insert(key, value)?;
    Ok(())
  }

  fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
    self.inner.remove(key)?;
    Ok(())
  }
}

/// Purely in-memory database. State does not survive the process.
#[derive(Default)]
pub struct MemoryDb {
  map: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryDb {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Database for MemoryDb {
  fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(self.map.get(key).map(|value| value.value().clone()))
  }

  fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
    self.map.insert(key.to_vec(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
    self.map.remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(db: &dyn Database) {
    assert_eq!(db.get(b"a").unwrap(), None);

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));

    db.put(b"a", b"3").unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"3".to_vec()));

    db.delete(b"a").unwrap();
    assert_eq!(db.get(b"a").unwrap(), None);

    // deleting a missing key is not an error
    db.delete(b"missing").unwrap();
  }

  #[test]
  fn memory_db_roundtrip() {
    roundtrip(&MemoryDb::new());
  }

  #[test]
  fn sled_db_roundtrip() {
    roundtrip(&SledDb::temporary().unwrap());
  }

  #[test]
  fn tables_isolate_namespaces() {
    let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
    let grandpa = Table::new(Arc::clone(&db), b"grandpa");
    let babe = Table::new(Arc::clone(&db), b"babe");

    grandpa.put(b"setID", b"g").unwrap();
    babe.put(b"setID", b"b").unwrap();

    assert_eq!(grandpa.get(b"setID").unwrap(), Some(b"g".to_vec()));
    assert_eq!(babe.get(b"setID").unwrap(), Some(b"b".to_vec()));
    assert_eq!(db.get(b"grandpasetID").unwrap(), Some(b"g".to_vec()));
  }

  #[test]
  fn sub_tables_nest_prefixes() {
    let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
    let outer = Table::new(Arc::clone(&db), b"outer");
    let inner = outer.sub_table(b"inner");

    inner.put(b"k", b"v").unwrap();
    assert_eq!(db.get(b"outerinnerk").unwrap(), Some(b"v".to_vec()));
    assert_eq!(outer.get(b"innerk").unwrap(), Some(b"v".to_vec()));
  }
}
