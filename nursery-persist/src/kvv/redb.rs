//! A durable KVV backend on redb.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableTable, TableDefinition};

use utxo_nursery::store::Error;
use utxo_nursery::SendSync;

use crate::kvv::{KVVNurseryStore, KVVStore, KVV};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kvv");

// values are stored as an 8-byte big-endian version followed by the
// payload; a delete removes the key outright
fn join_value(version: u64, value: &[u8]) -> Vec<u8> {
    let mut joined = version.to_be_bytes().to_vec();
    joined.extend_from_slice(value);
    joined
}

fn split_value(joined: &[u8]) -> Result<(u64, Vec<u8>), Error> {
    if joined.len() < 8 {
        return Err(Error::Corrupt(format!("stored value of {} bytes", joined.len())));
    }
    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&joined[..8]);
    Ok((u64::from_be_bytes(version_bytes), joined[8..].to_vec()))
}

fn internal<E: std::fmt::Display>(err: E) -> Error {
    Error::Internal(err.to_string())
}

/// A key-version-value store backed by a redb database file.
pub struct RedbKVVStore {
    db: Database,
    // current version per key, so versioning is enforced without a read
    // transaction per write
    versions: Mutex<BTreeMap<String, u64>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl RedbKVVStore {
    /// Open or create the database file, wrapped as a nursery store.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<KVVNurseryStore<Self>, Error> {
        let db = Database::create(path).map_err(|err| Error::Unavailable(err.to_string()))?;

        let txn = db.begin_write().map_err(internal)?;
        txn.open_table(TABLE).map_err(internal)?;
        txn.commit().map_err(internal)?;

        let mut versions = BTreeMap::new();
        {
            let txn = db.begin_read().map_err(internal)?;
            let table = txn.open_table(TABLE).map_err(internal)?;
            for item in table.iter().map_err(internal)? {
                let (key, value) = item.map_err(internal)?;
                let (version, _) = split_value(value.value())?;
                versions.insert(key.value().to_string(), version);
            }
        }
        Ok(KVVNurseryStore::new(RedbKVVStore { db, versions: Mutex::new(versions) }))
    }

    fn apply(&self, kvvs: &[KVV]) -> Result<(), Error> {
        {
            let versions = self.versions.lock().unwrap();
            for kvv in kvvs {
                if let Some(existing) = versions.get(&kvv.0) {
                    if kvv.1 .0 < *existing {
                        return Err(Error::Internal(format!("version regression for {}", kvv.0)));
                    }
                }
            }
        }

        let txn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = txn.open_table(TABLE).map_err(internal)?;
            for kvv in kvvs {
                if kvv.1 .1.is_empty() {
                    table.remove(kvv.0.as_str()).map_err(internal)?;
                } else {
                    table
                        .insert(kvv.0.as_str(), join_value(kvv.1 .0, &kvv.1 .1).as_slice())
                        .map_err(internal)?;
                }
            }
        }
        txn.commit().map_err(internal)?;

        let mut versions = self.versions.lock().unwrap();
        for kvv in kvvs {
            if kvv.1 .1.is_empty() {
                versions.remove(&kvv.0);
            } else {
                versions.insert(kvv.0.clone(), kvv.1 .0);
            }
        }
        Ok(())
    }
}

impl SendSync for RedbKVVStore {}

impl KVVStore for RedbKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        self.apply(&[KVV(key.to_string(), (version, value))])
    }

    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error> {
        self.apply(&kvvs)
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let txn = self.db.begin_read().map_err(internal)?;
        let table = txn.open_table(TABLE).map_err(internal)?;
        let result = match table.get(key).map_err(internal)? {
            Some(guard) => split_value(guard.value()).map(Some),
            None => Ok(None),
        };
        result
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.versions.lock().unwrap().get(key).copied())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let txn = self.db.begin_read().map_err(internal)?;
        let table = txn.open_table(TABLE).map_err(internal)?;
        let mut result = Vec::new();
        for item in table.range(prefix..).map_err(internal)? {
            let (key, value) = item.map_err(internal)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let (version, payload) = split_value(value.value())?;
            result.push(KVV(key.value().to_string(), (version, payload)));
        }
        Ok(Iter(result.into_iter()))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.apply(&[KVV(key.to_string(), (version, Vec::new()))])
    }

    fn clear_database(&self) -> Result<(), Error> {
        let txn = self.db.begin_write().map_err(internal)?;
        txn.delete_table(TABLE).map_err(internal)?;
        txn.open_table(TABLE).map_err(internal)?;
        txn.commit().map_err(internal)?;
        self.versions.lock().unwrap().clear();
        Ok(())
    }
}
