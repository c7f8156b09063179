//! An in-memory KVV backend.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::*;

use utxo_nursery::store::Error;
use utxo_nursery::SendSync;

use crate::kvv::{KVVNurseryStore, KVVStore, KVV};

/// A key-version-value in-memory store.
pub struct MemoryKVVStore {
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl MemoryKVVStore {
    /// Create an empty store wrapped as a nursery store.
    pub fn new() -> KVVNurseryStore<Self> {
        KVVNurseryStore::new(Self { data: Mutex::new(BTreeMap::new()) })
    }
}

impl SendSync for MemoryKVVStore {}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        if let Some((existing, _)) = data.get(key) {
            if version < *existing {
                // version cannot go backwards
                error!("version regression for {}: {} < {}", key, version, existing);
                return Err(Error::Internal(format!("version regression for {}", key)));
            }
        }
        data.insert(key.to_string(), (version, value));
        Ok(())
    }

    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        for kvv in kvvs.iter() {
            if let Some((existing, _)) = data.get(&kvv.0) {
                if kvv.1 .0 < *existing {
                    error!("version regression for {}: {} < {}", kvv.0, kvv.1 .0, existing);
                    return Err(Error::Internal(format!("version regression for {}", kvv.0)));
                }
            }
        }
        for kvv in kvvs {
            data.insert(kvv.0, kvv.1);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).map(|(version, _)| *version))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data.lock().unwrap();
        let mut result = Vec::new();
        for (key, (version, value)) in data.range(prefix.to_string()..) {
            if key.starts_with(prefix) {
                result.push(KVV(key.clone(), (*version, value.clone())));
            } else {
                break;
            }
        }
        Ok(Iter(result.into_iter()))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.put(key, Vec::new())
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.data.lock().unwrap().clear();
        Ok(())
    }
}
