//! Key-version-value storage and the nursery store built on it.

pub mod memory;
#[cfg(feature = "redb-kvv")]
pub mod redb;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::ops::Deref;
use std::sync::Mutex;

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::{OutPoint, Transaction};
use log::*;

use utxo_nursery::output::{BabyOutput, KidOutput};
use utxo_nursery::store::{Error, NurseryRecord, NurseryStore, Stage};
use utxo_nursery::SendSync;

use crate::model;

const CHANNEL_PREFIX: &str = "channel";
const HEIGHT_PREFIX: &str = "height";
const OUTPUT_INFIX: &str = "output";
const FINALIZED_TX_KEY: &str = "finalized-tx";
const LAST_GRADUATED_KEY: &str = "last-graduated-height";
const LAST_FINALIZED_KEY: &str = "last-finalized-height";
const SEPARATOR: &str = "/";

// non-empty marker for height index pointers; an empty value is a
// tombstone
const POINTER: &[u8] = &[1];

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&self.1 .1).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store.
///
/// Deletion writes an empty value (a tombstone), so a batch mixing puts
/// and deletes commits atomically through [`KVVStore::put_batch`].
pub trait KVVStore: SendSync {
    /// Iterator over a key range
    type Iter: Iterator<Item = KVV>;

    /// Put a key-value pair, assigning the next version
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    /// If the key already exists, the version must not go backwards
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error>;
    /// Atomically put several KVVs
    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error>;
    /// Get a value. `Ok(None)` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key. `Ok(None)` if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// All key-value pairs with the given prefix, in key order
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Tombstone a key
    fn delete(&self, key: &str) -> Result<(), Error>;
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
}

/// Implements the nursery's storage contract on any [`KVVStore`].
///
/// Every operation takes the write lock, reads what it needs, and commits
/// all of its writes as one atomic batch, so a crash can never leave the
/// channel index, the height index and the record stages disagreeing.
pub struct KVVNurseryStore<S: KVVStore> {
    store: S,
    write_lock: Mutex<()>,
}

impl<S: KVVStore> KVVNurseryStore<S> {
    /// Wrap a backend.
    pub fn new(store: S) -> Self {
        KVVNurseryStore { store, write_lock: Mutex::new(()) }
    }
}

impl<S: KVVStore> Deref for KVVNurseryStore<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl<S: KVVStore> SendSync for KVVNurseryStore<S> {}

fn outpoint_hex(outpoint: &OutPoint) -> String {
    hex::encode(serialize(outpoint))
}

fn parse_outpoint(part: &str) -> Result<OutPoint, Error> {
    let bytes =
        hex::decode(part).map_err(|_| Error::Corrupt(format!("bad outpoint key {}", part)))?;
    deserialize(&bytes).map_err(|_| Error::Corrupt(format!("bad outpoint key {}", part)))
}

fn output_key(chan_point: &OutPoint, outpoint: &OutPoint) -> String {
    format!(
        "{}{}{}{}{}{}{}",
        CHANNEL_PREFIX,
        SEPARATOR,
        outpoint_hex(chan_point),
        SEPARATOR,
        OUTPUT_INFIX,
        SEPARATOR,
        outpoint_hex(outpoint)
    )
}

fn height_output_key(height: u32, chan_point: &OutPoint, outpoint: &OutPoint) -> String {
    format!(
        "{}{}{:010}{}{}{}{}{}{}",
        HEIGHT_PREFIX,
        SEPARATOR,
        height,
        SEPARATOR,
        OUTPUT_INFIX,
        SEPARATOR,
        outpoint_hex(chan_point),
        SEPARATOR,
        outpoint_hex(outpoint)
    )
}

fn finalized_key(height: u32) -> String {
    format!("{}{}{:010}{}{}", HEIGHT_PREFIX, SEPARATOR, height, SEPARATOR, FINALIZED_TX_KEY)
}

impl<S: KVVStore> KVVNurseryStore<S> {
    // a stored value, with tombstones reading as absent
    fn get_live(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.store.get(key)?.map(|(_, value)| value).filter(|value| !value.is_empty()))
    }

    fn get_record(&self, key: &str) -> Result<Option<(Stage, NurseryRecord)>, Error> {
        match self.get_live(key)? {
            Some(bytes) => model::decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn get_finalized_tx(&self, height: u32) -> Result<Option<Transaction>, Error> {
        match self.get_live(&finalized_key(height))? {
            Some(bytes) => deserialize(&bytes)
                .map(Some)
                .map_err(|err| Error::Corrupt(format!("finalized tx at {}: {}", height, err))),
            None => Ok(None),
        }
    }

    fn get_watermark(&self, key: &str) -> Result<u32, Error> {
        match self.get_live(key)? {
            Some(bytes) => model::decode_height(&bytes),
            None => Ok(0),
        }
    }

    // Commit writes as one versioned batch; the last write to a key wins.
    fn commit(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), Error> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, value) in writes {
            merged.insert(key, value);
        }
        let mut kvvs = Vec::with_capacity(merged.len());
        for (key, value) in merged {
            let version = self.store.get_version(&key)?.map(|v| v + 1).unwrap_or(0);
            kvvs.push(KVV(key, (version, value)));
        }
        self.store.put_batch(kvvs)
    }

    // live height index entries at or below `height`, in key order
    fn height_entries_up_to(&self, height: u32) -> Result<Vec<(u32, OutPoint, OutPoint)>, Error> {
        let prefix = format!("{}{}", HEIGHT_PREFIX, SEPARATOR);
        let mut entries = Vec::new();
        for kvv in self.store.get_prefix(&prefix)? {
            let (key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue;
            }
            let parts: Vec<&str> = key.split(SEPARATOR).collect();
            if parts.len() != 5 || parts[2] != OUTPUT_INFIX {
                continue;
            }
            let h: u32 = parts[1]
                .parse()
                .map_err(|_| Error::Corrupt(format!("bad height key {}", key)))?;
            if h > height {
                break;
            }
            entries.push((h, parse_outpoint(parts[3])?, parse_outpoint(parts[4])?));
        }
        Ok(entries)
    }

    // live outputs of one channel, in key order
    fn outputs_of_channel(
        &self,
        chan_point: &OutPoint,
    ) -> Result<Vec<(OutPoint, Stage, NurseryRecord)>, Error> {
        let prefix = format!(
            "{}{}{}{}{}{}",
            CHANNEL_PREFIX,
            SEPARATOR,
            outpoint_hex(chan_point),
            SEPARATOR,
            OUTPUT_INFIX,
            SEPARATOR
        );
        let mut outputs = Vec::new();
        for kvv in self.store.get_prefix(&prefix)? {
            let (key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue;
            }
            let suffix = key
                .strip_prefix(&prefix)
                .ok_or_else(|| Error::Internal(format!("prefix scan returned {}", key)))?;
            let outpoint = parse_outpoint(suffix)?;
            let (stage, record) = model::decode_record(&value)?;
            outputs.push((outpoint, stage, record));
        }
        Ok(outputs)
    }
}

impl<S: KVVStore> NurseryStore for KVVNurseryStore<S> {
    fn incubate(&self, kids: &[KidOutput], babies: &[BabyOutput]) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        let mut writes = Vec::new();

        for baby in babies {
            let kid = baby.kid();
            let key = output_key(&kid.origin_chan_point(), &kid.outpoint());
            if self.get_live(&key)?.is_some() {
                debug!("output {} already incubating", kid.outpoint());
                continue;
            }
            writes
                .push((key, model::encode_record(Stage::Crib, &NurseryRecord::Baby(baby.clone()))));
            writes.push((
                height_output_key(baby.expiry(), &kid.origin_chan_point(), &kid.outpoint()),
                POINTER.to_vec(),
            ));
        }

        for kid in kids {
            let key = output_key(&kid.origin_chan_point(), &kid.outpoint());
            if self.get_live(&key)?.is_some() {
                debug!("output {} already incubating", kid.outpoint());
                continue;
            }
            if kid.is_confirmed() {
                // confirmation already known at hand-off: straight to
                // kindergarten
                writes.push((
                    key,
                    model::encode_record(Stage::Kindergarten, &NurseryRecord::Kid(kid.clone())),
                ));
                writes.push((
                    height_output_key(
                        kid.maturity_height(),
                        &kid.origin_chan_point(),
                        &kid.outpoint(),
                    ),
                    POINTER.to_vec(),
                ));
            } else {
                writes.push((
                    key,
                    model::encode_record(Stage::Preschool, &NurseryRecord::Kid(kid.clone())),
                ));
            }
        }

        if writes.is_empty() {
            return Ok(());
        }
        self.commit(writes)
    }

    fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        let kid = baby.kid();
        if !kid.is_confirmed() {
            return Err(Error::Internal("crib promotion without confirmation height".to_string()));
        }
        let chan_point = kid.origin_chan_point();
        let outpoint = kid.outpoint();
        let key = output_key(&chan_point, &outpoint);

        let (stage, record) = self
            .get_record(&key)?
            .ok_or_else(|| Error::NotFound(format!("no crib record for {}", outpoint)))?;
        match stage {
            Stage::Crib => {}
            // a duplicate confirmation event raced the promotion
            Stage::Kindergarten | Stage::Graduated => return Ok(()),
            Stage::Preschool => {
                return Err(Error::Internal(format!("crib promotion of preschool {}", outpoint)))
            }
        }
        let expiry = match record {
            NurseryRecord::Baby(stored) => stored.expiry(),
            NurseryRecord::Kid(_) => {
                return Err(Error::Corrupt(format!("crib record for {} is not a baby", outpoint)))
            }
        };

        self.commit(vec![
            (height_output_key(expiry, &chan_point, &outpoint), Vec::new()),
            (key, model::encode_record(Stage::Kindergarten, &NurseryRecord::Kid(kid.clone()))),
            (height_output_key(kid.maturity_height(), &chan_point, &outpoint), POINTER.to_vec()),
        ])
    }

    fn preschool_to_kinder(&self, kid: &KidOutput, conf_height: u32) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        if conf_height == 0 {
            return Err(Error::Internal("preschool promotion without height".to_string()));
        }
        let chan_point = kid.origin_chan_point();
        let outpoint = kid.outpoint();
        let key = output_key(&chan_point, &outpoint);

        let (stage, _) = self
            .get_record(&key)?
            .ok_or_else(|| Error::NotFound(format!("no preschool record for {}", outpoint)))?;
        match stage {
            Stage::Preschool => {}
            Stage::Kindergarten | Stage::Graduated => return Ok(()),
            Stage::Crib => {
                return Err(Error::Internal(format!("preschool promotion of crib {}", outpoint)))
            }
        }

        let mut promoted = kid.clone();
        promoted.set_conf_height(conf_height);
        self.commit(vec![
            (
                key,
                model::encode_record(Stage::Kindergarten, &NurseryRecord::Kid(promoted.clone())),
            ),
            (
                height_output_key(promoted.maturity_height(), &chan_point, &outpoint),
                POINTER.to_vec(),
            ),
        ])
    }

    fn fetch_class(
        &self,
        height: u32,
    ) -> Result<(Option<Transaction>, Vec<KidOutput>, Vec<BabyOutput>), Error> {
        let _lock = self.write_lock.lock().unwrap();
        let finalized_tx = self.get_finalized_tx(height)?;
        let mut kids = Vec::new();
        let mut babies = Vec::new();
        let mut has_finalized: HashMap<u32, bool> = HashMap::new();

        for (h, chan_point, outpoint) in self.height_entries_up_to(height)? {
            let key = output_key(&chan_point, &outpoint);
            let (stage, record) = self
                .get_record(&key)?
                .ok_or_else(|| Error::Corrupt(format!("dangling height pointer {}", outpoint)))?;
            match (stage, record) {
                (Stage::Crib, NurseryRecord::Baby(baby)) => babies.push(baby),
                (Stage::Kindergarten, NurseryRecord::Kid(kid)) => {
                    // an earlier class with its own pending sweep keeps
                    // its inputs until that sweep confirms
                    let spoken_for = if h == height {
                        false
                    } else {
                        match has_finalized.get(&h) {
                            Some(flag) => *flag,
                            None => {
                                let flag = self.get_finalized_tx(h)?.is_some();
                                has_finalized.insert(h, flag);
                                flag
                            }
                        }
                    };
                    if !spoken_for {
                        kids.push(kid);
                    }
                }
                (stage, _) => {
                    return Err(Error::Corrupt(format!(
                        "height pointer to {:?} record {}",
                        stage, outpoint
                    )))
                }
            }
        }
        Ok((finalized_tx, kids, babies))
    }

    fn finalize_kinder(&self, height: u32, tx: &Transaction) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        let bytes = serialize(tx);
        if let Some(existing) = self.get_live(&finalized_key(height))? {
            if existing == bytes {
                return Ok(());
            }
            return Err(Error::AlreadyExists(format!(
                "conflicting finalized tx for height {}",
                height
            )));
        }

        let mut writes = vec![(finalized_key(height), bytes)];
        if height > self.get_watermark(LAST_FINALIZED_KEY)? {
            writes.push((LAST_FINALIZED_KEY.to_string(), model::encode_height(height)));
        }
        self.commit(writes)
    }

    fn graduate_kinder(&self, height: u32) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        let tx = match self.get_finalized_tx(height)? {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let swept: HashSet<OutPoint> = tx.input.iter().map(|inp| inp.previous_output).collect();

        let mut writes = Vec::new();
        let mut graduated: HashSet<OutPoint> = HashSet::new();
        let mut channels: BTreeSet<OutPoint> = BTreeSet::new();

        // graduate exactly what the confirmed sweep consumed; an output
        // filed after the sweep was built stays in kindergarten
        for (h, chan_point, outpoint) in self.height_entries_up_to(height)? {
            if !swept.contains(&outpoint) {
                continue;
            }
            let key = output_key(&chan_point, &outpoint);
            let (stage, record) = self
                .get_record(&key)?
                .ok_or_else(|| Error::Corrupt(format!("dangling height pointer {}", outpoint)))?;
            if stage != Stage::Kindergarten {
                continue;
            }
            writes.push((height_output_key(h, &chan_point, &outpoint), Vec::new()));
            writes.push((key, model::encode_record(Stage::Graduated, &record)));
            graduated.insert(outpoint);
            channels.insert(chan_point);
        }
        writes.push((finalized_key(height), Vec::new()));

        for chan_point in channels {
            let outputs = self.outputs_of_channel(&chan_point)?;
            let mature = outputs
                .iter()
                .all(|(op, stage, _)| *stage == Stage::Graduated || graduated.contains(op));
            if mature {
                info!("channel {} fully graduated, pruning", chan_point);
                for (op, _, _) in outputs {
                    writes.push((output_key(&chan_point, &op), Vec::new()));
                }
            }
        }
        self.commit(writes)
    }

    fn graduate_height(&self, height: u32) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        self.commit(vec![(LAST_GRADUATED_KEY.to_string(), model::encode_height(height))])
    }

    fn last_graduated_height(&self) -> Result<u32, Error> {
        self.get_watermark(LAST_GRADUATED_KEY)
    }

    fn last_finalized_height(&self) -> Result<u32, Error> {
        self.get_watermark(LAST_FINALIZED_KEY)
    }

    fn fetch_preschools(&self) -> Result<Vec<KidOutput>, Error> {
        let mut kids = Vec::new();
        for chan_point in self.list_channels()? {
            for (_, stage, record) in self.outputs_of_channel(&chan_point)? {
                if stage == Stage::Preschool {
                    match record {
                        NurseryRecord::Kid(kid) => kids.push(kid),
                        NurseryRecord::Baby(_) => {
                            return Err(Error::Corrupt(
                                "baby record in preschool".to_string(),
                            ))
                        }
                    }
                }
            }
        }
        Ok(kids)
    }

    fn heights_below_or_equal(&self, height: u32) -> Result<Vec<u32>, Error> {
        let mut heights = BTreeSet::new();
        for (h, _, _) in self.height_entries_up_to(height)? {
            heights.insert(h);
        }
        Ok(heights.into_iter().collect())
    }

    fn for_chan_outputs(
        &self,
        chan_point: &OutPoint,
        cb: &mut dyn FnMut(Stage, NurseryRecord) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for (_, stage, record) in self.outputs_of_channel(chan_point)? {
            cb(stage, record)?;
        }
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<OutPoint>, Error> {
        let prefix = format!("{}{}", CHANNEL_PREFIX, SEPARATOR);
        let mut channels = BTreeSet::new();
        for kvv in self.store.get_prefix(&prefix)? {
            let (key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue;
            }
            let parts: Vec<&str> = key.split(SEPARATOR).collect();
            if parts.len() != 4 || parts[2] != OUTPUT_INFIX {
                return Err(Error::Corrupt(format!("unexpected channel key {}", key)));
            }
            channels.insert(parse_outpoint(parts[1])?);
        }
        Ok(channels.into_iter().collect())
    }

    fn is_mature_channel(&self, chan_point: &OutPoint) -> Result<bool, Error> {
        let outputs = self.outputs_of_channel(chan_point)?;
        if outputs.is_empty() {
            return Err(Error::NotFound(format!("no channel record for {}", chan_point)));
        }
        Ok(outputs.iter().all(|(_, stage, _)| *stage == Stage::Graduated))
    }

    fn remove_channel(&self, chan_point: &OutPoint) -> Result<(), Error> {
        let _lock = self.write_lock.lock().unwrap();
        let outputs = self.outputs_of_channel(chan_point)?;
        if outputs.is_empty() {
            return Err(Error::NotFound(format!("no channel record for {}", chan_point)));
        }
        let outpoints: HashSet<OutPoint> = outputs.iter().map(|(op, _, _)| *op).collect();

        let mut writes = Vec::new();
        for (h, cp, op) in self.height_entries_up_to(u32::MAX)? {
            if cp == *chan_point && outpoints.contains(&op) {
                writes.push((height_output_key(h, &cp, &op), Vec::new()));
            }
        }
        for (op, _, _) in outputs {
            writes.push((output_key(chan_point, &op), Vec::new()));
        }
        self.commit(writes)
    }
}
