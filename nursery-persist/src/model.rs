//! Serde models for persisted nursery records.
//!
//! Structs ending with `Entry` mirror a core type and convert via
//! `From` / `TryFrom`. Every record is wrapped in a versioned envelope;
//! decoding an unknown version is a fatal [`Error::Corrupt`].

use std::borrow::Cow;
use std::convert::{TryFrom, TryInto};

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{EcdsaSighashType, OutPoint, Script, Transaction, TxOut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::hex::Hex;
use serde_with::{serde_as, DeserializeAs, SerializeAs};

use utxo_nursery::output::{BabyOutput, KidOutput, SignDescriptor, WitnessType};
use utxo_nursery::store::{Error, NurseryRecord, Stage};

/// Version byte carried by every persisted record.
pub const RECORD_VERSION: u8 = 0;

/// Serializes a secp public key as compressed hex.
#[derive(Copy, Clone, Debug, Default)]
pub struct PublicKeyHandler;

impl SerializeAs<PublicKey> for PublicKeyHandler {
    fn serialize_as<S>(source: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(hex::encode(source.serialize()).as_str())
    }
}

impl<'de> DeserializeAs<'de, PublicKey> for PublicKeyHandler {
    fn deserialize_as<D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let res = <Cow<'de, str> as Deserialize<'de>>::deserialize(deserializer)?;
        let bytes = hex::decode(&*res).map_err(serde::de::Error::custom)?;
        PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct SignDescriptorEntry {
    #[serde_as(as = "PublicKeyHandler")]
    pub pubkey: PublicKey,
    #[serde_as(as = "Option<Hex>")]
    pub single_tweak: Option<Vec<u8>>,
    pub witness_script: Script,
    pub output: TxOut,
    pub hash_type: u32,
}

impl From<&SignDescriptor> for SignDescriptorEntry {
    fn from(desc: &SignDescriptor) -> Self {
        SignDescriptorEntry {
            pubkey: desc.pubkey,
            single_tweak: desc.single_tweak.clone(),
            witness_script: desc.witness_script.clone(),
            output: desc.output.clone(),
            hash_type: desc.hash_type.to_u32(),
        }
    }
}

impl TryFrom<SignDescriptorEntry> for SignDescriptor {
    type Error = Error;

    fn try_from(entry: SignDescriptorEntry) -> Result<Self, Error> {
        let hash_type = EcdsaSighashType::from_standard(entry.hash_type)
            .map_err(|_| Error::Corrupt(format!("unknown sighash type {}", entry.hash_type)))?;
        Ok(SignDescriptor {
            pubkey: entry.pubkey,
            single_tweak: entry.single_tweak,
            witness_script: entry.witness_script,
            output: entry.output,
            hash_type,
        })
    }
}

#[derive(Serialize, Deserialize)]
pub struct KidOutputEntry {
    pub amount_sat: u64,
    pub outpoint: OutPoint,
    pub origin_chan_point: OutPoint,
    pub blocks_to_maturity: u32,
    pub absolute_maturity: u32,
    pub conf_height: u32,
    pub witness_type: u8,
    pub sign_desc: SignDescriptorEntry,
}

impl From<&KidOutput> for KidOutputEntry {
    fn from(kid: &KidOutput) -> Self {
        KidOutputEntry {
            amount_sat: kid.amount_sat(),
            outpoint: kid.outpoint(),
            origin_chan_point: kid.origin_chan_point(),
            blocks_to_maturity: kid.blocks_to_maturity(),
            absolute_maturity: kid.absolute_maturity(),
            conf_height: kid.conf_height(),
            witness_type: witness_type_to_u8(kid.witness_type()),
            sign_desc: kid.sign_desc().into(),
        }
    }
}

impl TryFrom<KidOutputEntry> for KidOutput {
    type Error = Error;

    fn try_from(entry: KidOutputEntry) -> Result<Self, Error> {
        let witness_type = witness_type_from_u8(entry.witness_type)?;
        let mut kid = KidOutput::new(
            entry.amount_sat,
            entry.outpoint,
            entry.origin_chan_point,
            entry.blocks_to_maturity,
            entry.absolute_maturity,
            witness_type,
            entry.sign_desc.try_into()?,
        );
        if entry.conf_height != 0 {
            kid.set_conf_height(entry.conf_height);
        }
        Ok(kid)
    }
}

/// The baby-only fields layered on top of a kid entry.
#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct BabyExtraEntry {
    pub expiry: u32,
    #[serde_as(as = "Hex")]
    pub timeout_tx: Vec<u8>,
}

/// The versioned envelope stored per output.
#[derive(Serialize, Deserialize)]
pub struct RecordEntry {
    pub version: u8,
    pub stage: u8,
    pub kid: KidOutputEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baby: Option<BabyExtraEntry>,
}

fn witness_type_to_u8(witness_type: WitnessType) -> u8 {
    match witness_type {
        WitnessType::CommitmentTimeLock => 0,
        WitnessType::HtlcOfferedTimeoutSecondLevel => 1,
        WitnessType::HtlcAcceptedSuccessSecondLevel => 2,
        WitnessType::HtlcOfferedRemoteTimeout => 3,
    }
}

fn witness_type_from_u8(value: u8) -> Result<WitnessType, Error> {
    match value {
        0 => Ok(WitnessType::CommitmentTimeLock),
        1 => Ok(WitnessType::HtlcOfferedTimeoutSecondLevel),
        2 => Ok(WitnessType::HtlcAcceptedSuccessSecondLevel),
        3 => Ok(WitnessType::HtlcOfferedRemoteTimeout),
        other => Err(Error::Corrupt(format!("unknown witness type {}", other))),
    }
}

fn stage_to_u8(stage: Stage) -> u8 {
    match stage {
        Stage::Crib => 1,
        Stage::Preschool => 2,
        Stage::Kindergarten => 3,
        Stage::Graduated => 4,
    }
}

fn stage_from_u8(value: u8) -> Result<Stage, Error> {
    match value {
        1 => Ok(Stage::Crib),
        2 => Ok(Stage::Preschool),
        3 => Ok(Stage::Kindergarten),
        4 => Ok(Stage::Graduated),
        other => Err(Error::Corrupt(format!("unknown stage {}", other))),
    }
}

/// Encode a record with its stage into a versioned blob.
pub fn encode_record(stage: Stage, record: &NurseryRecord) -> Vec<u8> {
    let (kid, baby) = match record {
        NurseryRecord::Kid(kid) => (kid.into(), None),
        NurseryRecord::Baby(baby) => (
            baby.kid().into(),
            Some(BabyExtraEntry {
                expiry: baby.expiry(),
                timeout_tx: serialize(baby.timeout_tx()),
            }),
        ),
    };
    let entry = RecordEntry { version: RECORD_VERSION, stage: stage_to_u8(stage), kid, baby };
    serde_json::to_vec(&entry).expect("record serialization")
}

/// Decode a versioned record blob. Any malformation is fatal.
pub fn decode_record(bytes: &[u8]) -> Result<(Stage, NurseryRecord), Error> {
    let entry: RecordEntry = serde_json::from_slice(bytes)
        .map_err(|err| Error::Corrupt(format!("record decode: {}", err)))?;
    if entry.version != RECORD_VERSION {
        return Err(Error::Corrupt(format!("unknown record version {}", entry.version)));
    }
    let stage = stage_from_u8(entry.stage)?;
    let kid: KidOutput = entry.kid.try_into()?;
    let record = match entry.baby {
        Some(extra) => {
            let timeout_tx: Transaction = deserialize(&extra.timeout_tx)
                .map_err(|err| Error::Corrupt(format!("timeout tx decode: {}", err)))?;
            NurseryRecord::Baby(BabyOutput::new(kid, extra.expiry, timeout_tx))
        }
        None => NurseryRecord::Kid(kid),
    };
    match (&record, stage) {
        (NurseryRecord::Baby(_), Stage::Crib) | (NurseryRecord::Kid(_), Stage::Preschool)
        | (NurseryRecord::Kid(_), Stage::Kindergarten)
        | (NurseryRecord::Kid(_), Stage::Graduated) => {}
        _ => return Err(Error::Corrupt(format!("record shape does not match stage {:?}", stage))),
    }
    Ok((stage, record))
}

/// Encode a height watermark.
pub fn encode_height(height: u32) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

/// Decode a height watermark.
pub fn decode_height(bytes: &[u8]) -> Result<u32, Error> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt(format!("height watermark of {} bytes", bytes.len())))?;
    Ok(u32::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxo_nursery::util::test_utils::*;

    use test_log::test;

    fn sample_kids() -> Vec<KidOutput> {
        vec![
            make_kid(10_000, 1, WitnessType::CommitmentTimeLock, 2, 0),
            make_kid(25_000, 2, WitnessType::HtlcOfferedRemoteTimeout, 0, 125),
            make_kid_confirmed(1_234, 3, WitnessType::HtlcAcceptedSuccessSecondLevel, 6, 99),
            make_kid_confirmed(986_543, 4, WitnessType::HtlcOfferedTimeoutSecondLevel, 144, 500_000),
        ]
    }

    #[test]
    fn test_kid_round_trip() {
        let stages = [Stage::Preschool, Stage::Kindergarten, Stage::Graduated, Stage::Kindergarten];
        for (stage, kid) in stages.iter().zip(sample_kids()) {
            let encoded = encode_record(*stage, &NurseryRecord::Kid(kid.clone()));
            let (decoded_stage, decoded) = decode_record(&encoded).unwrap();
            assert_eq!(decoded_stage, *stage);
            assert_eq!(decoded, NurseryRecord::Kid(kid));
        }
    }

    #[test]
    fn test_baby_round_trip() {
        let res = make_outgoing_res(125, 2, 10_000, true);
        let baby = BabyOutput::from_outgoing_htlc(make_outpoint(9), &res);
        let encoded = encode_record(Stage::Crib, &NurseryRecord::Baby(baby.clone()));
        let (stage, decoded) = decode_record(&encoded).unwrap();
        assert_eq!(stage, Stage::Crib);
        assert_eq!(decoded, NurseryRecord::Baby(baby));
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let kid = make_kid(10_000, 1, WitnessType::CommitmentTimeLock, 2, 0);
        let mut encoded = encode_record(Stage::Preschool, &NurseryRecord::Kid(kid));
        // bump the version field in place
        let json = String::from_utf8(encoded.clone()).unwrap();
        let bumped = json.replacen("\"version\":0", "\"version\":9", 1);
        assert_ne!(json, bumped);
        encoded = bumped.into_bytes();
        match decode_record(&encoded) {
            Err(Error::Corrupt(msg)) => assert!(msg.contains("version")),
            other => panic!("expected corrupt error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_fatal() {
        match decode_record(b"not json") {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected corrupt error, got {:?}", other),
        }
    }

    #[test]
    fn test_height_round_trip() {
        for height in [0u32, 1, 125, u32::MAX] {
            assert_eq!(decode_height(&encode_height(height)).unwrap(), height);
        }
        assert!(decode_height(&[1, 2, 3]).is_err());
    }
}
