//! Mock collaborators and sample records for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{
    BlockHash, EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::chain::{
    BlockEpoch, Broadcaster, ChainIO, ChainNotifier, Error, PublishError, SpendDetail,
    TxConfirmation,
};
use crate::output::{
    CommitOutputResolution, IncomingHtlcResolution, InputScript, KidOutput,
    OutgoingHtlcResolution, SignDescriptor, WitnessType,
};
use crate::sweep::{self, Signer};
use crate::SendSync;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// A notifier delivering scripted events to every live registration.
pub struct MockNotifier {
    epoch_senders: Mutex<Vec<mpsc::Sender<BlockEpoch>>>,
    conf_senders: Mutex<HashMap<Txid, Vec<oneshot::Sender<TxConfirmation>>>>,
    spend_senders: Mutex<Vec<oneshot::Sender<SpendDetail>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        MockNotifier {
            epoch_senders: Mutex::new(Vec::new()),
            conf_senders: Mutex::new(HashMap::new()),
            spend_senders: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a block epoch to every registered stream.
    pub async fn notify_epoch(&self, height: u32) {
        let senders: Vec<mpsc::Sender<BlockEpoch>> = {
            let mut senders = self.epoch_senders.lock().unwrap();
            senders.retain(|s| !s.is_closed());
            senders.clone()
        };
        let epoch = BlockEpoch { height, hash: BlockHash::all_zeros() };
        for sender in senders {
            let _ = sender.send(epoch).await;
        }
    }

    /// Deliver a confirmation to every watcher of `txid`, waiting for at
    /// least one registration to exist.
    pub async fn confirm_tx(&self, txid: &Txid, height: u32) -> Result<(), String> {
        let mut waited = Duration::ZERO;
        loop {
            let watchers: Vec<oneshot::Sender<TxConfirmation>> = {
                let mut senders = self.conf_senders.lock().unwrap();
                match senders.get_mut(txid) {
                    Some(list) if !list.is_empty() => list.drain(..).collect(),
                    _ => Vec::new(),
                }
            };
            if !watchers.is_empty() {
                let conf =
                    TxConfirmation { block_height: height, block_hash: BlockHash::all_zeros() };
                for watcher in watchers {
                    let _ = watcher.send(conf);
                }
                return Ok(());
            }
            if waited >= CONFIRM_TIMEOUT {
                return Err(format!("no confirmation watcher for {}", txid));
            }
            sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
    }
}

impl SendSync for MockNotifier {}

#[async_trait]
impl ChainNotifier for MockNotifier {
    async fn register_block_epoch_ntfn(
        &self,
        _height_hint: Option<u32>,
    ) -> Result<mpsc::Receiver<BlockEpoch>, Error> {
        let (sender, receiver) = mpsc::channel(32);
        self.epoch_senders.lock().unwrap().push(sender);
        Ok(receiver)
    }

    async fn register_confirmations_ntfn(
        &self,
        txid: &Txid,
        _script: &Script,
        _num_confs: u32,
        _height_hint: u32,
    ) -> Result<oneshot::Receiver<TxConfirmation>, Error> {
        let (sender, receiver) = oneshot::channel();
        self.conf_senders.lock().unwrap().entry(*txid).or_default().push(sender);
        Ok(receiver)
    }

    async fn register_spend_ntfn(
        &self,
        _outpoint: &OutPoint,
        _script: &Script,
        _height_hint: u32,
    ) -> Result<oneshot::Receiver<SpendDetail>, Error> {
        let (sender, receiver) = oneshot::channel();
        self.spend_senders.lock().unwrap().push(sender);
        Ok(receiver)
    }
}

/// Chain tip access with a settable height.
pub struct MockChainIO {
    height: AtomicU32,
}

impl MockChainIO {
    pub fn new() -> Self {
        MockChainIO { height: AtomicU32::new(0) }
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }
}

impl SendSync for MockChainIO {}

impl ChainIO for MockChainIO {
    fn get_best_block(&self) -> Result<(BlockHash, u32), Error> {
        Ok((BlockHash::all_zeros(), self.height.load(Ordering::SeqCst)))
    }
}

/// Forwards every published transaction to a channel; can be told to
/// reject the next publish.
pub struct MockBroadcaster {
    sender: mpsc::UnboundedSender<Transaction>,
    fail_next: AtomicBool,
}

impl MockBroadcaster {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Transaction>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (MockBroadcaster { sender, fail_next: AtomicBool::new(false) }, receiver)
    }

    pub fn fail_next_publish(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SendSync for MockBroadcaster {}

impl Broadcaster for MockBroadcaster {
    fn publish_transaction(&self, tx: &Transaction) -> Result<(), PublishError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PublishError::Rejected("scripted failure".to_string()));
        }
        self.sender.send(tx.clone()).map_err(|_| PublishError::Rejected("closed".to_string()))?;
        Ok(())
    }
}

/// A signer producing empty signatures.
pub struct NullSigner;

impl SendSync for NullSigner {}

impl Signer for NullSigner {
    fn sign_output_raw(
        &self,
        _tx: &Transaction,
        _sign_desc: &SignDescriptor,
        _input_index: usize,
    ) -> Result<Vec<u8>, sweep::Error> {
        Ok(Vec::new())
    }

    fn compute_input_script(
        &self,
        _tx: &Transaction,
        _sign_desc: &SignDescriptor,
        _input_index: usize,
    ) -> Result<InputScript, sweep::Error> {
        Ok(InputScript::default())
    }
}

pub fn make_txid(i: u8) -> Txid {
    Txid::from_slice(&[i; 32]).unwrap()
}

pub fn make_outpoint(i: u8) -> OutPoint {
    OutPoint { txid: make_txid(i), vout: i as u32 }
}

pub fn make_pubkey() -> PublicKey {
    PublicKey::from_slice(
        &hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap(),
    )
    .unwrap()
}

pub fn make_sign_desc(value_sat: u64) -> SignDescriptor {
    SignDescriptor {
        pubkey: make_pubkey(),
        single_tweak: Some(vec![0x02; 32]),
        witness_script: Script::from(vec![0x51]),
        output: TxOut { value: value_sat, script_pubkey: Script::new() },
        hash_type: EcdsaSighashType::All,
    }
}

pub fn make_kid(
    amount_sat: u64,
    i: u8,
    witness_type: WitnessType,
    csv_delay: u32,
    absolute_maturity: u32,
) -> KidOutput {
    KidOutput::new(
        amount_sat,
        make_outpoint(i),
        make_outpoint(100 + i),
        csv_delay,
        absolute_maturity,
        witness_type,
        make_sign_desc(amount_sat),
    )
}

pub fn make_kid_confirmed(
    amount_sat: u64,
    i: u8,
    witness_type: WitnessType,
    csv_delay: u32,
    conf_height: u32,
) -> KidOutput {
    let mut kid = make_kid(amount_sat, i, witness_type, csv_delay, 0);
    kid.set_conf_height(conf_height);
    kid
}

/// An outgoing HTLC resolution mirroring a closed channel at `seed`'s
/// commitment. With `on_local_commitment` a pre-signed timeout
/// transaction is attached, otherwise the claim outpoint is set.
pub fn make_outgoing_res_seeded(
    seed: u8,
    expiry: u32,
    csv_delay: u32,
    amount_sat: u64,
    on_local_commitment: bool,
) -> OutgoingHtlcResolution {
    let htlc_op = make_outpoint(seed);
    let mut res = OutgoingHtlcResolution {
        expiry,
        signed_timeout_tx: None,
        csv_delay,
        claim_outpoint: OutPoint::null(),
        sweep_sign_desc: make_sign_desc(amount_sat),
    };
    if on_local_commitment {
        res.signed_timeout_tx = Some(Transaction {
            version: 2,
            lock_time: PackedLockTime(expiry),
            input: vec![TxIn {
                previous_output: htlc_op,
                script_sig: Script::new(),
                sequence: Sequence::ZERO,
                witness: Witness::from_vec(vec![vec![]]),
            }],
            output: vec![TxOut { value: amount_sat, script_pubkey: Script::new() }],
        });
    } else {
        res.claim_outpoint = htlc_op;
    }
    res
}

pub fn make_outgoing_res(
    expiry: u32,
    csv_delay: u32,
    amount_sat: u64,
    on_local_commitment: bool,
) -> OutgoingHtlcResolution {
    make_outgoing_res_seeded(1, expiry, csv_delay, amount_sat, on_local_commitment)
}

pub fn make_commit_res(amount_sat: u64, maturity_delay: u32) -> CommitOutputResolution {
    CommitOutputResolution {
        self_outpoint: OutPoint::null(),
        self_output_sign_desc: make_sign_desc(amount_sat),
        maturity_delay,
    }
}

pub fn make_incoming_res(seed: u8, csv_delay: u32, amount_sat: u64) -> IncomingHtlcResolution {
    IncomingHtlcResolution {
        claim_outpoint: make_outpoint(seed),
        csv_delay,
        sweep_sign_desc: make_sign_desc(amount_sat),
    }
}
