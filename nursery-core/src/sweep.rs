use std::sync::Arc;

use bitcoin::{
    PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};
use log::*;

use crate::output::{InputScript, KidOutput, SignDescriptor};
use crate::SendSync;

/// Confirmation target used when estimating the sweep fee rate.
pub const SWEEP_CONF_TARGET: u32 = 6;

// outputs below this are not worth sweeping
const DUST_LIMIT_SAT: u64 = 546;

/// Error while constructing or signing a sweep transaction
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The signer refused or failed to sign an input
    Signer(String),
    /// No wallet script was available for the sweep output
    Script(String),
    /// The class value does not cover the fee and dust limit
    NotEconomical {
        /// Summed value of the inputs
        total_sat: u64,
        /// Fee required at the estimated rate
        fee_sat: u64,
    },
}

/// Signs nursery-built transactions. Key material stays behind this
/// boundary.
pub trait Signer: SendSync {
    /// Produce a raw DER signature (without the sighash flag) for the
    /// given input.
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        sign_desc: &SignDescriptor,
        input_index: usize,
    ) -> Result<Vec<u8>, Error>;

    /// Produce a full input solution for outputs whose script the signer
    /// owns outright.
    fn compute_input_script(
        &self,
        tx: &Transaction,
        sign_desc: &SignDescriptor,
        input_index: usize,
    ) -> Result<InputScript, Error>;
}

/// Fee rate source, in satoshi per 1000 weight units.
pub trait FeeEstimator: SendSync {
    /// Estimate the rate to confirm within `conf_target` blocks.
    fn estimate_fee_per_kw(&self, conf_target: u32) -> Result<u64, String>;

    /// Rate to fall back to when estimation fails.
    fn fallback_fee_per_kw(&self) -> u64;
}

/// A fee estimator that always returns a fixed rate.
pub struct StaticFeeEstimator {
    /// The fixed rate in sat/kw
    pub sat_per_kw: u64,
}

impl SendSync for StaticFeeEstimator {}

impl FeeEstimator for StaticFeeEstimator {
    fn estimate_fee_per_kw(&self, _conf_target: u32) -> Result<u64, String> {
        Ok(self.sat_per_kw)
    }

    fn fallback_fee_per_kw(&self) -> u64 {
        self.sat_per_kw
    }
}

/// Produces a fresh wallet-owned script for each sweep output.
pub type GenSweepScript = Box<dyn Fn() -> Result<Script, String> + Send + Sync>;

/// Collaborators of the sweep pipeline.
pub struct SweeperConfig {
    /// Wallet script source for sweep outputs
    pub gen_sweep_script: GenSweepScript,
    /// Fee rate source
    pub estimator: Arc<dyn FeeEstimator>,
    /// Input signer
    pub signer: Arc<dyn Signer>,
}

/// Builds and signs one batched sweep transaction per kindergarten class.
pub struct Sweeper {
    cfg: SweeperConfig,
}

impl Sweeper {
    /// Create a sweeper from its collaborators.
    pub fn new(cfg: SweeperConfig) -> Self {
        Sweeper { cfg }
    }

    /// Construct and sign the sweep transaction for a class of mature
    /// kids.
    ///
    /// Inputs carry their CSV delay in the sequence field; the lock time
    /// is the class height, which satisfies the CLTV members of the class
    /// and keeps a rebuilt transaction byte-identical.
    pub fn create_sweep_tx(&self, kids: &[KidOutput], height: u32) -> Result<Transaction, Error> {
        assert!(!kids.is_empty(), "empty kindergarten class");

        let sweep_script =
            (self.cfg.gen_sweep_script)().map_err(Error::Script)?;

        let input: Vec<TxIn> = kids
            .iter()
            .map(|kid| TxIn {
                previous_output: kid.outpoint(),
                script_sig: Script::new(),
                sequence: sequence_for(kid),
                witness: Witness::default(),
            })
            .collect();

        let mut tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(height),
            input,
            output: vec![TxOut { value: 0, script_pubkey: sweep_script }],
        };

        let total_sat: u64 = kids.iter().map(|kid| kid.amount_sat()).sum();
        let fee_sat = self.fee_for(&tx, kids);
        if total_sat < fee_sat + DUST_LIMIT_SAT {
            return Err(Error::NotEconomical { total_sat, fee_sat });
        }
        tx.output[0].value = total_sat - fee_sat;

        for (i, kid) in kids.iter().enumerate() {
            let sig = self.cfg.signer.sign_output_raw(&tx, kid.sign_desc(), i)?;
            tx.input[i].witness = build_witness(sig, kid.sign_desc());
        }

        debug!(
            "built sweep tx {} for height {}: {} inputs, {} sat, fee {} sat",
            tx.txid(),
            height,
            kids.len(),
            total_sat,
            fee_sat
        );
        Ok(tx)
    }

    // Expected-weight fee for the unsigned transaction plus the witnesses
    // it will carry.
    fn fee_for(&self, unsigned_tx: &Transaction, kids: &[KidOutput]) -> u64 {
        // segwit marker and flag are absent from the witness-less weight
        let mut weight = unsigned_tx.weight() + 2;
        for kid in kids {
            weight += kid.witness_type().expected_witness_weight();
        }

        let fee_per_kw = match self.cfg.estimator.estimate_fee_per_kw(SWEEP_CONF_TARGET) {
            Ok(rate) => rate,
            Err(err) => {
                let fallback = self.cfg.estimator.fallback_fee_per_kw();
                warn!("fee estimation failed ({}), using fallback rate {}", err, fallback);
                fallback
            }
        };
        fee_per_kw * weight as u64 / 1000
    }
}

fn sequence_for(kid: &KidOutput) -> Sequence {
    if kid.witness_type().is_csv() {
        Sequence(kid.blocks_to_maturity())
    } else {
        Sequence::ENABLE_RBF_NO_LOCKTIME
    }
}

// All nursery sweeps solve a three element stack: the signature, an empty
// element selecting the timeout/delay branch (a zero-length push per
// MINIMALIF), and the witness script.
fn build_witness(mut sig: Vec<u8>, sign_desc: &SignDescriptor) -> Witness {
    sig.push(sign_desc.hash_type.to_u32() as u8);
    Witness::from_vec(vec![sig, vec![], sign_desc.witness_script.to_bytes()])
}
