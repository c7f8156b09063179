use bitcoin::secp256k1::PublicKey;
use bitcoin::{EcdsaSighashType, OutPoint, Script, Transaction, TxOut};

/// The script class of a tracked output.
///
/// Determines the witness layout used when sweeping and the weight
/// reserved for that witness during fee estimation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WitnessType {
    /// Our own commitment output, spendable after its CSV delay
    CommitmentTimeLock,
    /// The output of a pre-signed second-level HTLC timeout transaction
    HtlcOfferedTimeoutSecondLevel,
    /// The output of a second-level HTLC success claim
    HtlcAcceptedSuccessSecondLevel,
    /// An offered HTLC on the remote commitment, claimable after its CLTV
    HtlcOfferedRemoteTimeout,
}

impl WitnessType {
    /// Expected witness weight when an input of this type is swept.
    ///
    /// We use expected weight (and not actual) as signature sizes and
    /// timelock encodings may vary.
    pub fn expected_witness_weight(&self) -> usize {
        match self {
            // number_of_witness_elements + sig_length + sig + nil_length +
            // witness_script_length + witness_script
            WitnessType::CommitmentTimeLock => 1 + 1 + 73 + 1 + 1 + 77,
            WitnessType::HtlcOfferedTimeoutSecondLevel => 1 + 1 + 73 + 1 + 1 + 77,
            WitnessType::HtlcAcceptedSuccessSecondLevel => 1 + 1 + 73 + 1 + 1 + 77,
            // number_of_witness_elements + sig_length + sig +
            // empty_preimage_length + witness_script_length + witness_script
            WitnessType::HtlcOfferedRemoteTimeout => 1 + 1 + 73 + 1 + 1 + 133,
        }
    }

    /// Whether spends of this type are gated on a CSV delay counted from
    /// the confirmation of the output.
    pub fn is_csv(&self) -> bool {
        !matches!(self, WitnessType::HtlcOfferedRemoteTimeout)
    }
}

/// Opaque signing material for one output, handed to the external signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignDescriptor {
    /// The public key the signature must validate against
    pub pubkey: PublicKey,
    /// Optional tweak applied to the key before signing
    pub single_tweak: Option<Vec<u8>>,
    /// The witness script committed to by the output
    pub witness_script: Script,
    /// The output being spent
    pub output: TxOut,
    /// The sighash flag to sign under
    pub hash_type: EcdsaSighashType,
}

/// A script-level input solution produced by the signer.
#[derive(Clone, Debug, Default)]
pub struct InputScript {
    /// Witness stack
    pub witness: Vec<Vec<u8>>,
    /// Legacy script-sig, empty for native segwit
    pub sig_script: Vec<u8>,
}

/// An output that is ready, or will be ready at a known height, to be
/// swept by a single signature.
#[derive(Clone, Debug, PartialEq)]
pub struct KidOutput {
    amount_sat: u64,
    outpoint: OutPoint,
    origin_chan_point: OutPoint,
    // CSV delay, zero when only an absolute lock applies
    blocks_to_maturity: u32,
    // CLTV height, zero when only a CSV delay applies
    absolute_maturity: u32,
    // zero until the creating transaction confirms
    conf_height: u32,
    witness_type: WitnessType,
    sign_desc: SignDescriptor,
}

impl KidOutput {
    /// Assemble a kid from its parts. `conf_height` starts unknown.
    pub fn new(
        amount_sat: u64,
        outpoint: OutPoint,
        origin_chan_point: OutPoint,
        blocks_to_maturity: u32,
        absolute_maturity: u32,
        witness_type: WitnessType,
        sign_desc: SignDescriptor,
    ) -> Self {
        KidOutput {
            amount_sat,
            outpoint,
            origin_chan_point,
            blocks_to_maturity,
            absolute_maturity,
            conf_height: 0,
            witness_type,
            sign_desc,
        }
    }

    /// The node's commitment output, maturing `maturity_delay` blocks
    /// after the commitment transaction confirms.
    pub fn from_commit_resolution(
        chan_point: OutPoint,
        res: &CommitOutputResolution,
    ) -> Self {
        KidOutput::new(
            res.self_output_sign_desc.output.value,
            res.self_outpoint,
            chan_point,
            res.maturity_delay,
            0,
            WitnessType::CommitmentTimeLock,
            res.self_output_sign_desc.clone(),
        )
    }

    /// An offered HTLC claimed directly on the remote commitment, locked
    /// until its CLTV expiry.
    pub fn from_outgoing_htlc_claim(
        chan_point: OutPoint,
        res: &OutgoingHtlcResolution,
    ) -> Self {
        KidOutput::new(
            res.sweep_sign_desc.output.value,
            res.claim_outpoint,
            chan_point,
            0,
            res.expiry,
            WitnessType::HtlcOfferedRemoteTimeout,
            res.sweep_sign_desc.clone(),
        )
    }

    /// A second-stage claim of an accepted HTLC, maturing `csv_delay`
    /// blocks after its creating transaction confirms.
    pub fn from_incoming_htlc(chan_point: OutPoint, res: &IncomingHtlcResolution) -> Self {
        KidOutput::new(
            res.sweep_sign_desc.output.value,
            res.claim_outpoint,
            chan_point,
            res.csv_delay,
            0,
            WitnessType::HtlcAcceptedSuccessSecondLevel,
            res.sweep_sign_desc.clone(),
        )
    }

    /// Amount carried by the output in satoshi.
    pub fn amount_sat(&self) -> u64 {
        self.amount_sat
    }

    /// The outpoint this record tracks.
    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    /// Funding outpoint of the channel this output derives from.
    pub fn origin_chan_point(&self) -> OutPoint {
        self.origin_chan_point
    }

    /// CSV delay, zero for CLTV-only outputs.
    pub fn blocks_to_maturity(&self) -> u32 {
        self.blocks_to_maturity
    }

    /// CLTV height, zero for CSV-only outputs.
    pub fn absolute_maturity(&self) -> u32 {
        self.absolute_maturity
    }

    /// Height at which the creating transaction confirmed, zero if
    /// not yet observed.
    pub fn conf_height(&self) -> u32 {
        self.conf_height
    }

    /// Record the confirmation height of the creating transaction.
    pub fn set_conf_height(&mut self, height: u32) {
        self.conf_height = height;
    }

    /// Whether the creating transaction has confirmed.
    pub fn is_confirmed(&self) -> bool {
        self.conf_height != 0
    }

    /// The script class of this output.
    pub fn witness_type(&self) -> WitnessType {
        self.witness_type
    }

    /// Signing material for the sweep.
    pub fn sign_desc(&self) -> &SignDescriptor {
        &self.sign_desc
    }

    /// The height at which this output can be swept.
    ///
    /// CSV outputs mature a fixed number of blocks after confirmation;
    /// CLTV-only outputs mature at their absolute expiry.
    pub fn maturity_height(&self) -> u32 {
        if self.blocks_to_maturity > 0 {
            self.conf_height + self.blocks_to_maturity
        } else {
            self.absolute_maturity
        }
    }
}

/// An offered HTLC on our own commitment: a pre-signed timeout
/// transaction that may be broadcast once its CLTV expires, wrapping the
/// kid that sweeps the timeout transaction's output after its CSV delay.
#[derive(Clone, Debug, PartialEq)]
pub struct BabyOutput {
    kid: KidOutput,
    expiry: u32,
    timeout_tx: Transaction,
}

impl BabyOutput {
    /// Build a baby from an outgoing HTLC resolution carrying a signed
    /// timeout transaction. The inner kid spends the first output of the
    /// timeout transaction.
    pub fn from_outgoing_htlc(chan_point: OutPoint, res: &OutgoingHtlcResolution) -> Self {
        let timeout_tx =
            res.signed_timeout_tx.clone().expect("outgoing resolution without timeout tx");
        let kid_op = OutPoint { txid: timeout_tx.txid(), vout: 0 };
        let kid = KidOutput::new(
            res.sweep_sign_desc.output.value,
            kid_op,
            chan_point,
            res.csv_delay,
            0,
            WitnessType::HtlcOfferedTimeoutSecondLevel,
            res.sweep_sign_desc.clone(),
        );
        BabyOutput { kid, expiry: res.expiry, timeout_tx }
    }

    /// Reassemble a baby from persisted parts.
    pub fn new(kid: KidOutput, expiry: u32, timeout_tx: Transaction) -> Self {
        BabyOutput { kid, expiry, timeout_tx }
    }

    /// CLTV height before which the timeout transaction is invalid.
    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    /// The pre-signed timeout transaction.
    pub fn timeout_tx(&self) -> &Transaction {
        &self.timeout_tx
    }

    /// The kid that sweeps the timeout transaction's output.
    pub fn kid(&self) -> &KidOutput {
        &self.kid
    }

    /// Record the confirmation of the timeout transaction, producing the
    /// kindergarten form of this output.
    pub fn confirm(&mut self, height: u32) {
        self.kid.set_conf_height(height);
    }
}

/// Resolution of the node's own output on a closed channel's commitment
/// transaction.
#[derive(Clone, Debug)]
pub struct CommitOutputResolution {
    /// Our to-self output on the commitment transaction
    pub self_outpoint: OutPoint,
    /// Signing material for the sweep
    pub self_output_sign_desc: SignDescriptor,
    /// CSV delay imposed on the output
    pub maturity_delay: u32,
}

/// Resolution of an outgoing (offered) HTLC.
///
/// On our own commitment the resolution carries a pre-signed second-level
/// timeout transaction; on the remote commitment it names the claim
/// outpoint that can be swept directly after expiry.
#[derive(Clone, Debug)]
pub struct OutgoingHtlcResolution {
    /// CLTV expiry of the HTLC
    pub expiry: u32,
    /// Pre-signed timeout transaction, present for our own commitment
    pub signed_timeout_tx: Option<Transaction>,
    /// CSV delay on the timeout transaction's output
    pub csv_delay: u32,
    /// Output to claim directly when no timeout transaction is required
    pub claim_outpoint: OutPoint,
    /// Signing material for the final sweep
    pub sweep_sign_desc: SignDescriptor,
}

/// Resolution of an incoming (accepted) HTLC whose preimage is known,
/// handed over as a second-stage claim.
#[derive(Clone, Debug)]
pub struct IncomingHtlcResolution {
    /// Output to claim
    pub claim_outpoint: OutPoint,
    /// CSV delay on the claim output
    pub csv_delay: u32,
    /// Signing material for the final sweep
    pub sweep_sign_desc: SignDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::*;

    use test_log::test;

    #[test]
    fn test_csv_maturity() {
        let mut kid = make_kid(1000, 1, WitnessType::CommitmentTimeLock, 4, 0);
        assert!(!kid.is_confirmed());
        kid.set_conf_height(124);
        assert!(kid.is_confirmed());
        assert_eq!(kid.maturity_height(), 128);
    }

    #[test]
    fn test_cltv_maturity() {
        let mut kid = make_kid(1000, 2, WitnessType::HtlcOfferedRemoteTimeout, 0, 125);
        assert_eq!(kid.maturity_height(), 125);
        // confirmation does not move an absolute lock
        kid.set_conf_height(124);
        assert_eq!(kid.maturity_height(), 125);
    }

    #[test]
    fn test_baby_from_resolution() {
        let res = make_outgoing_res(125, 2, 10_000, true);
        let baby = BabyOutput::from_outgoing_htlc(make_outpoint(9), &res);
        assert_eq!(baby.expiry(), 125);
        assert_eq!(baby.kid().outpoint().txid, baby.timeout_tx().txid());
        assert_eq!(baby.kid().outpoint().vout, 0);
        assert_eq!(baby.kid().blocks_to_maturity(), 2);
        assert_eq!(baby.kid().amount_sat(), 10_000);
        assert_eq!(baby.kid().witness_type(), WitnessType::HtlcOfferedTimeoutSecondLevel);
    }

    #[test]
    fn test_remote_claim_from_resolution() {
        let res = make_outgoing_res(125, 2, 10_000, false);
        let kid = KidOutput::from_outgoing_htlc_claim(make_outpoint(9), &res);
        assert_eq!(kid.outpoint(), res.claim_outpoint);
        // the CSV delay of the resolution applies to the second level
        // transaction only, never to a direct remote claim
        assert_eq!(kid.blocks_to_maturity(), 0);
        assert_eq!(kid.absolute_maturity(), 125);
        assert_eq!(kid.witness_type(), WitnessType::HtlcOfferedRemoteTimeout);
    }
}
