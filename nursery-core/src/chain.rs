use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Script, Transaction, Txid};
use tokio::sync::{mpsc, oneshot};

use crate::SendSync;

/// Error from a chain event source
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The notifier is shutting down or unreachable
    Unavailable(String),
    /// The registration was rejected
    Registration(String),
}

/// Error from the transaction broadcaster
#[derive(Clone, Debug, PartialEq)]
pub enum PublishError {
    /// The transaction is already known to the mempool - treated as
    /// success by callers
    AlreadyInMempool,
    /// The transaction was rejected
    Rejected(String),
}

/// A newly connected block.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BlockEpoch {
    /// Height of the connected block
    pub height: u32,
    /// Hash of the connected block
    pub hash: BlockHash,
}

/// Confirmation of a watched transaction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TxConfirmation {
    /// Height of the block including the transaction
    pub block_height: u32,
    /// Hash of that block
    pub block_hash: BlockHash,
}

/// A spend of a watched outpoint.
#[derive(Clone, Debug)]
pub struct SpendDetail {
    /// The outpoint that was spent
    pub spent_outpoint: OutPoint,
    /// The transaction spending it
    pub spending_tx: Transaction,
    /// Height at which the spend confirmed
    pub spending_height: u32,
}

/// Source of chain events.
///
/// Events across different registrations may fire in any order; each
/// confirmation and spend registration fires at most once.
#[async_trait]
pub trait ChainNotifier: SendSync {
    /// Stream of connected blocks. `height_hint` tells the notifier the
    /// height the caller has already fully processed.
    async fn register_block_epoch_ntfn(
        &self,
        height_hint: Option<u32>,
    ) -> Result<mpsc::Receiver<BlockEpoch>, Error>;

    /// One-shot notification for the confirmation of `txid`.
    async fn register_confirmations_ntfn(
        &self,
        txid: &Txid,
        script: &Script,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<oneshot::Receiver<TxConfirmation>, Error>;

    /// One-shot notification for a spend of `outpoint`.
    async fn register_spend_ntfn(
        &self,
        outpoint: &OutPoint,
        script: &Script,
        height_hint: u32,
    ) -> Result<oneshot::Receiver<SpendDetail>, Error>;
}

/// Chain tip access.
pub trait ChainIO: SendSync {
    /// The best known block hash and height.
    fn get_best_block(&self) -> Result<(BlockHash, u32), Error>;
}

/// Hands transactions to the network.
pub trait Broadcaster: SendSync {
    /// Publish a transaction. [`PublishError::AlreadyInMempool`] is not a
    /// failure.
    fn publish_transaction(&self, tx: &Transaction) -> Result<(), PublishError>;
}
