use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::{OutPoint, Txid};
use log::*;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use triggered::{Listener, Trigger};

use crate::chain::{self, BlockEpoch, Broadcaster, ChainIO, ChainNotifier, PublishError, TxConfirmation};
use crate::output::{
    BabyOutput, CommitOutputResolution, IncomingHtlcResolution, KidOutput,
    OutgoingHtlcResolution, WitnessType,
};
use crate::store::{self, NurseryRecord, NurseryStore, Stage};
use crate::sweep::{self, Sweeper};

/// Nursery error
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The queried channel has no nursery record, either because it was
    /// never handed over or because all of its outputs graduated
    ContractNotFound,
    /// The nursery was started twice
    AlreadyStarted,
    /// Store failure
    Store(store::Error),
    /// Chain interface failure
    Chain(chain::Error),
    /// Sweep construction failure
    Sweep(sweep::Error),
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Error::Store(e)
    }
}

impl From<chain::Error> for Error {
    fn from(e: chain::Error) -> Self {
        Error::Chain(e)
    }
}

impl From<sweep::Error> for Error {
    fn from(e: sweep::Error) -> Self {
        Error::Sweep(e)
    }
}

/// Close metadata for a channel, supplied by the channel database.
#[derive(Clone, Debug)]
pub struct ChannelCloseSummary {
    /// Funding outpoint of the closed channel
    pub chan_point: OutPoint,
    /// Height at which the closing transaction confirmed
    pub close_height: u32,
}

/// Looks up close metadata for one channel.
pub type FetchClosedChannel =
    Arc<dyn Fn(&OutPoint) -> Result<Option<ChannelCloseSummary>, Error> + Send + Sync>;

/// Lists closed channels, optionally only those still pending resolution.
pub type FetchClosedChannels =
    Arc<dyn Fn(bool) -> Result<Vec<ChannelCloseSummary>, Error> + Send + Sync>;

/// Collaborators of the nursery.
#[derive(Clone)]
pub struct NurseryConfig {
    /// Chain event source
    pub notifier: Arc<dyn ChainNotifier>,
    /// Chain tip access
    pub chain_io: Arc<dyn ChainIO>,
    /// Durable state
    pub store: Arc<dyn NurseryStore>,
    /// Sweep transaction factory
    pub sweeper: Arc<Sweeper>,
    /// Transaction broadcaster
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Close metadata lookup
    pub fetch_closed_channel: FetchClosedChannel,
    /// Close metadata listing
    pub fetch_closed_channels: FetchClosedChannels,
}

/// Per-HTLC view of a channel's nursery state.
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcMaturityReport {
    /// Outpoint being incubated
    pub outpoint: OutPoint,
    /// Amount in satoshi
    pub amount_sat: u64,
    /// Next height at which the output needs action
    pub maturity_height: u32,
    /// 1 while the timeout transaction is pending, 2 afterwards
    pub stage: u32,
}

/// Operator-facing view of a channel's nursery state.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractMaturityReport {
    /// Funding outpoint of the channel
    pub chan_point: OutPoint,
    /// Summed value still maturing
    pub limbo_balance: u64,
    /// Summed value already swept
    pub recovered_balance: u64,
    /// Per-HTLC detail
    pub htlcs: Vec<HtlcMaturityReport>,
}

/// Shepherds outputs of closed channels through their timelocks.
///
/// One incubator task consumes block epochs and drives all height-keyed
/// transitions; confirmation waiters promote individual outputs. Every
/// store mutation triggered by a chain event is serialized behind one
/// async mutex, and every wait multiplexes the shutdown listener.
pub struct UtxoNursery {
    cfg: NurseryConfig,
    started: AtomicBool,
    best_height: AtomicU32,
    mutation_lock: AsyncMutex<()>,
    shutdown_trigger: Trigger,
    shutdown_listener: Listener,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // suppress duplicate registrations within one process lifetime
    pending_tx_confs: Mutex<HashSet<Txid>>,
    pending_preschool_confs: Mutex<HashSet<OutPoint>>,
}

impl UtxoNursery {
    /// Create a stopped nursery around its collaborators.
    pub fn new(cfg: NurseryConfig) -> Arc<Self> {
        let (shutdown_trigger, shutdown_listener) = triggered::trigger();
        Arc::new(UtxoNursery {
            cfg,
            started: AtomicBool::new(false),
            best_height: AtomicU32::new(0),
            mutation_lock: AsyncMutex::new(()),
            shutdown_trigger,
            shutdown_listener,
            tasks: Mutex::new(Vec::new()),
            pending_tx_confs: Mutex::new(HashSet::new()),
            pending_preschool_confs: Mutex::new(HashSet::new()),
        })
    }

    /// Bring the nursery up: re-establish every subscription, catch up on
    /// heights that matured while we were down, and spawn the incubator.
    ///
    /// The sequence is idempotent; a restart is indistinguishable from a
    /// run that began at the graduation watermark.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let (_, best_height) = self.cfg.chain_io.get_best_block()?;
        self.best_height.store(best_height, Ordering::SeqCst);

        let last_graduated = self.cfg.store.last_graduated_height()?;
        info!(
            "starting UTXO nursery at height {}, graduation watermark {}",
            best_height, last_graduated
        );

        let epochs =
            self.cfg.notifier.register_block_epoch_ntfn(Some(last_graduated)).await?;

        self.reload_preschool().await?;

        // Re-broadcast expired timeout transactions and re-publish any
        // finalized sweep that has not confirmed yet.
        {
            let _guard = self.mutation_lock.lock().await;
            self.process_due_heights(best_height).await?;
        }

        let nursery = Arc::clone(self);
        let listener = self.shutdown_listener.clone();
        let handle = tokio::spawn(async move { nursery.incubator(epochs, listener).await });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    /// Stop the nursery: cancel every wait and join every task. No store
    /// write happens after this returns.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        debug!("stopping UTXO nursery");
        self.shutdown_trigger.trigger();
        // joining the incubator can spawn no new waiters, but waiters
        // registered just before the trigger may still be in the list
        // after the first drain
        loop {
            let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
        info!("UTXO nursery stopped");
    }

    /// Hand over the resolutions of a freshly closed channel.
    ///
    /// Outputs are classified, committed in one atomic store call, and
    /// their confirmation watchers registered. Returns once the store
    /// commit has completed.
    pub async fn incubate_outputs(
        self: &Arc<Self>,
        chan_point: OutPoint,
        commit_resolution: Option<CommitOutputResolution>,
        outgoing_htlcs: Vec<OutgoingHtlcResolution>,
        incoming_htlcs: Vec<IncomingHtlcResolution>,
        broadcast_height: u32,
    ) -> Result<(), Error> {
        let mut kids = Vec::new();
        let mut babies = Vec::new();

        if let Some(res) = commit_resolution {
            kids.push(KidOutput::from_commit_resolution(chan_point, &res));
        }
        for res in &outgoing_htlcs {
            if res.signed_timeout_tx.is_some() {
                babies.push(BabyOutput::from_outgoing_htlc(chan_point, res));
            } else {
                kids.push(KidOutput::from_outgoing_htlc_claim(chan_point, res));
            }
        }
        for res in &incoming_htlcs {
            kids.push(KidOutput::from_incoming_htlc(chan_point, res));
        }

        if kids.is_empty() && babies.is_empty() {
            return Ok(());
        }

        info!(
            "incubating {} kids and {} babies for channel {}",
            kids.len(),
            babies.len(),
            chan_point
        );
        self.cfg.store.incubate(&kids, &babies)?;

        // watch for the transactions creating the preschool outputs; crib
        // babies are watched once their timeout tx is broadcast
        for kid in kids.into_iter().filter(|kid| !kid.is_confirmed()) {
            self.register_preschool_conf(kid, broadcast_height).await?;
        }
        Ok(())
    }

    /// The maturity report for one channel.
    pub fn nursery_report(&self, chan_point: &OutPoint) -> Result<ContractMaturityReport, Error> {
        let mut report = ContractMaturityReport {
            chan_point: *chan_point,
            limbo_balance: 0,
            recovered_balance: 0,
            htlcs: Vec::new(),
        };
        let mut seen = false;

        self.cfg.store.for_chan_outputs(chan_point, &mut |stage, record| {
            seen = true;
            let kid = record.kid();
            // preschool reports as stage two, same as kindergarten
            let stage_num = match stage {
                Stage::Crib => 1,
                Stage::Preschool | Stage::Kindergarten => 2,
                Stage::Graduated => {
                    report.recovered_balance += kid.amount_sat();
                    return Ok(());
                }
            };
            report.limbo_balance += kid.amount_sat();

            if kid.witness_type() != WitnessType::CommitmentTimeLock {
                let maturity_height = match &record {
                    NurseryRecord::Baby(baby) => baby.expiry(),
                    NurseryRecord::Kid(kid) if kid.is_confirmed() => kid.maturity_height(),
                    NurseryRecord::Kid(kid) => kid.absolute_maturity(),
                };
                report.htlcs.push(HtlcMaturityReport {
                    outpoint: kid.outpoint(),
                    amount_sat: kid.amount_sat(),
                    maturity_height,
                    stage: stage_num,
                });
            }
            Ok(())
        })?;

        if !seen {
            return Err(Error::ContractNotFound);
        }
        Ok(report)
    }

    /// Best height the nursery has observed.
    pub fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::SeqCst)
    }

    async fn incubator(self: Arc<Self>, mut epochs: mpsc::Receiver<BlockEpoch>, listener: Listener) {
        debug!("incubator starting");
        loop {
            tokio::select! {
                _ = listener.clone() => break,
                epoch = epochs.recv() => match epoch {
                    Some(epoch) => {
                        if let Err(err) = self.handle_epoch(epoch).await {
                            if let Error::Store(store::Error::Corrupt(ref msg)) = err {
                                error!("nursery store corrupt, incubator halting: {}", msg);
                                break;
                            }
                            warn!(
                                "epoch {} processing incomplete, retrying next block: {:?}",
                                epoch.height, err
                            );
                        }
                    }
                    None => {
                        debug!("block epoch stream closed");
                        break;
                    }
                },
            }
        }
        debug!("incubator exiting");
    }

    async fn handle_epoch(self: &Arc<Self>, epoch: BlockEpoch) -> Result<(), Error> {
        trace!("block epoch at height {}", epoch.height);
        self.best_height.store(epoch.height, Ordering::SeqCst);

        let _guard = self.mutation_lock.lock().await;
        self.process_due_heights(epoch.height).await?;
        self.cfg.store.graduate_height(epoch.height)?;
        Ok(())
    }

    // Run one graduation pass per due height, ascending. Failed heights
    // stay in the index and are retried on the next epoch; only a corrupt
    // store halts processing. Caller holds the mutation lock.
    async fn process_due_heights(self: &Arc<Self>, tip: u32) -> Result<(), Error> {
        for height in self.cfg.store.heights_below_or_equal(tip)? {
            if let Err(err) = self.graduate_class(height).await {
                if matches!(err, Error::Store(store::Error::Corrupt(_))) {
                    return Err(err);
                }
                warn!("class at height {} not processed: {:?}", height, err);
            }
        }
        Ok(())
    }

    // Advance one height's class: broadcast due timeout transactions,
    // then build (or reuse) and publish the class sweep.
    async fn graduate_class(self: &Arc<Self>, height: u32) -> Result<(), Error> {
        let (finalized_tx, kids, babies) = self.cfg.store.fetch_class(height)?;

        for baby in &babies {
            self.broadcast_timeout_tx(baby).await?;
        }

        if kids.is_empty() {
            return Ok(());
        }

        // Reuse the finalized transaction when one exists: after a crash
        // between build and confirm the same bytes, and hence the same
        // txid, go back out.
        let sweep_tx = match finalized_tx {
            Some(tx) => tx,
            None => {
                let tx = self.cfg.sweeper.create_sweep_tx(&kids, height)?;
                self.cfg.store.finalize_kinder(height, &tx)?;
                tx
            }
        };

        match self.cfg.broadcaster.publish_transaction(&sweep_tx) {
            Ok(()) => debug!("published sweep tx {} for height {}", sweep_tx.txid(), height),
            Err(PublishError::AlreadyInMempool) => {
                trace!("sweep tx {} already in mempool", sweep_tx.txid())
            }
            Err(PublishError::Rejected(reason)) => {
                // the finalized record guarantees the identical bytes are
                // retried on the next epoch
                warn!(
                    "sweep tx {} for height {} rejected, retrying next block: {}",
                    sweep_tx.txid(),
                    height,
                    reason
                );
                return Ok(());
            }
        }

        self.register_sweep_conf(&sweep_tx, height).await
    }

    async fn broadcast_timeout_tx(self: &Arc<Self>, baby: &BabyOutput) -> Result<(), Error> {
        let tx = baby.timeout_tx();
        match self.cfg.broadcaster.publish_transaction(tx) {
            Ok(()) => {
                info!("broadcast timeout tx {} (expiry {})", tx.txid(), baby.expiry())
            }
            Err(PublishError::AlreadyInMempool) => {
                trace!("timeout tx {} already in mempool", tx.txid())
            }
            Err(PublishError::Rejected(reason)) => {
                warn!("timeout tx {} rejected, retrying next block: {}", tx.txid(), reason);
                return Ok(());
            }
        }
        self.register_timeout_conf(baby).await
    }

    async fn reload_preschool(self: &Arc<Self>) -> Result<(), Error> {
        // close heights of pending channels in one query, with a
        // per-channel fallback for anything not listed
        let mut hints: HashMap<OutPoint, u32> = HashMap::new();
        if let Ok(channels) = (self.cfg.fetch_closed_channels)(true) {
            for summary in channels {
                hints.insert(summary.chan_point, summary.close_height);
            }
        }
        for kid in self.cfg.store.fetch_preschools()? {
            let hint = match hints.get(&kid.origin_chan_point()) {
                Some(height) => *height,
                None => self.close_height_hint(&kid.origin_chan_point()),
            };
            self.register_preschool_conf(kid, hint).await?;
        }
        Ok(())
    }

    fn close_height_hint(&self, chan_point: &OutPoint) -> u32 {
        match (self.cfg.fetch_closed_channel)(chan_point) {
            Ok(Some(summary)) => summary.close_height,
            _ => 0,
        }
    }

    // Watch for the confirmation of the transaction creating a preschool
    // output. The outpoint itself names that transaction.
    async fn register_preschool_conf(
        self: &Arc<Self>,
        kid: KidOutput,
        height_hint: u32,
    ) -> Result<(), Error> {
        let outpoint = kid.outpoint();
        if !self.pending_preschool_confs.lock().unwrap().insert(outpoint) {
            return Ok(());
        }
        let conf_rx = self
            .cfg
            .notifier
            .register_confirmations_ntfn(
                &outpoint.txid,
                &kid.sign_desc().output.script_pubkey,
                1,
                height_hint,
            )
            .await?;

        debug!("watching preschool output {} for confirmation", outpoint);
        let nursery = Arc::clone(self);
        let listener = self.shutdown_listener.clone();
        self.spawn_task(async move {
            tokio::select! {
                _ = listener => {}
                conf = conf_rx => {
                    nursery.pending_preschool_confs.lock().unwrap().remove(&outpoint);
                    match conf {
                        Ok(conf) => {
                            if let Err(err) = nursery.handle_preschool_conf(kid, conf).await {
                                error!("preschool promotion of {} failed: {:?}", outpoint, err);
                            }
                        }
                        Err(_) => debug!("confirmation stream for {} closed", outpoint),
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_preschool_conf(
        self: &Arc<Self>,
        kid: KidOutput,
        conf: TxConfirmation,
    ) -> Result<(), Error> {
        let _guard = self.mutation_lock.lock().await;
        self.cfg.store.preschool_to_kinder(&kid, conf.block_height)?;
        let mut kid = kid;
        kid.set_conf_height(conf.block_height);
        info!(
            "preschool output {} confirmed at {}, matures at height {}",
            kid.outpoint(),
            conf.block_height,
            kid.maturity_height()
        );
        Ok(())
    }

    async fn register_timeout_conf(self: &Arc<Self>, baby: &BabyOutput) -> Result<(), Error> {
        let txid = baby.timeout_tx().txid();
        if !self.pending_tx_confs.lock().unwrap().insert(txid) {
            return Ok(());
        }
        let script = baby.timeout_tx().output[0].script_pubkey.clone();
        let conf_rx = self
            .cfg
            .notifier
            .register_confirmations_ntfn(&txid, &script, 1, baby.expiry())
            .await?;

        let nursery = Arc::clone(self);
        let listener = self.shutdown_listener.clone();
        let baby = baby.clone();
        self.spawn_task(async move {
            tokio::select! {
                _ = listener => {}
                conf = conf_rx => {
                    nursery.pending_tx_confs.lock().unwrap().remove(&txid);
                    match conf {
                        Ok(conf) => {
                            if let Err(err) = nursery.handle_timeout_conf(baby, conf).await {
                                error!("crib promotion via {} failed: {:?}", txid, err);
                            }
                        }
                        Err(_) => debug!("confirmation stream for {} closed", txid),
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_timeout_conf(
        self: &Arc<Self>,
        mut baby: BabyOutput,
        conf: TxConfirmation,
    ) -> Result<(), Error> {
        let _guard = self.mutation_lock.lock().await;
        baby.confirm(conf.block_height);
        self.cfg.store.crib_to_kinder(&baby)?;
        info!(
            "baby output {} promoted to kindergarten, matures at height {}",
            baby.kid().outpoint(),
            baby.kid().maturity_height()
        );
        Ok(())
    }

    async fn register_sweep_conf(
        self: &Arc<Self>,
        tx: &bitcoin::Transaction,
        class_height: u32,
    ) -> Result<(), Error> {
        let txid = tx.txid();
        if !self.pending_tx_confs.lock().unwrap().insert(txid) {
            return Ok(());
        }
        let script = tx.output[0].script_pubkey.clone();
        let conf_rx = self
            .cfg
            .notifier
            .register_confirmations_ntfn(&txid, &script, 1, class_height)
            .await?;

        let nursery = Arc::clone(self);
        let listener = self.shutdown_listener.clone();
        self.spawn_task(async move {
            tokio::select! {
                _ = listener => {}
                conf = conf_rx => {
                    nursery.pending_tx_confs.lock().unwrap().remove(&txid);
                    match conf {
                        Ok(conf) => {
                            if let Err(err) = nursery.handle_sweep_conf(class_height, conf).await {
                                error!(
                                    "graduation of class {} via sweep {} failed: {:?}",
                                    class_height, txid, err
                                );
                            }
                        }
                        Err(_) => debug!("confirmation stream for {} closed", txid),
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_sweep_conf(
        self: &Arc<Self>,
        class_height: u32,
        conf: TxConfirmation,
    ) -> Result<(), Error> {
        let _guard = self.mutation_lock.lock().await;
        self.cfg.store.graduate_kinder(class_height)?;
        info!(
            "kindergarten class of height {} graduated at height {}",
            class_height, conf.block_height
        );
        Ok(())
    }

    fn spawn_task(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.tasks.lock().unwrap().push(handle);
    }
}
