//! End-to-end nursery scenarios, each run under a restart loop that
//! injects a stop/new/start cycle at every checkpoint to assert crash
//! recovery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{OutPoint, Transaction, Txid};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use nursery_persist::kvv::memory::MemoryKVVStore;
use nursery_persist::kvv::KVVNurseryStore;
use utxo_nursery::nursery::{
    ChannelCloseSummary, Error, NurseryConfig, UtxoNursery,
};
use utxo_nursery::output::{BabyOutput, KidOutput};
use utxo_nursery::store::{NurseryRecord, NurseryStore, Stage};
use utxo_nursery::sweep::{StaticFeeEstimator, Sweeper, SweeperConfig};
use utxo_nursery::util::test_utils::*;
use utxo_nursery::SendSync;

use test_log::test;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps the real store and reports every transition to the test, so
/// scenarios can wait for asynchronous promotions deterministically.
struct StoreInterceptor {
    inner: Arc<KVVNurseryStore<MemoryKVVStore>>,
    crib_tx: mpsc::UnboundedSender<()>,
    preschool_tx: mpsc::UnboundedSender<()>,
    graduate_tx: mpsc::UnboundedSender<()>,
    finalize_tx: mpsc::UnboundedSender<()>,
}

struct StoreEvents {
    crib_rx: mpsc::UnboundedReceiver<()>,
    preschool_rx: mpsc::UnboundedReceiver<()>,
    graduate_rx: mpsc::UnboundedReceiver<()>,
    finalize_rx: mpsc::UnboundedReceiver<()>,
}

impl StoreInterceptor {
    fn new(inner: Arc<KVVNurseryStore<MemoryKVVStore>>) -> (Self, StoreEvents) {
        let (crib_tx, crib_rx) = mpsc::unbounded_channel();
        let (preschool_tx, preschool_rx) = mpsc::unbounded_channel();
        let (graduate_tx, graduate_rx) = mpsc::unbounded_channel();
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();
        (
            StoreInterceptor { inner, crib_tx, preschool_tx, graduate_tx, finalize_tx },
            StoreEvents { crib_rx, preschool_rx, graduate_rx, finalize_rx },
        )
    }
}

impl SendSync for StoreInterceptor {}

impl NurseryStore for StoreInterceptor {
    fn incubate(
        &self,
        kids: &[KidOutput],
        babies: &[BabyOutput],
    ) -> Result<(), utxo_nursery::store::Error> {
        self.inner.incubate(kids, babies)
    }

    fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), utxo_nursery::store::Error> {
        let res = self.inner.crib_to_kinder(baby);
        let _ = self.crib_tx.send(());
        res
    }

    fn preschool_to_kinder(
        &self,
        kid: &KidOutput,
        conf_height: u32,
    ) -> Result<(), utxo_nursery::store::Error> {
        let res = self.inner.preschool_to_kinder(kid, conf_height);
        let _ = self.preschool_tx.send(());
        res
    }

    fn fetch_class(
        &self,
        height: u32,
    ) -> Result<(Option<Transaction>, Vec<KidOutput>, Vec<BabyOutput>), utxo_nursery::store::Error>
    {
        self.inner.fetch_class(height)
    }

    fn finalize_kinder(
        &self,
        height: u32,
        tx: &Transaction,
    ) -> Result<(), utxo_nursery::store::Error> {
        let res = self.inner.finalize_kinder(height, tx);
        let _ = self.finalize_tx.send(());
        res
    }

    fn graduate_kinder(&self, height: u32) -> Result<(), utxo_nursery::store::Error> {
        let res = self.inner.graduate_kinder(height);
        let _ = self.graduate_tx.send(());
        res
    }

    fn graduate_height(&self, height: u32) -> Result<(), utxo_nursery::store::Error> {
        self.inner.graduate_height(height)
    }

    fn last_graduated_height(&self) -> Result<u32, utxo_nursery::store::Error> {
        self.inner.last_graduated_height()
    }

    fn last_finalized_height(&self) -> Result<u32, utxo_nursery::store::Error> {
        self.inner.last_finalized_height()
    }

    fn fetch_preschools(&self) -> Result<Vec<KidOutput>, utxo_nursery::store::Error> {
        self.inner.fetch_preschools()
    }

    fn heights_below_or_equal(&self, height: u32) -> Result<Vec<u32>, utxo_nursery::store::Error> {
        self.inner.heights_below_or_equal(height)
    }

    fn for_chan_outputs(
        &self,
        chan_point: &OutPoint,
        cb: &mut dyn FnMut(Stage, NurseryRecord) -> Result<(), utxo_nursery::store::Error>,
    ) -> Result<(), utxo_nursery::store::Error> {
        self.inner.for_chan_outputs(chan_point, cb)
    }

    fn list_channels(&self) -> Result<Vec<OutPoint>, utxo_nursery::store::Error> {
        self.inner.list_channels()
    }

    fn is_mature_channel(&self, chan_point: &OutPoint) -> Result<bool, utxo_nursery::store::Error> {
        self.inner.is_mature_channel(chan_point)
    }

    fn remove_channel(&self, chan_point: &OutPoint) -> Result<(), utxo_nursery::store::Error> {
        self.inner.remove_channel(chan_point)
    }
}

struct NurseryHarness {
    cfg: NurseryConfig,
    nursery: Arc<UtxoNursery>,
    notifier: Arc<MockNotifier>,
    chain_io: Arc<MockChainIO>,
    broadcaster: Arc<MockBroadcaster>,
    publish_rx: mpsc::UnboundedReceiver<Transaction>,
    events: StoreEvents,
    restart_idx: usize,
    checkpoints: usize,
}

impl NurseryHarness {
    async fn new(restart_idx: usize) -> Self {
        let notifier = Arc::new(MockNotifier::new());
        let chain_io = Arc::new(MockChainIO::new());
        let (broadcaster, publish_rx) = MockBroadcaster::new();
        let broadcaster = Arc::new(broadcaster);
        let store = Arc::new(MemoryKVVStore::new());
        let (interceptor, events) = StoreInterceptor::new(store);

        let sweeper = Arc::new(Sweeper::new(SweeperConfig {
            gen_sweep_script: Box::new(|| Ok(bitcoin::Script::new())),
            estimator: Arc::new(StaticFeeEstimator { sat_per_kw: 10_000 }),
            signer: Arc::new(NullSigner),
        }));

        let cfg = NurseryConfig {
            notifier: notifier.clone(),
            chain_io: chain_io.clone(),
            store: Arc::new(interceptor),
            sweeper,
            broadcaster: broadcaster.clone(),
            fetch_closed_channel: Arc::new(|chan_point: &OutPoint| {
                Ok(Some(ChannelCloseSummary { chan_point: *chan_point, close_height: 0 }))
            }),
            fetch_closed_channels: Arc::new(|_pending_only| Ok(Vec::new())),
        };

        let nursery = UtxoNursery::new(cfg.clone());
        nursery.start().await.unwrap();

        let mut harness = NurseryHarness {
            cfg,
            nursery,
            notifier,
            chain_io,
            broadcaster,
            publish_rx,
            events,
            restart_idx,
            checkpoints: 0,
        };
        // exercise an immediate restart
        harness.checkpoint().await;
        harness
    }

    /// A restart injection point. Performs a stop/new/start cycle when
    /// this checkpoint's ordinal matches the harness's restart index.
    async fn checkpoint(&mut self) -> bool {
        self.checkpoints += 1;
        if self.checkpoints == self.restart_idx {
            self.force_restart().await;
            true
        } else {
            false
        }
    }

    async fn force_restart(&mut self) {
        self.nursery.stop().await;
        self.nursery = UtxoNursery::new(self.cfg.clone());
        self.nursery.start().await.unwrap();
    }

    async fn notify_epoch(&self, height: u32) {
        self.chain_io.set_height(height);
        self.notifier.notify_epoch(height).await;
    }

    async fn confirm_tx(&self, txid: &Txid, height: u32) {
        self.notifier.confirm_tx(txid, height).await.unwrap();
    }

    async fn receive_tx(&mut self) -> Transaction {
        timeout(TEST_TIMEOUT, self.publish_rx.recv())
            .await
            .expect("tx not published")
            .expect("publish channel closed")
    }

    async fn wait_crib_promotion(&mut self) {
        timeout(TEST_TIMEOUT, self.events.crib_rx.recv())
            .await
            .expect("output not promoted to kindergarten");
    }

    async fn wait_preschool_promotion(&mut self) {
        timeout(TEST_TIMEOUT, self.events.preschool_rx.recv())
            .await
            .expect("output not promoted to kindergarten");
    }

    async fn wait_graduation(&mut self) {
        timeout(TEST_TIMEOUT, self.events.graduate_rx.recv()).await.expect("class not graduated");
    }

    async fn wait_finalize(&mut self) {
        timeout(TEST_TIMEOUT, self.events.finalize_rx.recv()).await.expect("class not finalized");
    }

    /// Final restart point, shutdown, and end-state assertions: nothing
    /// left unpublished and a fully empty store.
    async fn finish(mut self) -> usize {
        self.checkpoint().await;
        self.nursery.stop().await;

        assert!(self.publish_rx.try_recv().is_err(), "unexpected transactions published");
        assert!(
            self.cfg.store.list_channels().unwrap().is_empty(),
            "expected all channels to be removed from the store"
        );
        assert!(
            self.cfg.store.heights_below_or_equal(u32::MAX).unwrap().is_empty(),
            "expected the height index to be empty"
        );
        self.checkpoints
    }
}

fn assert_report(
    harness: &NurseryHarness,
    chan_point: OutPoint,
    expected_htlcs: usize,
    expected_stage: u32,
    expected_limbo: u64,
) {
    let report = harness.nursery.nursery_report(&chan_point).unwrap();
    assert_eq!(report.htlcs.len(), expected_htlcs, "unexpected number of htlcs reported");
    if expected_htlcs != 0 {
        assert_eq!(report.htlcs[0].stage, expected_stage, "htlc reported in wrong stage");
    }
    assert_eq!(report.limbo_balance, expected_limbo, "unexpected limbo balance");
}

fn assert_report_unavailable(harness: &NurseryHarness, chan_point: OutPoint) {
    assert_eq!(
        harness.nursery.nursery_report(&chan_point),
        Err(Error::ContractNotFound),
        "expected report to be unavailable"
    );
}

/// Run a scenario repeatedly, moving the injected restart one checkpoint
/// later on every iteration until every checkpoint has been exercised.
async fn run_restart_loop(
    scenario: for<'a> fn(&'a mut NurseryHarness) -> Pin<Box<dyn Future<Output = ()> + 'a>>,
) {
    let mut restart_idx = 0;
    loop {
        log::info!("scenario run with restart at checkpoint {}", restart_idx);
        let mut harness = NurseryHarness::new(restart_idx).await;
        scenario(&mut harness).await;
        let checkpoints = harness.finish().await;
        if checkpoints <= restart_idx {
            return;
        }
        restart_idx += 1;
    }
}

/// The shared tail of every sweep scenario: observe the sweep broadcast,
/// survive a restart with identical bytes, confirm, graduate, and watch
/// the channel disappear.
async fn sweep_and_graduate(
    harness: &mut NurseryHarness,
    chan_point: OutPoint,
    expected_htlcs: usize,
    expected_limbo: u64,
) {
    let sweep_tx = harness.receive_tx().await;
    let sweep_txid = sweep_tx.txid();

    if harness.checkpoint().await {
        // a restart republishes the finalized bytes, never a rebuilt tx
        let republished = harness.receive_tx().await;
        assert_eq!(republished.txid(), sweep_txid, "restart changed the sweep txid");
    }

    // balances stay in limbo until the sweep confirms
    assert_report(harness, chan_point, expected_htlcs, 2, expected_limbo);

    harness.confirm_tx(&sweep_txid, 129).await;
    harness.wait_graduation().await;

    harness.checkpoint().await;

    // the last output graduated, so the channel record is gone
    assert_report_unavailable(harness, chan_point);
}

// An outgoing HTLC on our own commitment: crib, timeout broadcast at
// expiry, kindergarten after the timeout confirms, swept after the CSV
// delay.
fn outgoing_htlc_on_local(
    harness: &mut NurseryHarness,
) -> Pin<Box<dyn Future<Output = ()> + '_>> {
    Box::pin(async move {
        let chan_point = make_outpoint(9);
        let res = make_outgoing_res(125, 2, 10_000, true);
        let timeout_txid = res.signed_timeout_tx.as_ref().unwrap().txid();

        harness
            .nursery
            .incubate_outputs(chan_point, None, vec![res], vec![], 0)
            .await
            .unwrap();

        // synchronous intake: the crib output shows up immediately
        assert_report(harness, chan_point, 1, 1, 10_000);

        harness.checkpoint().await;

        // the CLTV expires and the pre-signed timeout tx goes out
        harness.notify_epoch(125).await;
        let tx = harness.receive_tx().await;
        assert_eq!(tx.txid(), timeout_txid);

        if harness.checkpoint().await {
            // restart retriggers the timeout broadcast
            let tx = harness.receive_tx().await;
            assert_eq!(tx.txid(), timeout_txid);
        }

        harness.confirm_tx(&timeout_txid, 126).await;
        harness.wait_crib_promotion().await;

        harness.checkpoint().await;

        // the second level output unlocks two blocks later
        harness.notify_epoch(128).await;
        sweep_and_graduate(harness, chan_point, 1, 10_000).await;
    })
}

// An outgoing HTLC on the remote commitment: preschool until the
// creating transaction confirms, swept at the CLTV expiry.
fn outgoing_htlc_on_remote(
    harness: &mut NurseryHarness,
) -> Pin<Box<dyn Future<Output = ()> + '_>> {
    Box::pin(async move {
        let chan_point = make_outpoint(9);
        let res = make_outgoing_res(125, 2, 10_000, false);
        let claim_txid = res.claim_outpoint.txid;

        harness
            .nursery
            .incubate_outputs(chan_point, None, vec![res], vec![], 0)
            .await
            .unwrap();

        assert_report(harness, chan_point, 1, 2, 10_000);

        harness.checkpoint().await;

        harness.confirm_tx(&claim_txid, 124).await;
        harness.wait_preschool_promotion().await;

        harness.checkpoint().await;

        harness.notify_epoch(125).await;
        sweep_and_graduate(harness, chan_point, 1, 10_000).await;
    })
}

// Our own commitment output: balance in limbo, no htlc entries, swept
// after the CSV delay.
fn commitment_output(harness: &mut NurseryHarness) -> Pin<Box<dyn Future<Output = ()> + '_>> {
    Box::pin(async move {
        let chan_point = make_outpoint(9);
        let res = make_commit_res(10_000, 2);
        let commit_txid = res.self_outpoint.txid;

        harness
            .nursery
            .incubate_outputs(chan_point, Some(res), vec![], vec![], 0)
            .await
            .unwrap();

        assert_report(harness, chan_point, 0, 0, 10_000);

        harness.checkpoint().await;

        harness.confirm_tx(&commit_txid, 124).await;
        harness.wait_preschool_promotion().await;

        harness.checkpoint().await;

        harness.notify_epoch(126).await;
        sweep_and_graduate(harness, chan_point, 0, 10_000).await;
    })
}

#[test(tokio::test)]
async fn test_outgoing_htlc_on_local_commitment() {
    run_restart_loop(outgoing_htlc_on_local).await;
}

#[test(tokio::test)]
async fn test_outgoing_htlc_on_remote_commitment() {
    run_restart_loop(outgoing_htlc_on_remote).await;
}

#[test(tokio::test)]
async fn test_commitment_output() {
    run_restart_loop(commitment_output).await;
}

#[test(tokio::test)]
async fn test_two_channels_share_one_sweep() {
    let mut harness = NurseryHarness::new(0).await;

    let chan_a = make_outpoint(40);
    let chan_b = make_outpoint(41);
    let res_a = make_incoming_res(42, 2, 10_000);
    let res_b = make_incoming_res(43, 2, 20_000);
    let op_a = res_a.claim_outpoint;
    let op_b = res_b.claim_outpoint;

    harness.nursery.incubate_outputs(chan_a, None, vec![], vec![res_a], 0).await.unwrap();
    harness.nursery.incubate_outputs(chan_b, None, vec![], vec![res_b], 0).await.unwrap();

    harness.confirm_tx(&op_a.txid, 124).await;
    harness.wait_preschool_promotion().await;
    harness.confirm_tx(&op_b.txid, 124).await;
    harness.wait_preschool_promotion().await;

    // both kids mature at 126 and must share one sweep
    harness.notify_epoch(126).await;
    let sweep_tx = harness.receive_tx().await;
    assert_eq!(sweep_tx.input.len(), 2, "expected a single sweep with both inputs");
    assert_eq!(sweep_tx.output.len(), 1);
    let spent: Vec<OutPoint> = sweep_tx.input.iter().map(|inp| inp.previous_output).collect();
    assert!(spent.contains(&op_a) && spent.contains(&op_b));

    harness.confirm_tx(&sweep_tx.txid(), 129).await;
    harness.wait_graduation().await;

    assert_report_unavailable(&harness, chan_a);
    assert_report_unavailable(&harness, chan_b);
    harness.finish().await;
}

#[test(tokio::test)]
async fn test_finalize_then_publish_failure_republishes_same_bytes() {
    let mut harness = NurseryHarness::new(0).await;

    let chan_point = make_outpoint(50);
    let res = make_incoming_res(51, 2, 10_000);
    let claim_txid = res.claim_outpoint.txid;

    harness.nursery.incubate_outputs(chan_point, None, vec![], vec![res], 0).await.unwrap();
    harness.confirm_tx(&claim_txid, 124).await;
    harness.wait_preschool_promotion().await;

    // the first publish attempt dies between finalize and broadcast
    harness.broadcaster.fail_next_publish();
    harness.notify_epoch(126).await;
    harness.wait_finalize().await;
    sleep(Duration::from_millis(100)).await;
    assert!(harness.publish_rx.try_recv().is_err(), "rejected publish must not deliver");

    // crash immediately after the finalize commit
    harness.force_restart().await;
    let republished = harness.receive_tx().await;

    // later epochs retry the identical bytes too
    harness.notify_epoch(127).await;
    let retried = harness.receive_tx().await;
    assert_eq!(republished.txid(), retried.txid(), "distinct sweep produced for one height");

    harness.confirm_tx(&republished.txid(), 129).await;
    harness.wait_graduation().await;
    assert_report_unavailable(&harness, chan_point);
    harness.finish().await;
}

#[test(tokio::test)]
async fn test_catch_up_after_downtime() {
    let mut harness = NurseryHarness::new(0).await;

    // three channels whose outputs mature at three distinct heights
    let setups = [(60u8, 2u32, 10_000u64), (61, 4, 20_000), (62, 6, 30_000)];
    let mut claims = Vec::new();
    for (seed, csv, amount) in setups {
        let chan_point = make_outpoint(seed);
        let res = make_incoming_res(seed + 10, csv, amount);
        claims.push(res.claim_outpoint);
        harness.nursery.incubate_outputs(chan_point, None, vec![], vec![res], 0).await.unwrap();
        harness.confirm_tx(&claims.last().unwrap().txid, 100).await;
        harness.wait_preschool_promotion().await;
    }

    // chain advances from 100 to 130 while the nursery is down
    harness.nursery.stop().await;
    harness.chain_io.set_height(130);
    harness.nursery = UtxoNursery::new(harness.cfg.clone());
    harness.nursery.start().await.unwrap();

    // one class per due height, ascending, never collapsed
    let expected_heights = [102u32, 104, 106];
    for (claim, expected_height) in claims.iter().zip(expected_heights) {
        let sweep_tx = harness.receive_tx().await;
        assert_eq!(sweep_tx.lock_time.0, expected_height, "classes out of order");
        assert_eq!(sweep_tx.input.len(), 1);
        assert_eq!(sweep_tx.input[0].previous_output, *claim);

        harness.confirm_tx(&sweep_tx.txid(), 131).await;
        harness.wait_graduation().await;
    }

    harness.finish().await;
}

#[test(tokio::test)]
async fn test_commit_and_incoming_in_one_intake() {
    let mut harness = NurseryHarness::new(0).await;

    let chan_point = make_outpoint(70);
    let commit_res = make_commit_res(50_000, 2);
    let commit_txid = commit_res.self_outpoint.txid;
    let incoming_res = make_incoming_res(71, 2, 10_000);
    let claim_txid = incoming_res.claim_outpoint.txid;

    harness
        .nursery
        .incubate_outputs(chan_point, Some(commit_res), vec![], vec![incoming_res], 0)
        .await
        .unwrap();

    // one htlc entry plus the commitment balance
    assert_report(&harness, chan_point, 1, 2, 60_000);

    harness.confirm_tx(&commit_txid, 124).await;
    harness.wait_preschool_promotion().await;
    harness.confirm_tx(&claim_txid, 124).await;
    harness.wait_preschool_promotion().await;

    harness.notify_epoch(126).await;
    let sweep_tx = harness.receive_tx().await;
    assert_eq!(sweep_tx.input.len(), 2);

    harness.confirm_tx(&sweep_tx.txid(), 129).await;
    harness.wait_graduation().await;
    assert_report_unavailable(&harness, chan_point);
    harness.finish().await;
}
