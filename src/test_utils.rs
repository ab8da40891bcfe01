use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::mem::ManuallyDrop;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{
    Amount, BlockHash, EcdsaSighashType, OutPoint, ScriptBuf, Transaction, TxOut, Txid,
};
use tempfile::TempDir as OldTempDir;
use tokio::sync::mpsc;

use crate::arbiter::{BreachedOutput, RetributionInfo, WitnessType};
use crate::chain::{ChainNotifier, ConfirmationEvent, TxConfirmation};
use crate::channel::{
    BreachReport, ChannelCloseSummary, ChannelContract, ChannelEvents, ChannelFactory,
    ChannelSnapshot, ChannelStateStore, HtlcSwitch, LinkCloseReason, OpenChannel,
    UnilateralCloseSummary, WatchedChannel,
};
use crate::store::Store;
use crate::wallet::{secp256k1_instance, SignDescriptor, Signer, WalletController};
use crate::{Error, Result};

static RETAIN_VAR: &str = "TEST_TEMP_RETAIN";

#[derive(Debug)]
pub struct TempDir(ManuallyDrop<OldTempDir>);

impl TempDir {
    pub fn new<S: AsRef<OsStr>>(prefix: S) -> Self {
        Self(ManuallyDrop::new(
            OldTempDir::with_prefix(prefix).expect("create temp directory"),
        ))
    }
}

impl AsRef<Path> for TempDir {
    fn as_ref(&self) -> &Path {
        self.0.path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if env::var(RETAIN_VAR).is_ok() {
            println!(
                "Keeping temp directory {:?}, as environment variable {RETAIN_VAR} set",
                self.as_ref()
            );
        } else {
            unsafe {
                ManuallyDrop::drop(&mut self.0);
            }
        }
    }
}

pub fn init_tracing() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .pretty()
            .init();
    });
}

/// Poll until the condition holds or a generous deadline passes.
pub async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn gen_rand_txid() -> Txid {
    let bytes: [u8; 32] = rand::random();
    Txid::from_byte_array(bytes)
}

pub fn gen_rand_outpoint() -> OutPoint {
    OutPoint {
        txid: gen_rand_txid(),
        vout: rand::random::<u16>() as u32,
    }
}

pub fn gen_rand_keypair() -> (SecretKey, PublicKey) {
    loop {
        let bytes: [u8; 32] = rand::random();
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return (
                secret,
                PublicKey::from_secret_key(secp256k1_instance(), &secret),
            );
        }
    }
}

pub fn gen_rand_pubkey() -> PublicKey {
    gen_rand_keypair().1
}

/// A scalar far below the curve order, so tweaking always succeeds.
pub fn gen_rand_tweak() -> [u8; 32] {
    let mut tweak = [0u8; 32];
    tweak[24..].copy_from_slice(&rand::random::<u64>().to_be_bytes());
    tweak
}

pub fn gen_sign_descriptor(value: u64, tweaked: bool) -> SignDescriptor {
    let mut script_pubkey = vec![0x00, 0x14];
    script_pubkey.extend(std::iter::repeat_with(rand::random::<u8>).take(20));

    let mut witness_script = vec![0u8; 34];
    for byte in witness_script.iter_mut() {
        *byte = rand::random();
    }

    SignDescriptor {
        pubkey: gen_rand_pubkey(),
        single_tweak: tweaked.then(gen_rand_tweak),
        witness_script: ScriptBuf::from_bytes(witness_script),
        output: TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(script_pubkey),
        },
        hash_type: EcdsaSighashType::All,
    }
}

pub fn gen_breached_output(witness_type: WitnessType, amount: u64) -> BreachedOutput {
    BreachedOutput {
        amount,
        outpoint: gen_rand_outpoint(),
        sign_descriptor: gen_sign_descriptor(amount, true),
        witness_type,
        two_stage_claim: false,
        witness_func: None,
    }
}

pub fn gen_retribution_info(chan_point: OutPoint, num_htlcs: usize) -> RetributionInfo {
    RetributionInfo {
        commit_hash: gen_rand_txid(),
        chan_point,
        remote_identity: gen_rand_pubkey(),
        capacity: 100_000,
        settled_balance: 40_000,
        self_output: gen_breached_output(WitnessType::CommitmentNoDelay, 20_000),
        revoked_output: gen_breached_output(WitnessType::CommitmentRevoke, 60_000),
        htlc_outputs: (0..num_htlcs)
            .map(|_| gen_breached_output(WitnessType::CommitmentNoDelay, 1_000))
            .collect(),
        done: None,
    }
}

/// A notifier whose confirmations are injected by the test. Dropping all
/// subscription senders simulates notifier shutdown.
#[derive(Default)]
pub struct MockNotifier {
    subscriptions: Mutex<HashMap<Txid, Vec<mpsc::Sender<TxConfirmation>>>>,
    best_height: AtomicU32,
}

impl MockNotifier {
    pub fn new(best_height: u32) -> Arc<Self> {
        let notifier = Self::default();
        notifier.best_height.store(best_height, Ordering::SeqCst);
        Arc::new(notifier)
    }

    /// Dispatch a confirmation to every subscriber of the txid. Returns the
    /// number of subscribers reached.
    pub fn confirm(&self, txid: &Txid, block_height: u32) -> usize {
        let senders = self
            .subscriptions
            .lock()
            .expect("notifier lock")
            .get(txid)
            .cloned()
            .unwrap_or_default();
        for sender in &senders {
            let _ = sender.try_send(TxConfirmation { block_height });
        }
        senders.len()
    }

    pub fn subscription_count(&self, txid: &Txid) -> usize {
        self.subscriptions
            .lock()
            .expect("notifier lock")
            .get(txid)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every subscription sender, closing all confirmation streams.
    pub fn shutdown(&self) {
        self.subscriptions.lock().expect("notifier lock").clear();
    }
}

#[async_trait]
impl ChainNotifier for MockNotifier {
    async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        _num_confs: u32,
        _height_hint: u32,
    ) -> Result<ConfirmationEvent> {
        let (sender, confirmed) = mpsc::channel(1);
        self.subscriptions
            .lock()
            .expect("notifier lock")
            .entry(txid)
            .or_default()
            .push(sender);
        Ok(ConfirmationEvent { confirmed })
    }

    async fn get_best_block(&self) -> Result<(BlockHash, u32)> {
        Ok((
            BlockHash::all_zeros(),
            self.best_height.load(Ordering::SeqCst),
        ))
    }
}

/// A wallet that records published transactions and hands out one fixed
/// sweep script.
pub struct MockWallet {
    sweep_script: ScriptBuf,
    published: Mutex<Vec<Transaction>>,
}

impl MockWallet {
    pub fn new() -> Arc<Self> {
        let mut script = vec![0x00, 0x14];
        script.extend(std::iter::repeat(0xab).take(20));
        Arc::new(Self {
            sweep_script: ScriptBuf::from_bytes(script),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn sweep_script(&self) -> ScriptBuf {
        self.sweep_script.clone()
    }

    pub fn published(&self) -> Vec<Transaction> {
        self.published.lock().expect("wallet lock").clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().expect("wallet lock").len()
    }
}

#[async_trait]
impl WalletController for MockWallet {
    async fn new_sweep_pk_script(&self) -> Result<ScriptBuf> {
        Ok(self.sweep_script.clone())
    }

    async fn publish_transaction(&self, tx: &Transaction) -> Result<()> {
        self.published.lock().expect("wallet lock").push(tx.clone());
        Ok(())
    }
}

/// Signs with a fixed key over the real sighash, so signatures are
/// deterministic for fixed inputs.
pub struct MockSigner {
    secret: SecretKey,
}

impl MockSigner {
    pub fn new() -> Arc<Self> {
        let secret = SecretKey::from_slice(&[0x42; 32]).expect("static secret key");
        Arc::new(Self { secret })
    }
}

impl Signer for MockSigner {
    fn sign_output_raw<'a>(
        &self,
        _tx: &'a Transaction,
        sighashes: &mut SighashCache<&'a Transaction>,
        input_index: usize,
        sign_desc: &SignDescriptor,
    ) -> Result<ecdsa::Signature> {
        let sighash = sighashes
            .p2wsh_signature_hash(
                input_index,
                &sign_desc.witness_script,
                sign_desc.output.value,
                sign_desc.hash_type,
            )
            .map_err(|e| Error::Sighash(e.to_string()))?;
        let message = Message::from_digest(sighash.to_byte_array());
        Ok(secp256k1_instance().sign_ecdsa(&message, &self.secret))
    }
}

#[derive(Default)]
pub struct MockSwitch {
    closed_links: Mutex<Vec<(OutPoint, LinkCloseReason)>>,
}

impl MockSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn closed_links(&self) -> Vec<(OutPoint, LinkCloseReason)> {
        self.closed_links.lock().expect("switch lock").clone()
    }
}

impl HtlcSwitch for MockSwitch {
    fn close_link(&self, chan_point: &OutPoint, reason: LinkCloseReason) {
        self.closed_links
            .lock()
            .expect("switch lock")
            .push((*chan_point, reason));
    }
}

/// A scripted channel state machine. `delete_state` delegates to the
/// channel database when one is attached, mirroring the production state
/// machine.
pub struct MockChannelContract {
    chan_point: OutPoint,
    snapshot: ChannelSnapshot,
    store: Option<Store>,
    deleted: Mutex<Vec<ChannelCloseSummary>>,
    stopped: AtomicBool,
}

impl MockChannelContract {
    pub fn deleted_summaries(&self) -> Vec<ChannelCloseSummary> {
        self.deleted.lock().expect("contract lock").clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ChannelContract for MockChannelContract {
    fn channel_point(&self) -> OutPoint {
        self.chan_point
    }

    fn state_snapshot(&self) -> ChannelSnapshot {
        self.snapshot.clone()
    }

    fn delete_state(&self, summary: &ChannelCloseSummary) -> Result<()> {
        self.deleted
            .lock()
            .expect("contract lock")
            .push(summary.clone());
        if let Some(store) = &self.store {
            store.close_channel(summary)?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// The test side of a watched channel: the event senders plus the contract
/// for inspection.
pub struct ChannelHarness {
    pub contract: Arc<MockChannelContract>,
    pub unilateral_tx: mpsc::Sender<UnilateralCloseSummary>,
    pub breach_tx: mpsc::Sender<BreachReport>,
}

pub fn mock_watched_channel(
    chan_point: OutPoint,
    store: Option<Store>,
) -> (WatchedChannel, ChannelHarness) {
    let (unilateral_tx, unilateral_close) = mpsc::channel(1);
    let (breach_tx, contract_breach) = mpsc::channel(1);

    let contract = Arc::new(MockChannelContract {
        chan_point,
        snapshot: ChannelSnapshot {
            remote_identity: gen_rand_pubkey(),
            capacity: 100_000,
            local_balance: 40_000,
        },
        store,
        deleted: Mutex::new(Vec::new()),
        stopped: AtomicBool::new(false),
    });

    let watched = WatchedChannel {
        contract: contract.clone(),
        events: ChannelEvents {
            unilateral_close,
            contract_breach,
        },
    };
    let harness = ChannelHarness {
        contract,
        unilateral_tx,
        breach_tx,
    };
    (watched, harness)
}

pub fn gen_breach_report(local_amt: u64, remote_amt: u64) -> BreachReport {
    BreachReport {
        breach_txid: gen_rand_txid(),
        revoked_state_num: rand::random::<u32>() as u64,
        local_outpoint: gen_rand_outpoint(),
        local_output_sign_desc: gen_sign_descriptor(local_amt, true),
        remote_outpoint: gen_rand_outpoint(),
        remote_output_sign_desc: gen_sign_descriptor(remote_amt, true),
    }
}

/// Hands out pre-scripted channels by channel point on startup.
#[derive(Default)]
pub struct MockChannelFactory {
    channels: Mutex<HashMap<OutPoint, WatchedChannel>>,
}

impl MockChannelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_channel(&self, channel: WatchedChannel) {
        self.channels
            .lock()
            .expect("factory lock")
            .insert(channel.channel_point(), channel);
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn load_channel(&self, stub: &OpenChannel) -> Result<WatchedChannel> {
        self.channels
            .lock()
            .expect("factory lock")
            .remove(&stub.chan_point)
            .ok_or(Error::ChannelNotFound(stub.chan_point))
    }
}

pub fn gen_open_channel(chan_point: OutPoint) -> OpenChannel {
    OpenChannel {
        chan_point,
        remote_identity: gen_rand_pubkey(),
        capacity: 100_000,
        local_balance: 40_000,
    }
}
