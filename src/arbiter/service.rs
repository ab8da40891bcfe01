use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::OutPoint;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chain::ChainNotifier;
use crate::channel::{
    ChannelFactory, ChannelStateStore, CloseType, HtlcSwitch, LinkCloseReason, WatchedChannel,
};
use crate::tasks::ShutdownHandle;
use crate::wallet::{FeeEstimator, Signer, WalletController};
use crate::Result;

use super::retribution::{RetributionInfo, RetributionStore};

const SIGNAL_BUFFER_SIZE: usize = 128;

/// The storage surface the arbiter needs: retribution checkpoints plus the
/// channel database.
pub trait ArbiterStore:
    RetributionStore + ChannelStateStore + Clone + Send + Sync + 'static
{
}

impl<T> ArbiterStore for T where
    T: RetributionStore + ChannelStateStore + Clone + Send + Sync + 'static
{
}

/// Watches all open channels for contract breaches and acts on any it
/// detects: the deterrence subsystem of the node. In practice this code is
/// expected to never run against an honest counterparty, but it must be in
/// place for the deterrent to hold.
///
/// The arbiter owns a map of per-channel breach observers and a persistent
/// retribution store. A breach is checkpointed to the store before anything
/// irreversible happens on-chain, so an interrupted retribution is resumed
/// on the next start.
pub struct BreachArbiter<S> {
    pub(super) notifier: Arc<dyn ChainNotifier>,
    pub(super) wallet: Arc<dyn WalletController>,
    pub(super) signer: Arc<dyn Signer>,
    pub(super) estimator: Arc<dyn FeeEstimator>,
    pub(super) htlc_switch: Arc<dyn HtlcSwitch>,
    pub(super) channel_factory: Arc<dyn ChannelFactory>,
    pub(super) store: S,

    new_contracts_tx: mpsc::Sender<WatchedChannel>,
    settled_contracts_tx: mpsc::Sender<OutPoint>,
    pub(super) breached_contracts_tx: mpsc::Sender<RetributionInfo>,
    receivers: Mutex<Option<ArbiterReceivers>>,

    pub(super) shutdown: ShutdownHandle,
    started: AtomicBool,
    stopped: AtomicBool,
}

struct ArbiterReceivers {
    new_contracts: mpsc::Receiver<WatchedChannel>,
    settled_contracts: mpsc::Receiver<OutPoint>,
    breached_contracts: mpsc::Receiver<RetributionInfo>,
}

impl<S: ArbiterStore> BreachArbiter<S> {
    pub fn new(
        notifier: Arc<dyn ChainNotifier>,
        wallet: Arc<dyn WalletController>,
        signer: Arc<dyn Signer>,
        estimator: Arc<dyn FeeEstimator>,
        htlc_switch: Arc<dyn HtlcSwitch>,
        channel_factory: Arc<dyn ChannelFactory>,
        store: S,
    ) -> Self {
        let (new_contracts_tx, new_contracts) = mpsc::channel(SIGNAL_BUFFER_SIZE);
        let (settled_contracts_tx, settled_contracts) = mpsc::channel(SIGNAL_BUFFER_SIZE);
        let (breached_contracts_tx, breached_contracts) = mpsc::channel(SIGNAL_BUFFER_SIZE);

        Self {
            notifier,
            wallet,
            signer,
            estimator,
            htlc_switch,
            channel_factory,
            store,
            new_contracts_tx,
            settled_contracts_tx,
            breached_contracts_tx,
            receivers: Mutex::new(Some(ArbiterReceivers {
                new_contracts,
                settled_contracts,
                breached_contracts,
            })),
            shutdown: ShutdownHandle::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Sender used by outside subsystems to hand the arbiter a newly opened
    /// channel to watch.
    pub fn new_contracts(&self) -> mpsc::Sender<WatchedChannel> {
        self.new_contracts_tx.clone()
    }

    /// Sender used by outside subsystems to signal that a channel has been
    /// closed without a breach.
    pub fn settled_contracts(&self) -> mpsc::Sender<OutPoint> {
        self.settled_contracts_tx.clone()
    }

    /// Start the breach arbiter: reconcile the retribution store against
    /// the channel database, resume pending retributions, and begin
    /// watching all remaining open channels. Idempotent; later calls are
    /// no-ops.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        trace!("Starting breach arbiter");

        // Load all pending retributions. Each is enough to reconstruct the
        // close summary of its channel, so a channel left open after a
        // breach can be closed here without any further information.
        let mut breach_ret_infos: HashMap<OutPoint, RetributionInfo> = HashMap::new();
        self.store.for_all_retributions(&mut |ret| {
            breach_ret_infos.insert(ret.chan_point, ret);
            Ok(())
        })?;

        let active_channels = self.store.fetch_all_channels()?;
        if !active_channels.is_empty() {
            info!(
                "Retrieved {} channels from database, watching with vigilance!",
                active_channels.len()
            );
        }

        // Promote every breached-but-still-open channel to breached-and-
        // closed before any retribution task runs, so the channel database
        // and the retribution store agree on the set of breached channels.
        // Channels whose retribution is already underway are excluded from
        // watching; their fate rests with an exact_retribution task spawned
        // below.
        let mut channels_to_watch = Vec::with_capacity(active_channels.len());
        for chan_state in active_channels {
            let chan_point = chan_state.chan_point;
            if let Some(ret) = breach_ret_infos.get(&chan_point) {
                // No activity may continue on the link.
                self.htlc_switch
                    .close_link(&chan_point, LinkCloseReason::Breach);

                let close_summary = ret.close_summary();
                self.store.close_channel(&close_summary)?;
                continue;
            }

            let channel = self.channel_factory.load_channel(&chan_state).await?;
            channels_to_watch.push(channel);
        }

        let (_, current_height) = self.notifier.get_best_block().await?;

        // Resume retribution for every breach loaded from the store.
        for (_, ret_info) in breach_ret_infos {
            let breach_txid = ret_info.commit_hash;
            let conf_event = self
                .notifier
                .register_confirmations_ntfn(breach_txid, 1, current_height)
                .await
                .map_err(|err| {
                    error!(
                        "unable to register for conf updates for txid: {}, err: {}",
                        breach_txid, err
                    );
                    err
                })?;

            self.shutdown
                .tracker()
                .spawn(Arc::clone(&self).exact_retribution(conf_event, ret_info));
        }

        let receivers = self
            .receivers
            .lock()
            .expect("arbiter receivers lock")
            .take()
            .expect("arbiter receivers consumed before start");
        self.shutdown
            .tracker()
            .spawn(Arc::clone(&self).contract_observer(receivers, channels_to_watch));

        // Lastly, watch for the on-chain resolution of any cooperative or
        // unilateral close already pending, so it can be marked fully
        // closed once its closing transaction confirms. Breach closes are
        // resolved by the exact_retribution tasks spawned above, and force
        // closes with a time-locked balance are under the nursery's care.
        let pending_close_chans = self.store.fetch_closed_channels(true)?;
        for pending_close in pending_close_chans {
            if pending_close.close_type == CloseType::Breach {
                continue;
            }
            if pending_close.close_type == CloseType::ForceClose
                && pending_close.time_locked_balance != 0
            {
                continue;
            }

            info!(
                "Watching for the closure of ChannelPoint({})",
                pending_close.chan_point
            );

            let close_txid = pending_close.closing_txid;
            let mut conf_event = self
                .notifier
                .register_confirmations_ntfn(close_txid, 1, current_height)
                .await?;

            let chan_point = pending_close.chan_point;
            let store = self.store.clone();
            let token = self.shutdown.token();
            self.shutdown.tracker().spawn(async move {
                select! {
                    conf = conf_event.confirmed.recv() => {
                        // A closed channel means the notifier is shutting
                        // down; there is nothing left to record.
                        let Some(conf) = conf else { return; };

                        info!(
                            "ChannelPoint({}) is fully closed, at height: {}",
                            chan_point, conf.block_height
                        );

                        if let Err(err) = store.mark_channel_fully_closed(&chan_point) {
                            error!("unable to mark chan as closed: {}", err);
                        }
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        Ok(())
    }

    /// Signal a graceful shutdown and block until every tracked task has
    /// exited. Idempotent; later calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Breach arbiter shutting down");

        self.shutdown.close().await;
    }

    /// The primary event loop. Owns the breach-observer map: every observer
    /// is spawned, replaced, and cancelled from here and nowhere else.
    async fn contract_observer(
        self: Arc<Self>,
        mut receivers: ArbiterReceivers,
        channels_to_watch: Vec<WatchedChannel>,
    ) {
        let mut breach_observers: HashMap<OutPoint, CancellationToken> = HashMap::new();

        for channel in channels_to_watch {
            let settle_signal = CancellationToken::new();
            let chan_point = channel.channel_point();
            breach_observers.insert(chan_point, settle_signal.clone());

            self.shutdown
                .tracker()
                .spawn(Arc::clone(&self).breach_observer(channel, settle_signal));
        }

        let token = self.shutdown.token();
        loop {
            select! {
                Some(breach_info) = receivers.breached_contracts.recv() => {
                    let current_height = match self.notifier.get_best_block().await {
                        Ok((_, height)) => height,
                        Err(err) => {
                            error!("unable to get best height: {}", err);
                            0
                        }
                    };

                    // A channel contract has just been breached. Register
                    // for the breach transaction's confirmation first, so
                    // we are not acting against a moving target.
                    let breach_txid = breach_info.commit_hash;
                    let conf_event = match self
                        .notifier
                        .register_confirmations_ntfn(breach_txid, 1, current_height)
                        .await
                    {
                        Ok(conf_event) => conf_event,
                        Err(err) => {
                            error!(
                                "unable to register for conf updates for txid: {}, err: {}",
                                breach_txid, err
                            );
                            continue;
                        }
                    };

                    warn!(
                        "A channel has been breached with txid: {}. Waiting for \
                         confirmation, then justice will be served!",
                        breach_txid
                    );

                    let chan_point = breach_info.chan_point;
                    self.shutdown
                        .tracker()
                        .spawn(Arc::clone(&self).exact_retribution(conf_event, breach_info));

                    breach_observers.remove(&chan_point);
                }

                Some(contract) = receivers.new_contracts.recv() => {
                    let settle_signal = CancellationToken::new();
                    let chan_point = contract.channel_point();

                    // A second send for a watched channel means the earlier
                    // contract reference is stale. Cancel its observer and
                    // watch the live version instead.
                    if let Some(old_signal) =
                        breach_observers.insert(chan_point, settle_signal.clone())
                    {
                        info!(
                            "ChannelPoint({}) is now live, abandoning state contract for \
                             live version",
                            chan_point
                        );
                        old_signal.cancel();
                    }

                    debug!("New contract detected, launching breach observer");

                    self.shutdown
                        .tracker()
                        .spawn(Arc::clone(&self).breach_observer(contract, settle_signal));
                }

                Some(chan_point) = receivers.settled_contracts.recv() => {
                    match breach_observers.remove(&chan_point) {
                        Some(kill_signal) => {
                            debug!(
                                "ChannelPoint({}) has been settled, cancelling breach \
                                 observer",
                                chan_point
                            );
                            kill_signal.cancel();
                        }
                        None => error!("Unable to find contract: {}", chan_point),
                    }
                }

                _ = token.cancelled() => break,
            }
        }
    }
}
