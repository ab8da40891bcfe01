use std::sync::Arc;

use bitcoin::OutPoint;
use tokio::select;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::ChainNotifier;
use crate::channel::{
    BreachReport, ChannelContract, ChannelStateStore, LinkCloseReason, UnilateralCloseSummary,
    WatchedChannel,
};
use crate::wallet::{FeeEstimator, Signer, WalletController};

use super::retribution::{BreachedOutput, RetributionInfo, WitnessType};
use super::service::{ArbiterStore, BreachArbiter};
use super::sweep;

impl<S: ArbiterStore> BreachArbiter<S> {
    /// Watch one channel until exactly one of its terminal events fires:
    /// cooperative settlement, a non-revoked unilateral close, or a
    /// contract breach.
    pub(super) async fn breach_observer(
        self: Arc<Self>,
        channel: WatchedChannel,
        settle_signal: CancellationToken,
    ) {
        let WatchedChannel {
            contract,
            mut events,
        } = channel;
        let chan_point = contract.channel_point();

        debug!("Breach observer for ChannelPoint({}) started", chan_point);

        let token = self.shutdown.token();
        select! {
            // The contract has been settled cooperatively; our duties end
            // here.
            _ = settle_signal.cancelled() => {
                contract.stop();
            }

            // The channel closed by normal means: a force close with the
            // latest commitment transaction.
            close_info = events.unilateral_close.recv() => match close_info {
                Some(close_info) => self.handle_unilateral_close(chan_point, close_info),
                None => debug!(
                    "Unilateral close event source for ChannelPoint({}) dropped",
                    chan_point
                ),
            },

            // A channel breach has been detected! Gather what is needed to
            // bring the counterparty to justice and hand it to the main
            // event loop.
            breach_info = events.contract_breach.recv() => match breach_info {
                Some(breach_info) => {
                    self.handle_contract_breach(contract.as_ref(), chan_point, breach_info)
                        .await
                }
                None => debug!(
                    "Contract breach event source for ChannelPoint({}) dropped",
                    chan_point
                ),
            },

            _ = token.cancelled() => {}
        }
    }

    fn handle_unilateral_close(&self, chan_point: OutPoint, close_info: UnilateralCloseSummary) {
        // Cancel this contract out of the main event loop's map.
        let settled_tx = self.settled_contracts();
        let token = self.shutdown.token();
        self.shutdown.tracker().spawn(async move {
            select! {
                _ = settled_tx.send(chan_point) => {}
                _ = token.cancelled() => {}
            }
        });

        // Wait out the closing confirmation and resolve the channel in the
        // database. Deliberately not tracked by the shutdown handle: the
        // confirmation may never arrive before shutdown, and joining on it
        // would deadlock stop().
        tokio::spawn(wait_for_chan_to_close(
            Arc::clone(&self.notifier),
            Arc::clone(&self.wallet),
            Arc::clone(&self.signer),
            Arc::clone(&self.estimator),
            self.store.clone(),
            chan_point,
            close_info,
        ));
    }

    async fn handle_contract_breach(
        &self,
        contract: &dyn ChannelContract,
        chan_point: OutPoint,
        breach_info: BreachReport,
    ) {
        warn!(
            "REVOKED STATE #{} FOR ChannelPoint({}) broadcast, REMOTE PEER IS DOING \
             SOMETHING SKETCHY!!!",
            breach_info.revoked_state_num, chan_point
        );

        // Immediately stop any multi-hop traffic over this link, or any
        // other link with the offending peer.
        self.htlc_switch
            .close_link(&chan_point, LinkCloseReason::Breach);
        let chan_info = contract.state_snapshot();

        // Witness generator for our own output on the revoked commitment, a
        // regular p2wkh spend.
        let local_sign_desc = breach_info.local_output_sign_desc;
        let local_witness = WitnessType::CommitmentNoDelay
            .gen_witness_func(Arc::clone(&self.signer), local_sign_desc.clone());

        // And the one claiming the cheater's output through the revocation
        // clause of its witness script.
        let remote_sign_desc = breach_info.remote_output_sign_desc;
        let remote_witness = WitnessType::CommitmentRevoke
            .gen_witness_func(Arc::clone(&self.signer), remote_sign_desc.clone());

        let (done_tx, _done_rx) = oneshot::channel();
        let ret_info = RetributionInfo {
            commit_hash: breach_info.breach_txid,
            chan_point,

            remote_identity: chan_info.remote_identity,
            capacity: chan_info.capacity,
            settled_balance: chan_info.local_balance,

            self_output: BreachedOutput {
                amount: local_sign_desc.output.value.to_sat(),
                outpoint: breach_info.local_outpoint,
                sign_descriptor: local_sign_desc,
                witness_type: WitnessType::CommitmentNoDelay,
                two_stage_claim: false,
                witness_func: Some(local_witness),
            },

            revoked_output: BreachedOutput {
                amount: remote_sign_desc.output.value.to_sat(),
                outpoint: breach_info.remote_outpoint,
                sign_descriptor: remote_sign_desc,
                witness_type: WitnessType::CommitmentRevoke,
                two_stage_claim: false,
                witness_func: Some(remote_witness),
            },

            htlc_outputs: Vec::new(),

            done: Some(done_tx),
        };

        // Durability barrier: nothing irreversible may happen before the
        // retribution state is on disk. If this fails the breach is not
        // acted on at all; the channel state machine will re-emit it.
        if let Err(err) = self.store.add_retribution(&ret_info) {
            error!("unable to persist retribution info to db: {}", err);
            return;
        }

        let close_info = ret_info.close_summary();
        if let Err(err) = contract.delete_state(&close_info) {
            error!("unable to delete channel state: {}", err);
        }

        // Hand the retribution over to the event loop to deal swift
        // justice.
        let token = self.shutdown.token();
        select! {
            _ = self.breached_contracts_tx.send(ret_info) => {}
            _ = token.cancelled() => {}
        }
    }
}

/// Wait until the closing transaction of a unilaterally closed channel
/// confirms, sweep our commitment output when there is one, and mark the
/// channel fully closed.
async fn wait_for_chan_to_close<S: ChannelStateStore>(
    notifier: Arc<dyn ChainNotifier>,
    wallet: Arc<dyn WalletController>,
    signer: Arc<dyn Signer>,
    estimator: Arc<dyn FeeEstimator>,
    store: S,
    chan_point: OutPoint,
    close_info: UnilateralCloseSummary,
) {
    let mut conf_event = match notifier
        .register_confirmations_ntfn(close_info.spender_txid, 1, close_info.spending_height)
        .await
    {
        Ok(conf_event) => conf_event,
        Err(err) => {
            error!(
                "unable to register for conf updates for txid: {}, err: {}",
                close_info.spender_txid, err
            );
            return;
        }
    };

    // Closed without a value means the notifier is shutting down.
    if conf_event.confirmed.recv().await.is_none() {
        return;
    }

    // The commitment output pays to a tweaked key the wallet does not know;
    // sweep it manually. Outstanding HTLCs are not yet reclaimed here.
    if close_info.self_outpoint.is_some() {
        match sweep::craft_commit_sweep_tx(
            wallet.as_ref(),
            signer.as_ref(),
            &close_info,
            estimator.sweep_fee_sats(),
        )
        .await
        {
            Ok(sweep_tx) => {
                if let Err(err) = wallet.publish_transaction(&sweep_tx).await {
                    error!("unable to broadcast tx: {}", err);
                }
            }
            Err(err) => error!("unable to generate sweep tx: {}", err),
        }
    }

    info!(
        "Force closed ChannelPoint({}) is fully closed, updating DB",
        chan_point
    );

    if let Err(err) = store.mark_channel_fully_closed(&chan_point) {
        error!("unable to mark chan as closed: {}", err);
    }
}
