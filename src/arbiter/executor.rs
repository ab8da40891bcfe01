use std::sync::Arc;

use tokio::select;
use tracing::{debug, error, info};

use crate::chain::ConfirmationEvent;

use super::retribution::RetributionInfo;
use super::service::{ArbiterStore, BreachArbiter};
use super::sweep;

impl<S: ArbiterStore> BreachArbiter<S> {
    /// Punish the counterparty for a detected breach: once the breach
    /// transaction confirms, sweep every contested output into the wallet
    /// and finalize the channel's records.
    pub(super) async fn exact_retribution(
        self: Arc<Self>,
        mut conf_event: ConfirmationEvent,
        mut breach_info: RetributionInfo,
    ) {
        let token = self.shutdown.token();

        select! {
            conf = conf_event.confirmed.recv() => {
                // A closed channel signifies notifier shutdown; exit and
                // resume from the persisted record on the next start.
                if conf.is_none() {
                    return;
                }
            }
            _ = token.cancelled() => return,
        }

        debug!(
            "Breach transaction {} has been confirmed, sweeping revoked funds",
            breach_info.commit_hash
        );

        // Reattach the witness generators; they do not survive the store.
        breach_info.self_output.witness_func = Some(
            breach_info
                .self_output
                .witness_type
                .gen_witness_func(
                    Arc::clone(&self.signer),
                    breach_info.self_output.sign_descriptor.clone(),
                ),
        );
        breach_info.revoked_output.witness_func = Some(
            breach_info
                .revoked_output
                .witness_type
                .gen_witness_func(
                    Arc::clone(&self.signer),
                    breach_info.revoked_output.sign_descriptor.clone(),
                ),
        );
        for htlc in breach_info.htlc_outputs.iter_mut() {
            htlc.witness_func = Some(
                htlc.witness_type
                    .gen_witness_func(Arc::clone(&self.signer), htlc.sign_descriptor.clone()),
            );
        }

        let justice_tx = match sweep::create_justice_tx(
            self.wallet.as_ref(),
            &breach_info,
            self.estimator.sweep_fee_sats(),
        )
        .await
        {
            Ok(justice_tx) => justice_tx,
            Err(err) => {
                error!("unable to create justice tx: {}", err);
                return;
            }
        };

        debug!("Broadcasting justice tx: {:?}", justice_tx);

        let current_height = match self.notifier.get_best_block().await {
            Ok((_, height)) => height,
            Err(err) => {
                error!("unable to get current height: {}", err);
                return;
            }
        };

        // Broadcast, finalizing our retribution against the cheating
        // counterparty.
        if let Err(err) = self.wallet.publish_transaction(&justice_tx).await {
            error!("unable to broadcast justice tx: {}", err);
            return;
        }

        // The deed is done once the justice transaction itself confirms.
        let justice_txid = justice_tx.compute_txid();
        let mut conf_event = match self
            .notifier
            .register_confirmations_ntfn(justice_txid, 1, current_height)
            .await
        {
            Ok(conf_event) => conf_event,
            Err(err) => {
                error!(
                    "unable to register for conf for txid: {}, err: {}",
                    justice_txid, err
                );
                return;
            }
        };

        select! {
            conf = conf_event.confirmed.recv() => {
                if conf.is_none() {
                    return;
                }

                let revoked_funds = breach_info.revoked_output.amount;
                let total_funds = revoked_funds + breach_info.self_output.amount;

                info!(
                    "Justice for ChannelPoint({}) has been served, {} revoked funds \
                     ({} total) have been claimed",
                    breach_info.chan_point, revoked_funds, total_funds
                );

                // Mark the close resolved first; losing the retribution
                // record before the close is recorded would violate the
                // store's invariant.
                if let Err(err) = self.store.mark_channel_fully_closed(&breach_info.chan_point) {
                    error!("unable to mark chan as closed: {}", err);
                }

                // Justice has been carried out; the checkpoint can go.
                if let Err(err) = self.store.remove_retribution(&breach_info.chan_point) {
                    error!("unable to remove retribution from the db: {}", err);
                }

                if let Some(done) = breach_info.done.take() {
                    let _ = done.send(());
                }
            }
            _ = token.cancelled() => {}
        }
    }
}
