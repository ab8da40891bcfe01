use async_trait::async_trait;
use bitcoin::{BlockHash, Txid};
use tokio::sync::mpsc;

use crate::Result;

/// Dispatched once a watched transaction reaches the requested depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    pub block_height: u32,
}

/// One confirmation subscription. The stream yields at most one event for
/// the requested depth and closes without a value when the notifier shuts
/// down.
pub struct ConfirmationEvent {
    pub confirmed: mpsc::Receiver<TxConfirmation>,
}

/// The chain view consumed by the arbiter: confirmation subscriptions and
/// the current tip.
#[async_trait]
pub trait ChainNotifier: Send + Sync {
    async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<ConfirmationEvent>;

    async fn get_best_block(&self) -> Result<(BlockHash, u32)>;
}
