use std::path::PathBuf;

use clap_serde_derive::ClapSerde;

use crate::wallet::StaticFeeEstimator;

/// Fee attached to justice and commitment-sweep transactions, in satoshis.
/// A fixed stub until a fee estimator is wired through.
pub const DEFAULT_SWEEP_TX_FEE_SATS: u64 = 5000;

// Use prefix `vigil-`/`VIGIL_`
#[derive(ClapSerde, Debug, Clone)]
pub struct VigilConfig {
    /// vigil base directory
    #[arg(
        name = "VIGIL_BASE_DIR",
        long = "vigil-base-dir",
        env,
        help = "base directory for the breach arbiter [default: $BASE_DIR/vigil]"
    )]
    pub base_dir: Option<PathBuf>,

    /// Fee to attach to sweep transactions, in satoshis.
    #[default(DEFAULT_SWEEP_TX_FEE_SATS)]
    #[arg(
        name = "VIGIL_SWEEP_TX_FEE_SATS",
        long = "vigil-sweep-tx-fee-sats",
        env,
        help = format!("fee attached to sweep transactions in satoshis, default is {}", DEFAULT_SWEEP_TX_FEE_SATS),
    )]
    pub sweep_tx_fee_sats: u64,
}

impl VigilConfig {
    /// The fee estimator stub configured for this node.
    pub fn fee_estimator(&self) -> StaticFeeEstimator {
        StaticFeeEstimator::new(self.sweep_tx_fee_sats)
    }
}
