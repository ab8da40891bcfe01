use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::wallet::SignDescriptor;
use crate::Result;

/// Reasons the switch is told to tear a link down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCloseReason {
    /// The counterparty broadcast a revoked commitment.
    Breach,
}

/// The HTLC switch surface the arbiter drives: stop forwarding over a
/// breached link before acting on-chain.
pub trait HtlcSwitch: Send + Sync {
    fn close_link(&self, chan_point: &OutPoint, reason: LinkCloseReason);
}

/// How a channel ended, as recorded in its close summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseType {
    Cooperative,
    Breach,
    ForceClose,
}

/// Persisted when a channel leaves the open state. Carries enough to
/// describe the close without the original open-channel record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCloseSummary {
    pub chan_point: OutPoint,
    pub closing_txid: Txid,
    pub remote_pub: PublicKey,
    pub capacity: u64,
    pub settled_balance: u64,
    pub close_type: CloseType,
    /// True until the closing transaction is confirmed on chain.
    pub is_pending: bool,
    /// Balance still encumbered by a CSV delay after a force close. Owned
    /// by the nursery, not the arbiter.
    pub time_locked_balance: u64,
}

/// The persisted stub of an open channel, as enumerated from the channel
/// database on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub chan_point: OutPoint,
    pub remote_identity: PublicKey,
    pub capacity: u64,
    pub local_balance: u64,
}

/// A point-in-time view of a live channel's balances and counterparty.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub remote_identity: PublicKey,
    pub capacity: u64,
    pub local_balance: u64,
}

/// Emitted when the counterparty force-closes with its latest, non-revoked
/// commitment.
#[derive(Debug, Clone, PartialEq)]
pub struct UnilateralCloseSummary {
    pub spender_txid: Txid,
    pub spending_height: u32,
    /// Our non-delayed output on the remote commitment, when one exists.
    pub self_outpoint: Option<OutPoint>,
    pub self_output_sign_desc: Option<SignDescriptor>,
}

/// Emitted when the counterparty broadcasts a revoked commitment.
#[derive(Debug, Clone, PartialEq)]
pub struct BreachReport {
    pub breach_txid: Txid,
    pub revoked_state_num: u64,
    pub local_outpoint: OutPoint,
    pub local_output_sign_desc: SignDescriptor,
    pub remote_outpoint: OutPoint,
    pub remote_output_sign_desc: SignDescriptor,
}

/// The live channel state machine surface consumed by the arbiter.
pub trait ChannelContract: Send + Sync {
    fn channel_point(&self) -> OutPoint;

    fn state_snapshot(&self) -> ChannelSnapshot;

    /// Delete the channel's open-state record, recording the passed close
    /// summary in its stead.
    fn delete_state(&self, summary: &ChannelCloseSummary) -> Result<()>;

    fn stop(&self);
}

/// The three terminal channel events are mutually exclusive; at most one of
/// these sources ever yields a value.
pub struct ChannelEvents {
    pub unilateral_close: mpsc::Receiver<UnilateralCloseSummary>,
    pub contract_breach: mpsc::Receiver<BreachReport>,
}

/// A channel handed to the arbiter for watching.
pub struct WatchedChannel {
    pub contract: Arc<dyn ChannelContract>,
    pub events: ChannelEvents,
}

impl WatchedChannel {
    pub fn channel_point(&self) -> OutPoint {
        self.contract.channel_point()
    }
}

/// Rebuilds live channel handles from persisted stubs on startup.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn load_channel(&self, stub: &OpenChannel) -> Result<WatchedChannel>;
}

/// The channel database surface consumed by the arbiter.
pub trait ChannelStateStore: Send + Sync {
    fn fetch_all_channels(&self) -> Result<Vec<OpenChannel>>;

    fn fetch_closed_channels(&self, pending_only: bool) -> Result<Vec<ChannelCloseSummary>>;

    /// Atomically delete the open-state record and persist the close
    /// summary. Deleting an already-absent open record succeeds silently;
    /// startup reconciliation relies on being able to repeat this.
    fn close_channel(&self, summary: &ChannelCloseSummary) -> Result<()>;

    fn mark_channel_fully_closed(&self, chan_point: &OutPoint) -> Result<()>;
}
