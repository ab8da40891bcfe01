use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::SighashCache;
use bitcoin::{OutPoint, Transaction, Txid, Witness};
use tokio::sync::oneshot;

use crate::channel::{ChannelCloseSummary, CloseType};
use crate::codec::{read_outpoint, read_varint, write_outpoint, write_varint};
use crate::wallet::{SignDescriptor, Signer};
use crate::{Error, Result};

use super::sweep;

/// Computes the full witness stack for one input of a sweep transaction,
/// against the pre-signature sighash cache of the assembled transaction.
pub type WitnessGenerator = Box<
    dyn for<'a> Fn(&'a Transaction, &mut SighashCache<&'a Transaction>, usize) -> Result<Witness>
        + Send
        + Sync,
>;

/// How a breached output is claimed. Encoded as u16 in the v1 record
/// format; HTLC variants are reserved for a later revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessType {
    /// Our own non-delayed output on the remote commitment.
    CommitmentNoDelay,
    /// The counterparty's output, claimable through the revocation clause.
    CommitmentRevoke,
}

impl WitnessType {
    pub(crate) fn to_u16(self) -> u16 {
        match self {
            WitnessType::CommitmentNoDelay => 0,
            WitnessType::CommitmentRevoke => 1,
        }
    }

    pub(crate) fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(WitnessType::CommitmentNoDelay),
            1 => Ok(WitnessType::CommitmentRevoke),
            n => Err(Error::DecodeFailure(format!("unknown witness type {}", n))),
        }
    }

    /// Bind the witness computation for this output type over the signer
    /// and the output's sign descriptor.
    pub fn gen_witness_func(
        self,
        signer: Arc<dyn Signer>,
        sign_desc: SignDescriptor,
    ) -> WitnessGenerator {
        match self {
            WitnessType::CommitmentNoDelay => Box::new(move |tx, sighashes, input_index| {
                sweep::commit_spend_no_delay(signer.as_ref(), &sign_desc, tx, sighashes, input_index)
            }),
            WitnessType::CommitmentRevoke => Box::new(move |tx, sighashes, input_index| {
                sweep::commit_spend_revoke(signer.as_ref(), &sign_desc, tx, sighashes, input_index)
            }),
        }
    }
}

/// An output of a revoked commitment transaction that the arbiter is
/// entitled to claim.
pub struct BreachedOutput {
    pub amount: u64,
    pub outpoint: OutPoint,
    pub sign_descriptor: SignDescriptor,
    pub witness_type: WitnessType,
    /// Reserved for HTLC outputs requiring an intermediate claim stage.
    pub two_stage_claim: bool,
    /// Attached at use time; never persisted.
    pub witness_func: Option<WitnessGenerator>,
}

impl BreachedOutput {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.amount.to_be_bytes())?;
        write_outpoint(w, &self.outpoint)?;
        self.sign_descriptor.encode(w)?;
        w.write_all(&self.witness_type.to_u16().to_be_bytes())?;
        w.write_all(&[self.two_stage_claim as u8])?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut amount = [0u8; 8];
        r.read_exact(&mut amount)?;
        let outpoint = read_outpoint(r)?;
        let sign_descriptor = SignDescriptor::decode(r)?;

        let mut witness_type = [0u8; 2];
        r.read_exact(&mut witness_type)?;
        let witness_type = WitnessType::from_u16(u16::from_be_bytes(witness_type))?;

        let mut two_stage = [0u8; 1];
        r.read_exact(&mut two_stage)?;

        Ok(BreachedOutput {
            amount: u64::from_be_bytes(amount),
            outpoint,
            sign_descriptor,
            witness_type,
            two_stage_claim: two_stage[0] == 1,
            witness_func: None,
        })
    }
}

impl fmt::Debug for BreachedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreachedOutput")
            .field("amount", &self.amount)
            .field("outpoint", &self.outpoint)
            .field("sign_descriptor", &self.sign_descriptor)
            .field("witness_type", &self.witness_type)
            .field("two_stage_claim", &self.two_stage_claim)
            .finish_non_exhaustive()
    }
}

impl PartialEq for BreachedOutput {
    fn eq(&self, other: &Self) -> bool {
        self.amount == other.amount
            && self.outpoint == other.outpoint
            && self.sign_descriptor == other.sign_descriptor
            && self.witness_type == other.witness_type
            && self.two_stage_claim == other.two_stage_claim
    }
}

/// Everything needed to sweep all contested funds of a breached channel.
/// Persisted from the moment a breach is observed until the justice
/// transaction confirms.
pub struct RetributionInfo {
    /// Txid of the revoked commitment the counterparty broadcast.
    pub commit_hash: Txid,
    pub chan_point: OutPoint,

    // Copied from the channel snapshot at breach time, so a close summary
    // can be reconstructed without consulting the channel database.
    pub remote_identity: PublicKey,
    pub capacity: u64,
    pub settled_balance: u64,

    pub self_output: BreachedOutput,
    pub revoked_output: BreachedOutput,
    pub htlc_outputs: Vec<BreachedOutput>,

    /// Signalled once justice has been served. Never persisted.
    pub done: Option<oneshot::Sender<()>>,
}

impl RetributionInfo {
    /// Deterministically reconstruct the close summary recorded for this
    /// breach, for reconciling the channel database after a restart.
    pub fn close_summary(&self) -> ChannelCloseSummary {
        ChannelCloseSummary {
            chan_point: self.chan_point,
            closing_txid: self.commit_hash,
            remote_pub: self.remote_identity,
            capacity: self.capacity,
            settled_balance: self.settled_balance,
            close_type: CloseType::Breach,
            is_pending: true,
            time_locked_balance: 0,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.commit_hash.to_byte_array())?;
        write_outpoint(w, &self.chan_point)?;
        w.write_all(&self.remote_identity.serialize())?;
        w.write_all(&self.capacity.to_be_bytes())?;
        w.write_all(&self.settled_balance.to_be_bytes())?;

        self.self_output.encode(w)?;
        self.revoked_output.encode(w)?;

        write_varint(w, self.htlc_outputs.len() as u64)?;
        for htlc in &self.htlc_outputs {
            htlc.encode(w)?;
        }

        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut commit_hash = [0u8; 32];
        r.read_exact(&mut commit_hash)?;

        let chan_point = read_outpoint(r)?;

        let mut remote_identity = [0u8; 33];
        r.read_exact(&mut remote_identity)?;
        let remote_identity = PublicKey::from_slice(&remote_identity)?;

        let mut capacity = [0u8; 8];
        r.read_exact(&mut capacity)?;
        let mut settled_balance = [0u8; 8];
        r.read_exact(&mut settled_balance)?;

        let self_output = BreachedOutput::decode(r)?;
        let revoked_output = BreachedOutput::decode(r)?;

        let num_htlc_outputs = read_varint(r)?;
        let mut htlc_outputs = Vec::with_capacity(num_htlc_outputs as usize);
        for _ in 0..num_htlc_outputs {
            htlc_outputs.push(BreachedOutput::decode(r)?);
        }

        Ok(RetributionInfo {
            commit_hash: Txid::from_byte_array(commit_hash),
            chan_point,
            remote_identity,
            capacity: u64::from_be_bytes(capacity),
            settled_balance: u64::from_be_bytes(settled_balance),
            self_output,
            revoked_output,
            htlc_outputs,
            done: None,
        })
    }
}

impl fmt::Debug for RetributionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetributionInfo")
            .field("commit_hash", &self.commit_hash)
            .field("chan_point", &self.chan_point)
            .field("remote_identity", &self.remote_identity)
            .field("capacity", &self.capacity)
            .field("settled_balance", &self.settled_balance)
            .field("self_output", &self.self_output)
            .field("revoked_output", &self.revoked_output)
            .field("htlc_outputs", &self.htlc_outputs)
            .finish_non_exhaustive()
    }
}

impl PartialEq for RetributionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.commit_hash == other.commit_hash
            && self.chan_point == other.chan_point
            && self.remote_identity == other.remote_identity
            && self.capacity == other.capacity
            && self.settled_balance == other.settled_balance
            && self.self_output == other.self_output
            && self.revoked_output == other.revoked_output
            && self.htlc_outputs == other.htlc_outputs
    }
}

/// Persistent map from channel point to retribution state. The arbiter
/// records a channel's retribution here before acting on-chain, so an
/// interrupted retribution can resume after a restart. Implementations must
/// be safe for concurrent use.
pub trait RetributionStore: Send + Sync {
    /// Persist the retribution under its channel point, overwriting any
    /// existing entry.
    fn add_retribution(&self, ret: &RetributionInfo) -> Result<()>;

    /// Delete the entry for the channel point. Errors if no retribution
    /// state has ever been recorded: removals must pair with a prior add.
    fn remove_retribution(&self, chan_point: &OutPoint) -> Result<()>;

    /// Apply the callback to every stored record over a point-in-time
    /// snapshot. An error from the callback aborts iteration and
    /// propagates.
    fn for_all_retributions(
        &self,
        cb: &mut dyn FnMut(RetributionInfo) -> Result<()>,
    ) -> Result<()>;
}
