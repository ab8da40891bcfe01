//! Pure assembly of the transactions that reclaim channel funds: the
//! justice transaction punishing a revoked commitment, and the sweep that
//! recovers our own output after a non-revoked unilateral close. The only
//! I/O is obtaining a fresh destination script from the wallet.

use anyhow::anyhow;
use bitcoin::absolute::LockTime;
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::channel::UnilateralCloseSummary;
use crate::wallet::{tweak_pubkey, SignDescriptor, Signer, WalletController};
use crate::{Error, Result};

use super::retribution::RetributionInfo;

fn sweep_input(outpoint: OutPoint) -> TxIn {
    TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Create the transaction which exacts justice by sweeping both commitment
/// outputs we are entitled to after a breach. Returns a fully signed
/// transaction with every witness in place. The caller must have attached
/// witness generators to the retribution's outputs.
pub async fn create_justice_tx(
    wallet: &dyn WalletController,
    ret: &RetributionInfo,
    fee_sats: u64,
) -> Result<Transaction> {
    let pk_script_of_justice = wallet.new_sweep_pk_script().await?;

    // HTLC outputs are not yet included in the claim.
    let total_amt = ret.self_output.amount + ret.revoked_output.amount;
    let swept_amt = total_amt.saturating_sub(fee_sats);

    let mut justice_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![
            sweep_input(ret.self_output.outpoint),
            sweep_input(ret.revoked_output.outpoint),
        ],
        output: vec![TxOut {
            value: Amount::from_sat(swept_amt),
            script_pubkey: pk_script_of_justice,
        }],
    };

    let local_witness_func = ret
        .self_output
        .witness_func
        .as_ref()
        .ok_or_else(|| Error::Signer("no witness generator attached to self output".into()))?;
    let remote_witness_func = ret
        .revoked_output
        .witness_func
        .as_ref()
        .ok_or_else(|| Error::Signer("no witness generator attached to revoked output".into()))?;

    let (local_witness, remote_witness) = {
        let mut hash_cache = SighashCache::new(&justice_tx);
        let local_witness = local_witness_func(&justice_tx, &mut hash_cache, 0)?;
        let remote_witness = remote_witness_func(&justice_tx, &mut hash_cache, 1)?;
        (local_witness, remote_witness)
    };
    justice_tx.input[0].witness = local_witness;
    justice_tx.input[1].witness = remote_witness;

    Ok(justice_tx)
}

/// Create a transaction sweeping the non-delayed output paying to us on the
/// remote party's commitment transaction. The output uses a tweaked public
/// key, so the wallet will not recognize it on its own.
pub async fn craft_commit_sweep_tx(
    wallet: &dyn WalletController,
    signer: &dyn Signer,
    close_info: &UnilateralCloseSummary,
    fee_sats: u64,
) -> Result<Transaction> {
    let sweep_pk_script = wallet.new_sweep_pk_script().await?;

    let self_outpoint = close_info
        .self_outpoint
        .ok_or_else(|| Error::Other(anyhow!("unilateral close carries no self output")))?;
    let sign_desc = close_info
        .self_output_sign_desc
        .as_ref()
        .ok_or_else(|| Error::Other(anyhow!("unilateral close carries no sign descriptor")))?;

    let output_amt = sign_desc.output.value.to_sat();
    let sweep_amt = output_amt as i64 - fee_sats as i64;
    if sweep_amt <= 0 {
        return Err(Error::OutputTooSmall(sweep_amt));
    }

    let mut sweep_tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![sweep_input(self_outpoint)],
        output: vec![TxOut {
            value: Amount::from_sat(sweep_amt as u64),
            script_pubkey: sweep_pk_script,
        }],
    };

    // A regular p2wkh witness, except the key is the tweaked one the
    // commitment output was created for.
    let witness = {
        let mut sighashes = SighashCache::new(&sweep_tx);
        let sweep_sig = signer.sign_output_raw(&sweep_tx, &mut sighashes, 0, sign_desc)?;

        let mut sig = sweep_sig.serialize_der().to_vec();
        sig.push(EcdsaSighashType::All.to_u32() as u8);

        let tweak = sign_desc
            .single_tweak
            .as_ref()
            .ok_or_else(|| Error::Signer("commitment output missing single tweak".into()))?;
        let tweaked_pubkey = tweak_pubkey(&sign_desc.pubkey, tweak)?;

        Witness::from_slice(&[sig.as_slice(), &tweaked_pubkey.serialize()[..]])
    };
    sweep_tx.input[0].witness = witness;

    Ok(sweep_tx)
}

/// Witness for spending our own non-delayed commitment output: a plain
/// p2wkh stack over the (possibly tweaked) key.
pub(crate) fn commit_spend_no_delay<'a>(
    signer: &dyn Signer,
    sign_desc: &SignDescriptor,
    tx: &'a Transaction,
    sighashes: &mut SighashCache<&'a Transaction>,
    input_index: usize,
) -> Result<Witness> {
    let sweep_sig = signer.sign_output_raw(tx, sighashes, input_index, sign_desc)?;

    let mut sig = sweep_sig.serialize_der().to_vec();
    sig.push(sign_desc.hash_type.to_u32() as u8);

    let pubkey = match &sign_desc.single_tweak {
        Some(tweak) => tweak_pubkey(&sign_desc.pubkey, tweak)?,
        None => sign_desc.pubkey,
    };

    Ok(Witness::from_slice(&[
        sig.as_slice(),
        &pubkey.serialize()[..],
    ]))
}

/// Witness for claiming the counterparty's output through the revocation
/// clause of the commitment script.
pub(crate) fn commit_spend_revoke<'a>(
    signer: &dyn Signer,
    sign_desc: &SignDescriptor,
    tx: &'a Transaction,
    sighashes: &mut SighashCache<&'a Transaction>,
    input_index: usize,
) -> Result<Witness> {
    let sweep_sig = signer.sign_output_raw(tx, sighashes, input_index, sign_desc)?;

    let mut sig = sweep_sig.serialize_der().to_vec();
    sig.push(sign_desc.hash_type.to_u32() as u8);

    // A true value on the stack selects the revocation branch.
    Ok(Witness::from_slice(&[
        sig.as_slice(),
        &[1u8][..],
        sign_desc.witness_script.as_bytes(),
    ]))
}
