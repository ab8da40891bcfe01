use std::io::{Read, Write};

use async_trait::async_trait;
use bitcoin::secp256k1::{ecdsa, All, PublicKey, Scalar, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::{Amount, EcdsaSighashType, ScriptBuf, Transaction, TxOut};
use once_cell::sync::OnceCell;

use crate::codec::{read_var_bytes, write_var_bytes, write_varint};
use crate::config::DEFAULT_SWEEP_TX_FEE_SATS;
use crate::{Error, Result};

pub fn secp256k1_instance() -> &'static Secp256k1<All> {
    static INSTANCE: OnceCell<Secp256k1<All>> = OnceCell::new();
    INSTANCE.get_or_init(Secp256k1::new)
}

/// Everything the external signer needs to produce one signature for one
/// input, minus the transaction being signed. Opaque to the arbiter, which
/// only persists it and hands it back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignDescriptor {
    /// The key the signature commits to, before any tweak.
    pub pubkey: PublicKey,
    /// Scalar added to the base key for commitment outputs paying to a
    /// tweaked key.
    pub single_tweak: Option<[u8; 32]>,
    /// The script whose satisfaction the signature authorizes.
    pub witness_script: ScriptBuf,
    /// The output being spent.
    pub output: TxOut,
    pub hash_type: EcdsaSighashType,
}

impl SignDescriptor {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.pubkey.serialize())?;
        match &self.single_tweak {
            Some(tweak) => write_var_bytes(w, tweak)?,
            None => write_varint(w, 0)?,
        }
        write_var_bytes(w, self.witness_script.as_bytes())?;
        w.write_all(&self.output.value.to_sat().to_be_bytes())?;
        write_var_bytes(w, self.output.script_pubkey.as_bytes())?;
        w.write_all(&self.hash_type.to_u32().to_be_bytes())?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut pubkey = [0u8; 33];
        r.read_exact(&mut pubkey)?;
        let pubkey = PublicKey::from_slice(&pubkey)?;

        let tweak = read_var_bytes(r)?;
        let single_tweak = match tweak.len() {
            0 => None,
            32 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&tweak);
                Some(bytes)
            }
            n => {
                return Err(Error::DecodeFailure(format!(
                    "invalid single tweak length {}",
                    n
                )))
            }
        };

        let witness_script = ScriptBuf::from_bytes(read_var_bytes(r)?);

        let mut value = [0u8; 8];
        r.read_exact(&mut value)?;
        let script_pubkey = ScriptBuf::from_bytes(read_var_bytes(r)?);

        let mut hash_type = [0u8; 4];
        r.read_exact(&mut hash_type)?;

        Ok(SignDescriptor {
            pubkey,
            single_tweak,
            witness_script,
            output: TxOut {
                value: Amount::from_sat(u64::from_be_bytes(value)),
                script_pubkey,
            },
            hash_type: EcdsaSighashType::from_consensus(u32::from_be_bytes(hash_type)),
        })
    }
}

/// Add the descriptor's single tweak to a base public key. Commitment
/// outputs pay to tweaked keys the wallet cannot recognize directly.
pub fn tweak_pubkey(base: &PublicKey, tweak: &[u8; 32]) -> Result<PublicKey> {
    let scalar = Scalar::from_be_bytes(*tweak).map_err(|e| Error::Signer(e.to_string()))?;
    Ok(base.add_exp_tweak(secp256k1_instance(), &scalar)?)
}

/// Produces raw signatures for sweep inputs. The sighash is computed by the
/// signer against the shared cache of the transaction being signed.
pub trait Signer: Send + Sync {
    fn sign_output_raw<'a>(
        &self,
        tx: &'a Transaction,
        sighashes: &mut SighashCache<&'a Transaction>,
        input_index: usize,
        sign_desc: &SignDescriptor,
    ) -> Result<ecdsa::Signature>;
}

/// The wallet surface the arbiter drives: fresh destination scripts and
/// transaction broadcast.
#[async_trait]
pub trait WalletController: Send + Sync {
    /// A fresh script owned by the wallet, suitable as the destination of a
    /// sweep.
    async fn new_sweep_pk_script(&self) -> Result<ScriptBuf>;

    async fn publish_transaction(&self, tx: &Transaction) -> Result<()>;
}

/// Fee policy for sweep transactions. Estimation strategy lives outside the
/// arbiter.
pub trait FeeEstimator: Send + Sync {
    /// The fee, in satoshis, to attach to a sweep transaction.
    fn sweep_fee_sats(&self) -> u64;
}

/// Fixed-fee stub used until a real estimator is wired through.
pub struct StaticFeeEstimator {
    fee_sats: u64,
}

impl StaticFeeEstimator {
    pub fn new(fee_sats: u64) -> Self {
        Self { fee_sats }
    }
}

impl Default for StaticFeeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_TX_FEE_SATS)
    }
}

impl FeeEstimator for StaticFeeEstimator {
    fn sweep_fee_sats(&self) -> u64 {
        self.fee_sats
    }
}
