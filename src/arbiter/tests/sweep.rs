use std::sync::Arc;

use bitcoin::transaction::Version;

use crate::arbiter::sweep::{craft_commit_sweep_tx, create_justice_tx};
use crate::channel::UnilateralCloseSummary;
use crate::test_utils::*;
use crate::Error;

fn attach_witness_funcs(ret: &mut crate::arbiter::RetributionInfo, signer: Arc<MockSigner>) {
    ret.self_output.witness_func = Some(ret.self_output.witness_type.gen_witness_func(
        signer.clone(),
        ret.self_output.sign_descriptor.clone(),
    ));
    ret.revoked_output.witness_func = Some(ret.revoked_output.witness_type.gen_witness_func(
        signer,
        ret.revoked_output.sign_descriptor.clone(),
    ));
}

#[tokio::test]
async fn test_justice_tx_shape() {
    let wallet = MockWallet::new();
    let signer = MockSigner::new();

    let mut ret = gen_retribution_info(gen_rand_outpoint(), 0);
    ret.self_output.amount = 20_000;
    ret.revoked_output.amount = 60_000;
    attach_witness_funcs(&mut ret, signer);

    let justice_tx = create_justice_tx(wallet.as_ref(), &ret, 5_000)
        .await
        .expect("create justice tx");

    assert_eq!(justice_tx.version, Version::TWO);

    assert_eq!(justice_tx.input.len(), 2);
    assert_eq!(
        justice_tx.input[0].previous_output,
        ret.self_output.outpoint
    );
    assert_eq!(
        justice_tx.input[1].previous_output,
        ret.revoked_output.outpoint
    );

    assert_eq!(justice_tx.output.len(), 1);
    assert_eq!(justice_tx.output[0].value.to_sat(), 75_000);
    assert_eq!(justice_tx.output[0].script_pubkey, wallet.sweep_script());

    // p2wkh spend of our own output, revocation-clause spend of theirs.
    assert_eq!(justice_tx.input[0].witness.len(), 2);
    assert_eq!(justice_tx.input[1].witness.len(), 3);
}

#[tokio::test]
async fn test_justice_tx_requires_witness_funcs() {
    let wallet = MockWallet::new();

    let ret = gen_retribution_info(gen_rand_outpoint(), 0);
    let err = create_justice_tx(wallet.as_ref(), &ret, 5_000)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Signer(_)));
}

#[tokio::test]
async fn test_commit_sweep_shape() {
    let wallet = MockWallet::new();
    let signer = MockSigner::new();

    let close_info = UnilateralCloseSummary {
        spender_txid: gen_rand_txid(),
        spending_height: 100,
        self_outpoint: Some(gen_rand_outpoint()),
        self_output_sign_desc: Some(gen_sign_descriptor(50_000, true)),
    };

    let sweep_tx = craft_commit_sweep_tx(wallet.as_ref(), signer.as_ref(), &close_info, 5_000)
        .await
        .expect("craft sweep tx");

    assert_eq!(sweep_tx.version, Version::ONE);
    assert_eq!(sweep_tx.input.len(), 1);
    assert_eq!(
        Some(sweep_tx.input[0].previous_output),
        close_info.self_outpoint
    );
    assert_eq!(sweep_tx.output.len(), 1);
    assert_eq!(sweep_tx.output[0].value.to_sat(), 45_000);
    assert_eq!(sweep_tx.output[0].script_pubkey, wallet.sweep_script());

    // Standard p2wkh layout: signature then the tweaked key.
    assert_eq!(sweep_tx.input[0].witness.len(), 2);
    assert_eq!(sweep_tx.input[0].witness.last().map(<[u8]>::len), Some(33));
}

#[tokio::test]
async fn test_commit_sweep_rejects_dust() {
    let wallet = MockWallet::new();
    let signer = MockSigner::new();

    let close_info = UnilateralCloseSummary {
        spender_txid: gen_rand_txid(),
        spending_height: 100,
        self_outpoint: Some(gen_rand_outpoint()),
        self_output_sign_desc: Some(gen_sign_descriptor(4_999, true)),
    };

    let err = craft_commit_sweep_tx(wallet.as_ref(), signer.as_ref(), &close_info, 5_000)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OutputTooSmall(_)));
    assert_eq!(wallet.published_count(), 0);
}
