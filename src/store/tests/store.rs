use crate::arbiter::{BreachedOutput, RetributionInfo, RetributionStore, WitnessType};
use crate::channel::{ChannelCloseSummary, ChannelStateStore, CloseType};
use crate::store::Store;
use crate::test_utils::*;
use crate::wallet::SignDescriptor;
use crate::Error;

fn new_store(prefix: &str) -> (Store, TempDir) {
    let path = TempDir::new(prefix);
    let store = Store::new(&path).expect("created store failed");
    (store, path)
}

fn all_retributions(store: &Store) -> Vec<RetributionInfo> {
    let mut rets = Vec::new();
    store
        .for_all_retributions(&mut |ret| {
            rets.push(ret);
            Ok(())
        })
        .expect("iterate retributions");
    rets
}

fn pending_close_summary(chan_point: bitcoin::OutPoint) -> ChannelCloseSummary {
    ChannelCloseSummary {
        chan_point,
        closing_txid: gen_rand_txid(),
        remote_pub: gen_rand_pubkey(),
        capacity: 100_000,
        settled_balance: 40_000,
        close_type: CloseType::Cooperative,
        is_pending: true,
        time_locked_balance: 0,
    }
}

#[test]
fn test_sign_descriptor_round_trip() {
    for tweaked in [false, true] {
        let desc = gen_sign_descriptor(12_345, tweaked);
        let mut encoded = Vec::new();
        desc.encode(&mut encoded).unwrap();
        let decoded = SignDescriptor::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, desc);
    }
}

#[test]
fn test_breached_output_round_trip() {
    for witness_type in [WitnessType::CommitmentNoDelay, WitnessType::CommitmentRevoke] {
        let output = gen_breached_output(witness_type, 54_321);
        let mut encoded = Vec::new();
        output.encode(&mut encoded).unwrap();
        let decoded = BreachedOutput::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, output);
    }
}

#[test]
fn test_retribution_info_round_trip() {
    for num_htlcs in [0usize, 1, 5] {
        let ret = gen_retribution_info(gen_rand_outpoint(), num_htlcs);

        let mut encoded = Vec::new();
        ret.encode(&mut encoded).unwrap();
        let decoded = RetributionInfo::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, ret);

        let mut reencoded = Vec::new();
        decoded.encode(&mut reencoded).unwrap();
        assert_eq!(reencoded, encoded);
    }
}

#[test]
fn test_unknown_witness_type_rejected() {
    let output = gen_breached_output(WitnessType::CommitmentRevoke, 1_000);
    let mut encoded = Vec::new();
    output.encode(&mut encoded).unwrap();

    // The witness type sits in the two bytes before the final claim flag.
    let len = encoded.len();
    encoded[len - 3] = 0xff;
    encoded[len - 2] = 0xff;

    assert!(matches!(
        BreachedOutput::decode(&mut encoded.as_slice()),
        Err(Error::DecodeFailure(_))
    ));
}

#[test]
fn test_store_upsert_overwrites() {
    let (store, _dir) = new_store("vigil-store-upsert");

    let chan_point = gen_rand_outpoint();
    let r1 = gen_retribution_info(chan_point, 0);
    let r2 = gen_retribution_info(chan_point, 2);

    store.add_retribution(&r1).unwrap();
    store.add_retribution(&r2).unwrap();

    let rets = all_retributions(&store);
    assert_eq!(rets.len(), 1);
    assert_eq!(rets[0], r2);
}

#[test]
fn test_store_remove() {
    let (store, _dir) = new_store("vigil-store-remove");

    let ret = gen_retribution_info(gen_rand_outpoint(), 1);

    // Nothing has ever been recorded: removal is a caller bug.
    assert!(matches!(
        store.remove_retribution(&ret.chan_point),
        Err(Error::NoRetributions)
    ));

    store.add_retribution(&ret).unwrap();
    store.remove_retribution(&ret.chan_point).unwrap();
    assert!(all_retributions(&store).is_empty());

    assert!(matches!(
        store.remove_retribution(&ret.chan_point),
        Err(Error::NoRetributions)
    ));
}

#[test]
fn test_store_iteration_complete() {
    let (store, _dir) = new_store("vigil-store-iter");

    let mut expected: Vec<RetributionInfo> = (0..4)
        .map(|_| gen_retribution_info(gen_rand_outpoint(), 0))
        .collect();
    for ret in &expected {
        store.add_retribution(ret).unwrap();
    }

    let mut visited = all_retributions(&store);
    expected.sort_by_key(|r| r.chan_point);
    visited.sort_by_key(|r| r.chan_point);
    assert_eq!(visited, expected);
}

#[test]
fn test_store_iteration_aborts_on_callback_error() {
    let (store, _dir) = new_store("vigil-store-iter-abort");

    for _ in 0..3 {
        store
            .add_retribution(&gen_retribution_info(gen_rand_outpoint(), 0))
            .unwrap();
    }

    let mut visits = 0;
    let result = store.for_all_retributions(&mut |_| {
        visits += 1;
        Err(Error::NoRetributions)
    });
    assert!(matches!(result, Err(Error::NoRetributions)));
    assert_eq!(visits, 1);
}

#[test]
fn test_close_channel_is_repeatable() {
    let (store, _dir) = new_store("vigil-store-close");

    let chan_point = gen_rand_outpoint();
    store.put_open_channel(&gen_open_channel(chan_point)).unwrap();

    let summary = pending_close_summary(chan_point);
    store.close_channel(&summary).unwrap();
    assert!(store.get_open_channel(&chan_point).is_none());
    assert_eq!(store.get_closed_channel(&chan_point), Some(summary.clone()));

    // The open record is already gone; closing again must succeed.
    store.close_channel(&summary).unwrap();
    assert_eq!(store.get_closed_channel(&chan_point), Some(summary));
}

#[test]
fn test_mark_channel_fully_closed() {
    let (store, _dir) = new_store("vigil-store-mark-closed");

    let chan_point = gen_rand_outpoint();
    store
        .close_channel(&pending_close_summary(chan_point))
        .unwrap();

    store.mark_channel_fully_closed(&chan_point).unwrap();
    let summary = store.get_closed_channel(&chan_point).unwrap();
    assert!(!summary.is_pending);

    assert!(matches!(
        store.mark_channel_fully_closed(&gen_rand_outpoint()),
        Err(Error::ChannelNotFound(_))
    ));
}

#[test]
fn test_fetch_closed_channels_pending_filter() {
    let (store, _dir) = new_store("vigil-store-fetch-closed");

    let pending_point = gen_rand_outpoint();
    let resolved_point = gen_rand_outpoint();
    store
        .close_channel(&pending_close_summary(pending_point))
        .unwrap();
    store
        .close_channel(&pending_close_summary(resolved_point))
        .unwrap();
    store.mark_channel_fully_closed(&resolved_point).unwrap();

    let pending = store.fetch_closed_channels(true).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].chan_point, pending_point);

    let all = store.fetch_closed_channels(false).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn test_fetch_all_channels() {
    let (store, _dir) = new_store("vigil-store-fetch-open");

    assert!(store.fetch_all_channels().unwrap().is_empty());

    let mut expected: Vec<_> = (0..3).map(|_| gen_open_channel(gen_rand_outpoint())).collect();
    for channel in &expected {
        store.put_open_channel(channel).unwrap();
    }

    let mut channels = store.fetch_all_channels().unwrap();
    expected.sort_by_key(|c| c.chan_point);
    channels.sort_by_key(|c| c.chan_point);
    assert_eq!(channels, expected);
}
