// Lightning network payment channel library implementing BOLT-2 & BOLT-3
// commitment transaction protocol.
//
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Two-party commitment protocol workflows, driving a pair of mirrored
//! channel objects through complete message rounds.

use std::str::FromStr;

use amplify::{Slice32, Wrapper};
use bitcoin::{OutPoint, Txid};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use bitcoin_scripts::PubkeyScript;
use ln_channel::channel::{
    per_commitment_point, per_commitment_secret_from_seed, Channel,
    ChannelState, Constraints, Direction, Error, Keypair, Lifecycle,
    LocalKeyset, MisbehaviorError, PaymentError, PeerParams, PreimageLookup,
    RemoteKeyset, Side, WatcherSink, START_INDEX,
};
use ln_channel::p2p::{OnionPacket, UpdateAddHtlc};
use secp256k1::{PublicKey, SecretKey, SECP256K1};

const ONE_BTC_MSAT: u64 = 100_000_000_000;
const ONE_BTC_SAT: u64 = 100_000_000;

fn sk(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fn local_keyset(base: u8, seed: [u8; 32]) -> LocalKeyset {
    LocalKeyset {
        funding: Keypair::with(sk(base)),
        payment_basepoint: Keypair::with(sk(base + 1)),
        revocation_basepoint: Keypair::with(sk(base + 2)),
        delayed_payment_basepoint: Keypair::with(sk(base + 3)),
        htlc_basepoint: Keypair::with(sk(base + 4)),
        per_commitment_seed: Slice32::from_inner(seed),
    }
}

fn public_view(keys: &LocalKeyset) -> RemoteKeyset {
    RemoteKeyset {
        funding_pubkey: keys.funding.key,
        payment_basepoint: keys.payment_basepoint.key,
        revocation_basepoint: keys.revocation_basepoint.key,
        delayed_payment_basepoint: keys.delayed_payment_basepoint.key,
        htlc_basepoint: keys.htlc_basepoint.key,
    }
}

fn peer_params(dust: u64, csv: u16, reserve_sat: u64) -> PeerParams {
    PeerParams {
        dust_limit_satoshis: dust,
        to_self_delay: csv,
        htlc_minimum_msat: 1,
        max_htlc_value_in_flight_msat: 5 * ONE_BTC_MSAT,
        channel_reserve_satoshis: reserve_sat,
        max_accepted_htlcs: 5,
    }
}

fn payment(byte: u8) -> (HashPreimage, HashLock) {
    let preimage = HashPreimage::from(Slice32::from_inner([byte; 32]));
    (preimage, HashLock::from(preimage))
}

fn create_test_channels_with(
    feerate: u32,
    local_msat: u64,
    remote_msat: u64,
    alice_reserve_sat: u64,
    bob_reserve_sat: u64,
) -> (Channel, Channel) {
    let funding_txid = Txid::from_str(
        "0101010101010101010101010101010101010101010101010101010101010101",
    )
    .unwrap();
    let funding_outpoint = OutPoint::new(funding_txid, 0);
    let capacity = (local_msat + remote_msat) / 1000;

    let alice_seed = [1u8; 32];
    let bob_seed = [2u8; 32];
    let alice_keys = local_keyset(0x10, alice_seed);
    let bob_keys = local_keyset(0x20, bob_seed);
    // parameters announced by each side; the announced reserve applies to
    // the counterparty
    let alice_params = peer_params(200, 5, bob_reserve_sat);
    let bob_params = peer_params(1300, 4, alice_reserve_sat);

    let bob_first = per_commitment_point(per_commitment_secret_from_seed(
        Slice32::from_inner(bob_seed),
        START_INDEX,
    ));
    let alice_first = per_commitment_point(per_commitment_secret_from_seed(
        Slice32::from_inner(alice_seed),
        START_INDEX,
    ));

    let mut alice = Channel::with(
        funding_outpoint,
        Constraints {
            capacity,
            is_initiator: true,
            funding_txn_minimum_depth: 3,
            feerate,
        },
        alice_keys.clone(),
        alice_params,
        local_msat,
        public_view(&bob_keys),
        bob_params,
        remote_msat,
        bob_first,
        PublicKey::from_secret_key(SECP256K1, &sk(0x77)),
    )
    .unwrap();
    let mut bob = Channel::with(
        funding_outpoint,
        Constraints {
            capacity,
            is_initiator: false,
            funding_txn_minimum_depth: 3,
            feerate,
        },
        bob_keys,
        bob_params,
        remote_msat,
        public_view(&alice_keys),
        alice_params,
        local_msat,
        alice_first,
        PublicKey::from_secret_key(SECP256K1, &sk(0x78)),
    )
    .unwrap();

    // initial (refund) commitment signature exchange
    let (alice_sig, alice_htlc_sigs) = alice.sign_next_commitment().unwrap();
    let (bob_sig, bob_htlc_sigs) = bob.sign_next_commitment().unwrap();
    assert!(alice_htlc_sigs.is_empty());
    assert!(bob_htlc_sigs.is_empty());
    alice.receive_initial_commitment_signature(bob_sig).unwrap();
    bob.receive_initial_commitment_signature(alice_sig).unwrap();

    // funding mined: exchange funding_locked points
    let alice_second = per_commitment_point(per_commitment_secret_from_seed(
        Slice32::from_inner(alice_seed),
        START_INDEX - 1,
    ));
    let bob_second = per_commitment_point(per_commitment_secret_from_seed(
        Slice32::from_inner(bob_seed),
        START_INDEX - 1,
    ));
    alice.funding_locked(None, bob_second).unwrap();
    bob.funding_locked(None, alice_second).unwrap();
    assert_eq!(alice.stage(), Lifecycle::Open);
    assert_eq!(bob.stage(), Lifecycle::Open);

    // the two views of every commitment must agree from the start
    assert_eq!(
        alice.current_commitment(Side::Local).unwrap().outputs(),
        bob.current_commitment(Side::Remote).unwrap().outputs()
    );
    assert_eq!(
        alice.current_commitment(Side::Remote).unwrap().outputs(),
        bob.current_commitment(Side::Local).unwrap().outputs()
    );

    (alice, bob)
}

fn create_test_channels(
    feerate: u32,
    local_msat: u64,
    remote_msat: u64,
) -> (Channel, Channel) {
    create_test_channels_with(feerate, local_msat, remote_msat, 0, 0)
}

fn default_channels() -> (Channel, Channel) {
    create_test_channels(6000, 5 * ONE_BTC_MSAT, 5 * ONE_BTC_MSAT)
}

/// Runs the full four-message commitment round started by `a`.
fn force_state_transition(a: &mut Channel, b: &mut Channel) {
    let (sig, htlc_sigs) = a.sign_next_commitment().unwrap();
    b.receive_new_commitment(sig, htlc_sigs).unwrap();
    let (rev_b, _) = b.revoke_current_commitment().unwrap();
    let (sig_b, htlc_sigs_b) = b.sign_next_commitment().unwrap();
    a.receive_revocation(&rev_b).unwrap();
    a.receive_new_commitment(sig_b, htlc_sigs_b).unwrap();
    let (rev_a, _) = a.revoke_current_commitment().unwrap();
    b.receive_revocation(&rev_a).unwrap();
}

fn add_one_htlc(
    alice: &mut Channel,
    bob: &mut Channel,
    byte: u8,
    amount_msat: u64,
) -> (HashPreimage, u64) {
    let (preimage, hash) = payment(byte);
    let message = alice
        .add_htlc(hash, amount_msat, 5, OnionPacket::default())
        .unwrap();
    let htlc_id = bob.receive_htlc(&message).unwrap();
    (preimage, htlc_id)
}

#[test]
fn initial_commitment_fee() {
    // 253 sat/kw over a 724-weight commitment costs 183 sat, paid by the
    // funder
    let (alice, _bob) =
        create_test_channels(253, 10_000_000_000, 5_000_000_000);
    let ctx = alice.current_commitment(Side::Local).unwrap();
    assert!(ctx.outputs().iter().any(|txout| txout.value == 9_999_817));
}

#[test]
fn simple_add_settle_workflow() {
    let (mut alice, mut bob) = default_channels();
    let (preimage, hash) = payment(1);

    let add = alice
        .add_htlc(hash, ONE_BTC_MSAT, 5, OnionPacket::default())
        .unwrap();
    assert_eq!(add.htlc_id, 0);
    assert!(!alice
        .log()
        .htlcs_by_direction(Side::Remote, Direction::Received, Some(1))
        .is_empty());

    let before = bob.balance_minus_outgoing_htlcs(Side::Remote);
    let bob_id = bob.receive_htlc(&add).unwrap();
    let after = bob.balance_minus_outgoing_htlcs(Side::Remote);
    assert_eq!(before - after, ONE_BTC_MSAT);
    assert_eq!(
        bob.balance_minus_outgoing_htlcs(Side::Local),
        5 * ONE_BTC_MSAT
    );

    // both peers see the same pending HTLC, from opposite directions
    let alice_view: Vec<_> = alice
        .log()
        .pending_htlcs(Side::Remote)
        .into_iter()
        .map(|(direction, htlc)| (direction, *htlc))
        .collect();
    let bob_view: Vec<_> = bob
        .log()
        .pending_htlcs(Side::Local)
        .into_iter()
        .map(|(direction, htlc)| (direction, *htlc))
        .collect();
    assert_eq!(alice_view, bob_view);
    assert_eq!(alice_view[0].0, Direction::Received);

    // Alice commits to the new state; her signature covers the HTLC
    let (alice_sig, alice_htlc_sigs) = alice.sign_next_commitment().unwrap();
    assert_eq!(
        alice_htlc_sigs.len(),
        1,
        "alice should generate one htlc signature"
    );
    assert_eq!(
        alice.pending_commitment(Side::Remote).unwrap().outputs(),
        bob.pending_commitment(Side::Local).unwrap().outputs()
    );

    bob.receive_new_commitment(alice_sig, alice_htlc_sigs).unwrap();
    assert!(bob.signature_fits(&bob.pending_commitment(Side::Local).unwrap()));

    let (bob_revocation, _) = bob.revoke_current_commitment().unwrap();
    let (bob_sig, bob_htlc_sigs) = bob.sign_next_commitment().unwrap();
    assert_eq!(bob_htlc_sigs.len(), 1);

    let force_close_before = alice.force_close_tx().unwrap();
    alice.receive_revocation(&bob_revocation).unwrap();
    assert_eq!(
        alice.pending_commitment(Side::Local).unwrap().outputs().len(),
        3
    );

    alice.receive_new_commitment(bob_sig, bob_htlc_sigs).unwrap();
    // a fresh signature moves the force-close transaction forward
    let force_close_after = alice.force_close_tx().unwrap();
    assert_ne!(force_close_before, force_close_after);
    assert_eq!(force_close_after.output.len(), 3);

    let (alice_revocation, _) = alice.revoke_current_commitment().unwrap();
    // revoking does not change the force-close target: it was already the
    // newly signed commitment
    assert_eq!(alice.force_close_tx().unwrap(), force_close_after);
    bob.receive_revocation(&alice_revocation).unwrap();

    assert_eq!(alice.log().ctn(Side::Local), 1);
    assert_eq!(bob.log().ctn(Side::Local), 1);
    assert_eq!(alice.total_msat(Direction::Sent), 0);
    assert_eq!(bob.total_msat(Direction::Received), 0);

    // both commitments carry the HTLC output of exactly 1 BTC
    for (channel, side) in
        [(&alice, Side::Local), (&bob, Side::Local)]
    {
        let ctx = channel.pending_commitment(side).unwrap();
        assert_eq!(ctx.outputs().len(), 3);
        assert!(ctx
            .outputs()
            .iter()
            .any(|txout| txout.value == ONE_BTC_SAT));
    }
    assert_eq!(
        alice.balance_minus_outgoing_htlcs(Side::Local),
        4 * ONE_BTC_MSAT
    );

    // Bob learned the preimage and settles
    let fulfill = bob.settle_htlc(preimage, bob_id).unwrap();
    alice.receive_htlc_settle(&fulfill).unwrap();

    let (bob_sig2, bob_htlc_sigs2) = bob.sign_next_commitment().unwrap();
    assert!(bob_htlc_sigs2.is_empty());
    assert_eq!(
        alice.pending_commitment(Side::Local).unwrap().outputs(),
        bob.pending_commitment(Side::Remote).unwrap().outputs()
    );
    alice.receive_new_commitment(bob_sig2, bob_htlc_sigs2).unwrap();

    let (alice_revocation2, _) = alice.revoke_current_commitment().unwrap();
    let (alice_sig2, alice_htlc_sigs2) = alice.sign_next_commitment().unwrap();
    assert!(alice_htlc_sigs2.is_empty());

    let (received, sent) = bob.receive_revocation(&alice_revocation2).unwrap();
    assert_eq!(received, ONE_BTC_MSAT);
    assert_eq!(sent, 0);

    bob.receive_new_commitment(alice_sig2, alice_htlc_sigs2).unwrap();
    let (bob_revocation2, _) = bob.revoke_current_commitment().unwrap();
    alice.receive_revocation(&bob_revocation2).unwrap();

    assert_eq!(alice.total_msat(Direction::Sent), ONE_BTC_MSAT);
    assert_eq!(alice.total_msat(Direction::Received), 0);
    assert_eq!(bob.total_msat(Direction::Received), ONE_BTC_MSAT);
    assert_eq!(bob.total_msat(Direction::Sent), 0);
    assert_eq!(alice.log().ctn(Side::Local), 2);
    assert_eq!(bob.log().ctn(Side::Local), 2);
    assert_eq!(alice.balance(Side::Local), 4 * ONE_BTC_MSAT);
    assert_eq!(bob.balance(Side::Local), 6 * ONE_BTC_MSAT);

    // each revocation round fed the peer's revocation store
    assert_eq!(alice.remote().revocation_store.revealed_count(), 2);
    assert_eq!(bob.remote().revocation_store.revealed_count(), 2);
}

#[test]
fn concurrent_reversed_payment() {
    let (mut alice, mut bob) = default_channels();
    let (_, hash1) = payment(1);
    let (_, hash2) = payment(2);

    let alice_add = alice
        .add_htlc(hash1, ONE_BTC_MSAT, 5, OnionPacket::default())
        .unwrap();
    bob.receive_htlc(&alice_add).unwrap();

    let bob_add = bob
        .add_htlc(hash2, ONE_BTC_MSAT + 1000, 5, OnionPacket::default())
        .unwrap();
    alice.receive_htlc(&bob_add).unwrap();

    let (bob_sig, bob_htlc_sigs) = bob.sign_next_commitment().unwrap();
    alice.receive_new_commitment(bob_sig, bob_htlc_sigs).unwrap();
    assert_eq!(
        alice.pending_commitment(Side::Remote).unwrap().outputs().len(),
        4
    );
}

#[test]
fn dust_limit() {
    let (mut alice, mut bob) = default_channels();
    let feerate = alice.constraints().feerate;
    assert_eq!(feerate, 6000);
    // exactly at the non-trimmed boundary of the offering side
    let htlc_amt_sat = 500 + 663 * (feerate as u64 / 1000);
    assert_eq!(htlc_amt_sat, 4478);

    let (preimage, bob_id) =
        add_one_htlc(&mut alice, &mut bob, 1, htlc_amt_sat * 1000);
    force_state_transition(&mut alice, &mut bob);

    // the HTLC output survives Alice's 200 sat dust limit but is trimmed by
    // Bob's 1300 sat one
    assert_eq!(
        alice.current_commitment(Side::Local).unwrap().outputs().len(),
        3
    );
    assert_eq!(
        bob.current_commitment(Side::Local).unwrap().outputs().len(),
        2
    );

    let fulfill = bob.settle_htlc(preimage, bob_id).unwrap();
    alice.receive_htlc_settle(&fulfill).unwrap();
    force_state_transition(&mut bob, &mut alice);

    assert_eq!(
        alice.pending_commitment(Side::Local).unwrap().outputs().len(),
        2
    );
    assert_eq!(alice.total_msat(Direction::Sent) / 1000, htlc_amt_sat);
}

#[test]
fn channel_reserve() {
    // Bob must keep 6 BTC (more than his balance), Alice 0.5 BTC
    let (mut alice, mut bob) = create_test_channels_with(
        6000,
        5 * ONE_BTC_MSAT,
        5 * ONE_BTC_MSAT,
        ONE_BTC_SAT / 2,
        6 * ONE_BTC_SAT,
    );

    // Alice stays above her reserve even though she pays the fee
    add_one_htlc(&mut alice, &mut bob, 1, ONE_BTC_MSAT / 2);
    force_state_transition(&mut alice, &mut bob);

    assert_eq!(
        alice.balance_minus_outgoing_htlcs(Side::Local),
        9 * ONE_BTC_MSAT / 2
    );
    assert_eq!(
        bob.balance_minus_outgoing_htlcs(Side::Remote),
        9 * ONE_BTC_MSAT / 2
    );
    assert_eq!(bob.balance(Side::Local), 5 * ONE_BTC_MSAT);

    // Bob's balance is below the reserve demanded by Alice: he may receive
    // HTLCs but not send them
    let (_, hash2) = payment(2);
    let err = bob
        .add_htlc(hash2, ONE_BTC_MSAT / 2, 5, OnionPacket::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Payment(PaymentError::NotEnoughBalance { .. })
    ));

    // and Alice must reject the same HTLC as a protocol violation
    let message = UpdateAddHtlc {
        channel_id: alice.channel_id(),
        htlc_id: 0,
        amount_msat: ONE_BTC_MSAT / 2,
        payment_hash: hash2,
        cltv_expiry: 5,
        onion_routing_packet: OnionPacket::default(),
    };
    let err = alice.receive_htlc(&message).unwrap_err();
    assert!(matches!(
        err,
        Error::Misbehavior(MisbehaviorError::Policy(
            PaymentError::NotEnoughBalance { .. }
        ))
    ));
}

#[test]
fn update_fee_sender_commits() {
    let (mut alice, mut bob) = default_channels();
    let old_feerate = alice.pending_feerate(Side::Local);

    let update = alice.update_fee(111).unwrap();
    // the sender's own commitments keep the old rate until the peer acks
    assert_eq!(alice.pending_feerate(Side::Local), old_feerate);
    assert_eq!(alice.pending_feerate(Side::Remote), 111);
    bob.receive_update_fee(&update).unwrap();
    assert_eq!(bob.pending_feerate(Side::Local), 111);
    assert_eq!(
        alice.pending_commitment(Side::Remote).unwrap().outputs(),
        bob.pending_commitment(Side::Local).unwrap().outputs()
    );

    let (alice_sig, alice_htlc_sigs) = alice.sign_next_commitment().unwrap();
    assert_eq!(alice.pending_feerate(Side::Local), old_feerate);
    bob.receive_new_commitment(alice_sig, alice_htlc_sigs).unwrap();

    assert_ne!(bob.constraints().feerate, 111);
    let (bob_revocation, _) = bob.revoke_current_commitment().unwrap();
    assert_eq!(bob.constraints().feerate, 111);

    let (bob_sig, bob_htlc_sigs) = bob.sign_next_commitment().unwrap();
    alice.receive_revocation(&bob_revocation).unwrap();
    alice.receive_new_commitment(bob_sig, bob_htlc_sigs).unwrap();

    assert_ne!(alice.constraints().feerate, 111);
    let (alice_revocation, _) = alice.revoke_current_commitment().unwrap();
    assert_eq!(alice.constraints().feerate, 111);

    bob.receive_revocation(&alice_revocation).unwrap();
    assert_eq!(bob.constraints().feerate, 111);
}

#[test]
fn update_fee_receiver_commits() {
    let (mut alice, mut bob) = default_channels();

    let update = alice.update_fee(111).unwrap();
    bob.receive_update_fee(&update).unwrap();

    // the receiver commits first: his signature still covers the old rate
    // on Alice's chain
    let (bob_sig, bob_htlc_sigs) = bob.sign_next_commitment().unwrap();
    alice.receive_new_commitment(bob_sig, bob_htlc_sigs).unwrap();

    let (alice_revocation, _) = alice.revoke_current_commitment().unwrap();
    bob.receive_revocation(&alice_revocation).unwrap();

    let (alice_sig, alice_htlc_sigs) = alice.sign_next_commitment().unwrap();
    bob.receive_new_commitment(alice_sig, alice_htlc_sigs).unwrap();

    assert_ne!(bob.constraints().feerate, 111);
    let (bob_revocation, _) = bob.revoke_current_commitment().unwrap();
    assert_eq!(bob.constraints().feerate, 111);

    let (bob_sig, bob_htlc_sigs) = bob.sign_next_commitment().unwrap();
    alice.receive_revocation(&bob_revocation).unwrap();
    alice.receive_new_commitment(bob_sig, bob_htlc_sigs).unwrap();

    assert_ne!(alice.constraints().feerate, 111);
    let (alice_revocation, _) = alice.revoke_current_commitment().unwrap();
    assert_eq!(alice.constraints().feerate, 111);

    bob.receive_revocation(&alice_revocation).unwrap();
    assert_eq!(bob.constraints().feerate, 111);
}

#[test]
fn update_fee_only_initiator() {
    let (mut alice, mut bob) = default_channels();
    assert!(matches!(
        bob.update_fee(500),
        Err(Error::FeeUpdateNotInitiator)
    ));
    let message = ln_channel::p2p::UpdateFee {
        channel_id: alice.channel_id(),
        feerate_per_kw: 500,
    };
    assert!(matches!(
        alice.receive_update_fee(&message),
        Err(Error::Misbehavior(MisbehaviorError::FeeUpdateFromFundee))
    ));
}

#[test]
fn desync_htlcs() {
    let (mut alice, mut bob) = default_channels();
    let (_, bob_id) = add_one_htlc(
        &mut alice,
        &mut bob,
        1,
        41 * ONE_BTC_MSAT / 10,
    );
    force_state_transition(&mut alice, &mut bob);

    let fail = bob.fail_htlc(bob_id, vec![]).unwrap();
    alice.receive_fail_htlc(&fail).unwrap();

    // The failure is not acked yet: Bob cannot assume Alice saw it, so her
    // balance is still encumbered and a 1 BTC HTLC must be refused.
    let (_, hash) = payment(2);
    let err = alice
        .add_htlc(hash, ONE_BTC_MSAT, 5, OnionPacket::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Payment(PaymentError::NotEnoughBalance { .. })
    ));

    // After a full round the failure is irrevocably committed and the
    // balance is restored.
    force_state_transition(&mut alice, &mut bob);
    alice
        .add_htlc(hash, ONE_BTC_MSAT, 5, OnionPacket::default())
        .unwrap();
}

#[test]
fn add_htlc_negative_balance() {
    let (mut alice, mut bob) = default_channels();
    // zero the fee so that the spendable-balance boundary is exact
    let update = alice.update_fee(0).unwrap();
    bob.receive_update_fee(&update).unwrap();
    force_state_transition(&mut alice, &mut bob);
    assert_eq!(alice.constraints().feerate, 0);

    for byte in 1..=3u8 {
        add_one_htlc(&mut alice, &mut bob, byte, ONE_BTC_MSAT);
    }
    // Alice has 2 BTC spendable left; a 2.5 BTC HTLC must overdraw
    let (_, hash) = payment(4);
    let err = alice
        .add_htlc(hash, 5 * ONE_BTC_MSAT / 2, 5, OnionPacket::default())
        .unwrap_err();
    match err {
        Error::Payment(PaymentError::NotEnoughBalance {
            available, ..
        }) => assert_eq!(available, 2 * ONE_BTC_MSAT),
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn sign_commitment_is_pure() {
    let (mut alice, mut bob) = default_channels();
    add_one_htlc(&mut alice, &mut bob, 1, ONE_BTC_MSAT);

    let before = alice.to_record();
    let _ = alice.sign_next_commitment().unwrap();
    let after = alice.to_record();
    assert_eq!(before, after);
}

#[test]
fn out_of_order_revocation_is_refused() {
    let (mut alice, mut bob) = default_channels();
    add_one_htlc(&mut alice, &mut bob, 1, ONE_BTC_MSAT);

    // revoking without having received a signature for the next commitment
    assert!(matches!(
        bob.revoke_current_commitment(),
        Err(Error::NoSignatureForRevocation)
    ));

    // a revocation with a wrong secret is fatal
    let (sig, htlc_sigs) = alice.sign_next_commitment().unwrap();
    bob.receive_new_commitment(sig, htlc_sigs).unwrap();
    let (mut revocation, _) = bob.revoke_current_commitment().unwrap();
    revocation.per_commitment_secret = sk(0x5e);
    assert!(matches!(
        alice.receive_revocation(&revocation),
        Err(Error::Misbehavior(
            MisbehaviorError::RevocationSecretMismatch
        ))
    ));
}

#[cfg(feature = "serde")]
#[test]
fn record_round_trip() {
    let (mut alice, mut bob) = default_channels();
    let (preimage, bob_id) =
        add_one_htlc(&mut alice, &mut bob, 1, ONE_BTC_MSAT);
    force_state_transition(&mut alice, &mut bob);
    let fulfill = bob.settle_htlc(preimage, bob_id).unwrap();
    alice.receive_htlc_settle(&fulfill).unwrap();
    force_state_transition(&mut bob, &mut alice);

    let record = alice.to_record();
    let json = serde_json::to_string(&record).unwrap();
    let parsed: ChannelState = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, record);

    let restored = Channel::from_record(parsed).unwrap();
    assert_eq!(restored.to_record(), record);
    assert_eq!(
        restored.current_commitment(Side::Local).unwrap().outputs(),
        alice.current_commitment(Side::Local).unwrap().outputs()
    );
    assert_eq!(restored.balance(Side::Local), alice.balance(Side::Local));
}

#[test]
fn watcher_registration() {
    struct Watchlist(Vec<OutPoint>);

    impl WatcherSink for Watchlist {
        fn watch(&mut self, outpoint: OutPoint, _script: PubkeyScript) {
            self.0.push(outpoint);
        }
    }

    let (alice, _bob) = default_channels();
    let mut watcher = Watchlist(vec![]);
    alice.register_funding(&mut watcher);
    assert_eq!(watcher.0, vec![alice.funding_outpoint()]);
}

struct NoInvoices;

impl PreimageLookup for NoInvoices {
    fn preimage(&self, _hashlock: HashLock) -> Option<HashPreimage> {
        None
    }
}

struct OneInvoice(HashPreimage);

impl PreimageLookup for OneInvoice {
    fn preimage(&self, hashlock: HashLock) -> Option<HashPreimage> {
        (HashLock::from(self.0) == hashlock).then(|| self.0)
    }
}

fn sweep_script() -> PubkeyScript {
    let pubkey = PublicKey::from_secret_key(SECP256K1, &sk(0x99));
    bitcoin::PublicKey::new(pubkey).wpubkey_hash().unwrap().into()
}

#[test]
fn force_close_package() {
    let (mut alice, mut bob) = default_channels();
    let (preimage_in, hash_in) = payment(1);
    let (_, hash_out) = payment(2);

    // one incoming (with known invoice) and one outgoing HTLC
    let bob_add = bob
        .add_htlc(hash_in, ONE_BTC_MSAT, 500, OnionPacket::default())
        .unwrap();
    alice.receive_htlc(&bob_add).unwrap();
    let alice_add = alice
        .add_htlc(hash_out, ONE_BTC_MSAT / 2, 600, OnionPacket::default())
        .unwrap();
    bob.receive_htlc(&alice_add).unwrap();
    force_state_transition(&mut alice, &mut bob);

    let package = alice
        .force_close(sweep_script(), &OneInvoice(preimage_in))
        .unwrap();

    // 2 balance outputs + 2 HTLC outputs
    assert_eq!(package.commitment.output.len(), 4);
    // both HTLCs claimable: the incoming one through the invoice preimage
    assert_eq!(package.htlc_claims.len(), 2);
    // sweeps: to_local plus one per second-stage transaction
    assert_eq!(package.sweeps.len(), 3);
    for claim in &package.htlc_claims {
        assert_eq!(claim.tx.input[0].previous_output.txid, package.commitment.txid());
    }

    // without the invoice the incoming HTLC can not be claimed
    let package = alice.force_close(sweep_script(), &NoInvoices).unwrap();
    assert_eq!(package.htlc_claims.len(), 1);
    assert_eq!(package.sweeps.len(), 2);
}

#[test]
fn penalty_claims_revoked_commitment() {
    let (mut alice, mut bob) = default_channels();

    // Bob's first commitment gets revoked by the round below
    let revoked = bob.force_close_tx().unwrap();
    assert_eq!(alice.commitment_number_of(&revoked), 0);

    add_one_htlc(&mut alice, &mut bob, 1, ONE_BTC_MSAT);
    force_state_transition(&mut alice, &mut bob);

    let penalty = alice.penalty_tx(&revoked, sweep_script()).unwrap();
    // the revoked commitment had no HTLC outputs: to_local plus to_remote
    assert_eq!(penalty.input.len(), 2);
    assert_eq!(penalty.output.len(), 1);
    let claimed: u64 = revoked.output.iter().map(|txout| txout.value).sum();
    assert!(penalty.output[0].value <= claimed);
    assert!(penalty.output[0].value > 0);

    // an unrevoked commitment can not be penalized
    let current = bob.force_close_tx().unwrap();
    assert!(alice.penalty_tx(&current, sweep_script()).is_err());
}
