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

//! The channel state machine.
//!
//! A [`Channel`] tracks one off-chain payment channel between two nodes: the
//! two lagging commitment chains, the HTLC log, the revocation history of
//! the peer and the signatures for the latest local commitment. All
//! operations are synchronous and atomic: they either advance the in-memory
//! state and return a message/result, or leave the channel untouched and
//! return an error. The orchestrator owning the channel is responsible for
//! persisting the state returned by [`Channel::to_record`] *before* sending
//! any produced message to the peer.

use std::collections::BTreeMap;

use amplify::{Slice32, Wrapper};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, OutPoint, Transaction, Witness};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use bitcoin_scripts::{PubkeyScript, WitnessScript};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use super::commitment::{
    assemble, obscured_commitment_number, CommitmentInfo, HtlcOutputInfo,
    OutputCandidate,
};
use super::fee::{
    commitment_fee_sat, htlc_success_fee_sat, htlc_timeout_fee_sat,
    offered_htlc_trim_threshold_sat, received_htlc_trim_threshold_sat,
};
use super::htlc::{CtnPair, HtlcLog, HtlcSecret};
use super::keyset::{
    derive_privkey, derive_pubkey, derive_revocation_pubkey,
    per_commitment_point, per_commitment_secret_from_seed, LocalKeyset,
    RemoteKeyset,
};
use super::policy::{
    Constraints, PaymentError, PeerParams, BOLT3_MAX_ACCEPTED_HTLC_LIMIT,
};
use super::scripts::ScriptGenerators;
use super::secrets::{SecretStoreError, START_INDEX};
use super::state::{
    ChannelState, LocalConfig, RemoteConfig, CHANNEL_STATE_VERSION,
};
use super::util::{Direction, Lifecycle, Side};
use crate::p2p::{
    ChannelId, FundingLocked, OnionPacket, RevokeAndAck, ShortChannelId,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFee, UpdateFulfillHtlc,
};

/// Capability injected by the orchestrator for resolving payment hashes of
/// incoming HTLCs into invoice preimages.
pub trait PreimageLookup {
    /// Returns the preimage matching the hashlock, if an invoice for it is
    /// known
    fn preimage(&self, hashlock: HashLock) -> Option<HashPreimage>;
}

/// Capability injected by the orchestrator for registering outpoints with
/// the on-chain watcher.
pub trait WatcherSink {
    /// Asks the watcher to report any transaction spending the given
    /// outpoint
    fn watch(&mut self, outpoint: OutPoint, script_pubkey: PubkeyScript);
}

/// Violations of the channel protocol by the remote peer.
///
/// All of these are fatal for the channel: the caller must stop processing
/// peer messages and move the channel to [`Lifecycle::ForceClosing`].
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum MisbehaviorError {
    /// peer signature does not match the local commitment transaction
    BadCommitmentSignature,

    /// peer has provided {received} HTLC signatures while the commitment
    /// transaction has {expected} HTLC outputs
    HtlcSignatureCountMismatch { expected: usize, received: usize },

    /// peer HTLC signature at position {0} does not match the second-stage
    /// HTLC transaction
    BadHtlcSignature(usize),

    /// revealed per-commitment secret does not match the per-commitment
    /// point of the revoked commitment
    RevocationSecretMismatch,

    /// revealed per-commitment secret was rejected by the revocation store:
    /// {0}
    #[from]
    SecretStore(SecretStoreError),

    /// peer sent `update_add_htlc` with id {found} while id {expected} was
    /// expected
    UnexpectedHtlcId { expected: u64, found: u64 },

    /// peer settled HTLC with a preimage not matching its payment hash
    SettlementPreimageMismatch,

    /// peer referred to an HTLC with unknown id {0}
    UnknownHtlc(u64),

    /// peer-proposed update violates the channel policy: {0}
    #[from]
    Policy(PaymentError),

    /// `update_fee` received from the non-initiator peer
    FeeUpdateFromFundee,
}

/// Channel operation errors.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// payment can not be processed: {0}
    #[from]
    Payment(PaymentError),

    /// remote peer violated the channel protocol: {0}
    #[from]
    Misbehavior(MisbehaviorError),

    /// channel is in a state {current} incompatible with the requested
    /// operation
    LifecycleMismatch {
        current: Lifecycle,
        required: &'static [Lifecycle],
    },

    /// initial balances do not sum up to the channel capacity
    CapacityMismatch,

    /// commitment transaction number {0} can not be constructed: its
    /// per-commitment point is not known
    NoCommitmentPoint(i64),

    /// `revoke_and_ack` can be produced only after receiving a valid
    /// `commitment_signed` for the next commitment
    NoSignatureForRevocation,

    /// the channel holds no remote signature for the local commitment
    NoRemoteSignature,

    /// HTLC with id {0} is not known
    UnknownHtlc(u64),

    /// HTLC with id {0} was already settled or failed
    HtlcAlreadyResolved(u64),

    /// HTLC with id {0} is not yet locked into both commitments
    HtlcNotLockedIn(u64),

    /// provided preimage does not match the payment hash of HTLC {0}
    PreimageMismatch(u64),

    /// no invoice preimage known for payment hash {0}
    UnknownPaymentHash(HashLock),

    /// only the channel initiator may propose fee updates
    FeeUpdateNotInitiator,

    /// another fee update round is still in progress
    FeeUpdatePending,

    /// channel state record has unsupported schema version {0}
    UnsupportedStateVersion(u16),
}

/// An `update_fee` round in flight.
///
/// Fee updates propagate asymmetrically: the proposer includes the new rate
/// into the counterparty's next commitment right away, while its own
/// commitments keep the old rate until the counterparty revokes. The
/// `added_at_*` fields record the first commitment number of each chain
/// built with the new rate, filled in as the round progresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct FeeUpdate {
    /// The proposed fee rate, in satoshi per 1000-weight
    pub feerate_per_kw: u32,
    /// Side which sent the `update_fee` message
    pub proposed_by: Side,
    /// First local commitment number using the new rate
    pub added_at_local: Option<i64>,
    /// First remote commitment number using the new rate
    pub added_at_remote: Option<i64>,
}

impl FeeUpdate {
    fn added_at(&self, side: Side) -> Option<i64> {
        match side {
            Side::Local => self.added_at_local,
            Side::Remote => self.added_at_remote,
        }
    }
}

/// The channel object: a bilateral off-chain payment channel with all of its
/// mutable protocol state.
///
/// The object is not internally synchronized; callers hosting multiple
/// channels must serialize operations on each channel under an exclusive
/// lock.
#[derive(Getters, Clone, PartialEq, Debug)]
pub struct Channel {
    /// Channel id derived from the funding outpoint
    #[getter(as_copy)]
    channel_id: ChannelId,

    /// Mined position of the funding transaction, once known
    #[getter(as_copy)]
    short_channel_id: Option<ShortChannelId>,

    /// Funding transaction output locking the channel capacity
    #[getter(as_copy)]
    funding_outpoint: OutPoint,

    /// Local side configuration and dynamic state
    local: LocalConfig,

    /// Remote side configuration and dynamic state
    remote: RemoteConfig,

    /// Channel dimensions and the committed fee rate
    #[getter(as_copy)]
    constraints: Constraints,

    /// The two-sided update log
    log: HtlcLog,

    /// In-flight `update_fee` round, if any
    #[getter(as_copy)]
    pending_fee: Option<FeeUpdate>,

    /// Node id of the remote peer
    #[getter(as_copy)]
    node_id: PublicKey,

    /// Latest remote commitment, kept for the watcher until revoked
    remote_commitment_to_be_revoked: Option<Transaction>,

    /// Ephemeral onion shared secrets per HTLC id
    onion_keys: BTreeMap<u64, Slice32>,

    /// Current lifecycle stage
    #[getter(as_copy)]
    stage: Lifecycle,
}

impl Channel {
    /// Constructs the channel object right after the funding transaction was
    /// negotiated and both keysets were exchanged.
    ///
    /// The remote commitment number starts at −1: no remote commitment is
    /// signed yet and `remote_first_per_commitment_point` will be consumed
    /// by the initial commitment exchange. Local numbering starts at 0 with
    /// the refund transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn with(
        funding_outpoint: OutPoint,
        constraints: Constraints,
        local_keys: LocalKeyset,
        local_params: PeerParams,
        local_initial_msat: u64,
        remote_keys: RemoteKeyset,
        remote_params: PeerParams,
        remote_initial_msat: u64,
        remote_first_per_commitment_point: PublicKey,
        node_id: PublicKey,
    ) -> Result<Channel, Error> {
        if local_initial_msat + remote_initial_msat
            != constraints.capacity * 1000
        {
            return Err(Error::CapacityMismatch);
        }

        Ok(Channel {
            channel_id: ChannelId::with(funding_outpoint),
            short_channel_id: None,
            funding_outpoint,
            local: LocalConfig {
                keys: local_keys,
                params: local_params,
                initial_msat: local_initial_msat,
                ctn: 0,
                next_htlc_id: 0,
                current_commitment_signature: None,
                current_htlc_signatures: vec![],
                got_sig_for_next: false,
                funding_locked_received: false,
            },
            remote: RemoteConfig {
                keys: remote_keys,
                params: remote_params,
                initial_msat: remote_initial_msat,
                ctn: -1,
                next_htlc_id: 0,
                current_per_commitment_point: None,
                next_per_commitment_point: remote_first_per_commitment_point,
                revocation_store: default!(),
            },
            constraints,
            log: HtlcLog::with(0, -1),
            pending_fee: None,
            node_id,
            remote_commitment_to_be_revoked: None,
            onion_keys: empty!(),
            stage: Lifecycle::Opening,
        })
    }

    /// Restores a channel from its persistent record
    pub fn from_record(state: ChannelState) -> Result<Channel, Error> {
        if state.version != CHANNEL_STATE_VERSION {
            return Err(Error::UnsupportedStateVersion(state.version));
        }
        Ok(Channel {
            channel_id: state.channel_id,
            short_channel_id: state.short_channel_id,
            funding_outpoint: state.funding_outpoint,
            local: state.local_config,
            remote: state.remote_config,
            constraints: state.constraints,
            log: state.log,
            pending_fee: state.pending_fee_update,
            node_id: state.node_id,
            remote_commitment_to_be_revoked: state
                .remote_commitment_to_be_revoked,
            onion_keys: state.onion_keys,
            stage: state.state,
        })
    }

    /// Produces the persistent record of the current channel state.
    ///
    /// The method is pure; in particular it is safe to compare records
    /// produced before and after read-only operations.
    pub fn to_record(&self) -> ChannelState {
        ChannelState {
            version: CHANNEL_STATE_VERSION,
            channel_id: self.channel_id,
            short_channel_id: self.short_channel_id,
            funding_outpoint: self.funding_outpoint,
            local_config: self.local.clone(),
            remote_config: self.remote.clone(),
            constraints: self.constraints,
            node_id: self.node_id,
            remote_commitment_to_be_revoked: self
                .remote_commitment_to_be_revoked
                .clone(),
            onion_keys: self.onion_keys.clone(),
            log: self.log.clone(),
            pending_fee_update: self.pending_fee,
            state: self.stage,
        }
    }

    /// Registers the funding outpoint with the on-chain watcher
    pub fn register_funding(&self, watcher: &mut dyn WatcherSink) {
        watcher.watch(
            self.funding_outpoint,
            PubkeyScript::ln_funding(
                self.local.keys.funding.key,
                self.remote.keys.funding_pubkey,
            ),
        );
    }

    /// Moves the channel to another lifecycle stage. Repeating the current
    /// stage is a no-op; any other transition must be allowed by
    /// [`Lifecycle::allowed_transitions`].
    pub fn set_stage(&mut self, stage: Lifecycle) -> Result<(), Error> {
        if stage == self.stage {
            return Ok(());
        }
        if !self.stage.allowed_transitions().contains(&stage) {
            return Err(Error::LifecycleMismatch {
                current: self.stage,
                required: self.stage.allowed_transitions(),
            });
        }
        self.stage = stage;
        Ok(())
    }

    fn require_stage(
        &self,
        required: &'static [Lifecycle],
    ) -> Result<(), Error> {
        if required.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::LifecycleMismatch {
                current: self.stage,
                required,
            })
        }
    }

    // -- side-parametric accessors

    fn params(&self, side: Side) -> PeerParams {
        match side {
            Side::Local => self.local.params,
            Side::Remote => self.remote.params,
        }
    }

    fn initial_msat(&self, side: Side) -> u64 {
        match side {
            Side::Local => self.local.initial_msat,
            Side::Remote => self.remote.initial_msat,
        }
    }

    fn is_initiator(&self, side: Side) -> bool {
        (side == Side::Local) == self.constraints.is_initiator
    }

    /// Reserve which `side` itself must maintain: the one demanded by its
    /// counterparty
    fn reserve_sat(&self, side: Side) -> u64 {
        self.params(side.other()).channel_reserve_satoshis
    }

    /// Dust limit applying to `side`'s own commitment transactions
    fn dust_limit_sat(&self, side: Side) -> u64 {
        self.params(side).dust_limit_satoshis
    }

    /// CSV delay encumbering `side`'s `to_local` output: the one demanded
    /// by its counterparty
    pub(super) fn to_self_delay(&self, side: Side) -> u16 {
        self.params(side.other()).to_self_delay
    }

    fn basepoint(&self, side: Side, f: fn(&RemoteKeyset) -> PublicKey) -> PublicKey {
        match side {
            Side::Local => f(&self.local_public_keyset()),
            Side::Remote => f(&self.remote.keys),
        }
    }

    fn local_public_keyset(&self) -> RemoteKeyset {
        RemoteKeyset {
            funding_pubkey: self.local.keys.funding.key,
            payment_basepoint: self.local.keys.payment_basepoint.key,
            revocation_basepoint: self.local.keys.revocation_basepoint.key,
            delayed_payment_basepoint: self
                .local
                .keys
                .delayed_payment_basepoint
                .key,
            htlc_basepoint: self.local.keys.htlc_basepoint.key,
        }
    }

    // -- commitment chain queries

    /// Per-commitment secret of the local chain at the given commitment
    /// number
    pub(super) fn local_per_commitment_secret(&self, ctn: i64) -> Slice32 {
        per_commitment_secret_from_seed(
            self.local.keys.per_commitment_seed,
            START_INDEX - ctn as u64,
        )
    }

    /// Per-commitment point of `side`'s commitment number `ctn`.
    ///
    /// Local points are re-derived from the seed; remote points are known
    /// for the current and next commitments and, via the revocation store,
    /// for every revoked one.
    fn commitment_point(
        &self,
        side: Side,
        ctn: i64,
    ) -> Result<PublicKey, Error> {
        if ctn < 0 {
            return Err(Error::NoCommitmentPoint(ctn));
        }
        match side {
            Side::Local => Ok(per_commitment_point(
                self.local_per_commitment_secret(ctn),
            )),
            Side::Remote if ctn == self.remote.ctn + 1 => {
                Ok(self.remote.next_per_commitment_point)
            }
            Side::Remote if ctn == self.remote.ctn => self
                .remote
                .current_per_commitment_point
                .ok_or(Error::NoCommitmentPoint(ctn)),
            Side::Remote if ctn < self.remote.ctn => {
                let secret = self
                    .remote
                    .revocation_store
                    .retrieve(START_INDEX - ctn as u64)
                    .map_err(|_| Error::NoCommitmentPoint(ctn))?;
                Ok(per_commitment_point(secret))
            }
            Side::Remote => Err(Error::NoCommitmentPoint(ctn)),
        }
    }

    /// Fee rate applying to `side`'s commitment number `ctn`, taking the
    /// in-flight fee update round into account
    fn feerate_for_ctx(&self, side: Side, ctn: i64) -> u32 {
        match self.pending_fee {
            Some(fee)
                if fee.added_at(side).map(|at| ctn >= at).unwrap_or(false) =>
            {
                fee.feerate_per_kw
            }
            _ => self.constraints.feerate,
        }
    }

    /// Fee rate which `side`'s next commitment will be built with
    #[inline]
    pub fn pending_feerate(&self, side: Side) -> u32 {
        self.feerate_for_ctx(side, self.log.ctn(side) + 1)
    }

    /// Builds `side`'s commitment transaction number `ctn` from the update
    /// log.
    ///
    /// The construction is deterministic: the same log and commitment number
    /// always produce the same transaction on both peers.
    pub fn commitment(
        &self,
        side: Side,
        ctn: i64,
    ) -> Result<CommitmentInfo, Error> {
        let point = self.commitment_point(side, ctn)?;
        let feerate = self.feerate_for_ctx(side, ctn);
        let dust_limit = self.dust_limit_sat(side);

        let revocationpubkey = derive_revocation_pubkey(
            self.basepoint(side.other(), |keys| keys.revocation_basepoint),
            point,
        );
        let delayedpubkey = derive_pubkey(
            self.basepoint(side, |keys| keys.delayed_payment_basepoint),
            point,
        );
        let remotepubkey = derive_pubkey(
            self.basepoint(side.other(), |keys| keys.payment_basepoint),
            point,
        );
        let local_htlcpubkey = derive_pubkey(
            self.basepoint(side, |keys| keys.htlc_basepoint),
            point,
        );
        let remote_htlcpubkey = derive_pubkey(
            self.basepoint(side.other(), |keys| keys.htlc_basepoint),
            point,
        );

        // raw balances with in-flight amounts subtracted from their senders
        let balance_msat = |party: Side| -> u64 {
            let credits = self.log.settled_msat_at(party, side, ctn);
            let debits = self.log.settled_msat_at(party.other(), side, ctn);
            let in_flight: u64 = self
                .log
                .included(side, party, ctn)
                .iter()
                .map(|htlc| htlc.amount_msat)
                .sum();
            self.initial_msat(party) + credits - debits - in_flight
        };
        let mut to_local_msat = balance_msat(side);
        let mut to_remote_msat = balance_msat(side.other());

        // non-trimmed HTLC outputs
        let mut candidates = Vec::new();
        let mut nondust = 0usize;
        for owner in [side, side.other()] {
            let threshold = if owner == side {
                offered_htlc_trim_threshold_sat(dust_limit, feerate)
            } else {
                received_htlc_trim_threshold_sat(dust_limit, feerate)
            };
            for htlc in self.log.included(side, owner, ctn) {
                if htlc.amount_msat / 1000 < threshold {
                    continue;
                }
                nondust += 1;
                let witness_script = if owner == side {
                    WitnessScript::ln_offered_htlc(
                        revocationpubkey,
                        local_htlcpubkey,
                        remote_htlcpubkey,
                        htlc.hashlock,
                    )
                } else {
                    WitnessScript::ln_received_htlc(
                        revocationpubkey,
                        local_htlcpubkey,
                        remote_htlcpubkey,
                        htlc.cltv_expiry,
                        htlc.hashlock,
                    )
                };
                candidates.push(OutputCandidate {
                    txout: bitcoin::TxOut {
                        value: htlc.amount_msat / 1000,
                        script_pubkey: witness_script.to_p2wsh().into(),
                    },
                    cltv: htlc.cltv_expiry,
                    htlc: Some((owner, *htlc, witness_script)),
                });
            }
        }

        // the initiator pays the commitment fee
        let fee_msat = commitment_fee_sat(feerate, nondust) * 1000;
        if self.is_initiator(side) {
            to_local_msat = to_local_msat.saturating_sub(fee_msat);
        } else {
            to_remote_msat = to_remote_msat.saturating_sub(fee_msat);
        }

        if to_local_msat / 1000 >= dust_limit {
            candidates.push(OutputCandidate::plain(bitcoin::TxOut {
                value: to_local_msat / 1000,
                script_pubkey: PubkeyScript::ln_to_local(
                    revocationpubkey,
                    delayedpubkey,
                    self.to_self_delay(side),
                )
                .into(),
            }));
        }
        if to_remote_msat / 1000 >= dust_limit {
            candidates.push(OutputCandidate::plain(bitcoin::TxOut {
                value: to_remote_msat / 1000,
                script_pubkey: PubkeyScript::ln_to_remote(remotepubkey)
                    .into(),
            }));
        }

        let (open, accept) = self.obscuring_basepoints();
        let obscured =
            obscured_commitment_number(ctn as u64, open, accept);
        let output_sat: u64 = candidates
            .iter()
            .map(|candidate| candidate.txout.value)
            .sum();
        Ok(assemble(
            side,
            ctn,
            self.funding_outpoint,
            obscured,
            candidates,
            self.constraints.capacity - output_sat,
            feerate,
        ))
    }

    pub(super) fn obscuring_basepoints(&self) -> (PublicKey, PublicKey) {
        let local = self.local.keys.payment_basepoint.key;
        let remote = self.remote.keys.payment_basepoint;
        if self.constraints.is_initiator {
            (local, remote)
        } else {
            (remote, local)
        }
    }

    /// Latest committed transaction of `side`'s commitment chain
    #[inline]
    pub fn current_commitment(
        &self,
        side: Side,
    ) -> Result<CommitmentInfo, Error> {
        self.commitment(side, self.log.ctn(side))
    }

    /// The next (not yet revoked-into) transaction of `side`'s commitment
    /// chain
    #[inline]
    pub fn pending_commitment(
        &self,
        side: Side,
    ) -> Result<CommitmentInfo, Error> {
        self.commitment(side, self.log.ctn(side) + 1)
    }

    // -- balances

    /// Balance of `side` counting only fully committed settlements, in
    /// millisatoshis. In-flight HTLCs are not subtracted.
    pub fn balance(&self, side: Side) -> u64 {
        self.initial_msat(side) + self.log.settled_msat(side)
            - self.log.settled_msat(side.other())
    }

    /// Balance of `side` minus all HTLCs it has offered which are not yet
    /// resolved on both commitment chains
    pub fn balance_minus_outgoing_htlcs(&self, side: Side) -> u64 {
        self.balance(side)
            .saturating_sub(self.log.pending_msat(side))
    }

    /// Amount `side` may currently lock into a new outgoing HTLC, after the
    /// channel reserve and (for the initiator) the commitment fee
    pub fn available_to_spend(&self, side: Side) -> u64 {
        let mut available = self.balance_minus_outgoing_htlcs(side);
        if self.is_initiator(side) {
            let feerate = self.pending_feerate(side);
            let count = self.log.pending_count(side, Side::Local)
                + self.log.pending_count(side, Side::Remote);
            available = available
                .saturating_sub(commitment_fee_sat(feerate, count + 1) * 1000);
        }
        available.saturating_sub(self.reserve_sat(side) * 1000)
    }

    /// Cumulative settled amount flowing in the given direction (as seen by
    /// the local node), in millisatoshis
    pub fn total_msat(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Sent => self.log.settled_msat(Side::Remote),
            Direction::Received => self.log.settled_msat(Side::Local),
        }
    }

    // -- HTLC updates

    fn check_can_add(
        &self,
        sender: Side,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> Result<(), PaymentError> {
        if amount_msat == 0 {
            return Err(PaymentError::AmountZero);
        }
        if cltv_expiry == 0 {
            return Err(PaymentError::ExpiryZero);
        }
        let receiver_params = self.params(sender.other());
        if amount_msat < receiver_params.htlc_minimum_msat {
            return Err(PaymentError::AmountTooSmall {
                proposed: amount_msat,
                required: receiver_params.htlc_minimum_msat,
            });
        }

        let limit = self
            .local
            .params
            .max_accepted_htlcs
            .min(self.remote.params.max_accepted_htlcs)
            .min(BOLT3_MAX_ACCEPTED_HTLC_LIMIT);
        let count = self.log.pending_count(sender.other(), sender);
        if count + 1 > limit as usize {
            return Err(PaymentError::TooManyHtlcs { limit });
        }

        let available = self.available_to_spend(sender);
        if amount_msat > available {
            return Err(PaymentError::NotEnoughBalance {
                required: amount_msat,
                available,
            });
        }

        let in_flight_limit = self
            .local
            .params
            .max_htlc_value_in_flight_msat
            .min(self.remote.params.max_htlc_value_in_flight_msat);
        let total = self.log.pending_msat(sender) + amount_msat;
        if total > in_flight_limit {
            return Err(PaymentError::InFlightLimitExceeded {
                total,
                limit: in_flight_limit,
            });
        }
        Ok(())
    }

    /// Offers a new HTLC to the peer. Returns the `update_add_htlc` message
    /// to be sent after the state is persisted.
    pub fn add_htlc(
        &mut self,
        payment_hash: HashLock,
        amount_msat: u64,
        cltv_expiry: u32,
        onion_routing_packet: OnionPacket,
    ) -> Result<UpdateAddHtlc, Error> {
        self.require_stage(&[Lifecycle::Open])?;
        self.check_can_add(Side::Local, amount_msat, cltv_expiry)?;

        let htlc_id = self.local.next_htlc_id;
        self.local.next_htlc_id += 1;
        let added_at = self.record_heights();
        self.log.add(
            Side::Local,
            HtlcSecret {
                amount_msat,
                hashlock: payment_hash,
                id: htlc_id,
                cltv_expiry,
            },
            added_at,
        );
        Ok(UpdateAddHtlc {
            channel_id: self.channel_id,
            htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet,
        })
    }

    /// Processes an incoming `update_add_htlc`. Returns the id under which
    /// the HTLC was recorded.
    pub fn receive_htlc(
        &mut self,
        message: &UpdateAddHtlc,
    ) -> Result<u64, Error> {
        self.require_stage(&[Lifecycle::Open])?;
        if message.htlc_id != self.remote.next_htlc_id {
            return Err(MisbehaviorError::UnexpectedHtlcId {
                expected: self.remote.next_htlc_id,
                found: message.htlc_id,
            }
            .into());
        }
        self.check_can_add(
            Side::Remote,
            message.amount_msat,
            message.cltv_expiry,
        )
        .map_err(MisbehaviorError::from)?;

        self.remote.next_htlc_id += 1;
        let added_at = self.record_heights();
        self.log.add(
            Side::Remote,
            HtlcSecret {
                amount_msat: message.amount_msat,
                hashlock: message.payment_hash,
                id: message.htlc_id,
                cltv_expiry: message.cltv_expiry,
            },
            added_at,
        );
        Ok(message.htlc_id)
    }

    /// Heights at which an update recorded right now enters the two
    /// commitment chains. An update can not enter a local commitment the
    /// peer has already signed.
    fn record_heights(&self) -> CtnPair {
        let mut at = self.log.next_ctns();
        if self.local.got_sig_for_next {
            at.local += 1;
        }
        at
    }

    fn resolvable_htlc(
        &self,
        owner: Side,
        htlc_id: u64,
    ) -> Result<HtlcSecret, Error> {
        let htlc = *self
            .log
            .add_by_id(owner, htlc_id)
            .ok_or(Error::UnknownHtlc(htlc_id))?;
        if self.log.is_resolved(owner, htlc_id) {
            return Err(Error::HtlcAlreadyResolved(htlc_id));
        }
        if !self.log.is_locked_in(owner, htlc_id) {
            return Err(Error::HtlcNotLockedIn(htlc_id));
        }
        Ok(htlc)
    }

    /// Settles an HTLC received from the peer by revealing its preimage.
    pub fn settle_htlc(
        &mut self,
        preimage: HashPreimage,
        htlc_id: u64,
    ) -> Result<UpdateFulfillHtlc, Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        let htlc = self.resolvable_htlc(Side::Remote, htlc_id)?;
        if HashLock::from(preimage) != htlc.hashlock {
            return Err(Error::PreimageMismatch(htlc_id));
        }
        let resolved_at = self.record_heights();
        self.log.settle(Side::Local, htlc_id, preimage, resolved_at);
        Ok(UpdateFulfillHtlc {
            channel_id: self.channel_id,
            htlc_id,
            payment_preimage: preimage,
        })
    }

    /// Processes the peer settling an HTLC offered by the local node.
    pub fn receive_htlc_settle(
        &mut self,
        message: &UpdateFulfillHtlc,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        let htlc = self
            .resolvable_htlc(Side::Local, message.htlc_id)
            .map_err(|err| match err {
                Error::UnknownHtlc(id) => {
                    MisbehaviorError::UnknownHtlc(id).into()
                }
                other => other,
            })?;
        if HashLock::from(message.payment_preimage) != htlc.hashlock {
            return Err(
                MisbehaviorError::SettlementPreimageMismatch.into()
            );
        }
        let resolved_at = self.record_heights();
        self.log.settle(
            Side::Remote,
            message.htlc_id,
            message.payment_preimage,
            resolved_at,
        );
        Ok(())
    }

    /// Fails an HTLC received from the peer.
    pub fn fail_htlc(
        &mut self,
        htlc_id: u64,
        reason: Vec<u8>,
    ) -> Result<UpdateFailHtlc, Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        self.resolvable_htlc(Side::Remote, htlc_id)?;
        let resolved_at = self.record_heights();
        self.log.fail(Side::Local, htlc_id, reason.clone(), resolved_at);
        Ok(UpdateFailHtlc {
            channel_id: self.channel_id,
            htlc_id,
            reason,
        })
    }

    /// Processes the peer failing an HTLC offered by the local node.
    pub fn receive_fail_htlc(
        &mut self,
        message: &UpdateFailHtlc,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        self.resolvable_htlc(Side::Local, message.htlc_id)
            .map_err(|err| match err {
                Error::UnknownHtlc(id) => {
                    MisbehaviorError::UnknownHtlc(id).into()
                }
                other => other,
            })?;
        let resolved_at = self.record_heights();
        self.log.fail(
            Side::Remote,
            message.htlc_id,
            message.reason.clone(),
            resolved_at,
        );
        Ok(())
    }

    // -- fee updates

    /// Proposes a new fee rate for both commitment transactions. Only the
    /// channel initiator may call this.
    pub fn update_fee(
        &mut self,
        feerate_per_kw: u32,
    ) -> Result<UpdateFee, Error> {
        self.require_stage(&[Lifecycle::Open])?;
        if !self.constraints.is_initiator {
            return Err(Error::FeeUpdateNotInitiator);
        }
        if self.pending_fee.is_some() {
            return Err(Error::FeeUpdatePending);
        }
        self.pending_fee = Some(FeeUpdate {
            feerate_per_kw,
            proposed_by: Side::Local,
            added_at_local: None,
            added_at_remote: Some(self.remote.ctn + 1),
        });
        Ok(UpdateFee {
            channel_id: self.channel_id,
            feerate_per_kw,
        })
    }

    /// Processes an `update_fee` message from the peer. Fails if the local
    /// node is the channel initiator: the non-initiator may not propose
    /// fees.
    pub fn receive_update_fee(
        &mut self,
        message: &UpdateFee,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Open])?;
        if self.constraints.is_initiator {
            return Err(MisbehaviorError::FeeUpdateFromFundee.into());
        }
        if self.pending_fee.is_some() {
            return Err(Error::FeeUpdatePending);
        }
        self.pending_fee = Some(FeeUpdate {
            feerate_per_kw: message.feerate_per_kw,
            proposed_by: Side::Remote,
            added_at_local: Some(self.local.ctn + 1),
            added_at_remote: None,
        });
        Ok(())
    }

    /// Commits the pending fee rate into `constraints.feerate` once the
    /// local chain uses it, and drops the round when both chains do.
    fn commit_pending_fee(&mut self) {
        if let Some(fee) = self.pending_fee {
            let local_done = fee
                .added_at_local
                .map(|at| at <= self.local.ctn)
                .unwrap_or(false);
            let remote_done = fee
                .added_at_remote
                .map(|at| at <= self.remote.ctn)
                .unwrap_or(false);
            if local_done {
                self.constraints.feerate = fee.feerate_per_kw;
            }
            if local_done && remote_done {
                self.pending_fee = None;
            }
        }
    }

    // -- commitment round

    fn funding_witness_script(&self) -> WitnessScript {
        WitnessScript::ln_funding(
            self.local.keys.funding.key,
            self.remote.keys.funding_pubkey,
        )
    }

    fn commitment_sighash(&self, tx: &Transaction) -> Message {
        let witness_script = self.funding_witness_script();
        let sighash = SighashCache::new(tx)
            .segwit_signature_hash(
                0,
                witness_script.as_inner(),
                self.constraints.capacity,
                EcdsaSighashType::All,
            )
            .expect("commitment transaction has a single input");
        Message::from_slice(&sighash[..]).expect("sighash is 32 bytes")
    }

    /// Second-stage transaction claiming the given HTLC output of a
    /// commitment transaction: HTLC-timeout for HTLCs offered by the
    /// commitment holder, HTLC-success for received ones.
    pub fn htlc_second_stage_tx(
        &self,
        ctx: &CommitmentInfo,
        output: &HtlcOutputInfo,
    ) -> Result<Transaction, Error> {
        use super::scripts::TxGenerators;

        let offered = output.owner == ctx.side;
        let fee_sat = if offered {
            htlc_timeout_fee_sat(ctx.feerate_per_kw)
        } else {
            htlc_success_fee_sat(ctx.feerate_per_kw)
        };
        let point = self.commitment_point(ctx.side, ctx.ctn)?;
        let revocationpubkey = derive_revocation_pubkey(
            self.basepoint(ctx.side.other(), |keys| {
                keys.revocation_basepoint
            }),
            point,
        );
        let delayedpubkey = derive_pubkey(
            self.basepoint(ctx.side, |keys| keys.delayed_payment_basepoint),
            point,
        );
        Ok(Transaction::ln_htlc(
            (output.htlc.amount_msat / 1000).saturating_sub(fee_sat),
            OutPoint::new(ctx.tx.txid(), output.vout),
            if offered { output.htlc.cltv_expiry } else { 0 },
            revocationpubkey,
            delayedpubkey,
            self.to_self_delay(ctx.side),
        ))
    }

    fn htlc_sighash(
        &self,
        output: &HtlcOutputInfo,
        htlc_tx: &Transaction,
    ) -> Message {
        let sighash = SighashCache::new(htlc_tx)
            .segwit_signature_hash(
                0,
                output.witness_script.as_inner(),
                output.htlc.amount_msat / 1000,
                EcdsaSighashType::All,
            )
            .expect("second-stage transaction has a single input");
        Message::from_slice(&sighash[..]).expect("sighash is 32 bytes")
    }

    /// Signs the next commitment transaction of the remote chain together
    /// with all second-stage HTLC transactions spending it, in canonical
    /// output order.
    ///
    /// The operation is read-only: no channel state changes until the peer
    /// responds. Serializing the channel before and after produces the same
    /// record.
    pub fn sign_next_commitment(
        &self,
    ) -> Result<(Signature, Vec<Signature>), Error> {
        self.require_stage(&[
            Lifecycle::Opening,
            Lifecycle::Funded,
            Lifecycle::Open,
            Lifecycle::Closing,
        ])?;
        let ctx = self.commitment(Side::Remote, self.remote.ctn + 1)?;
        let commitment_sig = SECP256K1.sign_ecdsa(
            &self.commitment_sighash(&ctx.tx),
            &self.local.keys.funding.secret_key(),
        );

        let point = self.commitment_point(Side::Remote, ctx.ctn)?;
        let htlc_privkey = derive_privkey(
            self.local.keys.htlc_basepoint.secret_key(),
            point,
        );
        let mut htlc_signatures = Vec::with_capacity(ctx.htlcs.len());
        for output in &ctx.htlcs {
            let htlc_tx = self.htlc_second_stage_tx(&ctx, output)?;
            htlc_signatures.push(SECP256K1.sign_ecdsa(
                &self.htlc_sighash(output, &htlc_tx),
                &htlc_privkey,
            ));
        }
        Ok((commitment_sig, htlc_signatures))
    }

    /// Verifies and stores the peer's signatures for the next local
    /// commitment.
    pub fn receive_new_commitment(
        &mut self,
        signature: Signature,
        htlc_signatures: Vec<Signature>,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        let ctx = self.commitment(Side::Local, self.local.ctn + 1)?;

        SECP256K1
            .verify_ecdsa(
                &self.commitment_sighash(&ctx.tx),
                &signature,
                &self.remote.keys.funding_pubkey,
            )
            .map_err(|_| MisbehaviorError::BadCommitmentSignature)?;

        if htlc_signatures.len() != ctx.htlcs.len() {
            return Err(MisbehaviorError::HtlcSignatureCountMismatch {
                expected: ctx.htlcs.len(),
                received: htlc_signatures.len(),
            }
            .into());
        }
        let point = self.commitment_point(Side::Local, ctx.ctn)?;
        let remote_htlc_pubkey =
            derive_pubkey(self.remote.keys.htlc_basepoint, point);
        for (pos, (output, htlc_sig)) in
            ctx.htlcs.iter().zip(&htlc_signatures).enumerate()
        {
            let htlc_tx = self.htlc_second_stage_tx(&ctx, output)?;
            SECP256K1
                .verify_ecdsa(
                    &self.htlc_sighash(output, &htlc_tx),
                    htlc_sig,
                    &remote_htlc_pubkey,
                )
                .map_err(|_| MisbehaviorError::BadHtlcSignature(pos))?;
        }

        self.local.current_commitment_signature = Some(signature);
        self.local.current_htlc_signatures = htlc_signatures;
        self.local.got_sig_for_next = true;
        Ok(())
    }

    /// Verifies the peer's signature for the *initial* local commitment
    /// (the refund transaction) during the funding flow.
    pub fn receive_initial_commitment_signature(
        &mut self,
        signature: Signature,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Opening, Lifecycle::Funded])?;
        let ctx = self.commitment(Side::Local, 0)?;
        SECP256K1
            .verify_ecdsa(
                &self.commitment_sighash(&ctx.tx),
                &signature,
                &self.remote.keys.funding_pubkey,
            )
            .map_err(|_| MisbehaviorError::BadCommitmentSignature)?;
        self.local.current_commitment_signature = Some(signature);
        self.local.current_htlc_signatures = vec![];
        Ok(())
    }

    /// Revokes the current local commitment, moving the local chain to the
    /// commitment the peer has just signed.
    ///
    /// Returns the `revoke_and_ack` message together with the
    /// `(received_msat, sent_msat)` amounts whose settlement entered the
    /// local chain during this step.
    pub fn revoke_current_commitment(
        &mut self,
    ) -> Result<(RevokeAndAck, (u64, u64)), Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        if !self.local.got_sig_for_next {
            return Err(Error::NoSignatureForRevocation);
        }

        let revoked_ctn = self.local.ctn;
        let revoked_secret = self.local_per_commitment_secret(revoked_ctn);

        self.local.ctn += 1;
        self.log.bump_ctn(Side::Local);
        self.local.got_sig_for_next = false;

        if let Some(fee) = &mut self.pending_fee {
            if fee.proposed_by == Side::Remote
                && fee.added_at_remote.is_none()
            {
                fee.added_at_remote = Some(self.remote.ctn + 1);
            }
        }
        self.commit_pending_fee();

        let next_per_commitment_point = per_commitment_point(
            self.local_per_commitment_secret(self.local.ctn + 1),
        );
        let settled = self.log.settled_delta(Side::Local, self.local.ctn);
        Ok((
            RevokeAndAck {
                channel_id: self.channel_id,
                per_commitment_secret: SecretKey::from_slice(
                    revoked_secret.as_inner(),
                )
                .expect("shachain secrets are valid scalars"),
                next_per_commitment_point,
            },
            settled,
        ))
    }

    /// Processes the peer's `revoke_and_ack`, advancing the remote chain.
    ///
    /// Returns the `(received_msat, sent_msat)` amounts whose settlement
    /// entered the remote chain during this step.
    pub fn receive_revocation(
        &mut self,
        message: &RevokeAndAck,
    ) -> Result<(u64, u64), Error> {
        self.require_stage(&[Lifecycle::Open, Lifecycle::Closing])?;
        let expected = self
            .remote
            .current_per_commitment_point
            .ok_or(Error::NoCommitmentPoint(self.remote.ctn))?;
        let revealed = PublicKey::from_secret_key(
            SECP256K1,
            &message.per_commitment_secret,
        );
        if revealed != expected {
            return Err(MisbehaviorError::RevocationSecretMismatch.into());
        }

        self.remote
            .revocation_store
            .insert(
                START_INDEX - self.remote.ctn as u64,
                Slice32::from_inner(
                    message.per_commitment_secret.secret_bytes(),
                ),
            )
            .map_err(MisbehaviorError::from)?;

        self.remote.ctn += 1;
        self.log.bump_ctn(Side::Remote);
        self.remote.current_per_commitment_point =
            Some(self.remote.next_per_commitment_point);
        self.remote.next_per_commitment_point =
            message.next_per_commitment_point;

        if let Some(fee) = &mut self.pending_fee {
            if fee.proposed_by == Side::Local && fee.added_at_local.is_none()
            {
                fee.added_at_local = Some(self.local.ctn + 1);
            }
        }
        self.commit_pending_fee();

        self.remote_commitment_to_be_revoked =
            Some(self.commitment(Side::Remote, self.remote.ctn)?.tx);

        Ok(self.log.settled_delta(Side::Remote, self.remote.ctn))
    }

    // -- funding flow

    /// Composes the `funding_locked` message announcing the next local
    /// per-commitment point
    pub fn compose_funding_locked(&self) -> FundingLocked {
        FundingLocked {
            channel_id: self.channel_id,
            next_per_commitment_point: per_commitment_point(
                self.local_per_commitment_secret(self.local.ctn + 1),
            ),
        }
    }

    /// Processes the peer's `funding_locked`: rotates the initial remote
    /// per-commitment point into place and opens the channel.
    pub fn funding_locked(
        &mut self,
        short_channel_id: Option<ShortChannelId>,
        next_per_commitment_point: PublicKey,
    ) -> Result<(), Error> {
        self.require_stage(&[
            Lifecycle::Opening,
            Lifecycle::Funded,
            Lifecycle::Open,
        ])?;
        if self.remote.ctn == -1 {
            self.remote.current_per_commitment_point =
                Some(self.remote.next_per_commitment_point);
            self.remote.next_per_commitment_point =
                next_per_commitment_point;
            self.remote.ctn = 0;
            self.log.bump_ctn(Side::Remote);
        }
        self.local.funding_locked_received = true;
        if short_channel_id.is_some() {
            self.short_channel_id = short_channel_id;
        }
        self.stage = Lifecycle::Open;
        Ok(())
    }

    // -- force close

    /// Checks whether the stored remote signature covers the given local
    /// commitment transaction
    pub fn signature_fits(&self, ctx: &CommitmentInfo) -> bool {
        match self.local.current_commitment_signature {
            Some(signature) => SECP256K1
                .verify_ecdsa(
                    &self.commitment_sighash(&ctx.tx),
                    &signature,
                    &self.remote.keys.funding_pubkey,
                )
                .is_ok(),
            None => false,
        }
    }

    /// The local commitment the stored remote signature belongs to: the
    /// pending one if a new signature has arrived, the current one
    /// otherwise.
    pub fn signed_commitment(&self) -> Result<CommitmentInfo, Error> {
        let ctn = if self.local.got_sig_for_next {
            self.local.ctn + 1
        } else {
            self.local.ctn
        };
        self.commitment(Side::Local, ctn)
    }

    pub(super) fn funding_witness(
        &self,
        local_sig: Signature,
        remote_sig: Signature,
    ) -> Witness {
        let ser = |sig: Signature| -> Vec<u8> {
            let mut der = sig.serialize_der().to_vec();
            der.push(EcdsaSighashType::All.to_u32() as u8);
            der
        };
        let local_key = self.local.keys.funding.key.serialize();
        let remote_key = self.remote.keys.funding_pubkey.serialize();
        let (first, second) = if local_key < remote_key {
            (local_sig, remote_sig)
        } else {
            (remote_sig, local_sig)
        };
        Witness::from_vec(vec![
            vec![],
            ser(first),
            ser(second),
            self.funding_witness_script().as_inner().to_bytes(),
        ])
    }

    /// Builds the broadcastable local commitment transaction with the full
    /// funding witness, combining the local signature with the stored
    /// remote one.
    pub fn force_close_tx(&self) -> Result<Transaction, Error> {
        let remote_sig = self
            .local
            .current_commitment_signature
            .ok_or(Error::NoRemoteSignature)?;
        let ctx = self.signed_commitment()?;
        let local_sig = SECP256K1.sign_ecdsa(
            &self.commitment_sighash(&ctx.tx),
            &self.local.keys.funding.secret_key(),
        );
        let mut tx = ctx.tx;
        tx.input[0].witness = self.funding_witness(local_sig, remote_sig);
        Ok(tx)
    }

    /// Resolves the preimage for an incoming HTLC through the injected
    /// invoice lookup, falling back to preimages already recorded in the
    /// update log.
    pub fn preimage_for(
        &self,
        lookup: &dyn PreimageLookup,
        htlc_id: u64,
    ) -> Result<HashPreimage, Error> {
        let htlc = self
            .log
            .add_by_id(Side::Remote, htlc_id)
            .ok_or(Error::UnknownHtlc(htlc_id))?;
        lookup
            .preimage(htlc.hashlock)
            .or_else(|| self.log.preimage(htlc.hashlock))
            .ok_or(Error::UnknownPaymentHash(htlc.hashlock))
    }
}
