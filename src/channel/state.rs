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

//! Persistent channel state record.
//!
//! [`ChannelState`] is the complete, schema-versioned image of a channel.
//! It is strict-encodable for the opaque key-value storage boundary and
//! (with the `serde` feature) serializes to the JSON record used by wallet
//! backups, with all byte fields hex-encoded.

use std::collections::BTreeMap;

use amplify::Slice32;
use bitcoin::{OutPoint, Transaction};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::channel::FeeUpdate;
use super::htlc::HtlcLog;
use super::keyset::{LocalKeyset, RemoteKeyset};
use super::policy::{Constraints, PeerParams};
use super::secrets::RevocationStore;
use super::util::Lifecycle;
use crate::p2p::{ChannelId, ShortChannelId};

/// Version of the [`ChannelState`] schema produced by this library
pub const CHANNEL_STATE_VERSION: u16 = 1;

/// Configuration and dynamic state of the local channel side.
///
/// The local side owns private key material: basepoint secrets and the
/// per-commitment seed. Local per-commitment points are never stored; they
/// are re-derived from the seed at any commitment number.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct LocalConfig {
    /// Basepoints with their private halves
    pub keys: LocalKeyset,

    /// Channel parameters announced by the local node, constraining the
    /// remote side
    pub params: PeerParams,

    /// Balance of the local side at channel opening, in millisatoshis
    pub initial_msat: u64,

    /// Number of the latest local commitment transaction whose predecessors
    /// are all revoked. Local numbering starts at 0 with the refund
    /// transaction
    pub ctn: i64,

    /// Id which the next locally-offered HTLC will be assigned
    pub next_htlc_id: u64,

    /// Signature of the remote peer for the local commitment at `ctn`
    /// (or `ctn + 1` whenever `got_sig_for_next` is set)
    pub current_commitment_signature: Option<Signature>,

    /// Remote signatures for the second-stage HTLC transactions of the same
    /// commitment, in canonical output order
    pub current_htlc_signatures: Vec<Signature>,

    /// Set between receiving a valid `commitment_signed` and issuing the
    /// matching `revoke_and_ack`
    pub got_sig_for_next: bool,

    /// Whether `funding_locked` was received from the peer
    pub funding_locked_received: bool,
}

/// Configuration and dynamic state of the remote channel side.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct RemoteConfig {
    /// Public basepoints of the peer
    pub keys: RemoteKeyset,

    /// Channel parameters announced by the peer, constraining the local side
    pub params: PeerParams,

    /// Balance of the remote side at channel opening, in millisatoshis
    pub initial_msat: u64,

    /// Number of the latest remote commitment transaction the local node has
    /// a revocation for all predecessors of. −1 until the first remote
    /// commitment is signed
    pub ctn: i64,

    /// Id expected for the next HTLC offered by the peer
    pub next_htlc_id: u64,

    /// Per-commitment point of the remote commitment at `ctn`; `None` until
    /// the funding flow completes
    pub current_per_commitment_point: Option<PublicKey>,

    /// Per-commitment point for the next remote commitment
    pub next_per_commitment_point: PublicKey,

    /// Revoked per-commitment secrets of the peer
    pub revocation_store: RevocationStore,
}

/// Complete persistent image of a channel.
#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct ChannelState {
    /// Schema version of this record
    pub version: u16,

    /// The channel id derived from the funding outpoint
    pub channel_id: ChannelId,

    /// Mined position of the funding transaction, if known
    pub short_channel_id: Option<ShortChannelId>,

    /// Funding transaction output locking the channel capacity. The `vout`
    /// field is the funding output index
    pub funding_outpoint: OutPoint,

    /// Local side configuration and state
    pub local_config: LocalConfig,

    /// Remote side configuration and state
    pub remote_config: RemoteConfig,

    /// Channel dimensions and the committed fee rate
    pub constraints: Constraints,

    /// Node id (compressed public key) of the remote peer
    pub node_id: PublicKey,

    /// Latest remote commitment transaction, kept for the watcher until the
    /// peer revokes it
    pub remote_commitment_to_be_revoked: Option<Transaction>,

    /// Ephemeral onion shared secrets per HTLC id, opaque to the channel
    pub onion_keys: BTreeMap<u64, Slice32>,

    /// The two-sided update log
    pub log: HtlcLog,

    /// In-flight `update_fee` round, if any
    pub pending_fee_update: Option<FeeUpdate>,

    /// Current lifecycle stage
    pub state: Lifecycle,
}
