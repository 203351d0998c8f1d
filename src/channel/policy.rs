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

#[cfg(feature = "serde")]
use amplify::ToYamlString;

/// Limit for the maximum number of the accepted HTLCs towards some node
pub const BOLT3_MAX_ACCEPTED_HTLC_LIMIT: u16 = 483;

/// Reasons for refusing to add a new HTLC to the channel.
///
/// All of them are recoverable: the channel state is left unchanged and the
/// caller may retry with different parameters. The same conditions detected
/// on values proposed by the remote peer are protocol violations instead.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Display,
    Error,
    StrictEncode,
    StrictDecode
)]
#[display(doc_comments)]
pub enum PaymentError {
    /// HTLC amount must be greater than zero
    AmountZero,

    /// HTLC expiry height must be greater than zero
    ExpiryZero,

    /// HTLC amount {proposed} msat is less than the minimum {required}
    /// msat accepted by the receiving node
    AmountTooSmall { proposed: u64, required: u64 },

    /// not enough local balance: {required} msat needed to pay the HTLC
    /// while only {available} msat are spendable after the channel reserve
    /// and commitment fee
    NotEnoughBalance { required: u64, available: u64 },

    /// adding the HTLC would exceed the limit of {limit} concurrently
    /// pending HTLCs
    TooManyHtlcs { limit: u16 },

    /// adding the HTLC would bring the total in-flight amount {total} msat
    /// over the negotiated maximum of {limit} msat
    InFlightLimitExceeded { total: u64, limit: u64 },
}

/// Channel parameters announced by one of the peers during the channel
/// establishment. Constrains the transactions and updates produced by the
/// *other* peer, except for the dust limit which applies to the announcing
/// side's own commitment transactions.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Display, Serialize, Deserialize),
    serde(crate = "serde_crate"),
    display(PeerParams::to_yaml_string)
)]
pub struct PeerParams {
    /// The threshold below which outputs on transactions broadcast by the
    /// announcing side will be omitted
    pub dust_limit_satoshis: u64,

    /// The number of blocks which the counterparty will have to wait to claim
    /// on-chain funds if they broadcast a commitment transaction
    pub to_self_delay: u16,

    /// Indicates the smallest value HTLC this node will accept
    pub htlc_minimum_msat: u64,

    /// The maximum inbound HTLC value in flight towards the announcing node,
    /// in milli-satoshi
    pub max_htlc_value_in_flight_msat: u64,

    /// The minimum value unencumbered by HTLCs for the counterparty to keep
    /// in the channel
    pub channel_reserve_satoshis: u64,

    /// The maximum number of inbound HTLCs towards the announcing node
    pub max_accepted_htlcs: u16,
}

#[cfg(feature = "serde")]
impl ToYamlString for PeerParams {}

impl Default for PeerParams {
    /// Sets reasonable values for the channel parameters requested from the
    /// other peer in sent `open_channel` or `accept_channel` messages
    fn default() -> Self {
        PeerParams {
            dust_limit_satoshis: 354,
            to_self_delay: 144,
            htlc_minimum_msat: 1,
            max_htlc_value_in_flight_msat: 1_000_000_000,
            channel_reserve_satoshis: 10000,
            max_accepted_htlcs: BOLT3_MAX_ACCEPTED_HTLC_LIMIT,
        }
    }
}

/// Immutable channel dimensions agreed during establishment plus the
/// currently committed fee rate.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Display, Serialize, Deserialize),
    serde(crate = "serde_crate"),
    display(Constraints::to_yaml_string)
)]
pub struct Constraints {
    /// Total channel capacity locked into the funding output, in satoshis
    pub capacity: u64,

    /// Whether the local node has funded the channel. The initiator pays the
    /// on-chain fees of the commitment transactions
    pub is_initiator: bool,

    /// Number of confirmations the funding transaction required before the
    /// channel became operational
    pub funding_txn_minimum_depth: u32,

    /// Fee rate currently committed by both sides, in satoshi per
    /// 1000-weight. Updated only by a completed `update_fee` round
    pub feerate: u32,
}

#[cfg(feature = "serde")]
impl ToYamlString for Constraints {}
