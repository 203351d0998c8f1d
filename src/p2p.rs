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

//! BOLT-2 commitment-update messages exchanged between the channel peers.
//!
//! Only the per-channel protocol surface is defined here: the five
//! commitment-update messages plus `funding_locked`. Channel establishment
//! (`open_channel`/`accept_channel`) and connection-level messages belong to
//! the peer negotiation layer and are not part of the channel core.

use std::io;
use std::str::FromStr;

use amplify::hex::{self, FromHex};
use amplify::{Slice32, Wrapper};
use bitcoin::hashes::Hash;
use bitcoin::OutPoint;
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use lightning_encoding::{LightningDecode, LightningEncode};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey};
#[cfg(feature = "serde")]
use serde_with::{As, DisplayFromStr};

/// Total length of the BOLT-4 payment onion carried by `update_add_htlc`
pub const PAYMENT_ONION_LEN: usize = 1366;

/// Lightning network channel id: 256-bit number representing funding txid
/// XOR'ed with 32-bit funding output number
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate", transparent)
)]
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From,
    LightningEncode,
    LightningDecode,
    StrictEncode,
    StrictDecode
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex, UpperHex)]
pub struct ChannelId(
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    Slice32,
);

impl FromHex for ChannelId {
    fn from_byte_iter<I>(iter: I) -> Result<Self, hex::Error>
    where
        I: Iterator<Item = Result<u8, hex::Error>>
            + ExactSizeIterator
            + DoubleEndedIterator,
    {
        Ok(Self(Slice32::from_byte_iter(iter)?))
    }
}

impl ChannelId {
    /// Constructs channel id from a funding outpoint by XOR-ing the last two
    /// bytes of the funding txid with the funding output number
    pub fn with(funding_outpoint: OutPoint) -> Self {
        let mut slice = funding_outpoint.txid.into_inner();
        let vout = (funding_outpoint.vout as u16).to_be_bytes();
        slice[30] ^= vout[0];
        slice[31] ^= vout[1];
        ChannelId::from_inner(Slice32::from_inner(slice))
    }

    /// With some lightning messages (like error) channel id consisting of all
    /// zeros has a special meaning of "applicable to all opened channels".
    /// This function allow to detect this kind of [`ChannelId`]
    pub fn is_wildcard(&self) -> bool {
        self.to_inner().to_inner() == [0u8; 32]
    }
}

/// Short channel id pointing at the mined funding transaction.
///
/// Serialized on the wire and in persistent records as 8 bytes in big-endian
/// order (displayed as 16 hexadecimal digits).
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate", transparent)
)]
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From,
    LightningEncode,
    LightningDecode,
    StrictEncode,
    StrictDecode
)]
#[display("{0:016x}")]
pub struct ShortChannelId(
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))] u64,
);

/// Error parsing [`ShortChannelId`] from a hexadecimal string
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display("invalid short channel id hex representation `{0}`")]
pub struct ShortChannelIdParseError(String);

impl FromStr for ShortChannelId {
    type Err = ShortChannelIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16)
            .map(ShortChannelId)
            .map_err(|_| ShortChannelIdParseError(s.to_owned()))
    }
}

/// Opaque BOLT-4 sphinx packet routing the payment across the network.
///
/// The channel core treats the onion as an uninterpreted 1366-byte blob;
/// construction and peeling of the packet is the job of the routing layer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct OnionPacket(Box<[u8; PAYMENT_ONION_LEN]>);

impl Default for OnionPacket {
    fn default() -> Self {
        OnionPacket(Box::new([0u8; PAYMENT_ONION_LEN]))
    }
}

impl OnionPacket {
    #[inline]
    pub fn from_raw(data: [u8; PAYMENT_ONION_LEN]) -> OnionPacket {
        OnionPacket(Box::new(data))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl LightningEncode for OnionPacket {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        e.write_all(self.0.as_ref())?;
        Ok(PAYMENT_ONION_LEN)
    }
}

impl LightningDecode for OnionPacket {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        let mut buf = [0u8; PAYMENT_ONION_LEN];
        d.read_exact(&mut buf)?;
        Ok(OnionPacket(Box::new(buf)))
    }
}

impl strict_encoding::StrictEncode for OnionPacket {
    fn strict_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, strict_encoding::Error> {
        e.write_all(self.0.as_ref())?;
        Ok(PAYMENT_ONION_LEN)
    }
}

impl strict_encoding::StrictDecode for OnionPacket {
    fn strict_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, strict_encoding::Error> {
        let mut buf = [0u8; PAYMENT_ONION_LEN];
        d.read_exact(&mut buf)?;
        Ok(OnionPacket(Box::new(buf)))
    }
}

/// Offers a new HTLC to the remote peer. The sender commits to the payment
/// hash and the absolute timeout of the contract; the routing instructions
/// for the next hop travel inside the onion.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_add_htlc({channel_id}, {htlc_id}, {amount_msat}, ...)")]
pub struct UpdateAddHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID
    pub htlc_id: u64,

    /// The HTLC value in milli-satoshi
    pub amount_msat: u64,

    /// The payment hash, the pre-image of which controls HTLC redemption
    pub payment_hash: HashLock,

    /// The expiry height of the HTLC
    pub cltv_expiry: u32,

    /// An obfuscated list of hops and instructions for each hop along the
    /// path. It commits to the HTLC by setting the payment_hash as associated
    /// data, i.e. includes the payment_hash in the computation of HMACs. This
    /// prevents replay attacks that would reuse a previous
    /// onion_routing_packet with a different payment_hash.
    pub onion_routing_packet: OnionPacket,
}

/// Settles an incoming HTLC by revealing its payment pre-image.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_fulfill_htlc({channel_id}, {htlc_id}, ...preimages)")]
pub struct UpdateFulfillHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID
    pub htlc_id: u64,

    /// The pre-image of the payment hash, allowing HTLC redemption
    pub payment_preimage: HashPreimage,
}

/// Removes an incoming HTLC returning it unpaid to the offerer.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_fail_htlc({channel_id}, {htlc_id}, ...reason)")]
pub struct UpdateFailHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID
    pub htlc_id: u64,

    /// The reason field is an opaque encrypted blob for the benefit of the
    /// original HTLC initiator, as defined in BOLT #4.
    pub reason: Vec<u8>,
}

/// Commits to the remote per-commitment transaction and all HTLC
/// transactions spending its outputs.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("commitment_signed({channel_id}, ...signatures)")]
pub struct CommitmentSigned {
    /// The channel ID
    pub channel_id: ChannelId,

    /// A signature on the commitment transaction
    pub signature: Signature,

    /// Signatures on the HTLC transactions, in the order the corresponding
    /// HTLC outputs appear in the canonically sorted commitment transaction
    pub htlc_signatures: Vec<Signature>,
}

/// Revokes the previous local commitment by revealing its per-commitment
/// secret and hands out the point for the next-but-one commitment.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display(
    "revoke_and_ack({channel_id}, {next_per_commitment_point}, \
     ...per_commitment_secret)"
)]
pub struct RevokeAndAck {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The secret corresponding to the per-commitment point
    pub per_commitment_secret: SecretKey,

    /// The next sender-broadcast commitment transaction's per-commitment
    /// point
    pub next_per_commitment_point: PublicKey,
}

/// Adjusts the fee rate committed by both commitment transactions. May only
/// be sent by the channel funder.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("update_fee({channel_id}, {feerate_per_kw})")]
pub struct UpdateFee {
    /// The channel ID
    pub channel_id: ChannelId,

    /// Fee rate per 1000-weight of the transaction
    pub feerate_per_kw: u32,
}

/// Signals that the funding transaction reached the negotiated depth and
/// provides the per-commitment point for the next commitment transaction.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[display("funding_locked({channel_id}, {next_per_commitment_point})")]
pub struct FundingLocked {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The per-commitment point of the sender for its next (first) commitment
    /// transaction
    pub next_per_commitment_point: PublicKey,
}

/// Commitment-update messages processed and produced by the channel state
/// machine. Message framing and type ids belong to the peer transport layer.
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
#[display(inner)]
pub enum Messages {
    #[from]
    UpdateAddHtlc(UpdateAddHtlc),

    #[from]
    UpdateFulfillHtlc(UpdateFulfillHtlc),

    #[from]
    UpdateFailHtlc(UpdateFailHtlc),

    #[from]
    CommitmentSigned(CommitmentSigned),

    #[from]
    RevokeAndAck(RevokeAndAck),

    #[from]
    UpdateFee(UpdateFee),

    #[from]
    FundingLocked(FundingLocked),
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::Txid;

    use super::*;

    #[test]
    fn channel_id_from_funding() {
        let txid = Txid::from_str(
            "0101010101010101010101010101010101010101010101010101010101010101",
        )
        .unwrap();
        let channel_id = ChannelId::with(OutPoint::new(txid, 0));
        // txid bytes are reversed against the display order, so the XOR with
        // a zero vout must keep the raw bytes intact
        assert_eq!(channel_id.as_inner().as_inner()[..], [1u8; 32][..]);

        let channel_id = ChannelId::with(OutPoint::new(txid, 1));
        let mut expected = [1u8; 32];
        expected[31] ^= 1;
        assert_eq!(channel_id.as_inner().as_inner()[..], expected[..]);
        assert!(!channel_id.is_wildcard());
    }

    #[test]
    fn short_channel_id_hex() {
        let scid = ShortChannelId::from(0x0102030405060708u64);
        assert_eq!(scid.to_string(), "0102030405060708");
        assert_eq!(ShortChannelId::from_str("0102030405060708"), Ok(scid));
    }
}
