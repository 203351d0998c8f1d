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

use std::ops::Not;
use std::str::FromStr;

/// Side of the channel: the node operating this channel object ([`Side::Local`])
/// or its peer ([`Side::Remote`]).
///
/// Each side owns its own chain of commitment transactions and its own queue
/// of proposed updates; most channel queries are parameterized by the side
/// they apply to.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate", rename_all = "UPPERCASE")
)]
pub enum Side {
    /// The local node
    #[display("LOCAL")]
    Local,

    /// The remote peer
    #[display("REMOTE")]
    Remote,
}

impl Side {
    /// Returns the opposite channel side
    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl Not for Side {
    type Output = Side;

    #[inline]
    fn not(self) -> Side {
        self.other()
    }
}

/// Direction of an HTLC flow relative to some channel side.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate", rename_all = "UPPERCASE")
)]
pub enum Direction {
    /// HTLC offered by the side in question
    #[display("SENT")]
    Sent,

    /// HTLC offered to the side in question
    #[display("RECEIVED")]
    Received,
}

/// Channel lifecycle: states of the channel state machine.
///
/// Transitions are triggered by external events observed by the orchestrator
/// (funding transaction mined, cooperative close negotiated, watcher noticing
/// a closing transaction) and are idempotent with respect to repeated calls.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[repr(u8)]
pub enum Lifecycle {
    /// Funding transaction is being negotiated, no key material exchanged yet
    #[display("PREOPENING")]
    PreOpening,

    /// Key material exchanged, initial commitment signatures being traded
    #[display("OPENING")]
    Opening,

    /// Funding transaction published but not yet at the required depth
    #[display("FUNDED")]
    Funded,

    /// Channel is operational
    #[display("OPEN")]
    Open,

    /// Cooperative close is in progress
    #[display("CLOSING")]
    Closing,

    /// Local commitment has been or is about to be broadcast
    #[display("FORCE_CLOSING")]
    ForceClosing,

    /// Channel is fully settled on-chain
    #[display("CLOSED")]
    Closed,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::PreOpening
    }
}

impl Lifecycle {
    /// Set of stages the channel may move to from the current stage. A
    /// transition to the current stage itself is always allowed (idempotency
    /// of externally-driven events).
    pub fn allowed_transitions(self) -> &'static [Lifecycle] {
        match self {
            Lifecycle::PreOpening => &[Lifecycle::Opening],
            Lifecycle::Opening => {
                &[Lifecycle::Funded, Lifecycle::ForceClosing]
            }
            Lifecycle::Funded => &[Lifecycle::Open, Lifecycle::ForceClosing],
            Lifecycle::Open => {
                &[Lifecycle::Closing, Lifecycle::ForceClosing]
            }
            Lifecycle::Closing => &[
                Lifecycle::Open,
                Lifecycle::ForceClosing,
                Lifecycle::Closed,
            ],
            Lifecycle::ForceClosing => &[Lifecycle::Closed],
            Lifecycle::Closed => &[],
        }
    }
}

/// Error parsing [`Lifecycle`] from a string representation
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display("unknown channel lifecycle stage name `{0}`")]
pub struct LifecycleParseError(String);

impl FromStr for Lifecycle {
    type Err = LifecycleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_uppercase().as_str() {
            "PREOPENING" => Lifecycle::PreOpening,
            "OPENING" => Lifecycle::Opening,
            "FUNDED" => Lifecycle::Funded,
            "OPEN" => Lifecycle::Open,
            "CLOSING" => Lifecycle::Closing,
            "FORCE_CLOSING" => Lifecycle::ForceClosing,
            "CLOSED" => Lifecycle::Closed,
            _ => return Err(LifecycleParseError(s.to_owned())),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn side_other() {
        assert_eq!(Side::Local.other(), Side::Remote);
        assert_eq!(!Side::Remote, Side::Local);
    }

    #[test]
    fn lifecycle_str_round_trip() {
        for stage in [
            Lifecycle::PreOpening,
            Lifecycle::Opening,
            Lifecycle::Funded,
            Lifecycle::Open,
            Lifecycle::Closing,
            Lifecycle::ForceClosing,
            Lifecycle::Closed,
        ] {
            assert_eq!(stage.to_string().parse::<Lifecycle>(), Ok(stage));
        }
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(Lifecycle::Open
            .allowed_transitions()
            .contains(&Lifecycle::ForceClosing));
        assert!(!Lifecycle::Closed
            .allowed_transitions()
            .contains(&Lifecycle::Open));
    }
}
