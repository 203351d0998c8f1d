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

//! The HTLC log: the replicated, lagging view of all proposed channel
//! updates.
//!
//! Each side of the channel owns a queue of updates it has proposed (adds,
//! settlements, failures). Every recorded update carries the pair of
//! commitment numbers at which it becomes visible on either side; since the
//! two commitment chains advance independently, the same update enters the
//! two chains at different times. All commitment-composition queries are a
//! deterministic function of the log and a commitment number.

use std::collections::BTreeMap;

use bitcoin_scripts::hlc::{HashLock, HashPreimage};
#[cfg(feature = "serde")]
use serde_with::{As, DisplayFromStr};

use super::util::{Direction, Side};

/// An in-flight HTLC as it appears in commitment transactions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct HtlcSecret {
    /// Amount of the HTLC in millisatoshis
    pub amount_msat: u64,
    /// Hash whose preimage unlocks the payment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub hashlock: HashLock,
    /// Update number assigned by the offering side
    pub id: u64,
    /// Absolute block height after which the HTLC expires
    pub cltv_expiry: u32,
}

/// A settled HTLC together with the revealed preimage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct HtlcKnown {
    /// Amount of the HTLC in millisatoshis
    pub amount_msat: u64,
    /// Preimage matching the HTLC hashlock
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub preimage: HashPreimage,
    /// Update number assigned by the offering side
    pub id: u64,
    /// Absolute block height after which the HTLC expires
    pub cltv_expiry: u32,
}

/// Pair of commitment numbers, one per commitment chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub(super) struct CtnPair {
    pub(super) local: i64,
    pub(super) remote: i64,
}

impl CtnPair {
    fn get(&self, side: Side) -> i64 {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
struct AddEntry {
    htlc: HtlcSecret,
    added_at: CtnPair,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
struct SettleEntry {
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    preimage: HashPreimage,
    resolved_at: CtnPair,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
struct FailEntry {
    reason: Vec<u8>,
    resolved_at: CtnPair,
}

/// Updates proposed by a single channel side, plus the number of the latest
/// committed transaction of that side's commitment chain.
///
/// The `adds` queue holds HTLCs offered by the owning side (keyed and
/// ordered by `htlc_id`); `settles` and `fails` resolve HTLCs offered by the
/// *other* side and are keyed by that side's `htlc_id`.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct UpdateLog {
    ctn: i64,
    adds: BTreeMap<u64, AddEntry>,
    settles: BTreeMap<u64, SettleEntry>,
    fails: BTreeMap<u64, FailEntry>,
}

/// The two-sided HTLC log of a channel.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct HtlcLog {
    local: UpdateLog,
    remote: UpdateLog,
}

impl HtlcLog {
    /// Creates an empty log with the given initial commitment numbers
    pub(super) fn with(local_ctn: i64, remote_ctn: i64) -> HtlcLog {
        let mut log = HtlcLog::default();
        log.local.ctn = local_ctn;
        log.remote.ctn = remote_ctn;
        log
    }

    fn queue(&self, side: Side) -> &UpdateLog {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn queue_mut(&mut self, side: Side) -> &mut UpdateLog {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    /// Number of the latest committed transaction in `side`'s commitment
    /// chain
    #[inline]
    pub fn ctn(&self, side: Side) -> i64 {
        self.queue(side).ctn
    }

    /// Both-sided visibility heights for an update recorded right now,
    /// ignoring signatures in flight
    pub(super) fn next_ctns(&self) -> CtnPair {
        CtnPair {
            local: self.local.ctn + 1,
            remote: self.remote.ctn + 1,
        }
    }

    /// Advances the commitment number of one side after a revocation
    pub(super) fn bump_ctn(&mut self, side: Side) {
        self.queue_mut(side).ctn += 1;
    }

    /// Records a new HTLC offered by `proposer`, entering each chain at the
    /// given heights
    pub(super) fn add(
        &mut self,
        proposer: Side,
        htlc: HtlcSecret,
        added_at: CtnPair,
    ) {
        self.queue_mut(proposer)
            .adds
            .insert(htlc.id, AddEntry { htlc, added_at });
    }

    /// Records a settlement proposed by `proposer` for the HTLC `htlc_id`
    /// offered by the other side
    pub(super) fn settle(
        &mut self,
        proposer: Side,
        htlc_id: u64,
        preimage: HashPreimage,
        resolved_at: CtnPair,
    ) {
        self.queue_mut(proposer).settles.insert(htlc_id, SettleEntry {
            preimage,
            resolved_at,
        });
    }

    /// Records a failure proposed by `proposer` for the HTLC `htlc_id`
    /// offered by the other side
    pub(super) fn fail(
        &mut self,
        proposer: Side,
        htlc_id: u64,
        reason: Vec<u8>,
        resolved_at: CtnPair,
    ) {
        self.queue_mut(proposer)
            .fails
            .insert(htlc_id, FailEntry { reason, resolved_at });
    }

    /// HTLC offered by `owner` under the given id
    #[inline]
    pub fn add_by_id(&self, owner: Side, htlc_id: u64) -> Option<&HtlcSecret> {
        self.queue(owner).adds.get(&htlc_id).map(|entry| &entry.htlc)
    }

    fn resolution_at(&self, owner: Side, htlc_id: u64) -> Option<CtnPair> {
        let resolver = self.queue(owner.other());
        resolver
            .settles
            .get(&htlc_id)
            .map(|entry| entry.resolved_at)
            .or_else(|| {
                resolver.fails.get(&htlc_id).map(|entry| entry.resolved_at)
            })
    }

    /// Whether a settle or fail was recorded for the HTLC offered by `owner`
    #[inline]
    pub fn is_resolved(&self, owner: Side, htlc_id: u64) -> bool {
        self.resolution_at(owner, htlc_id).is_some()
    }

    /// Whether the resolution of the HTLC has been irrevocably committed on
    /// both commitment chains
    pub fn is_fully_resolved(&self, owner: Side, htlc_id: u64) -> bool {
        self.resolution_at(owner, htlc_id)
            .map(|at| {
                at.local <= self.local.ctn && at.remote <= self.remote.ctn
            })
            .unwrap_or(false)
    }

    /// Whether the HTLC offered by `owner` is part of both latest committed
    /// transactions
    pub fn is_locked_in(&self, owner: Side, htlc_id: u64) -> bool {
        self.queue(owner)
            .adds
            .get(&htlc_id)
            .map(|entry| {
                entry.added_at.local <= self.local.ctn
                    && entry.added_at.remote <= self.remote.ctn
            })
            .unwrap_or(false)
    }

    /// HTLCs offered by `owner` which are part of `ctx_side`'s commitment
    /// number `ctn`, in `htlc_id` order
    pub fn included(
        &self,
        ctx_side: Side,
        owner: Side,
        ctn: i64,
    ) -> Vec<&HtlcSecret> {
        self.queue(owner)
            .adds
            .values()
            .filter(|entry| entry.added_at.get(ctx_side) <= ctn)
            .filter(|entry| {
                self.resolution_at(owner, entry.htlc.id)
                    .map(|at| at.get(ctx_side) > ctn)
                    .unwrap_or(true)
            })
            .map(|entry| &entry.htlc)
            .collect()
    }

    /// The set of HTLCs that appear in party `who`'s commitment at `ctn`
    /// flowing in direction `dir` (as seen by `who`). With `ctn = None` the
    /// latest committed transaction of `who` is queried.
    pub fn htlcs_by_direction(
        &self,
        who: Side,
        dir: Direction,
        ctn: Option<i64>,
    ) -> Vec<&HtlcSecret> {
        let owner = match dir {
            Direction::Sent => who,
            Direction::Received => who.other(),
        };
        self.included(who, owner, ctn.unwrap_or_else(|| self.ctn(who)))
    }

    /// Total amount of HTLCs offered by `owner` which are not yet resolved
    /// on both commitment chains. These amounts remain unavailable for
    /// spending by `owner`.
    pub fn pending_msat(&self, owner: Side) -> u64 {
        self.queue(owner)
            .adds
            .values()
            .filter(|entry| !self.is_fully_resolved(owner, entry.htlc.id))
            .map(|entry| entry.htlc.amount_msat)
            .sum()
    }

    /// Total amount settled in favor of `beneficiary` as seen by
    /// `ctx_side`'s commitment number `ctn`
    pub(super) fn settled_msat_at(
        &self,
        beneficiary: Side,
        ctx_side: Side,
        ctn: i64,
    ) -> u64 {
        let offerer = beneficiary.other();
        self.queue(beneficiary)
            .settles
            .iter()
            .filter(|(_, entry)| entry.resolved_at.get(ctx_side) <= ctn)
            .filter_map(|(id, _)| self.add_by_id(offerer, *id))
            .map(|htlc| htlc.amount_msat)
            .sum()
    }

    /// Amounts `(received_msat, sent_msat)` whose settlement entered
    /// `ctx_side`'s chain exactly at commitment number `ctn`. Used to report
    /// the monetary effect of a single revocation step.
    pub(super) fn settled_delta(&self, ctx_side: Side, ctn: i64) -> (u64, u64) {
        let sum = |proposer: Side| -> u64 {
            self.queue(proposer)
                .settles
                .iter()
                .filter(|(_, entry)| entry.resolved_at.get(ctx_side) == ctn)
                .filter_map(|(id, _)| self.add_by_id(proposer.other(), *id))
                .map(|htlc| htlc.amount_msat)
                .sum()
        };
        (sum(Side::Local), sum(Side::Remote))
    }

    /// Total amount settled in favor of `beneficiary`, counting only
    /// settlements committed on both commitment chains
    pub fn settled_msat(&self, beneficiary: Side) -> u64 {
        let offerer = beneficiary.other();
        self.queue(beneficiary)
            .settles
            .iter()
            .filter(|(_, entry)| {
                entry.resolved_at.local <= self.local.ctn
                    && entry.resolved_at.remote <= self.remote.ctn
            })
            .filter_map(|(id, _)| self.add_by_id(offerer, *id))
            .map(|htlc| htlc.amount_msat)
            .sum()
    }

    /// Opaque failure reason recorded for a failed HTLC offered by `owner`
    pub fn fail_reason(&self, owner: Side, htlc_id: u64) -> Option<&[u8]> {
        self.queue(owner.other())
            .fails
            .get(&htlc_id)
            .map(|entry| entry.reason.as_slice())
    }

    /// Looks up a known preimage for the given hashlock among recorded
    /// settlements
    pub fn preimage(&self, hashlock: HashLock) -> Option<HashPreimage> {
        for owner in [Side::Local, Side::Remote] {
            for (id, entry) in &self.queue(owner).settles {
                if self.add_by_id(owner.other(), *id).map(|h| h.hashlock)
                    == Some(hashlock)
                {
                    return Some(entry.preimage);
                }
            }
        }
        None
    }

    /// Number of HTLCs offered by `owner` which would be part of `ctx_side`'s
    /// next commitment
    pub fn pending_count(&self, ctx_side: Side, owner: Side) -> usize {
        self.included(ctx_side, owner, self.ctn(ctx_side) + 1).len()
    }

    /// All HTLCs which are part of `side`'s next commitment, tagged with
    /// their direction as seen by `side`
    pub fn pending_htlcs(
        &self,
        side: Side,
    ) -> Vec<(Direction, &HtlcSecret)> {
        let ctn = self.ctn(side) + 1;
        let mut pending: Vec<_> = self
            .included(side, side, ctn)
            .into_iter()
            .map(|htlc| (Direction::Sent, htlc))
            .collect();
        pending.extend(
            self.included(side, side.other(), ctn)
                .into_iter()
                .map(|htlc| (Direction::Received, htlc)),
        );
        pending
    }
}

#[cfg(test)]
mod test {
    use amplify::{Slice32, Wrapper};

    use super::*;

    fn htlc(id: u64, amount_msat: u64) -> HtlcSecret {
        HtlcSecret {
            amount_msat,
            hashlock: HashLock::from(Slice32::from_inner([id as u8; 32])),
            id,
            cltv_expiry: 144,
        }
    }

    #[test]
    fn add_is_visible_in_both_next_commitments() {
        let mut log = HtlcLog::with(0, 0);
        let at = log.next_ctns();
        log.add(Side::Local, htlc(0, 1000), at);

        assert!(log.included(Side::Local, Side::Local, 0).is_empty());
        assert!(log.included(Side::Remote, Side::Local, 0).is_empty());
        assert_eq!(log.included(Side::Local, Side::Local, 1).len(), 1);
        assert_eq!(log.included(Side::Remote, Side::Local, 1).len(), 1);
        assert!(!log.is_locked_in(Side::Local, 0));

        log.bump_ctn(Side::Local);
        log.bump_ctn(Side::Remote);
        assert!(log.is_locked_in(Side::Local, 0));
    }

    #[test]
    fn lagging_inclusion() {
        let mut log = HtlcLog::with(0, 0);
        log.bump_ctn(Side::Remote); // remote chain is one commitment ahead
        let at = log.next_ctns();
        log.add(Side::Local, htlc(0, 1000), at);

        // the HTLC enters each chain at its own next height
        assert_eq!(log.included(Side::Local, Side::Local, 1).len(), 1);
        assert!(log.included(Side::Remote, Side::Local, 1).is_empty());
        assert_eq!(log.included(Side::Remote, Side::Local, 2).len(), 1);
    }

    #[test]
    fn resolution_removes_from_later_commitments_only() {
        let mut log = HtlcLog::with(0, 0);
        let at = log.next_ctns();
        log.add(Side::Local, htlc(0, 1000), at);
        log.bump_ctn(Side::Local);
        log.bump_ctn(Side::Remote);

        let at = log.next_ctns();
        log.fail(Side::Remote, 0, vec![], at);
        // still part of the committed state
        assert_eq!(log.included(Side::Local, Side::Local, 1).len(), 1);
        // gone from the next one
        assert!(log.included(Side::Local, Side::Local, 2).is_empty());
        assert!(log.is_resolved(Side::Local, 0));
        assert!(!log.is_fully_resolved(Side::Local, 0));
        assert_eq!(log.pending_msat(Side::Local), 1000);

        log.bump_ctn(Side::Local);
        log.bump_ctn(Side::Remote);
        assert!(log.is_fully_resolved(Side::Local, 0));
        assert_eq!(log.pending_msat(Side::Local), 0);
        // a failed HTLC never contributes to settled totals
        assert_eq!(log.settled_msat(Side::Remote), 0);
    }

    #[test]
    fn settled_totals_and_preimage() {
        let mut log = HtlcLog::with(0, 0);
        let preimage = HashPreimage::from(Slice32::from_inner([7; 32]));
        let at = log.next_ctns();
        log.add(Side::Local, htlc(0, 5000), at);
        log.bump_ctn(Side::Local);
        log.bump_ctn(Side::Remote);

        let at = log.next_ctns();
        log.settle(Side::Remote, 0, preimage, at);
        assert_eq!(log.settled_msat(Side::Remote), 0);

        log.bump_ctn(Side::Local);
        log.bump_ctn(Side::Remote);
        assert_eq!(log.settled_msat(Side::Remote), 5000);
        assert_eq!(log.settled_msat(Side::Local), 0);
        assert_eq!(
            log.preimage(htlc(0, 5000).hashlock),
            Some(preimage)
        );
    }

    #[test]
    fn direction_queries() {
        let mut log = HtlcLog::with(0, 0);
        let at = log.next_ctns();
        log.add(Side::Local, htlc(0, 1000), at);
        assert_eq!(
            log.htlcs_by_direction(Side::Remote, Direction::Received, Some(1))
                .len(),
            1
        );
        assert!(log
            .htlcs_by_direction(Side::Remote, Direction::Sent, Some(1))
            .is_empty());
        assert_eq!(
            log.htlcs_by_direction(Side::Local, Direction::Sent, Some(1))
                .len(),
            1
        );
    }
}
