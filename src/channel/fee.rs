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

//! BOLT-3 transaction weights, fees and dust trimming thresholds.
//!
//! All fee rates are expressed in satoshis per 1000 weight units; divisions
//! round down, matching the protocol requirements.

/// Weight of the commitment transaction without any HTLC outputs
pub const COMMITMENT_TX_WEIGHT: u64 = 724;

/// Weight added to the commitment transaction by a single HTLC output
pub const HTLC_OUTPUT_WEIGHT: u64 = 172;

/// Weight of the HTLC-timeout transaction claiming an offered HTLC
pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;

/// Weight of the HTLC-success transaction claiming a received HTLC
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;

/// Weight of the commitment transaction carrying `htlc_count` non-trimmed
/// HTLC outputs
#[inline]
pub fn commitment_weight(htlc_count: usize) -> u64 {
    COMMITMENT_TX_WEIGHT + HTLC_OUTPUT_WEIGHT * htlc_count as u64
}

/// Fee of the commitment transaction, paid by the channel funder
#[inline]
pub fn commitment_fee_sat(feerate_per_kw: u32, htlc_count: usize) -> u64 {
    feerate_per_kw as u64 * commitment_weight(htlc_count) / 1000
}

/// Fee of the second-stage HTLC-timeout transaction
#[inline]
pub fn htlc_timeout_fee_sat(feerate_per_kw: u32) -> u64 {
    feerate_per_kw as u64 * HTLC_TIMEOUT_WEIGHT / 1000
}

/// Fee of the second-stage HTLC-success transaction
#[inline]
pub fn htlc_success_fee_sat(feerate_per_kw: u32) -> u64 {
    feerate_per_kw as u64 * HTLC_SUCCESS_WEIGHT / 1000
}

/// Smallest amount of an offered HTLC which still produces an output on a
/// commitment transaction with the given dust limit. Smaller HTLCs are
/// trimmed: they have no output and their value is added to the fee.
#[inline]
pub fn offered_htlc_trim_threshold_sat(
    dust_limit_sat: u64,
    feerate_per_kw: u32,
) -> u64 {
    dust_limit_sat + htlc_timeout_fee_sat(feerate_per_kw)
}

/// Smallest amount of a received HTLC which still produces an output on a
/// commitment transaction with the given dust limit
#[inline]
pub fn received_htlc_trim_threshold_sat(
    dust_limit_sat: u64,
    feerate_per_kw: u32,
) -> u64 {
    dust_limit_sat + htlc_success_fee_sat(feerate_per_kw)
}
