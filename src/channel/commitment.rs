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

//! Commitment transaction assembly: number obfuscation, canonical output
//! ordering and the rendered transaction view.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin_scripts::WitnessScript;
use secp256k1::PublicKey;

use super::htlc::HtlcSecret;
use super::util::Side;

const LOWER_48_BITS: u64 = 0x00_00_FF_FF_FF_FF_FF_FF;

/// Computes the obscured commitment number: the 48-bit commitment number
/// XORed with the lower 48 bits of
/// `SHA256(open_payment_basepoint || accept_payment_basepoint)`.
///
/// Obscuring makes the progress of a channel unreadable to chain observers
/// while still letting the two peers recognize the number of a broadcast
/// commitment.
pub fn obscured_commitment_number(
    commitment_number: u64,
    open_payment_basepoint: PublicKey,
    accept_payment_basepoint: PublicKey,
) -> u64 {
    let mut engine = sha256::Hash::engine();
    engine.input(&open_payment_basepoint.serialize());
    engine.input(&accept_payment_basepoint.serialize());
    let obscuring_hash = sha256::Hash::from_engine(engine);

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&obscuring_hash[24..]);
    let obscuring_factor = u64::from_be_bytes(buf) & LOWER_48_BITS;

    (commitment_number & LOWER_48_BITS) ^ obscuring_factor
}

/// A prospective commitment output before canonical sorting.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(super) struct OutputCandidate {
    pub txout: TxOut,
    /// CLTV tie-breaker; zero for non-HTLC outputs
    pub cltv: u32,
    /// Offering side and witness script for HTLC outputs
    pub htlc: Option<(Side, HtlcSecret, WitnessScript)>,
}

impl OutputCandidate {
    pub fn plain(txout: TxOut) -> OutputCandidate {
        OutputCandidate {
            txout,
            cltv: 0,
            htlc: None,
        }
    }
}

/// Location of an HTLC inside a rendered commitment transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HtlcOutputInfo {
    /// The in-flight HTLC
    pub htlc: HtlcSecret,
    /// Side which offered the HTLC
    pub owner: Side,
    /// Output index inside the commitment transaction
    pub vout: u32,
    /// Witness script locking the output
    pub witness_script: WitnessScript,
}

/// A rendered commitment transaction of one channel side at a given
/// commitment number, with enough metadata to sign or verify the HTLC
/// second-stage transactions spending it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommitmentInfo {
    /// Side whose commitment chain this transaction belongs to
    pub side: Side,
    /// Commitment number inside that chain
    pub ctn: i64,
    /// The unsigned commitment transaction
    pub tx: Transaction,
    /// Non-trimmed HTLCs in output order
    pub htlcs: Vec<HtlcOutputInfo>,
    /// Fee paid by the transaction (including trimmed amounts)
    pub fee_sat: u64,
    /// Fee rate the transaction was built with
    pub feerate_per_kw: u32,
}

impl CommitmentInfo {
    /// Outputs of the commitment transaction in canonical order
    #[inline]
    pub fn outputs(&self) -> &[TxOut] {
        &self.tx.output
    }
}

/// Sorts outputs in BIP-69 order (value ascending, then script
/// lexicographically); ties between identical HTLC outputs are broken by
/// CLTV ascending so that both peers agree on the `htlc_signature` order.
pub(super) fn lex_order(candidates: &mut [OutputCandidate]) {
    candidates.sort_by(|a, b| {
        a.txout
            .value
            .cmp(&b.txout.value)
            .then_with(|| {
                a.txout
                    .script_pubkey
                    .as_bytes()
                    .cmp(b.txout.script_pubkey.as_bytes())
            })
            .then_with(|| a.cltv.cmp(&b.cltv))
    });
}

/// Renders the final commitment transaction from sorted output candidates.
pub(super) fn assemble(
    side: Side,
    ctn: i64,
    funding_outpoint: OutPoint,
    obscured_commitment: u64,
    mut candidates: Vec<OutputCandidate>,
    fee_sat: u64,
    feerate_per_kw: u32,
) -> CommitmentInfo {
    lex_order(&mut candidates);

    let lock_time =
        (0x20u32 << 24) | (obscured_commitment as u32 & 0x00_FF_FF_FF);
    let sequence =
        (0x80u32 << 24) | ((obscured_commitment >> 24) as u32 & 0x00_FF_FF_FF);

    let mut htlcs = Vec::new();
    let mut outputs = Vec::with_capacity(candidates.len());
    for (vout, candidate) in candidates.into_iter().enumerate() {
        if let Some((owner, htlc, witness_script)) = candidate.htlc {
            htlcs.push(HtlcOutputInfo {
                htlc,
                owner,
                vout: vout as u32,
                witness_script,
            });
        }
        outputs.push(candidate.txout);
    }

    let tx = Transaction {
        version: 2,
        lock_time: bitcoin::PackedLockTime(lock_time),
        input: vec![TxIn {
            previous_output: funding_outpoint,
            script_sig: none!(),
            sequence: bitcoin::Sequence(sequence),
            witness: empty!(),
        }],
        output: outputs,
    };

    CommitmentInfo {
        side,
        ctn,
        tx,
        htlcs,
        fee_sat,
        feerate_per_kw,
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::Script;

    use super::*;

    #[test]
    fn bolt3_obscured_commitment_no() {
        let open = PublicKey::from_str("034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa").unwrap();
        let accept = PublicKey::from_str("032c0b7cf95324a07d05398b240174dc0c2be444d96b159aa6c7f7b1e668680991").unwrap();
        assert_eq!(
            obscured_commitment_number(42, open, accept),
            0x2bb038521914 ^ 42
        );
    }

    #[test]
    fn locktime_sequence_obfuscation() {
        let open = PublicKey::from_str("034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa").unwrap();
        let accept = PublicKey::from_str("032c0b7cf95324a07d05398b240174dc0c2be444d96b159aa6c7f7b1e668680991").unwrap();
        let obscured = obscured_commitment_number(42, open, accept);
        let info = assemble(
            Side::Local,
            42,
            OutPoint::default(),
            obscured,
            vec![],
            0,
            0,
        );
        assert_eq!(info.tx.lock_time.0 >> 24, 0x20);
        assert_eq!(info.tx.input[0].sequence.0 >> 24, 0x80);
        let recovered = ((info.tx.input[0].sequence.0 as u64 & 0x00_FF_FF_FF)
            << 24)
            | (info.tx.lock_time.0 as u64 & 0x00_FF_FF_FF);
        assert_eq!(recovered ^ obscured & LOWER_48_BITS, 0);
    }

    #[test]
    fn canonical_output_order() {
        let mk = |value, script: &[u8], cltv| OutputCandidate {
            txout: TxOut {
                value,
                script_pubkey: Script::from(script.to_vec()),
            },
            cltv,
            htlc: None,
        };
        let mut candidates = vec![
            mk(2000, b"\x00\x01", 0),
            mk(1000, b"\x00\x02", 0),
            mk(1000, b"\x00\x01", 500),
            mk(1000, b"\x00\x01", 400),
        ];
        lex_order(&mut candidates);
        assert_eq!(
            candidates
                .iter()
                .map(|c| (c.txout.value, c.cltv))
                .collect::<Vec<_>>(),
            vec![(1000, 400), (1000, 500), (1000, 0), (2000, 0)]
        );
    }
}
