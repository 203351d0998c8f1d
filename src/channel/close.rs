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

//! Unilateral channel close: the broadcastable commitment package and
//! penalty transactions for revoked remote commitments.

use amplify::Wrapper;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSighashType, OutPoint, Script, Transaction, TxIn, TxOut, Witness,
};
use bitcoin_scripts::{PubkeyScript, WitnessScript};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use super::channel::{Channel, Error, PreimageLookup};
use super::commitment::obscured_commitment_number;
use super::htlc::HtlcSecret;
use super::keyset::{
    derive_privkey, derive_pubkey, derive_revocation_privkey,
    derive_revocation_pubkey, per_commitment_point,
};
use super::scripts::ScriptGenerators;
use super::secrets::START_INDEX;
use super::util::Side;

/// Conservative weight estimate used for fee calculation of single-input
/// sweep transactions and of each penalty transaction input
pub const SWEEP_TX_WEIGHT: u64 = 500;

/// How an HTLC output of the broadcast local commitment is claimed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HtlcClaimKind {
    /// HTLC-timeout transaction, valid after the HTLC expiry height
    Timeout {
        /// Height encoded in the transaction locktime
        cltv_expiry: u32,
    },
    /// HTLC-success transaction carrying the payment preimage
    Success,
}

/// Fully signed second-stage transaction claiming one HTLC output of the
/// local commitment.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HtlcClaim {
    /// The broadcastable second-stage transaction
    pub tx: Transaction,
    /// Claim path
    pub kind: HtlcClaimKind,
    /// The HTLC being claimed
    pub htlc: HtlcSecret,
}

/// Everything needed to unilaterally close the channel: the signed local
/// commitment, claims for its HTLC outputs and CSV-delayed sweeps moving
/// the encumbered outputs to the wallet.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ForceClosePackage {
    /// The broadcastable local commitment transaction
    pub commitment: Transaction,
    /// Second-stage transactions for each claimable HTLC output
    pub htlc_claims: Vec<HtlcClaim>,
    /// Sweep transactions for the `to_local` output and for each
    /// second-stage output, spendable `to_self_delay` blocks after their
    /// parent confirms
    pub sweeps: Vec<Transaction>,
}

/// Spending path of a penalty transaction input.
enum PenaltyClaim {
    /// `to_local` output: TRUE selector plus the revocation signature
    Revocation(WitnessScript),
    /// HTLC output: revocation signature plus the revocation public key
    HtlcRevocation(WitnessScript),
    /// `to_remote` P2WPKH output paying to the tweaked local payment key
    ToRemote(PublicKey),
}

fn sig_push(signature: Signature) -> Vec<u8> {
    let mut der = signature.serialize_der().to_vec();
    der.push(EcdsaSighashType::All.to_u32() as u8);
    der
}

fn segwit_sighash(
    tx: &Transaction,
    vin: usize,
    script: &Script,
    value: u64,
) -> Message {
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(vin, script, value, EcdsaSighashType::All)
        .expect("input index is within the transaction");
    Message::from_slice(&sighash[..]).expect("sighash is 32 bytes")
}

/// Builds a sweep transaction moving a CSV-encumbered output (a `to_local`
/// or a second-stage HTLC output) to the wallet after the delay expires.
fn sweep_delayed_output(
    outpoint: OutPoint,
    value: u64,
    witness_script: &WitnessScript,
    delayed_privkey: SecretKey,
    to_self_delay: u16,
    sweep_script: &PubkeyScript,
    feerate_per_kw: u32,
) -> Transaction {
    let fee = feerate_per_kw as u64 * SWEEP_TX_WEIGHT / 1000;
    let mut tx = Transaction {
        version: 2,
        lock_time: bitcoin::PackedLockTime(0),
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: none!(),
            sequence: bitcoin::Sequence(to_self_delay as u32),
            witness: empty!(),
        }],
        output: vec![TxOut {
            value: value.saturating_sub(fee),
            script_pubkey: sweep_script.clone().into(),
        }],
    };
    let sighash = segwit_sighash(&tx, 0, witness_script.as_inner(), value);
    let signature = SECP256K1.sign_ecdsa(&sighash, &delayed_privkey);
    // empty element selects the OP_ELSE (delayed) branch
    tx.input[0].witness = Witness::from_vec(vec![
        sig_push(signature),
        vec![],
        witness_script.as_inner().to_bytes(),
    ]);
    tx
}

impl Channel {
    /// Extracts the commitment number from the obscured locktime and
    /// sequence fields of a commitment transaction of this channel
    pub fn commitment_number_of(&self, tx: &Transaction) -> u64 {
        let obscured = ((tx.input[0].sequence.0 as u64 & 0x00_FF_FF_FF)
            << 24)
            | (tx.lock_time.0 as u64 & 0x00_FF_FF_FF);
        let (open, accept) = self.obscuring_basepoints();
        // XOR with the factor of commitment number zero recovers the number
        obscured ^ obscured_commitment_number(0, open, accept)
    }

    /// Builds the complete unilateral close package from the latest signed
    /// local commitment.
    ///
    /// HTLC-success claims are produced only for incoming HTLCs whose
    /// preimage is known from an invoice or from a recorded settlement; the
    /// remaining incoming HTLCs can only be recovered by the peer.
    pub fn force_close(
        &self,
        sweep_script: PubkeyScript,
        preimages: &dyn PreimageLookup,
    ) -> Result<ForceClosePackage, Error> {
        let ctx = self.signed_commitment()?;
        let commitment = self.force_close_tx()?;
        let feerate = ctx.feerate_per_kw;
        let to_self_delay = self.to_self_delay(Side::Local);

        let point =
            per_commitment_point(self.local_per_commitment_secret(ctx.ctn));
        let delayed_privkey = derive_privkey(
            self.local()
                .keys
                .delayed_payment_basepoint
                .secret_key(),
            point,
        );
        let htlc_privkey = derive_privkey(
            self.local().keys.htlc_basepoint.secret_key(),
            point,
        );
        let revocationpubkey = derive_revocation_pubkey(
            self.remote().keys.revocation_basepoint,
            point,
        );
        let delayedpubkey =
            PublicKey::from_secret_key(SECP256K1, &delayed_privkey);

        let mut htlc_claims = Vec::new();
        let mut sweeps = Vec::new();

        let stage_script = WitnessScript::ln_htlc_output(
            revocationpubkey,
            delayedpubkey,
            to_self_delay,
        );
        for (pos, output) in ctx.htlcs.iter().enumerate() {
            let offered = output.owner == Side::Local;
            let preimage = if offered {
                None
            } else {
                match preimages
                    .preimage(output.htlc.hashlock)
                    .or_else(|| self.log().preimage(output.htlc.hashlock))
                {
                    Some(preimage) => Some(preimage),
                    // without a preimage the incoming HTLC is unclaimable
                    None => continue,
                }
            };

            let mut tx = self.htlc_second_stage_tx(&ctx, output)?;
            let sighash = segwit_sighash(
                &tx,
                0,
                output.witness_script.as_inner(),
                output.htlc.amount_msat / 1000,
            );
            let local_sig = SECP256K1.sign_ecdsa(&sighash, &htlc_privkey);
            let remote_sig = *self
                .local()
                .current_htlc_signatures
                .get(pos)
                .ok_or(Error::NoRemoteSignature)?;
            tx.input[0].witness = Witness::from_vec(vec![
                vec![],
                sig_push(remote_sig),
                sig_push(local_sig),
                preimage
                    .map(|preimage| AsRef::<[u8]>::as_ref(&preimage).to_vec())
                    .unwrap_or_default(),
                output.witness_script.as_inner().to_bytes(),
            ]);

            sweeps.push(sweep_delayed_output(
                OutPoint::new(tx.txid(), 0),
                tx.output[0].value,
                &stage_script,
                delayed_privkey,
                to_self_delay,
                &sweep_script,
                feerate,
            ));
            htlc_claims.push(HtlcClaim {
                tx,
                kind: if offered {
                    HtlcClaimKind::Timeout {
                        cltv_expiry: output.htlc.cltv_expiry,
                    }
                } else {
                    HtlcClaimKind::Success
                },
                htlc: output.htlc,
            });
        }

        // the to_local output of the commitment itself
        let to_local_witness = WitnessScript::ln_to_local(
            revocationpubkey,
            delayedpubkey,
            to_self_delay,
        );
        let to_local_script: Script = to_local_witness.to_p2wsh().into();
        if let Some((vout, txout)) = commitment
            .output
            .iter()
            .enumerate()
            .find(|(_, txout)| txout.script_pubkey == to_local_script)
        {
            sweeps.push(sweep_delayed_output(
                OutPoint::new(commitment.txid(), vout as u32),
                txout.value,
                &to_local_witness,
                delayed_privkey,
                to_self_delay,
                &sweep_script,
                feerate,
            ));
        }

        Ok(ForceClosePackage {
            commitment,
            htlc_claims,
            sweeps,
        })
    }

    /// Builds the penalty transaction claiming every output of a revoked
    /// remote commitment whose per-commitment secret is stored in the
    /// revocation store. All outputs are swept immediately into
    /// `sweep_script`.
    pub fn penalty_tx(
        &self,
        revoked_commitment: &Transaction,
        sweep_script: PubkeyScript,
    ) -> Result<Transaction, Error> {
        let ctn = self.commitment_number_of(revoked_commitment) as i64;
        let secret = self
            .remote()
            .revocation_store
            .retrieve(START_INDEX - ctn as u64)
            .map_err(|_| Error::NoCommitmentPoint(ctn))?;
        let per_commitment_secret =
            SecretKey::from_slice(secret.as_inner())
                .expect("shachain secrets are valid scalars");
        let point = per_commitment_point(secret);

        // the commitment is the remote one, so "local" in its scripts means
        // the remote node and the revocation key belongs to us
        let revocation_privkey = derive_revocation_privkey(
            self.local().keys.revocation_basepoint.secret_key(),
            per_commitment_secret,
        );
        let revocationpubkey =
            PublicKey::from_secret_key(SECP256K1, &revocation_privkey);
        let payment_privkey = derive_privkey(
            self.local().keys.payment_basepoint.secret_key(),
            point,
        );
        let payment_pubkey =
            PublicKey::from_secret_key(SECP256K1, &payment_privkey);
        let delayedpubkey = derive_pubkey(
            self.remote().keys.delayed_payment_basepoint,
            point,
        );

        let to_local_witness = WitnessScript::ln_to_local(
            revocationpubkey,
            delayedpubkey,
            self.to_self_delay(Side::Remote),
        );
        let to_local_script: Script = to_local_witness.to_p2wsh().into();
        let to_remote_script: Script =
            PubkeyScript::ln_to_remote(payment_pubkey).into();

        let ctx = self.commitment(Side::Remote, ctn)?;
        let mut inputs: Vec<(u32, u64, PenaltyClaim)> = Vec::new();
        for (vout, txout) in revoked_commitment.output.iter().enumerate() {
            if txout.script_pubkey == to_local_script {
                inputs.push((
                    vout as u32,
                    txout.value,
                    PenaltyClaim::Revocation(to_local_witness.clone()),
                ));
            } else if txout.script_pubkey == to_remote_script {
                inputs.push((
                    vout as u32,
                    txout.value,
                    PenaltyClaim::ToRemote(payment_pubkey),
                ));
            } else if let Some(output) = ctx.htlcs.iter().find(|output| {
                let script: Script =
                    output.witness_script.to_p2wsh().into();
                script == txout.script_pubkey
            }) {
                inputs.push((
                    vout as u32,
                    txout.value,
                    PenaltyClaim::HtlcRevocation(
                        output.witness_script.clone(),
                    ),
                ));
            }
        }

        let txid = revoked_commitment.txid();
        let total: u64 = inputs.iter().map(|(_, value, _)| *value).sum();
        let fee = ctx.feerate_per_kw as u64
            * SWEEP_TX_WEIGHT
            * inputs.len() as u64
            / 1000;
        let mut tx = Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: inputs
                .iter()
                .map(|(vout, _, _)| TxIn {
                    previous_output: OutPoint::new(txid, *vout),
                    script_sig: none!(),
                    sequence: bitcoin::Sequence(0xFFFF_FFFF),
                    witness: empty!(),
                })
                .collect(),
            output: vec![TxOut {
                value: total.saturating_sub(fee),
                script_pubkey: sweep_script.into(),
            }],
        };

        for (vin, (_, value, claim)) in inputs.iter().enumerate() {
            tx.input[vin].witness = match claim {
                PenaltyClaim::Revocation(witness_script) => {
                    let sighash = segwit_sighash(
                        &tx,
                        vin,
                        witness_script.as_inner(),
                        *value,
                    );
                    let signature =
                        SECP256K1.sign_ecdsa(&sighash, &revocation_privkey);
                    Witness::from_vec(vec![
                        sig_push(signature),
                        vec![1],
                        witness_script.as_inner().to_bytes(),
                    ])
                }
                PenaltyClaim::HtlcRevocation(witness_script) => {
                    let sighash = segwit_sighash(
                        &tx,
                        vin,
                        witness_script.as_inner(),
                        *value,
                    );
                    let signature =
                        SECP256K1.sign_ecdsa(&sighash, &revocation_privkey);
                    Witness::from_vec(vec![
                        sig_push(signature),
                        revocationpubkey.serialize().to_vec(),
                        witness_script.as_inner().to_bytes(),
                    ])
                }
                PenaltyClaim::ToRemote(pubkey) => {
                    let script_code = Script::new_p2pkh(
                        &bitcoin::PublicKey::new(*pubkey).pubkey_hash(),
                    );
                    let sighash =
                        segwit_sighash(&tx, vin, &script_code, *value);
                    let signature =
                        SECP256K1.sign_ecdsa(&sighash, &payment_privkey);
                    Witness::from_vec(vec![
                        sig_push(signature),
                        pubkey.serialize().to_vec(),
                    ])
                }
            };
        }
        Ok(tx)
    }
}
