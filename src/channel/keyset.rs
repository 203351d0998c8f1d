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

//! Channel basepoints and BOLT-3 key derivation.
//!
//! All keys appearing in commitment transaction outputs are deterministic
//! functions of a static *basepoint* and the *per-commitment point* of the
//! commitment they appear in. The per-commitment points themselves are
//! derived from a 32-byte seed via the shachain construction of BOLT-3
//! Appendix D, so that revealing the secret of an old commitment gives the
//! counterparty the corresponding revocation key without giving away any
//! newer commitment.

use amplify::{DumbDefault, Slice32, Wrapper};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};

/// Combination of a secret key and its pre-computed public counterpart
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Keypair {
    /// Public key matching the secret
    pub key: PublicKey,
    secret: SecretKey,
}

impl Keypair {
    /// Computes keypair from a secret key
    #[inline]
    pub fn with(secret: SecretKey) -> Keypair {
        Keypair {
            key: PublicKey::from_secret_key(SECP256K1, &secret),
            secret,
        }
    }

    /// Returns the secret half of the pair
    #[inline]
    pub fn secret_key(&self) -> SecretKey {
        self.secret
    }
}

impl DumbDefault for Keypair {
    fn dumb_default() -> Self {
        Keypair::with(secp256k1::ONE_KEY)
    }
}

/// Set of locally-owned basepoints used in channel transaction construction.
///
/// The private halves never leave the channel object; the remote peer knows
/// only the public basepoints from the `LocalKeyset` announced during channel
/// establishment.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct LocalKeyset {
    /// Key used in the 2-of-2 funding output multisig
    pub funding: Keypair,
    /// Base point for deriving keys in `to_remote` of the peer commitment
    pub payment_basepoint: Keypair,
    /// Base point for deriving keys used for penalty spending paths
    pub revocation_basepoint: Keypair,
    /// Base point for deriving keys in `to_local` time-locked spending paths
    pub delayed_payment_basepoint: Keypair,
    /// Base point for deriving HTLC-related keys
    pub htlc_basepoint: Keypair,
    /// Seed of the shachain producing all local per-commitment secrets
    pub per_commitment_seed: Slice32,
}

impl DumbDefault for LocalKeyset {
    fn dumb_default() -> Self {
        LocalKeyset {
            funding: Keypair::dumb_default(),
            payment_basepoint: Keypair::dumb_default(),
            revocation_basepoint: Keypair::dumb_default(),
            delayed_payment_basepoint: Keypair::dumb_default(),
            htlc_basepoint: Keypair::dumb_default(),
            per_commitment_seed: Slice32::default(),
        }
    }
}

/// Set of public basepoints announced by the remote peer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct RemoteKeyset {
    /// Public key used in the funding outpoint multisig
    pub funding_pubkey: PublicKey,
    /// Base point for deriving keys in `to_remote`
    pub payment_basepoint: PublicKey,
    /// Base point for deriving keys used for penalty spending paths
    pub revocation_basepoint: PublicKey,
    /// Base point for deriving keys in `to_local` time-locked spending paths
    pub delayed_payment_basepoint: PublicKey,
    /// Base point for deriving HTLC-related keys
    pub htlc_basepoint: PublicKey,
}

impl DumbDefault for RemoteKeyset {
    fn dumb_default() -> Self {
        RemoteKeyset {
            funding_pubkey: dumb_pubkey!(),
            payment_basepoint: dumb_pubkey!(),
            revocation_basepoint: dumb_pubkey!(),
            delayed_payment_basepoint: dumb_pubkey!(),
            htlc_basepoint: dumb_pubkey!(),
        }
    }
}

fn tweak(first: &PublicKey, second: &PublicKey) -> Scalar {
    let mut engine = sha256::Hash::engine();
    engine.input(&first.serialize());
    engine.input(&second.serialize());
    let tweak = sha256::Hash::from_engine(engine);
    Scalar::from_be_bytes(tweak.into_inner()).expect("negligible probability")
}

/// Derives `basepoint + SHA256(per_commitment_point || basepoint) * G`:
/// the localkey, remotekey, htlckey or delayedkey of a commitment, depending
/// on which basepoint is tweaked.
pub fn derive_pubkey(
    basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    basepoint
        .add_exp_tweak(SECP256K1, &tweak(&per_commitment_point, &basepoint))
        .expect("negligible probability")
}

/// Derives the secret counterpart of [`derive_pubkey`]:
/// `basepoint_secret + SHA256(per_commitment_point || basepoint)`
pub fn derive_privkey(
    basepoint_secret: SecretKey,
    per_commitment_point: PublicKey,
) -> SecretKey {
    let basepoint = PublicKey::from_secret_key(SECP256K1, &basepoint_secret);
    basepoint_secret
        .add_tweak(&tweak(&per_commitment_point, &basepoint))
        .expect("negligible probability")
}

/// Derives the revocation public key
/// `revocation_basepoint * SHA256(revocation_basepoint || per_commitment_point)
/// + per_commitment_point * SHA256(per_commitment_point ||
/// revocation_basepoint)`.
///
/// The key becomes spendable by the counterparty only once it learns the
/// per-commitment secret.
pub fn derive_revocation_pubkey(
    revocation_basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    let rev_part = revocation_basepoint
        .mul_tweak(
            SECP256K1,
            &tweak(&revocation_basepoint, &per_commitment_point),
        )
        .expect("negligible probability");
    let commitment_part = per_commitment_point
        .mul_tweak(
            SECP256K1,
            &tweak(&per_commitment_point, &revocation_basepoint),
        )
        .expect("negligible probability");
    rev_part
        .combine(&commitment_part)
        .expect("negligible probability")
}

/// Derives the revocation secret key from the revocation basepoint secret and
/// a revealed per-commitment secret. Both scalars are required, which is what
/// makes the revocation path spendable only after revocation.
pub fn derive_revocation_privkey(
    revocation_basepoint_secret: SecretKey,
    per_commitment_secret: SecretKey,
) -> SecretKey {
    let revocation_basepoint =
        PublicKey::from_secret_key(SECP256K1, &revocation_basepoint_secret);
    let per_commitment_point =
        PublicKey::from_secret_key(SECP256K1, &per_commitment_secret);

    let rev_part = revocation_basepoint_secret
        .mul_tweak(&tweak(&revocation_basepoint, &per_commitment_point))
        .expect("negligible probability");
    let commitment_part = per_commitment_secret
        .mul_tweak(&tweak(&per_commitment_point, &revocation_basepoint))
        .expect("negligible probability");
    let commitment_scalar =
        Scalar::from_be_bytes(commitment_part.secret_bytes())
            .expect("negligible probability");
    rev_part
        .add_tweak(&commitment_scalar)
        .expect("negligible probability")
}

/// Derives a secret down the shachain: flips each set bit of `index` within
/// the lowest `bits` bits, from the highest of them to the lowest, hashing
/// after each flip.
pub(super) fn shachain_derive_secret(
    base: Slice32,
    bits: u8,
    index: u64,
) -> Slice32 {
    let mut secret = base.to_inner();
    for bit in (0..bits).rev() {
        if index & (1u64 << bit) != 0 {
            secret[bit as usize / 8] ^= 1 << (bit % 8);
            secret = sha256::Hash::hash(&secret).into_inner();
        }
    }
    Slice32::from_inner(secret)
}

/// Computes the per-commitment secret at the given shachain `index` from the
/// 32-byte channel seed (BOLT-3 `generate_from_seed`)
#[inline]
pub fn per_commitment_secret_from_seed(seed: Slice32, index: u64) -> Slice32 {
    shachain_derive_secret(seed, 48, index)
}

/// Computes the public per-commitment point matching a per-commitment secret
#[inline]
pub fn per_commitment_point(secret: Slice32) -> PublicKey {
    PublicKey::from_secret_key(
        SECP256K1,
        &SecretKey::from_slice(secret.as_inner())
            .expect("negligible probability"),
    )
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use amplify::hex::ToHex;

    use super::*;
    use crate::channel::secrets::START_INDEX;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }
    macro_rules! sk {
        ($hex:expr) => {
            SecretKey::from_str($hex).unwrap()
        };
    }

    #[test]
    fn bolt3_localkey_derivation() {
        let base_point = pk!("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2");
        let per_commitment_point = pk!("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486");
        assert_eq!(
            derive_pubkey(base_point, per_commitment_point),
            pk!("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5")
        );
    }

    #[test]
    fn bolt3_localprivkey_derivation() {
        let base_secret = sk!("000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f");
        let per_commitment_point = pk!("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486");
        assert_eq!(
            derive_privkey(base_secret, per_commitment_point),
            sk!("cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f")
        );
    }

    #[test]
    fn bolt3_revocationkey_derivation() {
        let base_point = pk!("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2");
        let per_commitment_point = pk!("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486");
        assert_eq!(
            derive_revocation_pubkey(base_point, per_commitment_point),
            pk!("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0")
        );
    }

    #[test]
    fn bolt3_revocationprivkey_derivation() {
        let base_secret = sk!("000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f");
        let per_commitment_secret = sk!("1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100");
        assert_eq!(
            derive_revocation_privkey(base_secret, per_commitment_secret),
            sk!("d09ffff62ddb2297ab000cc85bcb4283fdeb6aa052affbc9dddcf33b61078110")
        );
    }

    #[test]
    fn bolt3_per_commitment_secret_generation() {
        // generate_from_seed 0 final node
        assert_eq!(
            per_commitment_secret_from_seed(
                Slice32::from_inner([0u8; 32]),
                START_INDEX
            )
            .to_hex(),
            "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"
        );
        // generate_from_seed FF final node
        assert_eq!(
            per_commitment_secret_from_seed(
                Slice32::from_inner([0xFF; 32]),
                START_INDEX
            )
            .to_hex(),
            "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"
        );
        // generate_from_seed FF alternate bits 1
        assert_eq!(
            per_commitment_secret_from_seed(
                Slice32::from_inner([0xFF; 32]),
                0xaaaaaaaaaaa
            )
            .to_hex(),
            "56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"
        );
        // generate_from_seed FF alternate bits 2
        assert_eq!(
            per_commitment_secret_from_seed(
                Slice32::from_inner([0xFF; 32]),
                0x555555555555
            )
            .to_hex(),
            "9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e5327d157"
        );
        // generate_from_seed 01 last nontrivial node
        assert_eq!(
            per_commitment_secret_from_seed(
                Slice32::from_inner([0x01; 32]),
                1
            )
            .to_hex(),
            "915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c"
        );
    }
}
