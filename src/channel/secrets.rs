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

//! Compact storage for revoked per-commitment secrets.
//!
//! Per-commitment secrets are generated from a single seed as leaves of a
//! binary hash tree (BOLT-3 Appendix D) and revealed in decreasing index
//! order, starting from [`START_INDEX`]. A secret whose index has `b`
//! trailing zero bits can re-derive every already-revealed secret sharing its
//! upper `48 - b` bits, so at most 49 stored elements suffice to reproduce
//! the entire revocation history of 2^48 commitments.

use std::collections::BTreeMap;

use amplify::Slice32;

use super::keyset::shachain_derive_secret;

/// Shachain index of the first per-commitment secret
pub const START_INDEX: u64 = (1 << 48) - 1;

/// Errors operating the [`RevocationStore`]
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum SecretStoreError {
    /// per-commitment secret at index {found} breaks the required strictly
    /// descending revelation order; expected index {expected}
    IndexOutOfSequence { expected: u64, found: u64 },

    /// per-commitment secret at index {0} does not re-derive the previously
    /// stored secret at index {1}; the peer is not using a proper shachain
    ChainMismatch(u64, u64),

    /// per-commitment secret at index {0} was not revealed yet
    NotYetRevealed(u64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
struct ShachainElement {
    index: u64,
    secret: Slice32,
}

impl ShachainElement {
    fn zeros(&self) -> u8 {
        trailing_zeros(self.index)
    }

    fn covers(&self, index: u64) -> bool {
        let zeros = self.zeros();
        index >> zeros == self.index >> zeros
    }

    fn derive(&self, index: u64) -> Slice32 {
        shachain_derive_secret(self.secret, self.zeros(), index)
    }
}

fn trailing_zeros(index: u64) -> u8 {
    (index.trailing_zeros() as u8).min(48)
}

/// Stores up to 2^48 revoked per-commitment secrets of the remote peer in
/// O(49) space.
///
/// Inserted indices must strictly descend from [`START_INDEX`]; on each
/// insertion the new secret is verified to re-derive every stored secret it
/// claims to cover. A verification failure is fatal for the channel.
#[derive(Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct RevocationStore {
    buckets: BTreeMap<u8, ShachainElement>,
}

impl RevocationStore {
    /// Creates an empty store
    #[inline]
    pub fn new() -> RevocationStore {
        RevocationStore::default()
    }

    /// Number of secrets revealed so far
    #[inline]
    pub fn revealed_count(&self) -> u64 {
        START_INDEX - self.next_index() as u64
    }

    /// Index which the next inserted secret must have
    pub fn next_index(&self) -> u64 {
        self.buckets
            .values()
            .map(|element| element.index)
            .min()
            .map(|index| index - 1)
            .unwrap_or(START_INDEX)
    }

    /// Adds the secret revealed by the peer revocation at the given shachain
    /// index.
    ///
    /// Fails if the index does not continue the strictly descending sequence,
    /// or if the secret does not re-derive the previously stored secrets it
    /// covers.
    pub fn insert(
        &mut self,
        index: u64,
        secret: Slice32,
    ) -> Result<(), SecretStoreError> {
        let expected = self.next_index();
        if index != expected {
            return Err(SecretStoreError::IndexOutOfSequence {
                expected,
                found: index,
            });
        }

        let element = ShachainElement { index, secret };
        let bucket = element.zeros();
        for stored in self.buckets.range(..bucket).map(|(_, e)| *e) {
            if element.derive(stored.index) != stored.secret {
                return Err(SecretStoreError::ChainMismatch(
                    index,
                    stored.index,
                ));
            }
        }
        self.buckets.insert(bucket, element);
        Ok(())
    }

    /// Re-derives the secret for a previously revoked commitment.
    pub fn retrieve(&self, index: u64) -> Result<Slice32, SecretStoreError> {
        self.buckets
            .values()
            .find(|element| element.covers(index) && index >= element.index)
            .map(|element| element.derive(index))
            .ok_or(SecretStoreError::NotYetRevealed(index))
    }
}

#[cfg(test)]
mod test {
    use amplify::Wrapper;

    use super::*;
    use crate::channel::keyset::per_commitment_secret_from_seed;

    fn seed() -> Slice32 {
        Slice32::from_inner([0x42; 32])
    }

    fn filled_store(count: u64) -> RevocationStore {
        let mut store = RevocationStore::new();
        for offset in 0..count {
            let index = START_INDEX - offset;
            store
                .insert(index, per_commitment_secret_from_seed(seed(), index))
                .expect("properly derived secrets must be accepted");
        }
        store
    }

    #[test]
    fn store_round_trip() {
        let store = filled_store(1024);
        assert!(store.buckets.len() <= 49);
        assert_eq!(store.revealed_count(), 1024);
        for offset in 0..1024 {
            let index = START_INDEX - offset;
            assert_eq!(
                store.retrieve(index),
                Ok(per_commitment_secret_from_seed(seed(), index))
            );
        }
    }

    #[test]
    fn unrevealed_index_fails() {
        let store = filled_store(16);
        let unrevealed = START_INDEX - 16;
        assert_eq!(
            store.retrieve(unrevealed),
            Err(SecretStoreError::NotYetRevealed(unrevealed))
        );
    }

    #[test]
    fn non_descending_index_fails() {
        let mut store = filled_store(2);
        let index = START_INDEX - 1;
        assert_eq!(
            store.insert(
                index,
                per_commitment_secret_from_seed(seed(), index)
            ),
            Err(SecretStoreError::IndexOutOfSequence {
                expected: START_INDEX - 2,
                found: index,
            })
        );
        assert_eq!(
            store.insert(
                START_INDEX,
                per_commitment_secret_from_seed(seed(), START_INDEX)
            ),
            Err(SecretStoreError::IndexOutOfSequence {
                expected: START_INDEX - 2,
                found: START_INDEX,
            })
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let mut store = filled_store(3);
        let index = START_INDEX - 3;
        // secret from an unrelated seed can not re-derive stored history
        let foreign =
            per_commitment_secret_from_seed(Slice32::from_inner([7; 32]), index);
        let err = store.insert(index, foreign).unwrap_err();
        assert!(matches!(err, SecretStoreError::ChainMismatch(i, _) if i == index));
    }
}
