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

mod keyset;
mod policy;
mod secrets;
mod state;
mod util;

#[allow(clippy::module_inception)]
mod channel;
mod close;
mod commitment;
mod fee;
mod htlc;
mod scripts;

pub use channel::{
    Channel, Error, FeeUpdate, MisbehaviorError, PreimageLookup, WatcherSink,
};
pub use close::{
    ForceClosePackage, HtlcClaim, HtlcClaimKind, SWEEP_TX_WEIGHT,
};
pub use commitment::{
    obscured_commitment_number, CommitmentInfo, HtlcOutputInfo,
};
pub use fee::{
    commitment_fee_sat, commitment_weight, htlc_success_fee_sat,
    htlc_timeout_fee_sat, received_htlc_trim_threshold_sat,
    offered_htlc_trim_threshold_sat, COMMITMENT_TX_WEIGHT, HTLC_OUTPUT_WEIGHT,
    HTLC_SUCCESS_WEIGHT, HTLC_TIMEOUT_WEIGHT,
};
pub use htlc::{HtlcKnown, HtlcLog, HtlcSecret, UpdateLog};
pub use keyset::{
    derive_privkey, derive_pubkey, derive_revocation_privkey,
    derive_revocation_pubkey, per_commitment_point,
    per_commitment_secret_from_seed, Keypair, LocalKeyset, RemoteKeyset,
};
pub use policy::{
    Constraints, PaymentError, PeerParams, BOLT3_MAX_ACCEPTED_HTLC_LIMIT,
};
pub use scripts::{ScriptGenerators, TxGenerators};
pub use secrets::{RevocationStore, SecretStoreError, START_INDEX};
pub use state::{
    ChannelState, LocalConfig, RemoteConfig, CHANNEL_STATE_VERSION,
};
pub use util::{Direction, Lifecycle, Side};
