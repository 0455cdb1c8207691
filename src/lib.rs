//! Agent-side leaf-certificate machinery for a service mesh.
//!
//! The centerpiece is [`LeafCache`], a blocking-query cache entry that
//! hands out short-lived per-service identity certificates. It renews
//! certificates inside a jittered soft/hard window, watches the cluster's
//! signing roots through a shared background task, and paces re-issuance
//! after a root rotation so fleets do not stampede the signing servers.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod cache;
pub mod identity;
pub mod leaf;
pub mod roots;
pub mod signer;

pub use cache::{
    BoxError, CacheEntry, CacheRequest, CacheValue, EntryState, FetchOptions, FetchResult,
    RequestInfo,
};
pub use identity::{IdentityError, SpiffeId};
pub use leaf::{
    crypto::CryptoError,
    policy::{pick_renewal_target, random_stagger, soft_expiry},
    FetchState, IssuedCert, LeafCache, LeafCacheConfig, LeafError, LeafRequest, LEAF_TYPE_NAME,
};
pub use roots::{IndexedRoots, RootCert, RootsCache, RootsError, RootsEvent, ROOTS_TYPE_NAME};
pub use signer::{CertSigner, SignError, SignRequest, SignedCert};
