//! Seam to the roots cache entry: the set of trusted signing roots for a
//! datacenter, consumed here as a snapshot reader plus an update feed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Registration name of the roots cache type.
pub const ROOTS_TYPE_NAME: &str = "mesh-ca-roots";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCert {
    pub id: String,
    /// Hex key ID of the root's signing key, as it appears in the
    /// authority key identifier of leaves it signs.
    pub signing_key_id: String,
    pub active: bool,
    pub root_cert_pem: String,
}

/// Snapshot of the trusted roots as of `index`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexedRoots {
    /// Empty until the cluster has bootstrapped a signing authority.
    pub trust_domain: String,
    pub active_root_id: String,
    pub roots: Vec<RootCert>,
    pub index: u64,
}

impl IndexedRoots {
    /// True when the currently active root signs with `key_id`.
    ///
    /// Returns false when no root is marked active, which should not be
    /// possible in a bootstrapped cluster.
    pub fn active_root_has_key(&self, key_id: &str) -> bool {
        for root in &self.roots {
            if root.active {
                return root.signing_key_id == key_id;
            }
        }
        false
    }
}

/// Payload pushed on a subscription channel. Events may carry errors;
/// leaf subscribers ignore them because any client watching leaves is
/// watching roots too and observes the same error there.
pub type RootsEvent = Result<Arc<IndexedRoots>, RootsError>;

#[derive(Debug, Clone, Error)]
pub enum RootsError {
    #[error("roots cache unavailable: {details}")]
    Unavailable { details: String },
}

/// The roots cache entry as seen from the leaf side.
pub trait RootsCache: Send + Sync {
    /// Latest snapshot without blocking. A cache hit most of the time.
    fn current(&self, datacenter: &str) -> Result<Arc<IndexedRoots>, RootsError>;

    /// Register `tx` to receive update events until the receiving side
    /// is dropped.
    fn subscribe(&self, datacenter: &str, tx: mpsc::Sender<RootsEvent>)
        -> Result<(), RootsError>;
}
