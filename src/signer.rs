//! Seam to the signing RPC on the mesh servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub token: String,
    pub datacenter: String,
    pub csr_pem: String,
}

/// Reply from the signing servers. Validity and the authority key ID are
/// read back out of the certificate itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCert {
    pub cert_pem: String,
    /// Monotone index assigned by the signing service.
    pub modify_index: u64,
}

#[derive(Debug, Clone, Error)]
#[error("certificate signing failed: {details}")]
pub struct SignError {
    pub details: String,
}

/// Transport to the signing endpoint. Implementations perform exactly one
/// attempt per call; retrying is the caller's poll loop.
#[async_trait]
pub trait CertSigner: Send + Sync {
    async fn sign(&self, request: &SignRequest) -> Result<SignedCert, SignError>;
}
