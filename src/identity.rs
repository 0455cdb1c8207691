use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    #[error("invalid SPIFFE id: {0}")]
    InvalidSpiffeId(String),
}

/// SPIFFE identity of a workload or service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpiffeId {
    pub trust_domain: String,
    pub path: String,
}

impl SpiffeId {
    pub fn parse(id: &str) -> Result<Self, IdentityError> {
        let trimmed = id
            .strip_prefix("spiffe://")
            .ok_or_else(|| IdentityError::InvalidSpiffeId(id.to_string()))?;
        let mut parts = trimmed.splitn(2, '/');
        let trust_domain = parts
            .next()
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| IdentityError::InvalidSpiffeId(id.to_string()))?;
        let path = parts
            .next()
            .ok_or_else(|| IdentityError::InvalidSpiffeId(id.to_string()))?;
        Ok(Self {
            trust_domain: trust_domain.to_string(),
            path: format!("/{path}"),
        })
    }

    /// Identity of a service instance in a datacenter and namespace.
    pub fn for_service(trust_domain: &str, datacenter: &str, namespace: &str, service: &str) -> Self {
        Self {
            trust_domain: trust_domain.to_string(),
            path: format!("/ns/{namespace}/dc/{datacenter}/svc/{service}"),
        }
    }

    pub fn canonical(&self) -> String {
        format!("spiffe://{}{}", self.trust_domain, self.path)
    }
}
