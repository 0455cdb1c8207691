//! Key generation, CSR construction, and parsing of signed leaves.

use std::time::{Duration, Instant, SystemTime};

use rcgen::{CertificateParams, Ia5String, KeyPair, SanType};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::pem::parse_x509_pem;

use crate::identity::SpiffeId;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("private key generation failed: {details}")]
    KeyGenerate { details: String },
    #[error("CSR construction failed: {details}")]
    CsrBuild { details: String },
    #[error("certificate PEM decode failed: {details}")]
    PemDecode { details: String },
    #[error("certificate parse failed: {details}")]
    X509Parse { details: String },
    #[error("certificate carries no authority key identifier")]
    MissingAuthorityKeyId,
    #[error("certificate validity predates the unix epoch")]
    TimeBeforeUnixEpoch,
}

/// What a fetch needs to know about a freshly signed leaf.
#[derive(Debug, Clone)]
pub(crate) struct LeafCertMeta {
    /// Hex key ID of the root that signed the cert.
    pub(crate) authority_key_id: String,
    pub(crate) valid_after: Instant,
    pub(crate) valid_before: Instant,
}

/// Fresh per-leaf private key plus its PEM encoding.
pub(crate) fn generate_private_key() -> Result<(KeyPair, String), CryptoError> {
    let key = KeyPair::generate().map_err(|err| CryptoError::KeyGenerate {
        details: err.to_string(),
    })?;
    let pem = key.serialize_pem();
    Ok((key, pem))
}

/// CSR binding `id` to `key`, with the identity carried as a URI SAN.
pub(crate) fn build_csr(id: &SpiffeId, key: &KeyPair) -> Result<String, CryptoError> {
    let uri = Ia5String::try_from(id.canonical()).map_err(|err| CryptoError::CsrBuild {
        details: err.to_string(),
    })?;
    let mut params = CertificateParams::default();
    params.subject_alt_names.push(SanType::URI(uri));
    let csr = params
        .serialize_request(key)
        .map_err(|err| CryptoError::CsrBuild {
            details: err.to_string(),
        })?;
    csr.pem().map_err(|err| CryptoError::CsrBuild {
        details: err.to_string(),
    })
}

/// Parses a signed leaf and projects its validity onto the monotonic
/// clock, anchored at `now`.
pub(crate) fn parse_leaf_metadata(cert_pem: &str, now: Instant) -> Result<LeafCertMeta, CryptoError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).map_err(|err| CryptoError::PemDecode {
        details: err.to_string(),
    })?;
    let cert = pem.parse_x509().map_err(|err| CryptoError::X509Parse {
        details: err.to_string(),
    })?;

    let authority_key_id = extract_authority_key_id(&cert)?;
    let validity = cert.validity();
    let now_system = SystemTime::now();
    let valid_after = project_system_time(as_system_time(&validity.not_before)?, now_system, now);
    let valid_before = project_system_time(as_system_time(&validity.not_after)?, now_system, now);

    Ok(LeafCertMeta {
        authority_key_id,
        valid_after,
        valid_before,
    })
}

fn extract_authority_key_id(cert: &X509Certificate<'_>) -> Result<String, CryptoError> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
            if let Some(key_id) = &aki.key_identifier {
                return Ok(hex::encode(key_id.0));
            }
        }
    }
    Err(CryptoError::MissingAuthorityKeyId)
}

fn as_system_time(time: &x509_parser::time::ASN1Time) -> Result<SystemTime, CryptoError> {
    let dt = time.to_datetime();
    let secs = dt.unix_timestamp();
    let nanos = dt.nanosecond() as u64;
    if secs >= 0 {
        Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64) + Duration::from_nanos(nanos))
    } else {
        let abs = secs.unsigned_abs();
        Ok(SystemTime::UNIX_EPOCH
            .checked_sub(Duration::from_secs(abs))
            .ok_or(CryptoError::TimeBeforeUnixEpoch)?
            .checked_sub(Duration::from_nanos(nanos))
            .ok_or(CryptoError::TimeBeforeUnixEpoch)?)
    }
}

fn project_system_time(
    target: SystemTime,
    reference_system: SystemTime,
    reference_instant: Instant,
) -> Instant {
    if let Ok(delta) = target.duration_since(reference_system) {
        reference_instant + delta
    } else if let Ok(delta) = reference_system.duration_since(target) {
        reference_instant
            .checked_sub(delta)
            .unwrap_or(reference_instant)
    } else {
        reference_instant
    }
}
