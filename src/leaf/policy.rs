//! Renewal-time policy for live leaf certificates.

use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

use super::IssuedCert;

/// Certificates shorter than this are treated as already expired. Guards
/// against clock skew and malformed validity windows.
pub(crate) const MIN_LEAF_LIFETIME: Duration = Duration::from_secs(10 * 60);

const SOFT_RENEW_FRACTION: f64 = 0.6;
const HARD_RENEW_FRACTION: f64 = 0.9;

/// Bounds on when a live cert should be renewed, as `(min, max)`; the
/// caller picks a uniformly random instant between them.
///
/// The window opens at 60% of the cert lifetime and closes at 90%:
///
/// ```text
///   issued [------------------------------|===============|!!!!!] expires
///          0                             60%             90%
/// ```
///
/// Jittering the first attempt across `|===|` keeps the aggregate CSR
/// rate low, leaves headroom to ride out transient signing outages, and
/// de-correlates renewal times so an outage does not leave the whole
/// fleet renewing in lockstep afterwards. The average renewal lands at
/// ~75% of lifetime. `|!!!|` is never jittered over: past the 90% mark
/// the answer is `(now, now)`, renew immediately. If `now` is already
/// inside the soft window, the remaining `[now, hard)` span is used.
pub fn soft_expiry(now: Instant, cert: &IssuedCert) -> (Instant, Instant) {
    let lifetime = cert
        .valid_before
        .saturating_duration_since(cert.valid_after);
    if lifetime < MIN_LEAF_LIFETIME {
        return (now, now);
    }

    let mut soft = cert.valid_after + lifetime.mul_f64(SOFT_RENEW_FRACTION);
    let hard = cert.valid_after + lifetime.mul_f64(HARD_RENEW_FRACTION);

    if now > hard {
        return (now, now);
    }
    if now > soft {
        soft = now;
    }
    (soft, hard)
}

/// Uniformly random duration in `[0, span)`. Zero span stays zero.
pub fn random_stagger(span: Duration) -> Duration {
    let nanos = span.as_nanos().min(u128::from(u64::MAX)) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(thread_rng().gen_range(0..nanos))
}

/// The instant at which this fetch should renew `cert`, drawn from the
/// soft-expiry window.
pub fn pick_renewal_target(now: Instant, cert: &IssuedCert) -> Instant {
    let (min, max) = soft_expiry(now, cert);
    min + random_stagger(max.saturating_duration_since(min))
}
